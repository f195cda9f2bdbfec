use taskwire_utilities::SendableError;

fn main() -> Result<(), SendableError> {
    let wiring = taskwire_worker::builtin::wiring()?;
    taskwire_worker::run(wiring)
}
