use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rstest::rstest;
use serde_json::json;
use taskwire_broker::memory::MemoryBroker;
use taskwire_broker::{session, BrokerClient, Message};
use taskwire_tasks::{
    AutoWiring, HardWiring, TaskArgs, TaskBroker, TaskBrokerError, TaskError, TaskImpl,
    WiringError, task,
};

mod rabbits {
    use super::*;

    pub static SIGHTINGS: Mutex<Vec<String>> = Mutex::new(Vec::new());
    pub static NAMINGS: Mutex<Vec<String>> = Mutex::new(Vec::new());

    pub fn what_that_rabbit_do(args: &TaskArgs) -> Result<(), TaskError> {
        let name: String = args.arg(0)?;
        SIGHTINGS.lock().unwrap().push(format!("{name} digs holes."));
        Ok(())
    }

    pub fn name_rabbits(args: &TaskArgs) -> Result<(), TaskError> {
        let count: u32 = args.kwarg_or("count", 1)?;
        NAMINGS
            .lock()
            .unwrap()
            .push(format!("There are {count} rabbits and they're all called Peter"));
        Ok(())
    }

    pub fn declared() -> Vec<TaskImpl> {
        vec![task!(name_rabbits, queue = "warren")]
    }
}

fn prefix() -> String {
    static NEXT: AtomicUsize = AtomicUsize::new(0);
    format!("t{}-", NEXT.fetch_add(1, Ordering::SeqCst))
}

#[test]
fn hardwired_worker_runs_submitted_task() {
    let broker = MemoryBroker::new();
    let what = TaskImpl::new(rabbits::what_that_rabbit_do);
    let wiring = HardWiring::new([("rabbits", vec![("what_that_rabbit_do", what.clone())])]).unwrap();
    let tasks = TaskBroker::new(Box::new(broker.client()))
        .with_wiring(wiring)
        .with_queue_prefix(prefix());

    tasks.destroy_queues(["rabbits"]).unwrap();
    tasks.create_queues(["rabbits"]).unwrap();
    tasks.submit(&what, TaskArgs::new().with_arg("peter")).unwrap();

    let report = tasks.run_worker(["rabbits"], Some(Duration::ZERO), None).unwrap();

    assert_eq!(report.processed, 1);
    assert_eq!(report.succeeded, 1);
    assert!(rabbits::SIGHTINGS
        .lock()
        .unwrap()
        .contains(&"peter digs holes.".to_string()));
    assert_eq!(broker.depth(&tasks.queue_name("rabbits")), 0);
    tasks.destroy_queues(["rabbits"]).unwrap();
}

#[test]
fn autowired_worker_resolves_declared_task_by_name() {
    let broker = MemoryBroker::new();
    let wiring = AutoWiring::new(rabbits::declared()).unwrap();
    let tasks = TaskBroker::new(Box::new(broker.client()))
        .with_wiring(wiring)
        .with_queue_prefix(prefix());
    tasks.create_queues(["warren"]).unwrap();

    let name = format!("{}::rabbits:name_rabbits", module_path!());
    tasks
        .submit_by_name(&name, TaskArgs::new().with_kwarg("count", 3))
        .unwrap();

    let report = tasks.run_worker(["warren"], Some(Duration::ZERO), None).unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(rabbits::NAMINGS
        .lock()
        .unwrap()
        .contains(&"There are 3 rabbits and they're all called Peter".to_string()));
}

#[test]
fn submitted_message_has_invocation_shape() {
    let broker = MemoryBroker::new();
    let tasks = TaskBroker::new(Box::new(broker.client()))
        .with_default_queue("fallback")
        .unwrap();

    let declared = task!(noop);
    tasks
        .submit(&declared, TaskArgs::new().with_arg(1).with_kwarg("k", "v"))
        .unwrap();

    let client = broker.client();
    let client = session(&client).unwrap();
    let messages: Vec<Message> = client
        .listen(&["fallback".to_string()], Some(Duration::ZERO))
        .unwrap()
        .map(Result::unwrap)
        .collect();
    assert_eq!(messages.len(), 1);
    assert_eq!(
        messages[0].body,
        json!({
            "task_name": format!("{}:noop", module_path!()),
            "args": [1],
            "kwargs": {"k": "v"},
        })
    );
}

fn noop(_args: &TaskArgs) -> Result<(), TaskError> {
    Ok(())
}

#[test]
fn failing_task_is_requeued_once_and_the_worker_continues() {
    static CALLS: AtomicUsize = AtomicUsize::new(0);

    let broker = MemoryBroker::new();
    let failing = TaskImpl::new(|_: &TaskArgs| Err("no carrots today".into()));
    let panicking = TaskImpl::new(|_: &TaskArgs| panic!("fox in the warren"));
    let healthy = TaskImpl::new(|_: &TaskArgs| {
        CALLS.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let wiring = HardWiring::new([
        ("failing", vec![("fail", failing.clone())]),
        ("panicking", vec![("panic", panicking.clone())]),
        ("healthy", vec![("ok", healthy.clone())]),
    ])
    .unwrap();
    let tasks = TaskBroker::new(Box::new(broker.client())).with_wiring(wiring);

    tasks.submit(&failing, TaskArgs::new()).unwrap();
    tasks.submit(&panicking, TaskArgs::new()).unwrap();
    tasks.submit(&healthy, TaskArgs::new()).unwrap();

    let report = tasks
        .run_worker(["failing", "panicking", "healthy"], Some(Duration::ZERO), None)
        .unwrap();

    assert_eq!(report.processed, 3);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    assert_eq!(broker.depth("failing"), 1);
    assert_eq!(broker.depth("panicking"), 1);
    assert_eq!(broker.depth("healthy"), 0);
}

fn counted(calls: &Arc<AtomicUsize>) -> TaskImpl {
    let calls = Arc::clone(calls);
    TaskImpl::new(move |_: &TaskArgs| {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn unknown_task_messages_are_requeued() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let ok = counted(&calls);
    let wiring = HardWiring::new([("jobs", vec![("ok", ok.clone())])]).unwrap();
    {
        let client = broker.client();
        let client = session(&client).unwrap();
        client
            .publish(&Message::new("jobs", json!({"task_name": "nobody:home"})))
            .unwrap();
        client.publish(&Message::new("jobs", json!("not an invocation"))).unwrap();
    }
    let tasks = TaskBroker::new(Box::new(broker.client())).with_wiring(wiring);
    tasks.submit(&ok, TaskArgs::new()).unwrap();

    let report = tasks
        .run_worker(["jobs"], Some(Duration::from_secs(2)), Some(3))
        .unwrap();
    assert_eq!(report.processed, 3);
    assert_eq!(report.requeued, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(broker.depth("jobs"), 2);
}

#[test]
fn failing_task_does_not_block_the_rest_of_its_queue() {
    let broker = MemoryBroker::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let failing = TaskImpl::new(|_: &TaskArgs| Err("always fails".into()));
    let healthy = counted(&calls);
    let wiring = HardWiring::new([(
        "jobs",
        vec![("failing", failing.clone()), ("healthy", healthy.clone())],
    )])
    .unwrap();
    let tasks = TaskBroker::new(Box::new(broker.client())).with_wiring(wiring);
    tasks.submit(&failing, TaskArgs::new()).unwrap();
    tasks.submit(&healthy, TaskArgs::new()).unwrap();

    let report = tasks
        .run_worker(["jobs"], Some(Duration::from_millis(500)), Some(10))
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.requeued, report.processed - 1);
    assert_eq!(broker.depth("jobs"), 1);
}

#[rstest]
#[case(Some(1), 1)]
#[case(Some(3), 3)]
#[case(Some(0), 0)]
fn task_limit_stops_the_worker(#[case] limit: Option<usize>, #[case] expected: usize) {
    let broker = MemoryBroker::new();
    let ok = TaskImpl::new(|_: &TaskArgs| Ok(()));
    let wiring = HardWiring::new([("jobs", vec![("ok", ok.clone())])]).unwrap();
    let tasks = TaskBroker::new(Box::new(broker.client())).with_wiring(wiring);
    for _ in 0..5 {
        tasks.submit(&ok, TaskArgs::new()).unwrap();
    }

    let report = tasks
        .run_worker(["jobs"], Some(Duration::from_secs(2)), limit)
        .unwrap();
    assert_eq!(report.processed, expected);
    assert_eq!(broker.depth("jobs"), 5 - expected);
}

#[test]
fn time_limit_ends_an_idle_worker() {
    let broker = MemoryBroker::new();
    let tasks = TaskBroker::new(Box::new(broker.client()));
    let report = tasks
        .run_worker(["idle"], Some(Duration::from_millis(100)), None)
        .unwrap();
    assert_eq!(report.processed, 0);
}

#[test]
fn wiring_errors_reach_the_submitter() {
    let broker = MemoryBroker::new();
    let tasks = TaskBroker::new(Box::new(broker.client()));

    let anonymous = TaskImpl::new(|_: &TaskArgs| Ok(()));
    assert!(matches!(
        tasks.submit(&anonymous, TaskArgs::new()),
        Err(TaskBrokerError::Wiring(WiringError::Undeclared))
    ));
    assert!(matches!(
        tasks.submit_by_name("missing:task", TaskArgs::new()),
        Err(TaskBrokerError::Wiring(WiringError::UnknownTask(_)))
    ));
}
