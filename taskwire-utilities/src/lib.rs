pub mod logger;
pub mod startup;

/// Boxed error usable across threads, the return type of process entry points.
pub type SendableError = Box<dyn std::error::Error + Send + Sync>;
