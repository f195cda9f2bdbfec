//! Task implementations, their arguments and the invocation wire shape.

use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::{ArgumentError, TaskError};

type TaskFn = dyn Fn(&TaskArgs) -> Result<(), TaskError> + Send + Sync;

/// Where a declared task was defined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskOrigin {
    pub module: &'static str,
    pub symbol: &'static str,
}

impl fmt::Display for TaskOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.symbol)
    }
}

/// Cloneable handle to a task implementation.
///
/// Two handles are equal when they share the same underlying closure, i.e.
/// one was cloned from the other.
#[derive(Clone)]
pub struct TaskImpl {
    run: Arc<TaskFn>,
    origin: Option<TaskOrigin>,
    queue: Option<String>,
}

impl TaskImpl {
    pub fn new<F>(run: F) -> Self
    where
        F: Fn(&TaskArgs) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Self {
            run: Arc::new(run),
            origin: None,
            queue: None,
        }
    }

    /// A task that remembers where it was defined. Prefer the [`task!`](crate::task) macro.
    pub fn declared<F>(module: &'static str, symbol: &'static str, run: F) -> Self
    where
        F: Fn(&TaskArgs) -> Result<(), TaskError> + Send + Sync + 'static,
    {
        Self {
            origin: Some(TaskOrigin { module, symbol }),
            ..Self::new(run)
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn origin(&self) -> Option<TaskOrigin> {
        self.origin
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn call(&self, args: &TaskArgs) -> Result<(), TaskError> {
        (self.run)(args)
    }

    pub fn same_as(&self, other: &TaskImpl) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.run), Arc::as_ptr(&other.run))
    }

    /// Identity key shared by all clones of this handle.
    pub(crate) fn key(&self) -> usize {
        Arc::as_ptr(&self.run) as *const () as usize
    }
}

impl PartialEq for TaskImpl {
    fn eq(&self, other: &Self) -> bool {
        self.same_as(other)
    }
}

impl Eq for TaskImpl {}

impl fmt::Debug for TaskImpl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("TaskImpl");
        match &self.origin {
            Some(origin) => debug.field("origin", &format_args!("{origin}")),
            None => debug.field("origin", &format_args!("<anonymous>")),
        };
        debug.field("queue", &self.queue).finish()
    }
}

/// Declare a task function, recording the module it lives in.
///
/// ```ignore
/// fn resize(args: &TaskArgs) -> Result<(), TaskError> { /* ... */ }
///
/// let task = task!(resize, queue = "images");
/// ```
#[macro_export]
macro_rules! task {
    ($function:ident) => {
        $crate::TaskImpl::declared(module_path!(), stringify!($function), $function)
    };
    ($function:ident, queue = $queue:expr) => {
        $crate::task!($function).on_queue($queue)
    };
}

/// Positional and keyword arguments for one task call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskArgs {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse arguments given as a JSON array and a JSON object.
    pub fn from_json(args_json: &str, kwargs_json: &str) -> Result<Self, serde_json::Error> {
        Ok(Self {
            args: serde_json::from_str(args_json)?,
            kwargs: serde_json::from_str(kwargs_json)?,
        })
    }

    pub fn with_arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn with_kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.kwargs.insert(name.into(), value.into());
        self
    }

    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> Result<T, TaskError> {
        let value = self
            .args
            .get(index)
            .ok_or(ArgumentError::MissingPositional(index))?;
        decode(index.to_string(), value)
    }

    pub fn kwarg<T: DeserializeOwned>(&self, name: &str) -> Result<T, TaskError> {
        let value = self
            .kwargs
            .get(name)
            .ok_or_else(|| ArgumentError::MissingKeyword(name.to_string()))?;
        decode(name.to_string(), value)
    }

    pub fn kwarg_or<T: DeserializeOwned>(&self, name: &str, default: T) -> Result<T, TaskError> {
        match self.kwargs.get(name) {
            Some(value) => decode(name.to_string(), value),
            None => Ok(default),
        }
    }
}

fn decode<T: DeserializeOwned>(name: String, value: &Value) -> Result<T, TaskError> {
    T::deserialize(value).map_err(|source| ArgumentError::Invalid { name, source }.into())
}

/// Body of a task message: `{"task_name": .., "args": [..], "kwargs": {..}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInvocation {
    pub task_name: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

impl TaskInvocation {
    pub fn new(task_name: impl Into<String>, args: TaskArgs) -> Self {
        Self {
            task_name: task_name.into(),
            args: args.args,
            kwargs: args.kwargs,
        }
    }

    pub fn arguments(&self) -> TaskArgs {
        TaskArgs {
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}
