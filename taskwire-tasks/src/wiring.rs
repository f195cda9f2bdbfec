//! Mapping between task implementations and the names sent over the wire.

use std::collections::HashMap;
use std::collections::hash_map::Entry;

use serde::{Deserialize, Serialize};

use crate::errors::WiringError;
use crate::task::TaskImpl;

/// Stable, serializable reference to a task implementation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskIdentity {
    pub name: String,
    pub queue: String,
}

pub trait TaskWiring: Send + Sync {
    fn identity_of(&self, task: &TaskImpl) -> Result<TaskIdentity, WiringError>;

    fn resolve(&self, name: &str) -> Result<TaskImpl, WiringError>;

    /// Every name `resolve` accepts, sorted.
    fn task_names(&self) -> Vec<String>;
}

/// Wiring derived from where tasks were declared.
///
/// A task declared with [`task!`](crate::task) is named
/// `"<module path>:<function>"` and sent to its declared queue, or to the
/// default queue when it has none. Workers resolve names against the
/// declared tasks registered at startup.
#[derive(Debug, Clone, Default)]
pub struct AutoWiring {
    registry: HashMap<String, TaskImpl>,
    default_queue: Option<String>,
}

impl AutoWiring {
    pub fn new(tasks: impl IntoIterator<Item = TaskImpl>) -> Result<Self, WiringError> {
        let mut registry = HashMap::new();
        for task in tasks {
            let name = Self::task_name(&task)?;
            match registry.entry(name) {
                Entry::Occupied(entry) => {
                    return Err(WiringError::DuplicateName(entry.key().clone()));
                }
                Entry::Vacant(entry) => {
                    entry.insert(task);
                }
            }
        }
        Ok(Self {
            registry,
            default_queue: None,
        })
    }

    pub fn with_default_queue(mut self, queue: impl Into<String>) -> Self {
        self.default_queue = Some(queue.into());
        self
    }

    /// Wire name of a declared task.
    pub fn task_name(task: &TaskImpl) -> Result<String, WiringError> {
        task.origin()
            .map(|origin| origin.to_string())
            .ok_or(WiringError::Undeclared)
    }
}

impl TaskWiring for AutoWiring {
    fn identity_of(&self, task: &TaskImpl) -> Result<TaskIdentity, WiringError> {
        let name = Self::task_name(task)?;
        let queue = task
            .queue()
            .or(self.default_queue.as_deref())
            .ok_or_else(|| WiringError::NoQueue(name.clone()))?;
        Ok(TaskIdentity {
            queue: queue.to_string(),
            name,
        })
    }

    fn resolve(&self, name: &str) -> Result<TaskImpl, WiringError> {
        self.registry
            .get(name)
            .cloned()
            .ok_or_else(|| WiringError::UnknownTask(name.to_string()))
    }

    fn task_names(&self) -> Vec<String> {
        sorted_names(self.registry.keys())
    }
}

fn sorted_names<'a>(names: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut names: Vec<String> = names.cloned().collect();
    names.sort();
    names
}

/// Wiring from an explicit `{queue: {name: implementation}}` table.
///
/// Names and implementations form a bijection: construction fails if a name
/// appears twice or one implementation is listed under two names.
#[derive(Debug, Clone)]
pub struct HardWiring {
    by_name: HashMap<String, TaskImpl>,
    by_impl: HashMap<usize, TaskIdentity>,
}

impl HardWiring {
    pub fn new<Q, T, N>(table: impl IntoIterator<Item = (Q, T)>) -> Result<Self, WiringError>
    where
        Q: Into<String>,
        T: IntoIterator<Item = (N, TaskImpl)>,
        N: Into<String>,
    {
        let mut by_name = HashMap::new();
        let mut by_impl: HashMap<usize, TaskIdentity> = HashMap::new();

        for (queue, tasks) in table {
            let queue = queue.into();
            for (name, task) in tasks {
                let name = name.into();
                if by_name.contains_key(&name) {
                    return Err(WiringError::DuplicateName(name));
                }
                if let Some(existing) = by_impl.get(&task.key()) {
                    return Err(WiringError::DuplicateImplementation {
                        first: existing.name.clone(),
                        second: name,
                    });
                }
                by_impl.insert(
                    task.key(),
                    TaskIdentity {
                        name: name.clone(),
                        queue: queue.clone(),
                    },
                );
                by_name.insert(name, task);
            }
        }

        Ok(Self { by_name, by_impl })
    }
}

impl TaskWiring for HardWiring {
    fn identity_of(&self, task: &TaskImpl) -> Result<TaskIdentity, WiringError> {
        self.by_impl
            .get(&task.key())
            .cloned()
            .ok_or_else(|| WiringError::NotWired(format!("{task:?}")))
    }

    fn resolve(&self, name: &str) -> Result<TaskImpl, WiringError> {
        self.by_name
            .get(name)
            .cloned()
            .ok_or_else(|| WiringError::UnknownTask(name.to_string()))
    }

    fn task_names(&self) -> Vec<String> {
        sorted_names(self.by_name.keys())
    }
}
