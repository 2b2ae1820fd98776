//! Duplicate suppression for generated tasks.

use std::collections::{BTreeSet, HashSet};

use thiserror::Error;

use crate::core::types::Task;

/// Creation proposed a task that is already queued or recorded.
///
/// Returned by enqueue and dropped silently by the loop.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("duplicate task '{name}' (dependencies: {dependencies:?})")]
pub struct DuplicateTaskError {
    pub name: String,
    pub dependencies: Vec<String>,
}

/// Canonical form of a task name: trimmed, lowercased, single-spaced.
pub fn normalize_name(name: &str) -> String {
    name.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Identity of a task for duplicate suppression: `(name, dependencies)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupKey {
    name: String,
    dependencies: BTreeSet<String>,
}

impl DedupKey {
    pub fn new<I, S>(name: &str, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            name: normalize_name(name),
            dependencies: dependencies
                .into_iter()
                .map(|dep| normalize_name(dep.as_ref()))
                .filter(|dep| !dep.is_empty())
                .collect(),
        }
    }

    pub fn of(task: &Task) -> Self {
        Self::new(&task.name, &task.dependencies)
    }
}

/// Keys of every task the manager has seen (queued or in history).
#[derive(Debug, Default, Clone)]
pub struct KnownTasks {
    keys: HashSet<DedupKey>,
}

impl KnownTasks {
    pub fn from_tasks<'a, I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = &'a Task>,
    {
        Self {
            keys: tasks.into_iter().map(DedupKey::of).collect(),
        }
    }

    /// Record `task`, or report it as a duplicate.
    pub fn admit(&mut self, task: &Task) -> Result<(), DuplicateTaskError> {
        if self.keys.insert(DedupKey::of(task)) {
            Ok(())
        } else {
            Err(DuplicateTaskError {
                name: task.name.clone(),
                dependencies: task.dependencies.clone(),
            })
        }
    }
}
