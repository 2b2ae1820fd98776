//! Dependency resolution and dispatch selection for the pending queue.

use std::collections::HashSet;

use thiserror::Error;

use crate::core::dedup::normalize_name;
use crate::core::types::{HistoryEntry, Task, TaskStatus};

/// Names and ids of every task that has reached `success`.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedSet {
    ids: HashSet<String>,
    names: HashSet<String>,
}

impl ResolvedSet {
    pub fn from_history(history: &[HistoryEntry]) -> Self {
        let mut set = Self::default();
        for entry in history {
            if entry.result.status == TaskStatus::Success {
                set.insert(&entry.task);
            }
        }
        set
    }

    pub fn insert(&mut self, task: &Task) {
        self.ids.insert(task.id.clone());
        self.names.insert(normalize_name(&task.name));
    }

    pub fn is_resolved(&self, dependency: &str) -> bool {
        let dependency = dependency.trim();
        self.ids.contains(dependency) || self.names.contains(&normalize_name(dependency))
    }

    /// Sorted, normalized view used in prompts and fingerprints.
    pub fn sorted(&self) -> Vec<String> {
        let mut all: Vec<String> = self.ids.iter().chain(self.names.iter()).cloned().collect();
        all.sort();
        all
    }
}

/// Dependencies of `task` that have not reached `success`.
pub fn unresolved_dependencies<'a>(task: &'a Task, resolved: &ResolvedSet) -> Vec<&'a str> {
    task.dependencies
        .iter()
        .map(String::as_str)
        .filter(|dep| !resolved.is_resolved(dep))
        .collect()
}

/// Queue indices in dispatch order: ascending `(priority, insertion index)`.
pub fn dispatch_order(queue: &[Task]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..queue.len()).collect();
    order.sort_by_key(|&idx| (queue[idx].priority, idx));
    order
}

/// A pending task that cannot run, with the dependencies holding it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockedTask {
    pub id: String,
    pub name: String,
    pub unresolved: Vec<String>,
}

/// No pending task is dispatchable: every one waits on an unresolved dependency.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("stalled queue: {} pending task(s) blocked on unresolved dependencies", blocked.len())]
pub struct StalledQueueError {
    pub blocked: Vec<BlockedTask>,
}

/// Result of choosing the next task to dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// Nothing is queued.
    Empty,
    /// Queue index of the task to run next.
    Dispatch(usize),
    /// Tasks remain but none can run.
    Stalled(StalledQueueError),
}

/// Pick the first task in dispatch order whose dependencies have all succeeded.
pub fn select_next(queue: &[Task], resolved: &ResolvedSet) -> Selection {
    if queue.is_empty() {
        return Selection::Empty;
    }

    let order = dispatch_order(queue);
    for &idx in &order {
        if unresolved_dependencies(&queue[idx], resolved).is_empty() {
            return Selection::Dispatch(idx);
        }
    }

    let blocked = order
        .iter()
        .map(|&idx| {
            let task = &queue[idx];
            BlockedTask {
                id: task.id.clone(),
                name: task.name.clone(),
                unresolved: unresolved_dependencies(task, resolved)
                    .into_iter()
                    .map(str::to_string)
                    .collect(),
            }
        })
        .collect();
    Selection::Stalled(StalledQueueError { blocked })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TaskResult;
    use crate::test_support::{task, task_with_deps};

    fn succeeded(task: Task) -> HistoryEntry {
        HistoryEntry::new(task, TaskResult::success("ok"), "execution")
    }

    #[test]
    fn resolved_set_ignores_failures() {
        let history = vec![
            succeeded(task("t1", "design schema")),
            HistoryEntry::new(
                task("t2", "write docs"),
                TaskResult::failure("boom"),
                "execution",
            ),
        ];
        let resolved = ResolvedSet::from_history(&history);
        assert!(resolved.is_resolved("design schema"));
        assert!(resolved.is_resolved("Design  Schema"));
        assert!(resolved.is_resolved("t1"));
        assert!(!resolved.is_resolved("write docs"));
    }

    #[test]
    fn select_skips_blocked_head() {
        let mut blocked = task_with_deps("t1", "implement endpoint", &["design schema"]);
        blocked.priority = 0;
        let mut ready = task("t2", "design schema");
        ready.priority = 1;
        let queue = vec![blocked, ready];

        assert_eq!(
            select_next(&queue, &ResolvedSet::default()),
            Selection::Dispatch(1)
        );
    }

    #[test]
    fn select_prefers_lower_priority_then_insertion_order() {
        let mut a = task("a", "a");
        a.priority = 2;
        let mut b = task("b", "b");
        b.priority = 1;
        let mut c = task("c", "c");
        c.priority = 1;
        let queue = vec![a, b, c];
        assert_eq!(dispatch_order(&queue), vec![1, 2, 0]);
        assert_eq!(
            select_next(&queue, &ResolvedSet::default()),
            Selection::Dispatch(1)
        );
    }

    #[test]
    fn cyclic_dependencies_stall() {
        let queue = vec![
            task_with_deps("a", "a", &["b"]),
            task_with_deps("b", "b", &["a"]),
        ];
        match select_next(&queue, &ResolvedSet::default()) {
            Selection::Stalled(err) => {
                assert_eq!(err.blocked.len(), 2);
                assert_eq!(err.blocked[0].unresolved, vec!["b".to_string()]);
            }
            other => panic!("expected stall, got {other:?}"),
        }
    }

    #[test]
    fn empty_queue_is_empty() {
        assert_eq!(
            select_next(&[], &ResolvedSet::default()),
            Selection::Empty
        );
    }
}
