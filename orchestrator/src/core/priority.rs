//! Dependency-respecting total order over the pending set.
//!
//! Kahn's algorithm over edges `dependency -> dependent`, restricted to
//! dependencies that are unresolved and name another pending task. Among
//! ready tasks the highest score goes first; unscored tasks rank below scored
//! ones, and ties fall back to insertion order. The output is a pure function
//! of its inputs.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

use crate::core::schedule::{ResolvedSet, unresolved_dependencies};
use crate::core::types::Task;

/// Position assigned to one pending task.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedTask {
    pub task_id: String,
    /// Dispatch ordinal (0 runs first). Unique across the order.
    pub priority: u32,
    /// Longest chain of pending dependencies in front of this task.
    pub level: u32,
    pub score: Option<f64>,
    /// True if the task sits on a dependency cycle and was appended last.
    pub in_cycle: bool,
}

/// Order `pending` so dependents never precede their unresolved dependencies.
///
/// `scores` is keyed by task id; higher scores run earlier within a ready set.
pub fn topological_order(
    pending: &[Task],
    resolved: &ResolvedSet,
    scores: &HashMap<String, f64>,
) -> Vec<RankedTask> {
    let n = pending.len();
    let mut successors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    let mut indegree = vec![0usize; n];

    for (dependent, task) in pending.iter().enumerate() {
        let mut preds = BTreeSet::new();
        for dep in unresolved_dependencies(task, resolved) {
            for (candidate, other) in pending.iter().enumerate() {
                if candidate != dependent && other.is_referenced_by(dep) {
                    preds.insert(candidate);
                }
            }
        }
        for pred in preds {
            if successors[pred].insert(dependent) {
                indegree[dependent] += 1;
            }
        }
    }

    let score_of = |idx: usize| -> Option<f64> {
        scores
            .get(&pending[idx].id)
            .copied()
            .filter(|score| score.is_finite())
    };

    let mut level = vec![0u32; n];
    let mut emitted = vec![false; n];
    let mut ready: Vec<usize> = (0..n).filter(|&idx| indegree[idx] == 0).collect();
    let mut order: Vec<RankedTask> = Vec::with_capacity(n);

    while !ready.is_empty() {
        let pos = best_ready(&ready, &score_of);
        let idx = ready.swap_remove(pos);
        emitted[idx] = true;
        order.push(RankedTask {
            task_id: pending[idx].id.clone(),
            priority: order.len() as u32,
            level: level[idx],
            score: score_of(idx),
            in_cycle: false,
        });
        for &succ in &successors[idx] {
            level[succ] = level[succ].max(level[idx] + 1);
            indegree[succ] -= 1;
            if indegree[succ] == 0 {
                ready.push(succ);
            }
        }
    }

    for idx in 0..n {
        if !emitted[idx] {
            order.push(RankedTask {
                task_id: pending[idx].id.clone(),
                priority: order.len() as u32,
                level: level[idx],
                score: score_of(idx),
                in_cycle: true,
            });
        }
    }

    order
}

fn best_ready(ready: &[usize], score_of: &impl Fn(usize) -> Option<f64>) -> usize {
    let mut best = 0;
    for pos in 1..ready.len() {
        if compare_ready(ready[pos], ready[best], score_of) == Ordering::Less {
            best = pos;
        }
    }
    best
}

/// `Less` means `a` should run before `b`.
fn compare_ready(a: usize, b: usize, score_of: &impl Fn(usize) -> Option<f64>) -> Ordering {
    let by_score = match (score_of(a), score_of(b)) {
        (Some(sa), Some(sb)) => sb.total_cmp(&sa),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };
    by_score.then(a.cmp(&b))
}
