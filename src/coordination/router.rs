//! Task type → role routing.
//!
//! An explicit type table from configuration is consulted first (exact,
//! case-insensitive) and pins a type to exactly one role. Any other type is
//! eligible for every role whose keyword set it contains, so `code_review`
//! is offered to both generation and review workers; assignment decides
//! which one takes it.

use std::collections::BTreeMap;

use crate::core::{Role, Task};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Router {
    explicit: BTreeMap<String, Role>,
}

impl Router {
    pub fn new(routing: &BTreeMap<String, Role>) -> Self {
        Self {
            explicit: routing
                .iter()
                .map(|(task_type, role)| (task_type.to_lowercase(), *role))
                .collect(),
        }
    }

    /// Every role that may take `task_type`, in role order. Empty means the
    /// type is unroutable.
    pub fn roles(&self, task_type: &str) -> Vec<Role> {
        Role::ALL
            .into_iter()
            .filter(|role| self.routes_to(task_type, *role))
            .collect()
    }

    pub fn is_routable(&self, task_type: &str) -> bool {
        Role::ALL
            .into_iter()
            .any(|role| self.routes_to(task_type, role))
    }

    pub fn routes_to(&self, task_type: &str, role: Role) -> bool {
        let task_type = task_type.to_lowercase();
        if let Some(pinned) = self.explicit.get(&task_type) {
            return *pinned == role;
        }
        role.keywords()
            .iter()
            .any(|keyword| task_type.contains(keyword))
    }

    /// Pending tasks for `role`, highest priority first, then creation order.
    pub fn eligible<'a>(&self, tasks: impl IntoIterator<Item = &'a Task>, role: Role) -> Vec<Task> {
        let mut eligible: Vec<Task> = tasks
            .into_iter()
            .filter(|task| task.is_pending() && self.routes_to(&task.task_type, role))
            .cloned()
            .collect();
        eligible.sort_by_key(|task| (task.priority, task.created_seq));
        eligible
    }
}
