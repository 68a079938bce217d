// Handler notification tracking
//
// Successful tasks add handler names to the notify set. Membership is
// idempotent and never removed during a run, so a handler notified many
// times still runs once.

use std::collections::HashSet;

use parking_lot::RwLock;

use crate::parser::ast::Task;

/// Set of handler names marked due during the task phase
#[derive(Debug, Default)]
pub struct NotifySet {
    names: RwLock<HashSet<String>>,
}

impl NotifySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&self, name: &str) {
        self.names.write().insert(name.to_string());
    }

    pub fn notify_all(&self, names: &[String]) {
        let mut set = self.names.write();
        for name in names {
            set.insert(name.clone());
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.read().contains(name)
    }

    /// Handlers due to run, in declaration order
    pub fn pending<'a>(&self, handlers: &'a [Task]) -> Vec<&'a Task> {
        let names = self.names.read();
        handlers
            .iter()
            .filter(|h| names.contains(&h.name))
            .collect()
    }
}
