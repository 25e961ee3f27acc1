use std::collections::HashSet;

/// Tracks which accepted slaves still owe a completion report for a task.
#[derive(Debug)]
pub(crate) struct Completion {
    outstanding: HashSet<String>,
    failures: Vec<String>,
    dispatching: bool,
}

/// Final verdict once every slave has reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Resolution {
    Completed,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Recorded {
    /// The slave was not expected to report (unknown or already reported).
    Duplicate,
    Waiting { remaining: usize },
    Resolved(Resolution),
}

impl Completion {
    /// Starts tracking before fan-out so early reports are not lost.
    pub(crate) fn new(slaves: impl IntoIterator<Item = String>) -> Self {
        Self {
            outstanding: slaves.into_iter().collect(),
            failures: Vec::new(),
            dispatching: true,
        }
    }

    pub(crate) fn record(&mut self, slave_id: &str, success: bool, message: &str) -> Recorded {
        if !self.outstanding.remove(slave_id) {
            return Recorded::Duplicate;
        }
        if !success {
            let message = if message.is_empty() { "execution failed" } else { message };
            self.failures.push(format!("{slave_id}: {message}"));
        }
        self.settle()
    }

    /// Closes the dispatch phase; only slaves in `accepted` are still awaited.
    pub(crate) fn dispatched(&mut self, accepted: &[String]) -> Recorded {
        self.outstanding.retain(|slave| accepted.contains(slave));
        self.dispatching = false;
        self.settle()
    }

    fn settle(&self) -> Recorded {
        if self.dispatching || !self.outstanding.is_empty() {
            return Recorded::Waiting {
                remaining: self.outstanding.len(),
            };
        }
        if self.failures.is_empty() {
            Recorded::Resolved(Resolution::Completed)
        } else {
            Recorded::Resolved(Resolution::Failed(self.failures.join("; ")))
        }
    }
}
