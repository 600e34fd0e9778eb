use metrics::{counter, describe_counter, describe_gauge, gauge, Counter, Gauge};

/// Process-wide execution metrics, registered once at stage construction.
#[derive(Debug, Clone)]
pub(crate) struct ExecMetrics {
    /// Aggregation steps currently resident in the database, scaled by 100.
    pub(crate) steps_in_db: Gauge,
    /// Tasks re-executed after a failed read-set validation.
    pub(crate) repeats: Counter,
    /// Deferred same-sender tasks promoted to the retry lane.
    pub(crate) triggers: Counter,
}

impl ExecMetrics {
    pub(crate) fn new() -> Self {
        describe_gauge!(
            "sync.execution.steps_in_db",
            "Aggregation steps currently resident in the database, scaled by 100"
        );
        describe_counter!(
            "sync.execution.repeats",
            "Tasks re-executed after a failed read-set validation"
        );
        describe_counter!(
            "sync.execution.triggers",
            "Deferred same-sender tasks promoted to the retry lane"
        );
        Self {
            steps_in_db: gauge!("sync.execution.steps_in_db"),
            repeats: counter!("sync.execution.repeats"),
            triggers: counter!("sync.execution.triggers"),
        }
    }
}
