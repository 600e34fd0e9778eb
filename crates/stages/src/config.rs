use serde::Deserialize;
use std::time::Duration;

/// Configuration of the execution stage.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Number of execution workers.
    pub worker_count: usize,
    /// Commit threshold: buffered state bytes that trigger a flush.
    pub batch_size: u64,
    /// Run the parallel pipeline instead of the sequential one.
    pub parallel: bool,
    /// Whether this is the initial (full) sync cycle.
    pub initial_cycle: bool,
    /// Emit change-stream notifications near the chain head.
    pub state_stream: bool,
    /// Turn a failed root check into a stage failure instead of an unwind.
    pub bad_block_halt: bool,
    /// Skip writing historical change entries.
    pub discard_history: bool,
    /// Skip the per-block commitment check.
    pub discard_commitment: bool,
    /// Build snapshot files in the background after commits.
    pub produce_files: bool,
    /// Interval of the progress log tick.
    pub log_interval: Duration,
    /// Interval of the prune/flush tick of the commit coordinator.
    pub prune_interval: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 512 * 1024 * 1024,
            parallel: false,
            initial_cycle: true,
            state_stream: false,
            bad_block_halt: false,
            discard_history: false,
            discard_commitment: false,
            produce_files: false,
            log_interval: Duration::from_secs(1),
            prune_interval: Duration::from_secs(2),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ExecConfig::default();
        assert!(config.worker_count >= 1);
        assert!(config.batch_size > 0);
        assert!(!config.parallel);
    }
}
