use sorrel_interfaces::AGGREGATION_STEP;
use sorrel_state::{QueueWithRetry, ResultsQueue, SharedState};
use std::time::Instant;
use tracing::info;

/// Interval bookkeeping for the periodic replay progress line.
#[derive(Debug)]
pub(crate) struct Progress {
    prev_time: Instant,
    prev_count: u64,
    prev_repeat_count: u64,
    commit_threshold: u64,
    worker_count: usize,
}

impl Progress {
    pub(crate) fn new(commit_threshold: u64, worker_count: usize) -> Self {
        Self {
            prev_time: Instant::now(),
            prev_count: 0,
            prev_repeat_count: 0,
            commit_threshold,
            worker_count,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn log(
        &mut self,
        state: &SharedState,
        queue: &QueueWithRetry,
        results: &ResultsQueue,
        output_block_num: u64,
        output_tx_num: u64,
        repeat_count: u64,
    ) {
        let done_count = state.done_count();
        let interval = self.prev_time.elapsed().as_secs_f64();
        let tx_per_second = if interval > 0.0 {
            (done_count.saturating_sub(self.prev_count)) as f64 / interval
        } else {
            0.0
        };
        let repeat_ratio = if done_count > self.prev_count {
            100.0 * (repeat_count.saturating_sub(self.prev_repeat_count)) as f64
                / (done_count - self.prev_count) as f64
        } else {
            0.0
        };

        info!(
            target: "sync::stages::execution",
            blk = output_block_num,
            tx_per_s = format_args!("{tx_per_second:.1}"),
            pipe = format_args!(
                "({}+{})->{}/{}->{}/{}",
                queue.new_tasks_len(),
                queue.retries_len(),
                results.result_ch_len(),
                results.result_ch_cap(),
                results.len(),
                results.limit()
            ),
            repeat_ratio = format_args!("{repeat_ratio:.2}%"),
            workers = self.worker_count,
            buffer = format_args!(
                "{}/{}",
                byte_count(state.size_estimate()),
                byte_count(self.commit_threshold)
            ),
            step = format_args!("{:.1}", output_tx_num as f64 / AGGREGATION_STEP as f64),
            "Transaction replay"
        );

        self.prev_time = Instant::now();
        self.prev_count = done_count;
        self.prev_repeat_count = repeat_count;
    }
}

/// Render a byte count with a binary unit suffix.
pub(crate) fn byte_count(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes}{}", UNITS[0])
    } else {
        format!("{value:.1}{}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_count_units() {
        assert_eq!(byte_count(512), "512B");
        assert_eq!(byte_count(2048), "2.0KiB");
        assert_eq!(byte_count(3 * 1024 * 1024), "3.0MiB");
    }
}
