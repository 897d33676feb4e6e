use std::collections::HashMap;
use std::time::Instant;

/// Per-frame stages reported by the trackers, in processing order.
pub const STAGES: [&str; 5] = ["detect", "quantize", "track", "objects", "learn"];

/// Observer for frame processing: progress, stage timings and counters.
///
/// The trackers and executors report through this trait so callers pick
/// how much they want to see without touching the tracking code.
pub trait PipelineLogger: Send {
    /// Report that `frame` frames were processed, out of `total` if known.
    fn progress(&mut self, frame: usize, total: Option<usize>);

    /// Record how long a named stage took for one frame.
    fn timing(&mut self, stage: &str, duration_ms: f64);

    /// Record a per-frame counter (keypoints, matches, objects).
    fn metric(&mut self, name: &str, value: f64);

    fn info(&mut self, message: &str);

    /// Emit an end-of-run summary. Default: no-op.
    fn summary(&self) {}
}

/// Discards everything.
pub struct NullPipelineLogger;

impl PipelineLogger for NullPipelineLogger {
    fn progress(&mut self, _frame: usize, _total: Option<usize>) {}
    fn timing(&mut self, _stage: &str, _duration_ms: f64) {}
    fn metric(&mut self, _name: &str, _value: f64) {}
    fn info(&mut self, _message: &str) {}
}

/// Aggregates timings and counters and reports them through `log`.
///
/// Progress lines are throttled to one every `throttle_frames` frames.
pub struct StdoutPipelineLogger {
    throttle_frames: usize,
    timings: HashMap<String, Vec<f64>>,
    metrics: HashMap<String, Vec<f64>>,
    start_time: Instant,
    frames: usize,
    messages: Vec<String>,
}

impl StdoutPipelineLogger {
    pub fn new(throttle_frames: usize) -> Self {
        Self {
            throttle_frames: throttle_frames.max(1),
            timings: HashMap::new(),
            metrics: HashMap::new(),
            start_time: Instant::now(),
            frames: 0,
            messages: Vec::new(),
        }
    }

    /// Stage names in report order: known stages first, then the rest sorted.
    fn stage_order(&self) -> Vec<&str> {
        let mut order: Vec<&str> = STAGES
            .iter()
            .copied()
            .filter(|s| self.timings.contains_key(*s))
            .collect();
        let mut others: Vec<&str> = self
            .timings
            .keys()
            .map(String::as_str)
            .filter(|s| !STAGES.contains(s))
            .collect();
        others.sort_unstable();
        order.extend(others);
        order
    }

    /// The formatted summary, or `None` if nothing was recorded.
    pub fn summary_string(&self) -> Option<String> {
        if self.timings.is_empty() && self.metrics.is_empty() {
            return None;
        }

        let elapsed_ms = self.start_time.elapsed().as_secs_f64() * 1000.0;
        let frames = self.frames;
        let mut lines = vec![format!(
            "Tracking summary ({frames} frames, {:.1}s):",
            elapsed_ms / 1000.0
        )];

        let mut per_frame_ms = 0.0;
        for stage in self.stage_order() {
            let durations = &self.timings[stage];
            let total_ms: f64 = durations.iter().sum();
            let avg_ms = mean(durations);
            per_frame_ms += avg_ms;
            lines.push(format!(
                "  {stage:10}: avg {avg_ms:7.2}ms  total {total_ms:8.0}ms  ({} frames)",
                durations.len()
            ));
        }

        let mut names: Vec<_> = self.metrics.keys().collect();
        names.sort();
        for name in names {
            let values = &self.metrics[name];
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            lines.push(format!("  {name}: avg {:.1}  max {max:.0}", mean(values)));
        }

        if per_frame_ms > 0.0 {
            lines.push(format!("  Throughput: {:.1} fps", 1000.0 / per_frame_ms));
        }

        Some(lines.join("\n"))
    }

    pub fn timings_for(&self, stage: &str) -> Option<&[f64]> {
        self.timings.get(stage).map(|v| v.as_slice())
    }

    pub fn metrics_for(&self, name: &str) -> Option<&[f64]> {
        self.metrics.get(name).map(|v| v.as_slice())
    }

    pub fn frames(&self) -> usize {
        self.frames
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

impl Default for StdoutPipelineLogger {
    fn default() -> Self {
        Self::new(25)
    }
}

impl PipelineLogger for StdoutPipelineLogger {
    fn progress(&mut self, frame: usize, total: Option<usize>) {
        self.frames = frame;
        let last = total == Some(frame);
        if frame % self.throttle_frames != 0 && !last {
            return;
        }
        match total {
            Some(total) if total > 0 => {
                let pct = frame as f64 / total as f64 * 100.0;
                log::info!("Tracking: {frame}/{total} frames ({pct:.1}%)");
            }
            _ => log::info!("Tracking: {frame} frames"),
        }
    }

    fn timing(&mut self, stage: &str, duration_ms: f64) {
        self.timings
            .entry(stage.to_string())
            .or_default()
            .push(duration_ms);
    }

    fn metric(&mut self, name: &str, value: f64) {
        self.metrics
            .entry(name.to_string())
            .or_default()
            .push(value);
    }

    fn info(&mut self, message: &str) {
        self.messages.push(message.to_string());
        log::info!("{message}");
    }

    fn summary(&self) {
        if let Some(text) = self.summary_string() {
            log::info!("\n{text}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_null_logger_accepts_everything() {
        let mut logger = NullPipelineLogger;
        logger.progress(1, None);
        logger.timing("detect", 5.0);
        logger.metric("keypoints", 300.0);
        logger.info("hello");
        logger.summary();
    }

    #[test]
    fn test_timing_records_values() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.timing("track", 2.0);
        logger.timing("track", 4.0);
        logger.timing("objects", 7.0);

        assert_eq!(logger.timings_for("track").unwrap(), &[2.0, 4.0]);
        assert_eq!(logger.timings_for("objects").unwrap(), &[7.0]);
        assert!(logger.timings_for("learn").is_none());
    }

    #[test]
    fn test_metric_records_values() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.metric("matches", 120.0);
        logger.metric("matches", 80.0);
        let values = logger.metrics_for("matches").unwrap();
        assert_relative_eq!(mean(values), 100.0);
    }

    #[test]
    fn test_summary_lists_stages_in_processing_order() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.timing("learn", 1.0);
        logger.timing("custom", 1.0);
        logger.timing("detect", 3.0);
        logger.timing("track", 2.0);

        let summary = logger.summary_string().unwrap();
        let at = |s: &str| summary.find(s).unwrap();
        assert!(summary.starts_with("Tracking summary"));
        assert!(at("detect") < at("track"));
        assert!(at("track") < at("learn"));
        assert!(at("learn") < at("custom"));
    }

    #[test]
    fn test_summary_includes_metrics_and_throughput() {
        let mut logger = StdoutPipelineLogger::new(10);
        logger.metric("objects", 1.0);
        logger.metric("objects", 2.0);
        logger.timing("detect", 10.0);

        let summary = logger.summary_string().unwrap();
        assert!(summary.contains("objects: avg 1.5  max 2"));
        assert!(summary.contains("Throughput: 100.0 fps"));
    }

    #[test]
    fn test_empty_summary_returns_none() {
        assert!(StdoutPipelineLogger::new(10).summary_string().is_none());
    }

    #[test]
    fn test_progress_counts_frames_without_total() {
        let mut logger = StdoutPipelineLogger::new(10);
        for i in 1..=12 {
            logger.progress(i, None);
        }
        assert_eq!(logger.frames(), 12);
    }

    #[test]
    fn test_info_stores_messages() {
        let mut logger = StdoutPipelineLogger::default();
        logger.info("tree loaded");
        assert_eq!(logger.messages, vec!["tree loaded".to_string()]);
        assert_eq!(logger.throttle_frames, 25);
    }
}
