use std::sync::atomic::Ordering;

use crate::pipeline::tracking_executor::{report_frame, FrameReport, TrackingConfig, TrackingExecutor};
use crate::tracking::domain::frame_source::FrameSource;
use crate::tracking::domain::keypoint_detector::KeypointDetector;
use crate::tracking::infrastructure::object_tracker::ObjectTracker;

/// Reads, detects and tracks every frame on the calling thread.
#[derive(Default)]
pub struct SequentialTrackingExecutor;

impl TrackingExecutor for SequentialTrackingExecutor {
    fn execute(
        &self,
        mut source: Box<dyn FrameSource>,
        mut detector: Box<dyn KeypointDetector>,
        tracker: &mut ObjectTracker,
        config: TrackingConfig,
    ) -> Result<usize, Box<dyn std::error::Error>> {
        let total = source.frame_count();
        let mut processed = 0;
        for frame in source.frames() {
            if config.cancelled.load(Ordering::Relaxed) {
                break;
            }
            let frame = frame?;
            let id = tracker.process_frame(&frame, detector.as_mut())?;
            processed += 1;
            let report = FrameReport {
                processed,
                total,
                index: frame.index(),
                timestamp: frame.timestamp(),
                keypoints: tracker.tracker().store().frame(id).map_or(0, |f| f.len()),
                instances: tracker.instances(id).to_vec(),
            };
            report_frame(tracker, &config, report)?;
        }
        tracker.tracker_mut().logger_mut().summary();
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retrieval::query_rules::QueryRules;
    use crate::retrieval::visual_database::VisualDatabase;
    use crate::shared::frame::Frame;
    use crate::shared::settings::TrackerSettings;
    use crate::storage::infrastructure::memory_table_store::MemoryTableStore;
    use crate::tracking::domain::keypoint_detector::DetectedKeypoint;
    use crate::tracking::infrastructure::keypoint_tracker::KeypointTracker;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};

    struct StubFrameSource {
        count: usize,
        fail_at: Option<usize>,
    }

    impl FrameSource for StubFrameSource {
        fn frames(&mut self) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn std::error::Error>>> + '_> {
            let fail_at = self.fail_at;
            Box::new((0..self.count).map(move |i| {
                if Some(i) == fail_at {
                    Err("corrupt frame".into())
                } else {
                    Ok(Frame::gray(64, 64, 0, i).with_timestamp(i as i64 * 40))
                }
            }))
        }

        fn frame_count(&self) -> Option<usize> {
            Some(self.count)
        }
    }

    /// Two points drifting right by one pixel per frame.
    struct StubDetector;

    impl KeypointDetector for StubDetector {
        fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedKeypoint>, Box<dyn std::error::Error>> {
            let x = frame.index() as f32;
            Ok(vec![
                DetectedKeypoint::new(10.0 + x, 10.0, vec![1.0, 0.0]),
                DetectedKeypoint::new(30.0 + x, 40.0, vec![0.0, 1.0]),
            ])
        }
    }

    fn object_tracker() -> ObjectTracker {
        let db = VisualDatabase::open(Box::new(MemoryTableStore::new()), QueryRules::NORMALIZED_FREQ).unwrap();
        ObjectTracker::new(KeypointTracker::new(TrackerSettings::default()), db)
    }

    fn source(count: usize) -> Box<dyn FrameSource> {
        Box::new(StubFrameSource { count, fail_at: None })
    }

    #[test]
    fn test_all_frames_are_tracked() {
        let mut tracker = object_tracker();
        let reports = Arc::new(Mutex::new(Vec::new()));
        let sink = reports.clone();
        let config = TrackingConfig {
            on_frame: Some(Box::new(move |r: &FrameReport| {
                sink.lock().unwrap().push((r.processed, r.total, r.timestamp, r.keypoints));
                true
            })),
            ..TrackingConfig::default()
        };

        let n = SequentialTrackingExecutor
            .execute(source(5), Box::new(StubDetector), &mut tracker, config)
            .unwrap();

        assert_eq!(n, 5);
        assert_eq!(tracker.tracker().store().track_count(), 2);
        let reports = reports.lock().unwrap();
        assert_eq!(reports.len(), 5);
        assert_eq!(reports[4], (5, Some(5), 160, 2));
    }

    #[test]
    fn test_callback_false_cancels() {
        let mut tracker = object_tracker();
        let config = TrackingConfig {
            on_frame: Some(Box::new(|r: &FrameReport| r.processed < 2)),
            ..TrackingConfig::default()
        };
        let err = SequentialTrackingExecutor
            .execute(source(5), Box::new(StubDetector), &mut tracker, config)
            .unwrap_err();
        assert_eq!(err.to_string(), "Cancelled");
        assert_eq!(tracker.tracker().store().frame_count(), 2);
    }

    #[test]
    fn test_cancel_flag_stops_before_first_frame() {
        let mut tracker = object_tracker();
        let config = TrackingConfig {
            cancelled: Arc::new(AtomicBool::new(true)),
            ..TrackingConfig::default()
        };
        let n = SequentialTrackingExecutor
            .execute(source(5), Box::new(StubDetector), &mut tracker, config)
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn test_source_error_propagates() {
        let mut tracker = object_tracker();
        let failing = Box::new(StubFrameSource {
            count: 5,
            fail_at: Some(3),
        });
        let err = SequentialTrackingExecutor
            .execute(failing, Box::new(StubDetector), &mut tracker, TrackingConfig::default())
            .unwrap_err();
        assert_eq!(err.to_string(), "corrupt frame");
        assert_eq!(tracker.tracker().store().frame_count(), 3);
    }
}
