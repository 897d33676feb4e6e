use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::tracking::domain::frame_source::FrameSource;
use crate::tracking::domain::keypoint_detector::KeypointDetector;
use crate::tracking::infrastructure::object_tracker::{ObjectInstance, ObjectTracker};

/// What the tracker found on one frame, handed to [`TrackingConfig::on_frame`].
#[derive(Clone, Debug)]
pub struct FrameReport {
    /// Frames processed so far, this one included.
    pub processed: usize,
    pub total: Option<usize>,
    pub index: usize,
    pub timestamp: i64,
    pub keypoints: usize,
    pub instances: Vec<ObjectInstance>,
}

/// Configuration for a tracking run.
pub struct TrackingConfig {
    /// Called after every frame. Returning `false` stops the run with a
    /// `Cancelled` error.
    pub on_frame: Option<Box<dyn Fn(&FrameReport) -> bool + Send>>,
    pub cancelled: Arc<AtomicBool>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            on_frame: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// Abstracts how the read → detect → track loop is driven.
///
/// Track and object state always stays on the calling thread. Implementations
/// only differ in where frames are read and keypoints detected.
pub trait TrackingExecutor: Send {
    /// Runs `source` to exhaustion through `tracker`. Returns the number
    /// of frames processed.
    fn execute(
        &self,
        source: Box<dyn FrameSource>,
        detector: Box<dyn KeypointDetector>,
        tracker: &mut ObjectTracker,
        config: TrackingConfig,
    ) -> Result<usize, Box<dyn std::error::Error>>;
}

/// Reports the frame to the tracker's logger and the caller's callback.
pub(crate) fn report_frame(
    tracker: &mut ObjectTracker,
    config: &TrackingConfig,
    report: FrameReport,
) -> Result<(), Box<dyn std::error::Error>> {
    tracker
        .tracker_mut()
        .logger_mut()
        .progress(report.processed, report.total);
    if let Some(ref callback) = config.on_frame {
        if !callback(&report) {
            return Err("Cancelled".into());
        }
    }
    Ok(())
}
