use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use crate::pipeline::tracking_executor::{report_frame, FrameReport, TrackingConfig, TrackingExecutor};
use crate::quantization::kmeans_tree::QuantizationTree;
use crate::shared::frame::Frame;
use crate::tracking::domain::frame_source::FrameSource;
use crate::tracking::domain::keypoint_detector::KeypointDetector;
use crate::tracking::infrastructure::keypoint_tracker::{quantize_keypoints, QuantizedKeypoint};
use crate::tracking::infrastructure::object_tracker::ObjectTracker;

const DEFAULT_CHANNEL_CAPACITY: usize = 8;

type SendError = Box<dyn std::error::Error + Send + Sync>;

/// A frame's keypoints, detected and quantized off the main thread.
struct DetectedFrame {
    index: usize,
    timestamp: i64,
    width: u32,
    height: u32,
    keypoints: Vec<QuantizedKeypoint>,
    detect_ms: f64,
    quantize_ms: f64,
}

/// Runs frame reading and keypoint detection on their own threads.
///
/// Layout: `source → detect + quantize → main [track / objects / learn]`
///
/// The quantization tree is shared read-only with the detect thread. Track
/// and database mutation stay on the calling thread.
pub struct ThreadedTrackingExecutor {
    channel_capacity: usize,
}

impl ThreadedTrackingExecutor {
    pub fn new() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(capacity: usize) -> Self {
        Self {
            channel_capacity: capacity.max(1),
        }
    }
}

impl Default for ThreadedTrackingExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackingExecutor for ThreadedTrackingExecutor {
    fn execute(
        &self,
        source: Box<dyn FrameSource>,
        detector: Box<dyn KeypointDetector>,
        tracker: &mut ObjectTracker,
        config: TrackingConfig,
    ) -> Result<usize, Box<dyn std::error::Error>> {
        let cap = self.channel_capacity;
        let total = source.frame_count();
        let tree = tracker.tracker().tree().cloned();

        let (frame_tx, frame_rx) = crossbeam_channel::bounded::<Result<Frame, SendError>>(cap);
        let (detected_tx, detected_rx) =
            crossbeam_channel::bounded::<Result<DetectedFrame, SendError>>(cap);

        let source_handle = spawn_source(source, frame_tx, config.cancelled.clone());
        let detect_handle = spawn_detector(detector, tree, frame_rx, detected_tx, config.cancelled.clone());

        let (processed, main_error) = run_main_loop(detected_rx, tracker, total, &config);

        let result = join_threads(source_handle, detect_handle, main_error);
        tracker.tracker_mut().logger_mut().summary();
        result.map(|()| processed)
    }
}

fn spawn_source(
    mut source: Box<dyn FrameSource>,
    frame_tx: crossbeam_channel::Sender<Result<Frame, SendError>>,
    cancelled: Arc<AtomicBool>,
) -> JoinHandle<Box<dyn FrameSource>> {
    std::thread::spawn(move || {
        for frame in source.frames() {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }
            let mapped = frame.map_err(|e| -> SendError { e.to_string().into() });
            let failed = mapped.is_err();
            if frame_tx.send(mapped).is_err() || failed {
                break;
            }
        }
        source
    })
}

fn spawn_detector(
    mut detector: Box<dyn KeypointDetector>,
    tree: Option<Arc<QuantizationTree>>,
    frame_rx: crossbeam_channel::Receiver<Result<Frame, SendError>>,
    detected_tx: crossbeam_channel::Sender<Result<DetectedFrame, SendError>>,
    cancelled: Arc<AtomicBool>,
) -> JoinHandle<Box<dyn KeypointDetector>> {
    std::thread::spawn(move || {
        for frame in frame_rx {
            if cancelled.load(Ordering::Relaxed) {
                break;
            }
            let result = frame.and_then(|frame| {
                let start = Instant::now();
                let detected = detector
                    .detect(&frame)
                    .map_err(|e| -> SendError { e.to_string().into() })?;
                let detect_ms = start.elapsed().as_secs_f64() * 1000.0;
                let start = Instant::now();
                let keypoints = quantize_keypoints(tree.as_deref(), detected);
                Ok(DetectedFrame {
                    index: frame.index(),
                    timestamp: frame.timestamp(),
                    width: frame.width(),
                    height: frame.height(),
                    keypoints,
                    detect_ms,
                    quantize_ms: start.elapsed().as_secs_f64() * 1000.0,
                })
            });
            if detected_tx.send(result).is_err() {
                break;
            }
        }
        detector
    })
}

/// Feeds detected frames to the tracker. Returns the number of frames
/// processed and the first error, if any.
fn run_main_loop(
    detected_rx: crossbeam_channel::Receiver<Result<DetectedFrame, SendError>>,
    tracker: &mut ObjectTracker,
    total: Option<usize>,
    config: &TrackingConfig,
) -> (usize, Option<Box<dyn std::error::Error>>) {
    let mut processed = 0;
    for detected in detected_rx {
        if config.cancelled.load(Ordering::Relaxed) {
            break;
        }
        let detected = match detected {
            Ok(d) => d,
            Err(e) => return (processed, Some(e.to_string().into())),
        };
        let logger = tracker.tracker_mut().logger_mut();
        logger.timing("detect", detected.detect_ms);
        logger.timing("quantize", detected.quantize_ms);

        let keypoints = detected.keypoints.len();
        let id = match tracker.ingest(
            detected.index,
            detected.timestamp,
            detected.width,
            detected.height,
            detected.keypoints,
        ) {
            Ok(id) => id,
            Err(e) => return (processed, Some(e.into())),
        };
        processed += 1;
        let report = FrameReport {
            processed,
            total,
            index: detected.index,
            timestamp: detected.timestamp,
            keypoints,
            instances: tracker.instances(id).to_vec(),
        };
        if let Err(e) = report_frame(tracker, config, report) {
            return (processed, Some(e));
        }
    }
    (processed, None)
}

/// Joins the worker threads and keeps the first error encountered.
fn join_threads(
    source_handle: JoinHandle<Box<dyn FrameSource>>,
    detect_handle: JoinHandle<Box<dyn KeypointDetector>>,
    mut first_error: Option<Box<dyn std::error::Error>>,
) -> Result<(), Box<dyn std::error::Error>> {
    fn set_if_none(slot: &mut Option<Box<dyn std::error::Error>>, err: Box<dyn std::error::Error>) {
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    if source_handle.join().is_err() {
        set_if_none(&mut first_error, "Source thread panicked".into());
    }
    if detect_handle.join().is_err() {
        set_if_none(&mut first_error, "Detect thread panicked".into());
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
