pub mod frame_source;
pub mod keypoint_detector;
