pub mod geometric_verification;
pub mod keypoint_tracker;
pub mod object_tracker;
