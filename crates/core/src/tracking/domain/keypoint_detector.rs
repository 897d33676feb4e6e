use crate::shared::frame::Frame;

/// One detected interest point with its descriptor.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectedKeypoint {
    pub u: f32,
    pub v: f32,
    pub scale: f32,
    pub orientation: f32,
    pub descriptor: Vec<f32>,
}

impl DetectedKeypoint {
    pub fn new(u: f32, v: f32, descriptor: Vec<f32>) -> Self {
        Self {
            u,
            v,
            scale: 1.0,
            orientation: 0.0,
            descriptor,
        }
    }
}

/// Domain interface for keypoint detection and description.
///
/// Implementations may keep state between frames (pyramids, buffers),
/// hence `&mut self`. Descriptors must all have the dimension of the
/// quantization tree they will be fed to.
pub trait KeypointDetector: Send {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<DetectedKeypoint>, Box<dyn std::error::Error>>;
}
