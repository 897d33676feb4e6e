use crate::shared::frame::Frame;

/// Supplies frames to the tracker in capture order.
pub trait FrameSource: Send {
    /// Returns an iterator over the remaining frames.
    fn frames(
        &mut self,
    ) -> Box<dyn Iterator<Item = Result<Frame, Box<dyn std::error::Error>>> + '_>;

    /// Total number of frames, when known up front.
    fn frame_count(&self) -> Option<usize> {
        None
    }
}
