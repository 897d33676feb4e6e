/// One captured image handed to the keypoint detector.
///
/// Pixels are contiguous row-major bytes with `channels` interleaved
/// samples per pixel. The tracking core never inspects them; only the
/// detector and the image table of the visual database do.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    index: usize,
    timestamp: i64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8, index: usize) -> Self {
        debug_assert_eq!(
            data.len(),
            (width as usize) * (height as usize) * (channels as usize),
            "data length must equal width * height * channels"
        );
        Self {
            data,
            width,
            height,
            channels,
            index,
            timestamp: index as i64,
        }
    }

    /// Single-channel frame filled with `value`.
    pub fn gray(width: u32, height: u32, value: u8, index: usize) -> Self {
        Self::new(
            vec![value; width as usize * height as usize],
            width,
            height,
            1,
            index,
        )
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    /// Sample at column `x`, row `y`, channel `c`, or `None` outside the image.
    pub fn sample(&self, x: u32, y: u32, c: u8) -> Option<u8> {
        if x >= self.width || y >= self.height || c >= self.channels {
            return None;
        }
        let row = y as usize * self.width as usize * self.channels as usize;
        self.data
            .get(row + x as usize * self.channels as usize + c as usize)
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_and_accessors() {
        let data = vec![0u8; 12];
        let frame = Frame::new(data.clone(), 2, 2, 3, 5);
        assert_eq!(frame.width(), 2);
        assert_eq!(frame.height(), 2);
        assert_eq!(frame.channels(), 3);
        assert_eq!(frame.index(), 5);
        assert_eq!(frame.timestamp(), 5);
        assert_eq!(frame.data(), &data[..]);
    }

    #[test]
    fn test_with_timestamp_overrides_index_default() {
        let frame = Frame::gray(4, 4, 0, 2).with_timestamp(40_000);
        assert_eq!(frame.index(), 2);
        assert_eq!(frame.timestamp(), 40_000);
    }

    #[test]
    #[should_panic(expected = "data length must equal width * height * channels")]
    fn test_mismatched_data_length_panics_in_debug() {
        Frame::new(vec![0u8; 10], 2, 2, 3, 0);
    }

    #[test]
    fn test_sample_reads_interleaved_channels() {
        let mut data = vec![0u8; 12];
        data[6] = 200; // row 1, col 0, channel 0
        data[11] = 7; // row 1, col 1, channel 2
        let frame = Frame::new(data, 2, 2, 3, 0);
        assert_eq!(frame.sample(0, 1, 0), Some(200));
        assert_eq!(frame.sample(1, 1, 2), Some(7));
    }

    #[test]
    fn test_sample_outside_bounds_is_none() {
        let frame = Frame::gray(3, 2, 9, 0);
        assert_eq!(frame.sample(2, 1, 0), Some(9));
        assert_eq!(frame.sample(3, 0, 0), None);
        assert_eq!(frame.sample(0, 2, 0), None);
        assert_eq!(frame.sample(0, 0, 1), None);
    }
}
