pub mod pipeline;
pub mod quantization;
pub mod retrieval;
pub mod shared;
pub mod storage;
pub mod tracking;
pub mod tracks;
