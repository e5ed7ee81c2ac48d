pub mod frame;
pub mod proto;

pub use frame::{FrameError, FrameReader, FrameWriter, MAX_FRAME_BYTES};
