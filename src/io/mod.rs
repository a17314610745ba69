//! Input/output: footage decoding, slide loading, video encoding.

pub mod encoder;
pub mod footage;
pub mod image;
pub mod slides;

pub use encoder::{EncoderError, FfmpegEncoder, FrameSink};
pub use footage::{FfmpegFootage, FootageError, FootageSource, FrameReader, FRAMESKIP};
pub use image::{GrayImage, RgbFrame};
pub use slides::{load_deck, SlideError};
