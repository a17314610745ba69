//! Feature extraction and matching.

pub mod base;
pub mod detector;
pub mod matcher;

pub use base::{Descriptors, KeyPoint, Match, DESCRIPTOR_SIZE};
pub use detector::{BinaryDetector, DetectorParams};
pub use matcher::HammingMatcher;
