//! slidesync — synchronize a slide deck with presentation footage.
//!
//! Given a recording of a slide-based presentation and the deck as a set of
//! grayscale images, the library tracks which slide is on screen at every
//! point of the footage and produces:
//!
//! - a synchronization file listing the observed slide transitions in time
//!   order, and
//! - a synthesized video showing the canonical slide image for each footage
//!   time-step.
//!
//! The tracking pipeline matches binary keypoint descriptors between the
//! footage and the deck, estimates slide poses with RANSAC homographies and
//! carries a reference keyframe across steps; see [`loops::SyncLoop`] for
//! the full state machine and [`loops::GenLoop`] for video generation.

pub mod cli;
pub mod config;
pub mod features;
pub mod geometry;
pub mod io;
pub mod loops;
pub mod sync;

pub use features::{BinaryDetector, Descriptors, DetectorParams, HammingMatcher, KeyPoint, Match};
pub use geometry::{Homography, Quad};
pub use io::{FootageSource, FrameReader, FrameSink, GrayImage, RgbFrame};
pub use loops::{GenLoop, LoopState, ProcessLoop, SyncError, SyncLoop};
pub use sync::{SyncCode, SyncInstruction, SyncInstructions};
