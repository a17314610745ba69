//! Cooperative processing loops.
//!
//! Each loop runs one unit of work per `tick()` and is driven to completion
//! by an external ticker: the CLI just calls `tick()` in a tight loop, while
//! a hosted embedding can tick from a UI timer and stay responsive thanks to
//! the progress callbacks fired after each expensive stage.

pub mod gen_loop;
pub mod sync_loop;
#[cfg(test)]
mod sync_tests;

pub use gen_loop::GenLoop;
pub use sync_loop::SyncLoop;

use std::path::PathBuf;

use thiserror::Error;

use crate::io::encoder::EncoderError;
use crate::io::footage::FootageError;

/// Externally visible phase of a processing loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Running,
    Idle,
}

/// Errors a processing loop can surface to its driver.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Footage(#[from] FootageError),
    #[error("could not align the first footage frame to the opening slide")]
    InitialAlignmentFailed,
    #[error(transparent)]
    Encoder(#[from] EncoderError),
    #[error("failed to write sync cache {path}: {reason}")]
    CacheWrite { path: PathBuf, reason: String },
}

/// A loop the driver ticks until it reports [`LoopState::Idle`].
pub trait ProcessLoop {
    /// Run one cooperative step. Reentrant calls (possible when a progress
    /// callback re-enters the event loop) are dropped by a processing guard
    /// and return the current state unchanged.
    fn tick(&mut self) -> Result<LoopState, SyncError>;
}
