//! Synchronization instruction model.

pub mod instructions;

pub use instructions::{
    index_to_timestamp, timestamp_to_index, SyncCode, SyncInstruction, SyncInstructions,
    SyncParseError,
};
