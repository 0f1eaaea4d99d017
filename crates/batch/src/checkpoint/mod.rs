//! Checkpointing for resumable jobs
//!
//! This module provides:
//! - [`CheckpointStore`] trait for checkpoint persistence
//! - [`InMemoryCheckpointStore`] for testing and single-process hosts
//! - `CheckpointManager`, which tracks the contiguous watermark of attempted items

mod manager;
mod memory;
mod store;

pub(crate) use manager::CheckpointManager;
pub use memory::InMemoryCheckpointStore;
pub use store::{Checkpoint, CheckpointCounters, CheckpointError, CheckpointStore};
