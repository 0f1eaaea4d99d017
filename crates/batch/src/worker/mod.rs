//! Worker pool for concurrent item execution

mod pool;

pub use pool::{WorkerPool, WorkerPoolError};
