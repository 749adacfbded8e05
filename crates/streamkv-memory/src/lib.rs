//! Host engines for `streamkv` that run on a tokio runtime.
//!
//! [`MemoryEngine`] keeps every database in process memory. [`FsEngine`] is
//! the same engine with its committed state snapshotted to a JSON file.
//! Transactions run on spawned tasks, so opening a transaction or upgrading a
//! database requires a running tokio runtime.

mod config;
mod connection;
mod engine;
mod fs;
mod scheduler;
mod state;
mod store;
mod transaction;

pub use config::MemoryEngineConfig;
pub use engine::MemoryEngine;
pub use fs::{FsEngine, STATE_FILE_NAME};
