//! Storage backends.

pub mod memory;
mod metrics;

pub use memory::{InMemoryStorage, StorageConfig};
