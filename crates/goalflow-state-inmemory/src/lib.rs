//! In-memory snapshot storage for Goalflow
//!
//! This crate provides an in-memory implementation of the core
//! [`SnapshotStore`](goalflow_core::SnapshotStore) interface and a
//! write-behind wrapper that moves snapshot writes off the engine's hot
//! path. It is primarily useful for development, testing, and deployments
//! where snapshots only need to survive a component restart.

pub mod error;
pub mod store;
pub mod write_behind;

pub use error::StoreError;
pub use store::InMemorySnapshotStore;
pub use write_behind::{WriteBehindConfig, WriteBehindStore};
