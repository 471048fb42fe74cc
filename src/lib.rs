//! Docker Image Replicator Library
//!
//! Resumable replication of repository/tag trees between Docker registries.
//! The engine is made of a bounded worker pool, a tag filter, a delta transfer
//! optimizer and a checkpoint store, composed by the tree replicator; registry
//! access goes through the [`registry::RegistryClient`] capability trait.

pub mod checkpoint;
pub mod cli;
pub mod concurrency;
pub mod config;
pub mod delta;
pub mod digest;
pub mod error;
pub mod filter;
pub mod logging;
pub mod registry;
pub mod replicator;
pub mod service;

pub use config::AppConfig;
pub use error::{ReplicationError, Result};
pub use logging::Logger;
pub use replicator::{ReplicationOutcome, ReplicationReport, ReplicationRequest, TreeReplicator};
