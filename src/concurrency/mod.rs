//! Concurrency management for replication work
//!
//! The replicator never performs blob I/O on the orchestrating task. Every unit is
//! submitted to a [`WorkerPool`], which bounds how many units run at once and owns
//! their cancellation.
//!
//! ## Usage Example
//!
//! ```no_run
//! use docker_image_replicator::concurrency::WorkerPool;
//! use docker_image_replicator::logging::Logger;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> docker_image_replicator::error::Result<()> {
//! let pool = WorkerPool::start(4, Logger::new(false));
//! let context = CancellationToken::new();
//!
//! let handle = pool
//!     .submit(&context, |_token| async move { Ok(21 * 2) })
//!     .await?;
//!
//! pool.stop(true).await;
//! assert_eq!(handle.await?, 42);
//! # Ok(())
//! # }
//! ```

pub mod pool;

pub use pool::{PoolState, TaskHandle, WorkerPool};
