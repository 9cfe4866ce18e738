//! grid-dispatch is the client-side dispatch engine of a grid-computing
//! client.
//!
//! A submitted [`Job`](crate::job::Job) is a collection of independent or
//! dependency-linked [`Task`](crate::job::Task)s. The engine splits the job
//! into [`DispatchUnit`](crate::job::DispatchUnit)s, routes each unit to one of
//! several execution [channels](crate::channel), and reconciles the partial,
//! out-of-order and possibly failed results into one job outcome.
//!
//! Three channel kinds are available:
//! - a [local](crate::channel::LocalChannel) channel executing tasks on an
//!   in-process thread pool,
//! - a [synchronous remote](crate::channel::RemoteSyncChannel) channel doing
//!   one blocking round trip per unit,
//! - an [asynchronous remote](crate::channel::RemoteAsyncChannel) channel that
//!   pipelines sends and receives over one connection.
//!
//! ## Example
//!
//! ```ignore
//! let manager = DispatchManager::new(Configuration::new().with_local_execution(true))?;
//! let mut submission = JobSubmission::new("squares");
//! for i in 0..5u64 {
//!     submission.add_task(Task::new(move |_ctx: &TaskContext| {
//!         Ok(Bytes::from((i * i).to_string()))
//!     }));
//! }
//! let handle = manager.submit_job(submission)?;
//! let results = handle.await_results(Some(Duration::from_secs(10)));
//! ```

// Public submodules
pub mod channel;
pub mod communication;
pub mod job;
pub mod load_balancer;
pub mod scheduler;

// Private submodules
mod configuration;
mod manager;

// Public exports
pub use configuration::Configuration;
pub use manager::{ConnectionOptions, DispatchManager, JobHandle};

/// Identifier of a channel inside a [`ChannelRegistry`](crate::channel::ChannelRegistry).
pub type ChannelId = usize;

/// Identifier of a [`DispatchUnit`](crate::job::DispatchUnit), unique per process.
pub type UnitId = u64;

/// Identifier of a bundle sent over a remote connection, unique per channel.
pub type BundleId = u64;

pub use uuid::Uuid;
