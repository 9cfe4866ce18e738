//! Load balancing: how many tasks go into the next unit for a channel.
//!
//! Each channel holds one [`Bundler`] built by the shared [`BundlerFactory`]. When the
//! factory's settings change, its epoch moves forward and every bundler created before
//! is stale; channels replace a stale bundler, disposing of the old one, the next time
//! they need it.

// Private submodules
mod fixed;
mod persistence;

// Public exports
pub use fixed::{FixedSizeBundler, FixedSizeBundlerFactory};
pub use persistence::{
    BundlerSnapshot, InMemoryPersistence, LoadBalancerPersistence, NoopPersistence,
};

/// Decides the size of the units sent to one channel, and learns from the time they
/// take.
pub trait Bundler: Send + Sync {
    /// The number of tasks to put in the next unit.
    fn bundle_size(&self) -> usize;

    /// Reports that `task_count` tasks took `elapsed_nanos` to come back.
    fn feedback(&self, task_count: usize, elapsed_nanos: u64);

    /// Called when the bundler is replaced.
    fn dispose(&self) {}

    /// The factory epoch the bundler was created at.
    fn timestamp(&self) -> u64;
}

/// Creates bundlers and tells when the settings they were created from are outdated.
pub trait BundlerFactory: Send + Sync {
    fn new_bundler(&self) -> Box<dyn Bundler>;

    /// The epoch of the last settings update.
    fn last_update_time(&self) -> u64;

    /// The name of the algorithm, used as part of the persisted state.
    fn algorithm_name(&self) -> String;
}
