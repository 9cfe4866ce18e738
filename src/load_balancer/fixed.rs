use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Mutex,
};

use super::{Bundler, BundlerFactory};

#[derive(Debug, Default, Clone, Copy)]
struct Samples {
    tasks: usize,
    nanos: u64,
    count: usize,
}

/// Always proposes the same bundle size. Feedback is only kept as statistics.
#[derive(Debug)]
pub struct FixedSizeBundler {
    size: usize,
    timestamp: u64,
    samples: Mutex<Samples>,
}

impl FixedSizeBundler {
    pub fn new(size: usize, timestamp: u64) -> Self {
        Self {
            size: size.max(1),
            timestamp,
            samples: Mutex::new(Samples::default()),
        }
    }

    /// Number of feedback samples received.
    pub fn sample_count(&self) -> usize {
        self.samples.lock().unwrap().count
    }

    /// Mean execution time of a task over all the samples, in nanoseconds.
    pub fn mean_nanos_per_task(&self) -> Option<f64> {
        let samples = self.samples.lock().unwrap();
        if samples.tasks == 0 {
            None
        } else {
            Some(samples.nanos as f64 / samples.tasks as f64)
        }
    }
}

impl Bundler for FixedSizeBundler {
    fn bundle_size(&self) -> usize {
        self.size
    }

    fn feedback(&self, task_count: usize, elapsed_nanos: u64) {
        let mut samples = self.samples.lock().unwrap();
        samples.tasks += task_count;
        samples.nanos = samples.nanos.saturating_add(elapsed_nanos);
        samples.count += 1;
    }

    fn timestamp(&self) -> u64 {
        self.timestamp
    }
}

/// Factory of the "manual" algorithm. Every size update starts a new epoch.
#[derive(Debug)]
pub struct FixedSizeBundlerFactory {
    size: AtomicUsize,
    epoch: AtomicU64,
}

impl FixedSizeBundlerFactory {
    pub fn new(size: usize) -> Self {
        Self {
            size: AtomicUsize::new(size.max(1)),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn set_bundle_size(&self, size: usize) {
        self.size.store(size.max(1), Ordering::SeqCst);
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(
            "Load balancer settings updated: size {}, epoch {}",
            size,
            epoch
        );
    }

    pub fn bundle_size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }
}

impl BundlerFactory for FixedSizeBundlerFactory {
    fn new_bundler(&self) -> Box<dyn Bundler> {
        Box::new(FixedSizeBundler::new(
            self.size.load(Ordering::SeqCst),
            self.epoch.load(Ordering::SeqCst),
        ))
    }

    fn last_update_time(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn algorithm_name(&self) -> String {
        "manual".to_string()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Test that a settings update makes earlier bundlers stale.
    #[test]
    fn test_settings_update_bumps_epoch() {
        let factory = FixedSizeBundlerFactory::new(4);
        let bundler = factory.new_bundler();
        assert_eq!(bundler.bundle_size(), 4);
        assert_eq!(bundler.timestamp(), factory.last_update_time());

        factory.set_bundle_size(8);
        assert!(
            factory.last_update_time() > bundler.timestamp(),
            "The old bundler should be stale."
        );
        assert_eq!(factory.new_bundler().bundle_size(), 8);
    }

    /// Test that feedback is aggregated without changing the size.
    #[test]
    fn test_feedback_statistics() {
        let bundler = FixedSizeBundler::new(2, 0);
        assert_eq!(bundler.mean_nanos_per_task(), None);
        bundler.feedback(2, 1_000);
        bundler.feedback(2, 3_000);
        assert_eq!(bundler.sample_count(), 2);
        assert_eq!(bundler.mean_nanos_per_task(), Some(1_000.0));
        assert_eq!(bundler.bundle_size(), 2);
    }
}
