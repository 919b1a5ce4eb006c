//! Runs a campaign's iterations on one or more workers.
//!
//! Every worker owns its own [`FaultInjector`] (and with it its own debugger
//! link, consoles and simulator process). The only state the workers share
//! is the [`IterationCounter`].

use log::{error, info, warn};
use std::any::Any;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::fault_injector::FaultInjector;

/// Hands out iteration numbers `start..start + total`, each exactly once.
#[derive(Debug, Clone)]
pub struct IterationCounter {
    remaining: Arc<AtomicU64>,
    start: u64,
    total: u64,
}

impl IterationCounter {
    pub fn new(start: u64, total: u64) -> Self {
        Self {
            remaining: Arc::new(AtomicU64::new(total)),
            start,
            total,
        }
    }

    /// Claims the next iteration, or `None` once all are taken.
    pub fn claim(&self) -> Option<u64> {
        let previous = self
            .remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| remaining.checked_sub(1))
            .ok()?;
        Some(self.start + self.total - previous)
    }

    pub fn remaining(&self) -> u64 {
        self.remaining.load(Ordering::SeqCst)
    }

    /// Every iteration number this counter hands out.
    pub fn range(&self) -> Range<u64> {
        self.start..self.start + self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Inject,
    Supervise,
}

/// Number of workers that can actually run.
///
/// A simulator campaign runs as many simulators as requested, a device
/// campaign is bounded by the number of boards in the fleet.
pub fn effective_concurrency(requested: usize, simulator: bool, fleet_size: usize) -> usize {
    match simulator {
        true => requested.max(1),
        false => requested.min(fleet_size).max(1),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerReport {
    pub workers: usize,
    pub completed: u64,
    /// Workers that stopped on an error other than an interrupt.
    pub failed_workers: usize,
    pub remaining: u64,
    pub interrupted: bool,
}

pub struct CampaignScheduler {
    concurrency: usize,
    mode: Mode,
    cancel: CancelToken,
    retry_delay: Duration,
}

impl CampaignScheduler {
    pub fn new(concurrency: usize, mode: Mode, cancel: CancelToken) -> Self {
        Self {
            concurrency: concurrency.max(1),
            mode,
            cancel,
            retry_delay: Duration::from_secs(5),
        }
    }

    /// Pause before the second attempt to open a worker's link.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Runs workers until the counter is exhausted or the run is cancelled.
    ///
    /// `factory(worker_id)` builds the injector of one worker. Each worker
    /// finishes and tears down its current iteration before it stops.
    pub fn run<F>(&self, counter: &IterationCounter, factory: F) -> Result<SchedulerReport>
    where
        F: Fn(usize) -> Result<FaultInjector> + Sync,
    {
        let completed = AtomicU64::new(0);
        let failed = AtomicUsize::new(0);
        let factory = &factory;

        thread::scope(|scope| -> Result<()> {
            let mut workers = Vec::with_capacity(self.concurrency);
            for id in 0..self.concurrency {
                info!("Starting worker {id}");
                let completed = &completed;
                let handle = thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn_scoped(scope, move || self.worker(id, counter, factory, completed))?;
                workers.push((id, handle));
            }
            // Joined here so a panicking worker does not take the others down
            for (id, handle) in workers {
                match handle.join() {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!("Worker {id} stopped: {e}");
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(payload) => {
                        error!("Worker {id} panicked: {}", panic_message(payload.as_ref()));
                        failed.fetch_add(1, Ordering::SeqCst);
                    }
                }
            }
            Ok(())
        })?;

        Ok(SchedulerReport {
            workers: self.concurrency,
            completed: completed.load(Ordering::SeqCst),
            failed_workers: failed.load(Ordering::SeqCst),
            remaining: counter.remaining(),
            interrupted: self.cancel.is_cancelled(),
        })
    }

    fn worker<F>(&self, id: usize, counter: &IterationCounter, factory: &F, completed: &AtomicU64) -> Result<()>
    where
        F: Fn(usize) -> Result<FaultInjector>,
    {
        let mut injector = match self.build(id, factory) {
            Ok(injector) => injector,
            Err(Error::Interrupted) => return Ok(()),
            Err(e) => return Err(e),
        };

        let outcome = loop {
            if self.cancel.is_cancelled() {
                break Ok(());
            }
            let Some(iteration) = counter.claim() else {
                break Ok(());
            };
            let run = match self.mode {
                Mode::Inject => injector.run_iteration(iteration),
                Mode::Supervise => injector.supervise(iteration),
            };
            match run {
                Ok(_) => {
                    completed.fetch_add(1, Ordering::SeqCst);
                }
                Err(Error::Interrupted) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        if let Err(e) = injector.close() {
            warn!("Worker {id}: closing link failed: {e}");
        }
        outcome
    }

    /// Builds and connects an injector, retrying an unavailable link once.
    fn build<F>(&self, id: usize, factory: &F) -> Result<FaultInjector>
    where
        F: Fn(usize) -> Result<FaultInjector>,
    {
        let mut injector = factory(id)?;
        match injector.connect() {
            Ok(()) => Ok(injector),
            Err(Error::LinkUnavailable(reason)) if self.mode == Mode::Supervise => {
                warn!("Worker {id}: {reason}, supervising without debugger");
                Ok(injector)
            }
            Err(Error::LinkUnavailable(reason)) => {
                warn!("Worker {id}: {reason}, retrying");
                drop(injector);
                self.cancel.sleep(self.retry_delay)?;
                let mut injector = factory(id)?;
                injector.connect()?;
                Ok(injector)
            }
            Err(e) => Err(e),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown cause")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[test]
    fn counter_hands_out_each_iteration_once() {
        let counter = IterationCounter::new(1, 10);
        let claimed = Mutex::new(Vec::new());
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    while let Some(iteration) = counter.claim() {
                        claimed.lock().unwrap().push(iteration);
                    }
                });
            }
        });
        let claimed = claimed.into_inner().unwrap();
        assert_eq!(claimed.len(), 10);
        assert_eq!(claimed.iter().copied().collect::<HashSet<_>>(), (1..=10).collect());
        assert_eq!(counter.remaining(), 0);
        assert_eq!(counter.claim(), None);
    }

    #[test]
    fn counter_starts_at_offset() {
        let counter = IterationCounter::new(100, 2);
        assert_eq!(counter.claim(), Some(100));
        assert_eq!(counter.claim(), Some(101));
        assert_eq!(counter.claim(), None);
        assert_eq!(counter.range(), 100..102);
    }

    #[test]
    fn device_concurrency_is_bounded_by_fleet() {
        assert_eq!(effective_concurrency(4, false, 1), 1);
        assert_eq!(effective_concurrency(4, false, 3), 3);
        assert_eq!(effective_concurrency(4, true, 1), 4);
        assert_eq!(effective_concurrency(0, true, 0), 1);
    }

    #[test]
    fn panic_payload_text() {
        let payload = std::panic::catch_unwind(|| panic!("lost {}", "link")).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "lost link");
        let payload = std::panic::catch_unwind(|| std::panic::panic_any(7)).unwrap_err();
        assert_eq!(panic_message(payload.as_ref()), "unknown cause");
    }
}
