//! Backlog sweeps and the background detection worker.
//!
//! [`BacklogScheduler`] runs detection synchronously: over every
//! unprocessed activity, or over one activity on request.
//! [`DetectionWorker`] drives a scheduler from a tokio runtime with a
//! bounded job queue, a cap on in-flight jobs and optional periodic sweeps.

use std::future::pending;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, Interval, MissedTickBehavior};

use crate::config::WorkerConfig;
use crate::detector::{DetectionOutcome, SummitDetector};
use crate::error::{OptionExt, Result, SummitError};
use crate::ActivityId;

// ============================================================================
// Backlog scheduler
// ============================================================================

/// Per-sweep counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    /// Unprocessed activities found at the start of the sweep
    pub total: usize,
    pub completed: usize,
    /// Completed activities with at least one summit
    pub with_summit: usize,
    pub summits_found: usize,
    pub no_route: usize,
    pub decode_errors: usize,
    pub lookup_errors: usize,
    /// Activities whose flags could not be persisted
    pub failed: usize,
    pub elapsed: Duration,
}

impl SweepSummary {
    fn record(&mut self, outcome: &DetectionOutcome) {
        match outcome {
            DetectionOutcome::NoRoute => self.no_route += 1,
            DetectionOutcome::DecodeError { .. } => self.decode_errors += 1,
            DetectionOutcome::LookupError { .. } => self.lookup_errors += 1,
            DetectionOutcome::Completed { summit_ids, .. } => {
                self.completed += 1;
                self.summits_found += summit_ids.len();
                if !summit_ids.is_empty() {
                    self.with_summit += 1;
                }
            }
        }
    }
}

/// Runs the detector over the backlog or over single activities.
pub struct BacklogScheduler {
    detector: SummitDetector,
}

impl BacklogScheduler {
    pub fn new(detector: SummitDetector) -> Self {
        Self { detector }
    }

    pub fn detector(&self) -> &SummitDetector {
        &self.detector
    }

    /// Run detection on every unprocessed activity.
    ///
    /// Fails only when the backlog itself cannot be listed. Individual
    /// activity failures are logged and counted, and the sweep continues.
    pub fn run_backlog_sweep(&self) -> Result<SweepSummary> {
        let start = Instant::now();
        let pending = self.detector.activities().unprocessed_activities()?;

        let mut summary = SweepSummary {
            total: pending.len(),
            ..SweepSummary::default()
        };

        if pending.is_empty() {
            debug!("[BacklogScheduler] No unprocessed activities");
            return Ok(summary);
        }

        info!(
            "[BacklogScheduler] Sweeping {} unprocessed activities",
            pending.len()
        );

        for mut activity in pending {
            match self.detector.detect_summits(&mut activity) {
                Ok(outcome) => summary.record(&outcome),
                Err(e) => {
                    warn!(
                        "[BacklogScheduler] Activity {} failed: {}",
                        activity.id, e
                    );
                    summary.failed += 1;
                }
            }
        }

        summary.elapsed = start.elapsed();
        info!(
            "[BacklogScheduler] Sweep finished in {:.2}s: {} completed ({} with summits, {} summits), \
             {} no route, {} decode errors, {} lookup errors, {} failed",
            summary.elapsed.as_secs_f64(),
            summary.completed,
            summary.with_summit,
            summary.summits_found,
            summary.no_route,
            summary.decode_errors,
            summary.lookup_errors,
            summary.failed
        );

        Ok(summary)
    }

    /// Run detection on one activity, whether or not it was processed.
    pub fn run_single_activity(&self, activity_id: ActivityId) -> Result<DetectionOutcome> {
        let mut activity = self
            .detector
            .activities()
            .activity_by_id(activity_id)?
            .ok_or_not_found(activity_id)?;

        let outcome = self.detector.detect_summits(&mut activity)?;
        debug!(
            "[BacklogScheduler] Activity {}: {}",
            activity_id,
            outcome.label()
        );
        Ok(outcome)
    }
}

// ============================================================================
// Background worker
// ============================================================================

/// A unit of work for the background worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DetectionJob {
    /// Sweep the whole backlog.
    Sweep,
    /// Recompute one activity (e.g. after a new-activity event).
    Activity(ActivityId),
}

/// Job counters reported by [`DetectionWorker::shutdown`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub completed: u32,
    pub failed: u32,
    /// Submissions refused because the queue was full
    pub rejected: u32,
    /// Sweeps dropped because another sweep was still running
    pub skipped_sweeps: u32,
}

#[derive(Default)]
struct WorkerShared {
    completed: AtomicU32,
    failed: AtomicU32,
    rejected: AtomicU32,
    skipped_sweeps: AtomicU32,
    sweep_running: AtomicBool,
}

impl WorkerShared {
    fn snapshot(&self) -> WorkerStats {
        WorkerStats {
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            skipped_sweeps: self.skipped_sweeps.load(Ordering::Relaxed),
        }
    }
}

/// Background worker executing [`DetectionJob`]s on a tokio runtime.
///
/// Detection itself is blocking (store access, CPU work) and runs on the
/// blocking pool. At most `max_concurrency` jobs run at once and at most
/// one sweep is in flight; a sweep requested while another runs is
/// skipped, since the running sweep already covers the backlog.
pub struct DetectionWorker {
    sender: mpsc::Sender<DetectionJob>,
    dispatcher: JoinHandle<()>,
    shared: Arc<WorkerShared>,
}

impl DetectionWorker {
    /// Start the worker on the current tokio runtime.
    ///
    /// With a sweep interval configured, the first sweep starts immediately.
    pub fn spawn(scheduler: Arc<BacklogScheduler>, config: WorkerConfig) -> Result<Self> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SummitError::scheduler(format!("no tokio runtime: {}", e)))?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let shared = Arc::new(WorkerShared::default());

        info!(
            "[DetectionWorker] Starting with queue capacity {}, {} concurrent jobs, sweep interval {:?}",
            config.queue_capacity, config.max_concurrency, config.sweep_interval
        );

        let dispatcher = runtime.spawn(dispatch(
            receiver,
            scheduler,
            Arc::new(Semaphore::new(config.max_concurrency)),
            Arc::clone(&shared),
            config.sweep_interval,
        ));

        Ok(Self {
            sender,
            dispatcher,
            shared,
        })
    }

    /// Queue a job without waiting. Fails when the queue is full.
    pub fn try_submit(&self, job: DetectionJob) -> Result<()> {
        match self.sender.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(job)) => {
                self.shared.rejected.fetch_add(1, Ordering::Relaxed);
                warn!("[DetectionWorker] Queue full, rejected {:?}", job);
                Err(SummitError::scheduler("job queue full"))
            }
            Err(TrySendError::Closed(_)) => Err(SummitError::scheduler("worker stopped")),
        }
    }

    /// Queue a job, waiting for queue capacity.
    pub async fn submit(&self, job: DetectionJob) -> Result<()> {
        self.sender
            .send(job)
            .await
            .map_err(|_| SummitError::scheduler("worker stopped"))
    }

    pub fn stats(&self) -> WorkerStats {
        self.shared.snapshot()
    }

    /// Stop accepting jobs, finish everything queued or running, and
    /// return the final counters.
    pub async fn shutdown(self) -> WorkerStats {
        drop(self.sender);
        if let Err(e) = self.dispatcher.await {
            warn!("[DetectionWorker] Dispatcher terminated abnormally: {}", e);
        }

        let stats = self.shared.snapshot();
        info!(
            "[DetectionWorker] Stopped: {} completed, {} failed, {} rejected",
            stats.completed, stats.failed, stats.rejected
        );
        stats
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn dispatch(
    mut receiver: mpsc::Receiver<DetectionJob>,
    scheduler: Arc<BacklogScheduler>,
    semaphore: Arc<Semaphore>,
    shared: Arc<WorkerShared>,
    sweep_interval: Option<Duration>,
) {
    let mut ticker = sweep_interval.map(|period| {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });
    let mut in_flight = JoinSet::new();

    loop {
        let job = tokio::select! {
            biased;
            job = receiver.recv() => match job {
                Some(job) => job,
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!("[DetectionWorker] Job task panicked: {}", e);
                    shared.failed.fetch_add(1, Ordering::Relaxed);
                }
                continue;
            },
            _ = next_tick(&mut ticker) => DetectionJob::Sweep,
        };

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        in_flight.spawn(run_job(
            Arc::clone(&scheduler),
            job,
            Arc::clone(&shared),
            permit,
        ));
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!("[DetectionWorker] Job task panicked: {}", e);
            shared.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

async fn run_job(
    scheduler: Arc<BacklogScheduler>,
    job: DetectionJob,
    shared: Arc<WorkerShared>,
    _permit: OwnedSemaphorePermit,
) {
    let is_sweep = job == DetectionJob::Sweep;
    if is_sweep && shared.sweep_running.swap(true, Ordering::AcqRel) {
        debug!("[DetectionWorker] Sweep already running, skipping");
        shared.skipped_sweeps.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let result = tokio::task::spawn_blocking(move || match job {
        DetectionJob::Sweep => scheduler.run_backlog_sweep().map(|_| ()),
        DetectionJob::Activity(id) => scheduler.run_single_activity(id).map(|_| ()),
    })
    .await;

    if is_sweep {
        shared.sweep_running.store(false, Ordering::Release);
    }

    match result {
        Ok(Ok(())) => {
            shared.completed.fetch_add(1, Ordering::Relaxed);
        }
        Ok(Err(e)) => {
            warn!("[DetectionWorker] {:?} failed: {}", job, e);
            shared.failed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            warn!("[DetectionWorker] {:?} panicked: {}", job, e);
            shared.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Activity, DetectionConfig, MemoryStore, Summit};
    use chrono::Utc;

    const REFERENCE: &str = "_p~iF~ps|U_ulLnnqC_mqNvxq`@";

    fn scheduler_with(store: &Arc<MemoryStore>) -> BacklogScheduler {
        BacklogScheduler::new(SummitDetector::new(
            store.clone(),
            store.clone(),
            store.clone(),
            DetectionConfig::default(),
        )
        .unwrap())
    }

    #[test]
    fn test_sweep_counts_every_outcome() {
        let store = Arc::new(MemoryStore::new());
        store.add_summit(Summit::new(1, "Midpoint Peak", 39.6, -120.575));
        store.add_activity(Activity::new(1, 1, REFERENCE, Utc::now()));
        store.add_activity(Activity::new(2, 1, "", Utc::now()));
        store.add_activity(Activity::new(3, 1, "!!!", Utc::now()));

        let summary = scheduler_with(&store).run_backlog_sweep().unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.with_summit, 1);
        assert_eq!(summary.summits_found, 1);
        assert_eq!(summary.no_route, 1);
        assert_eq!(summary.decode_errors, 1);
        assert_eq!(summary.failed, 0);

        // Everything is processed; a second sweep has nothing to do
        let again = scheduler_with(&store).run_backlog_sweep().unwrap();
        assert_eq!(again.total, 0);
    }

    #[test]
    fn test_single_activity_not_found() {
        let store = Arc::new(MemoryStore::new());
        let result = scheduler_with(&store).run_single_activity(99);
        assert!(matches!(result, Err(SummitError::ActivityNotFound(99))));
    }

    #[test]
    fn test_single_activity_reprocesses() {
        let store = Arc::new(MemoryStore::new());
        store.add_summit(Summit::new(1, "Midpoint Peak", 39.6, -120.575));
        let mut activity = Activity::new(1, 1, REFERENCE, Utc::now());
        activity.processed = true;
        store.add_activity(activity);

        let outcome = scheduler_with(&store).run_single_activity(1).unwrap();
        assert_eq!(outcome.summit_count(), 1);
        assert!(store.activity(1).unwrap().has_summit);
    }
}
