//! Background merge scheduler
//!
//! A dedicated tokio runtime runs one maintenance ticker and a fixed pool
//! of merge workers fed through a bounded queue. Merges themselves are
//! blocking file I/O and run on the runtime's blocking pool. A cancellation
//! token stops the ticker, the workers and any merge between two series.

use super::MergeConfig;
use crate::part::PartHandle;
use crate::{QuiverError, Result};
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;
use tokio::sync::{mpsc, Mutex};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Attempts per job before its parts are released for re-selection
const MAX_ATTEMPTS: u32 = 5;

/// Longest wait on shutdown for running merges to observe cancellation
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Why a merge was scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeKind {
    /// A size tier went over its part limit
    Tiered,
    /// Explicit full merge
    Forced,
    /// Rewrite of a part straddling the retention cutoff
    Retention,
}

impl fmt::Display for MergeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MergeKind::Tiered => write!(f, "tiered"),
            MergeKind::Forced => write!(f, "forced"),
            MergeKind::Retention => write!(f, "retention"),
        }
    }
}

/// A planned merge; its input parts are claimed until the job commits or
/// is released
pub struct MergeJob {
    pub kind: MergeKind,
    pub parts: Vec<Arc<PartHandle>>,
}

impl MergeJob {
    pub fn part_ids(&self) -> Vec<u64> {
        self.parts.iter().map(|p| p.id()).collect()
    }
}

impl fmt::Debug for MergeJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MergeJob")
            .field("kind", &self.kind)
            .field("parts", &self.part_ids())
            .finish()
    }
}

/// What the scheduler drives
pub trait MergeHost: Send + Sync + 'static {
    /// Periodic maintenance; returns at most `max_jobs` claimed merge jobs
    fn maintain(&self, max_jobs: usize) -> Vec<MergeJob>;

    /// Merge the job's parts and commit the output
    fn run_job(&self, job: &MergeJob, cancel: &CancellationToken) -> Result<()>;

    /// Give up on a job; its parts become eligible again
    fn release(&self, job: &MergeJob);
}

/// Delay before retry `attempt` (1-based): exponential, capped, plus up to
/// 50% jitter
pub(crate) fn backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(factor).min(max);
    let jitter_ms = delay.as_millis() as u64 / 2;
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    delay + Duration::from_millis(jitter)
}

/// Handle to the running scheduler; dropping it stops the workers
pub struct MergeScheduler {
    runtime: Option<Runtime>,
    cancel: CancellationToken,
}

impl MergeScheduler {
    /// Start the ticker and `config.workers` merge workers; cancelling
    /// `cancel` stops them
    pub fn start(
        host: Arc<dyn MergeHost>,
        config: &MergeConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.workers + 1)
            .thread_name("quiver-merge")
            .enable_all()
            .build()
            .map_err(|e| QuiverError::Merge(format!("failed to start merge runtime: {}", e)))?;

        let (tx, rx) = mpsc::channel::<MergeJob>(config.queue_capacity);
        let rx = Arc::new(Mutex::new(rx));

        for worker_id in 0..config.workers {
            runtime.spawn(worker(
                worker_id,
                host.clone(),
                rx.clone(),
                cancel.clone(),
                config.retry_base,
                config.retry_max,
            ));
        }
        runtime.spawn(ticker(host, tx, cancel.clone(), config.check_interval));

        info!(
            "Merge scheduler started with {} workers, checking every {:?}",
            config.workers, config.check_interval
        );

        Ok(Self {
            runtime: Some(runtime),
            cancel,
        })
    }

    /// Stop scheduling and wait for running merges to finish or abort
    ///
    /// Inside another async runtime the wait is not possible; the runtime is
    /// then left to wind down in the background.
    pub fn shutdown(&mut self) {
        self.cancel.cancel();
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            warn!("Merge scheduler stopped from an async context, not waiting for running merges");
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
        }
        info!("Merge scheduler stopped");
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn ticker(
    host: Arc<dyn MergeHost>,
    tx: mpsc::Sender<MergeJob>,
    cancel: CancellationToken,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let room = tx.capacity();
                let maintain_host = host.clone();
                let jobs = match tokio::task::spawn_blocking(move || maintain_host.maintain(room)).await {
                    Ok(jobs) => jobs,
                    Err(e) => {
                        error!("Maintenance tick failed: {}", e);
                        continue;
                    }
                };
                for job in jobs {
                    debug!("Queueing {} merge of parts {:?}", job.kind, job.part_ids());
                    if let Err(e) = tx.try_send(job) {
                        let job = match e {
                            mpsc::error::TrySendError::Full(job) => job,
                            mpsc::error::TrySendError::Closed(job) => job,
                        };
                        host.release(&job);
                    }
                }
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn worker(
    worker_id: usize,
    host: Arc<dyn MergeHost>,
    rx: Arc<Mutex<mpsc::Receiver<MergeJob>>>,
    cancel: CancellationToken,
    retry_base: Duration,
    retry_max: Duration,
) {
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                job = rx.recv() => job,
                _ = cancel.cancelled() => None,
            }
        };
        let Some(job) = job else { break };

        let job = Arc::new(job);
        let mut attempt = 0;
        loop {
            let run_host = host.clone();
            let run_job = job.clone();
            let run_cancel = cancel.clone();
            let result = tokio::task::spawn_blocking(move || run_host.run_job(&run_job, &run_cancel)).await;
            let err = match result {
                Ok(Ok(())) => break,
                Ok(Err(e)) => e,
                Err(e) => QuiverError::Merge(format!("merge task failed: {}", e)),
            };

            attempt += 1;
            if !err.is_retryable() || attempt >= MAX_ATTEMPTS || cancel.is_cancelled() {
                warn!(
                    "Worker {}: giving up on merge of parts {:?} after {} attempts: {}",
                    worker_id,
                    job.part_ids(),
                    attempt,
                    err
                );
                host.release(&job);
                break;
            }

            let delay = backoff(attempt, retry_base, retry_max);
            warn!(
                "Worker {}: merge of parts {:?} failed, retrying in {:?}: {}",
                worker_id,
                job.part_ids(),
                delay,
                err
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => {
                    host.release(&job);
                    break;
                }
            }
        }
    }
    debug!("Merge worker {} exiting", worker_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    #[derive(Default)]
    struct FakeHost {
        ticks: AtomicUsize,
        runs: AtomicUsize,
        released: AtomicUsize,
        finished: AtomicUsize,
        fail_first: usize,
        fatal: bool,
        wait_for_cancel: bool,
    }

    impl MergeHost for FakeHost {
        fn maintain(&self, max_jobs: usize) -> Vec<MergeJob> {
            assert!(max_jobs > 0);
            if self.ticks.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![MergeJob {
                    kind: MergeKind::Tiered,
                    parts: Vec::new(),
                }]
            } else {
                Vec::new()
            }
        }

        fn run_job(&self, _job: &MergeJob, cancel: &CancellationToken) -> Result<()> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if self.wait_for_cancel {
                while !cancel.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                // cleanup after noticing the cancellation
                std::thread::sleep(Duration::from_millis(100));
                self.finished.fetch_add(1, Ordering::SeqCst);
                return Err(QuiverError::Cancelled);
            }
            if self.fatal {
                return Err(QuiverError::Corruption("bad part".into()));
            }
            if run < self.fail_first {
                return Err(QuiverError::Merge("transient".into()));
            }
            Ok(())
        }

        fn release(&self, _job: &MergeJob) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn config() -> MergeConfig {
        MergeConfig {
            workers: 2,
            check_interval: Duration::from_millis(10),
            retry_base: Duration::from_millis(1),
            retry_max: Duration::from_millis(5),
            ..Default::default()
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(10) {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn test_failed_merge_is_retried() {
        let host = Arc::new(FakeHost {
            fail_first: 2,
            ..Default::default()
        });
        let mut scheduler = MergeScheduler::start(host.clone(), &config(), CancellationToken::new()).unwrap();

        assert!(wait_until(|| host.runs.load(Ordering::SeqCst) == 3));
        assert!(wait_until(|| host.ticks.load(Ordering::SeqCst) > 2));
        scheduler.shutdown();
        assert_eq!(host.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fatal_error_releases_job() {
        let host = Arc::new(FakeHost {
            fatal: true,
            ..Default::default()
        });
        let scheduler = MergeScheduler::start(host.clone(), &config(), CancellationToken::new()).unwrap();

        assert!(wait_until(|| host.released.load(Ordering::SeqCst) == 1));
        assert_eq!(host.runs.load(Ordering::SeqCst), 1);
        drop(scheduler);
    }

    #[test]
    fn test_shutdown_waits_for_running_merge() {
        let host = Arc::new(FakeHost {
            wait_for_cancel: true,
            ..Default::default()
        });
        let mut scheduler = MergeScheduler::start(host.clone(), &config(), CancellationToken::new()).unwrap();
        assert!(wait_until(|| host.runs.load(Ordering::SeqCst) == 1));

        scheduler.shutdown();
        assert_eq!(host.finished.load(Ordering::SeqCst), 1);
        assert_eq!(host.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_worker_drains_queue_until_cancelled() {
        let host = Arc::new(FakeHost {
            fail_first: 1,
            ..Default::default()
        });
        let (tx, rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(worker(
            0,
            host.clone(),
            Arc::new(Mutex::new(rx)),
            cancel.clone(),
            Duration::from_millis(1),
            Duration::from_millis(5),
        ));

        for _ in 0..3 {
            let job = MergeJob {
                kind: MergeKind::Forced,
                parts: Vec::new(),
            };
            tx.send(job).await.unwrap();
        }

        // one failed attempt plus three successful jobs
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            while host.runs.load(Ordering::SeqCst) < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(drained.is_ok());

        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(host.released.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_backoff_bounds() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(1);
        for attempt in 1..20 {
            let delay = backoff(attempt, base, max);
            let floor = base.saturating_mul(1 << (attempt - 1).min(16)).min(max);
            assert!(delay >= floor, "attempt {}: {:?}", attempt, delay);
            assert!(delay <= floor + floor / 2, "attempt {}: {:?}", attempt, delay);
        }
    }
}
