//! Background job dispatch.
//!
//! A small in-process job system with the semantics the engine needs:
//! - at-least-once delivery to a pool of workers sharing one queue
//! - keyed deduplication while a job is queued ([`Job::dedup_key`])
//! - delayed enqueue (`TickRollout` re-arms itself a second out)
//! - cron-style recurring jobs
//! - bounded retries with exponential backoff and jitter
//! - cooperative shutdown through a [`CancellationToken`]
//!
//! Handlers must be idempotent: every state transition they perform goes
//! through a conditional store operation, so a redelivered job observes a
//! stale precondition and exits.

mod job;
mod retry;

use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use job::Job;
pub use retry::{RetryConfig, delay_for_attempt};

/// Work executed for each job. One implementation wires the whole engine.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

/// Dispatcher sizing and retry policy.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Concurrent workers consuming the queue.
    pub workers: usize,
    /// Bounded depth of the ready queue.
    pub queue_capacity: usize,
    pub retry: RetryConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self { workers: 4, queue_capacity: 1024, retry: RetryConfig::default() }
    }
}

/// A recurring job definition.
#[derive(Debug, Clone)]
pub struct CronJob {
    pub period: Duration,
    pub job: Job,
}

struct Envelope {
    job: Job,
    attempt: u32,
    run_at: Instant,
    seq: u64,
}

impl PartialEq for Envelope {
    fn eq(&self, other: &Self) -> bool {
        self.run_at == other.run_at && self.seq == other.seq
    }
}
impl Eq for Envelope {}
impl PartialOrd for Envelope {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Envelope {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; invert so the earliest deadline pops first.
        (other.run_at, other.seq).cmp(&(self.run_at, self.seq))
    }
}

struct QueueShared {
    pending_keys: Mutex<HashSet<String>>,
    seq: Mutex<u64>,
}

/// Cloneable handle for submitting jobs.
#[derive(Clone)]
pub struct JobQueue {
    submit: mpsc::UnboundedSender<Envelope>,
    shared: Arc<QueueShared>,
}

impl JobQueue {
    /// A queue with no dispatcher behind it; every submission is dropped.
    /// Useful in tests and in embedded setups that drive services directly.
    pub fn detached() -> Self {
        let (submit, _rx) = mpsc::unbounded_channel();
        Self {
            submit,
            shared: Arc::new(QueueShared {
                pending_keys: Mutex::new(HashSet::new()),
                seq: Mutex::new(0),
            }),
        }
    }

    /// Submit a job for immediate execution. Returns false when an identical
    /// keyed job is already queued (or the dispatcher has shut down).
    pub fn enqueue(&self, job: Job) -> bool {
        self.submit_with(job, 1, Duration::ZERO)
    }

    /// Submit a job to run after `delay`. Same dedup rules as [`enqueue`].
    ///
    /// [`enqueue`]: JobQueue::enqueue
    pub fn enqueue_in(&self, job: Job, delay: Duration) -> bool {
        self.submit_with(job, 1, delay)
    }

    fn submit_with(&self, job: Job, attempt: u32, delay: Duration) -> bool {
        if let Some(key) = job.dedup_key() {
            let mut keys = self.shared.pending_keys.lock().expect("pending_keys lock");
            if !keys.insert(key) {
                debug!(job = job.label(), "dropping duplicate queued job");
                return false;
            }
        }
        let seq = {
            let mut seq = self.shared.seq.lock().expect("seq lock");
            *seq += 1;
            *seq
        };
        let envelope = Envelope { job, attempt, run_at: Instant::now() + delay, seq };
        let key = envelope.job.dedup_key();
        if self.submit.send(envelope).is_ok() {
            return true;
        }
        // The dispatcher is gone; do not hold the key hostage.
        if let Some(key) = key {
            self.shared
                .pending_keys
                .lock()
                .expect("pending_keys lock")
                .remove(&key);
        }
        false
    }

    /// Release a job's dedup key; called by a worker the moment it takes the
    /// job, so a re-enqueue during execution is not lost.
    fn release_key(&self, job: &Job) {
        if let Some(key) = job.dedup_key() {
            self.shared
                .pending_keys
                .lock()
                .expect("pending_keys lock")
                .remove(&key);
        }
    }
}

/// The running dispatcher: scheduler, worker pool, and cron loops.
pub struct Dispatcher {
    queue: JobQueue,
    tasks: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Start the dispatcher. The returned value owns every spawned task;
    /// cancel `cancel` (or call [`Dispatcher::shutdown`]) to stop them.
    pub fn start(
        handler: Arc<dyn JobHandler>,
        config: DispatchConfig,
        crons: Vec<CronJob>,
        cancel: CancellationToken,
    ) -> Self {
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::channel(config.queue_capacity.max(1));
        let shared = Arc::new(QueueShared {
            pending_keys: Mutex::new(HashSet::new()),
            seq: Mutex::new(0),
        });
        let queue = JobQueue { submit: submit_tx, shared };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(run_scheduler(submit_rx, work_tx, cancel.clone())));

        let work_rx = Arc::new(tokio::sync::Mutex::new(work_rx));
        for worker in 0..config.workers.max(1) {
            tasks.push(tokio::spawn(run_worker(
                worker,
                Arc::clone(&work_rx),
                Arc::clone(&handler),
                queue.clone(),
                config.retry.clone(),
                cancel.clone(),
            )));
        }

        for cron in crons {
            tasks.push(tokio::spawn(run_cron(cron, queue.clone(), cancel.clone())));
        }

        Self { queue, tasks, cancel }
    }

    pub fn queue(&self) -> JobQueue {
        self.queue.clone()
    }

    /// Cancel and wait for every task.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

async fn run_scheduler(
    mut submit_rx: mpsc::UnboundedReceiver<Envelope>,
    work_tx: mpsc::Sender<Envelope>,
    cancel: CancellationToken,
) {
    let mut heap: BinaryHeap<Envelope> = BinaryHeap::new();
    loop {
        let next_deadline = heap.peek().map(|e| e.run_at);
        tokio::select! {
            _ = cancel.cancelled() => return,
            received = submit_rx.recv() => match received {
                Some(envelope) => heap.push(envelope),
                None => return,
            },
            _ = deadline_sleep(next_deadline) => {}
        }
        while heap.peek().is_some_and(|e| e.run_at <= Instant::now()) {
            let envelope = heap.pop().expect("peeked entry");
            if work_tx.send(envelope).await.is_err() {
                return;
            }
        }
    }
}

async fn deadline_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn run_worker(
    worker: usize,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Envelope>>>,
    handler: Arc<dyn JobHandler>,
    queue: JobQueue,
    retry: RetryConfig,
    cancel: CancellationToken,
) {
    loop {
        let envelope = {
            let mut rx = tokio::select! {
                _ = cancel.cancelled() => return,
                guard = work_rx.lock() => guard,
            };
            tokio::select! {
                _ = cancel.cancelled() => return,
                received = rx.recv() => match received {
                    Some(envelope) => envelope,
                    None => return,
                },
            }
        };

        queue.release_key(&envelope.job);
        let label = envelope.job.label();
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return,
            outcome = handler.handle(envelope.job.clone()) => outcome,
        };
        match outcome {
            Ok(()) => debug!(worker, job = label, attempt = envelope.attempt, "job done"),
            Err(err) => {
                let max = envelope.job.max_attempts();
                if envelope.attempt < max {
                    let delay = delay_for_attempt(&retry, envelope.attempt);
                    warn!(
                        worker, job = label, attempt = envelope.attempt, ?delay,
                        error = %err, "job failed; retrying"
                    );
                    queue.submit_with(envelope.job, envelope.attempt + 1, delay);
                } else {
                    error!(
                        worker, job = label, attempts = envelope.attempt,
                        error = %err, "job failed; retries exhausted"
                    );
                }
            }
        }
    }
}

async fn run_cron(cron: CronJob, queue: JobQueue, cancel: CancellationToken) {
    let mut interval = tokio::time::interval_at(Instant::now() + cron.period, cron.period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = interval.tick() => {
                queue.enqueue(cron.job.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::Notify;

    #[derive(Default)]
    struct Recorder {
        ticks: AtomicU32,
        sweeps: AtomicU32,
        scans: AtomicU32,
        compile_failures_left: AtomicU32,
        compiles: AtomicU32,
        gate: Option<Arc<Notify>>,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn gated() -> (Arc<Self>, Arc<Notify>) {
            let gate = Arc::new(Notify::new());
            let recorder = Arc::new(Self { gate: Some(Arc::clone(&gate)), ..Self::default() });
            (recorder, gate)
        }
    }

    #[async_trait]
    impl JobHandler for Recorder {
        async fn handle(&self, job: Job) -> anyhow::Result<()> {
            match job {
                Job::TickRollout { .. } => {
                    self.ticks.fetch_add(1, Ordering::SeqCst);
                }
                Job::LivenessSweep => {
                    if let Some(gate) = &self.gate {
                        gate.notified().await;
                    }
                    self.sweeps.fetch_add(1, Ordering::SeqCst);
                }
                Job::CompileBundle { .. } => {
                    self.compiles.fetch_add(1, Ordering::SeqCst);
                    let left = self.compile_failures_left.load(Ordering::SeqCst);
                    if left > 0 {
                        self.compile_failures_left.fetch_sub(1, Ordering::SeqCst);
                        anyhow::bail!("transient failure");
                    }
                }
                Job::DriftScan => {
                    self.scans.fetch_add(1, Ordering::SeqCst);
                }
                _ => {}
            }
            Ok(())
        }
    }

    fn quick_retry() -> DispatchConfig {
        DispatchConfig {
            workers: 1,
            queue_capacity: 64,
            retry: RetryConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(20),
                jitter: 0.0,
            },
        }
    }

    #[tokio::test]
    async fn queued_keyed_jobs_are_deduplicated() {
        let (recorder, gate) = Recorder::gated();
        let dispatcher = Dispatcher::start(
            recorder.clone(),
            quick_retry(),
            vec![],
            CancellationToken::new(),
        );
        let queue = dispatcher.queue();

        // Park the single worker on a gated job so later submissions queue up.
        assert!(queue.enqueue(Job::LivenessSweep));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rollout_id = sentinel_types::new_id();
        assert!(queue.enqueue(Job::TickRollout { rollout_id }));
        assert!(!queue.enqueue(Job::TickRollout { rollout_id }), "duplicate must be dropped");

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.sweeps.load(Ordering::SeqCst), 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn key_is_released_once_execution_starts() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::start(
            recorder.clone(),
            quick_retry(),
            vec![],
            CancellationToken::new(),
        );
        let queue = dispatcher.queue();
        let rollout_id = sentinel_types::new_id();

        assert!(queue.enqueue(Job::TickRollout { rollout_id }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // First instance finished, so the key is free again.
        assert!(queue.enqueue(Job::TickRollout { rollout_id }));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 2);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn delayed_jobs_run_after_their_delay() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::start(
            recorder.clone(),
            quick_retry(),
            vec![],
            CancellationToken::new(),
        );
        let queue = dispatcher.queue();

        queue.enqueue_in(
            Job::TickRollout { rollout_id: sentinel_types::new_id() },
            Duration::from_millis(150),
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 0, "too early");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(recorder.ticks.load(Ordering::SeqCst), 1);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn failed_jobs_retry_up_to_max_attempts() {
        let recorder = Recorder::new();
        recorder.compile_failures_left.store(2, Ordering::SeqCst);
        let dispatcher = Dispatcher::start(
            recorder.clone(),
            quick_retry(),
            vec![],
            CancellationToken::new(),
        );
        let queue = dispatcher.queue();

        queue.enqueue(Job::CompileBundle { bundle_id: sentinel_types::new_id() });
        tokio::time::sleep(Duration::from_millis(300)).await;
        // Two failures, then success on the third and final attempt.
        assert_eq!(recorder.compiles.load(Ordering::SeqCst), 3);

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn cron_jobs_fire_repeatedly() {
        let recorder = Recorder::new();
        let dispatcher = Dispatcher::start(
            recorder.clone(),
            quick_retry(),
            vec![CronJob { period: Duration::from_millis(50), job: Job::DriftScan }],
            CancellationToken::new(),
        );
        tokio::time::sleep(Duration::from_millis(230)).await;
        dispatcher.shutdown().await;
        assert!(recorder.scans.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn shutdown_stops_workers_even_mid_job() {
        let (recorder, _gate) = Recorder::gated();
        let cancel = CancellationToken::new();
        let dispatcher = Dispatcher::start(recorder, quick_retry(), vec![], cancel.clone());
        let queue = dispatcher.queue();
        queue.enqueue(Job::LivenessSweep);
        tokio::time::sleep(Duration::from_millis(30)).await;
        // The worker is parked inside the gated job; shutdown must still return.
        dispatcher.shutdown().await;
        // The scheduler is gone, so further submissions are rejected.
        assert!(!queue.enqueue(Job::DriftScan));
    }
}
