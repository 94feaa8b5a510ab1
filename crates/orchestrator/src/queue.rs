//! Asynchronous job queue and worker loop.
//!
//! The web layer and the periodic tickers talk to the orchestrator only by
//! enqueueing jobs; the worker drains them one at a time. No job failure
//! aborts the worker - every failure mode is retried by a later enqueue or
//! the next periodic cycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::select;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::Orchestrator;
use crate::session::SessionId;

/// Unit of work dispatched to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Create cluster resources for a session
    Initialize(SessionId),
    /// Tear a single session down
    Stop(SessionId),
    /// Run the reconciliation loop
    ReapStale,
    /// Poll status for all recently-active sessions
    UpdateAll,
}

/// Handle for enqueueing jobs
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl JobQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn enqueue(&self, job: Job) {
        if self.tx.send(job).is_err() {
            error!("job queue closed; dropping job");
        }
    }

    pub fn enqueue_initialize(&self, session_id: impl Into<SessionId>) {
        self.enqueue(Job::Initialize(session_id.into()));
    }

    pub fn enqueue_stop(&self, session_id: impl Into<SessionId>) {
        self.enqueue(Job::Stop(session_id.into()));
    }

    pub fn enqueue_reap_stale(&self) {
        self.enqueue(Job::ReapStale);
    }

    pub fn enqueue_update_all(&self) {
        self.enqueue(Job::UpdateAll);
    }
}

/// Worker draining the job queue
pub struct Worker {
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn the worker loop
    pub fn spawn(
        orchestrator: Arc<Orchestrator>,
        rx: mpsc::UnboundedReceiver<Job>,
        shutdown: CancellationToken,
    ) -> Self {
        let handle = tokio::spawn(Self::run(orchestrator, rx, shutdown));
        Self { handle }
    }

    pub async fn join(self) {
        let _ = self.handle.await;
    }

    async fn run(
        orchestrator: Arc<Orchestrator>,
        mut rx: mpsc::UnboundedReceiver<Job>,
        shutdown: CancellationToken,
    ) {
        info!("session worker started");
        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    Self::dispatch(&orchestrator, job).await;
                }
            }
        }
        info!("session worker shut down");
    }

    async fn dispatch(orchestrator: &Orchestrator, job: Job) {
        let result = match &job {
            Job::Initialize(session_id) => orchestrator.initialize_session(session_id).await,
            Job::Stop(session_id) => orchestrator.reap_session_by_id(session_id).await,
            Job::ReapStale => orchestrator.reap_stale_sessions().await,
            Job::UpdateAll => orchestrator.update_all_sessions().await,
        };
        if let Err(err) = result {
            error!(job = ?job, error = %err, "job failed; will retry on a later cycle");
        }
    }
}

/// Spawn the periodic tickers that drive reconciliation and status polling
pub fn spawn_tickers(
    queue: JobQueue,
    shutdown: CancellationToken,
    reap_every: Duration,
    update_every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut reap = interval(reap_every);
        let mut update = interval(update_every);
        loop {
            select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = reap.tick() => queue.enqueue_reap_stale(),
                _ = update.tick() => queue.enqueue_update_all(),
            }
        }
    })
}
