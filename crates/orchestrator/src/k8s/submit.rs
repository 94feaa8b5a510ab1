//! Workload submission: turning a session record into cluster resources.
//!
//! Submission is idempotent end to end: an already-existing pod or claim is
//! success, and `k8s_requested` only flips after the cluster accepted the
//! create calls.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::orchestrator::Orchestrator;
use crate::session::SessionRecord;

/// How long a blocked initialization waits before retrying the gate
const ADMISSION_RETRY_DELAY: Duration = Duration::from_secs(30);

impl Orchestrator {
    /// Create the cluster resources for a session.
    ///
    /// At or above the concurrent-session limit the job re-enqueues itself
    /// instead of proceeding; a later pass gets through once capacity frees
    /// up.
    pub async fn initialize_session(&self, session_id: &str) -> Result<()> {
        info!(session_id = %session_id, "initializing session");

        let active = self.store.count_active_past_init()?;
        if active >= self.config.sessions.max_sessions {
            info!(
                session_id = %session_id,
                active,
                max = self.config.sessions.max_sessions,
                "maximum sessions running; re-enqueueing initialization"
            );
            // Delay the retry so a full platform does not spin the worker
            let queue = self.queue.clone();
            let session_id = session_id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ADMISSION_RETRY_DELAY).await;
                queue.enqueue_initialize(session_id);
            });
            return Ok(());
        }

        let Some(session) = self.store.get(session_id)? else {
            error!(session_id = %session_id, "no session record to initialize");
            return Ok(());
        };
        if !session.active {
            info!(session_id = %session_id, "session already ended; skipping initialization");
            return Ok(());
        }

        self.submit_resources(&session).await
    }

    /// Build and submit the pod (and claim) for a session, then mark the
    /// record as requested. Shared by initialization and wedge repair.
    pub(crate) async fn submit_resources(&self, session: &SessionRecord) -> Result<()> {
        let secrets = self.cluster.probe_secrets(&self.config).await;
        let spec = self
            .spec_builder(secrets)
            .build(session)
            .context("building workload spec")?;

        if let Some(claim) = &spec.pvc {
            self.cluster
                .ensure_claim(claim)
                .await
                .context("ensuring session volume claim")?;
        }

        self.cluster
            .create_pod(&spec.pod)
            .await
            .context("creating session pod")?;

        self.store.mark_requested(&session.id)?;
        info!(
            session_id = %session.id,
            pod = spec.pod.metadata.name.as_deref().unwrap_or_default(),
            "session resources requested"
        );
        Ok(())
    }
}
