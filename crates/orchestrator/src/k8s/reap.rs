//! Lifecycle controller: stopping and reaping sessions.
//!
//! Reaping is two effects, always both: (1) mark the session's cluster
//! resources for deletion (backgrounded), then (2) finalize the record.
//! A failed delete never blocks the record update; the reconciliation
//! loop's drift repair retries cluster cleanup on the next pass.

use anyhow::Result;
use tracing::{error, info, warn};

use super::cluster::best_effort;
use super::pvc;
use crate::orchestrator::Orchestrator;
use crate::session::{SessionRecord, SessionState};

/// Batched record updates during sweeps are committed in chunks this size
pub(crate) const REAP_COMMIT_CHUNK: usize = 5;

/// Status written onto a grading run whose session was reaped
const GRADING_FINALIZE_STATUS: &str = "IDE session ended";

impl Orchestrator {
    /// Reap one session: delete its resources and finalize the record
    pub async fn reap_session(&self, session: &SessionRecord) -> Result<()> {
        info!(session_id = %session.id, "reaping session");

        // The delete is marked, not awaited; failure is retried by the
        // next reconciliation pass
        best_effort(
            "delete session resources",
            self.cluster.delete_session_resources(&session.id),
        )
        .await;

        self.store.mark_ended(&session.id, SessionState::Ended)?;
        self.finalize_grading(session);
        Ok(())
    }

    /// Reap a session by id; called for explicit stop requests
    pub async fn reap_session_by_id(&self, session_id: &str) -> Result<()> {
        info!(session_id = %session_id, "stop requested");

        // Hold the session lock so a concurrent poll cannot race the stop;
        // if the poller holds it, put the stop back on the queue.
        let Some(_guard) = self.locks.try_acquire(session_id) else {
            warn!(session_id = %session_id, "session busy; re-enqueueing stop");
            self.queue.enqueue_stop(session_id.to_string());
            return Ok(());
        };

        let Some(session) = self.store.get(session_id)? else {
            error!(session_id = %session_id, "no session record to reap");
            return Ok(());
        };
        self.reap_session(&session).await
    }

    /// Reap every active session in a course (kicks everyone off their IDE)
    pub async fn reap_sessions_in_course(&self, course_id: &str) -> Result<()> {
        info!(course_id = %course_id, "reaping all course sessions");
        let sessions = self.store.list_active_in_course(course_id)?;
        self.reap_sessions_batched(&sessions).await
    }

    /// Reap every active playground session
    pub async fn reap_all_playgrounds(&self) -> Result<()> {
        info!("reaping all playground sessions");
        let sessions = self.store.list_active_playgrounds()?;
        self.reap_sessions_batched(&sessions).await
    }

    /// Reap many sessions, committing record updates in bounded chunks so a
    /// killed worker loses at most one chunk of progress.
    pub(crate) async fn reap_sessions_batched(&self, sessions: &[SessionRecord]) -> Result<()> {
        for chunk in sessions.chunks(REAP_COMMIT_CHUNK) {
            for session in chunk {
                best_effort(
                    "delete session resources",
                    self.cluster.delete_session_resources(&session.id),
                )
                .await;
                self.finalize_grading(session);
            }
            let ids: Vec<_> = chunk.iter().map(|s| s.id.clone()).collect();
            self.store.mark_ended_many(&ids, SessionState::Ended)?;
        }
        Ok(())
    }

    /// Delete a user's persistent volume claim
    pub async fn reap_user_volume(&self, username: &str) -> Result<()> {
        let claim = pvc::user_claim_name(username);
        info!(username = %username, claim = %claim, "deleting user volume");
        self.cluster.delete_claim(&claim).await?;
        Ok(())
    }

    /// Finalize a linked grading run as part of the same logical teardown
    fn finalize_grading(&self, session: &SessionRecord) {
        if let Some(run_id) = &session.grading_run_id {
            if let Err(err) = self
                .collab
                .grading
                .finalize_run(run_id, GRADING_FINALIZE_STATUS)
            {
                error!(
                    session_id = %session.id,
                    grading_run_id = %run_id,
                    error = %err,
                    "failed to finalize grading run"
                );
            }
        }
    }
}
