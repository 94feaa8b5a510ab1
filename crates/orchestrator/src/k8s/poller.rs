//! Status polling for recently-active sessions.
//!
//! Reads each session's pod by its deterministic name and folds the pod
//! phase and event stream into the record's state. A pod stuck short of
//! Running past the threshold is wedged: its resources are deleted and
//! resubmitted fresh.

use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use tracing::{error, info, warn};

use super::cluster::best_effort;
use super::{pod_ip, pod_phase};
use crate::orchestrator::Orchestrator;
use crate::session::{SessionRecord, SessionState};

/// What a Pending pod is waiting on, per its event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PendingReason {
    /// FailedScheduling on insufficient capacity; the cluster is scaling
    ScalingUp,
    /// Scheduled but the persistent volume has not attached
    WaitingVolume,
    /// Scheduled and just waiting on the IDE server
    WaitingStartup,
}

impl PendingReason {
    pub(crate) const fn state(self) -> SessionState {
        match self {
            Self::ScalingUp => SessionState::ScalingUp,
            Self::WaitingVolume => SessionState::WaitingVolume,
            Self::WaitingStartup => SessionState::WaitingStartup,
        }
    }
}

/// The reason/message pair of one pod event
#[derive(Debug, Clone, Default)]
pub(crate) struct EventSummary {
    pub reason: String,
    pub message: String,
}

impl From<&Event> for EventSummary {
    fn from(event: &Event) -> Self {
        Self {
            reason: event.reason.clone().unwrap_or_default(),
            message: event.message.clone().unwrap_or_default(),
        }
    }
}

/// Classify what a Pending pod is waiting on.
///
/// A FailedScheduling event citing insufficient capacity before any
/// Scheduled event means the cluster is adding nodes, which is worth
/// telling the user apart from plain queueing.
pub(crate) fn classify_pending(events: &[EventSummary], persistent_storage: bool) -> PendingReason {
    let mut scheduled = false;
    let mut scaling = false;
    let mut volume_attached = false;

    for event in events {
        if event.reason.contains("Scheduled") {
            scheduled = true;
        } else if event.reason.contains("FailedScheduling")
            && event.message.contains("Insufficient")
        {
            scaling = true;
        } else if event.message.contains("AttachVolume.Attach succeeded") {
            volume_attached = true;
        }
    }

    if !scheduled && scaling {
        PendingReason::ScalingUp
    } else if scheduled && persistent_storage && !volume_attached {
        PendingReason::WaitingVolume
    } else {
        PendingReason::WaitingStartup
    }
}

/// A session is wedged when it has sat short of Running past the threshold
pub(crate) fn is_wedged(
    age: chrono::Duration,
    phase: Option<&str>,
    threshold: chrono::Duration,
) -> bool {
    age > threshold && phase != Some("Running")
}

impl Orchestrator {
    /// Poll every recently-created active session.
    ///
    /// Sessions whose lock is held (a stop is in flight) are skipped; the
    /// next cycle retries.
    pub async fn update_all_sessions(&self) -> anyhow::Result<()> {
        let window = self.config.sessions.recent_window();
        for session in self.store.list_recent_active(window)? {
            let Some(_guard) = self.locks.try_acquire(&session.id) else {
                continue;
            };
            if let Err(err) = self.update_session(&session).await {
                warn!(session_id = %session.id, error = %err, "session update failed");
            }
        }
        Ok(())
    }

    /// Fold one session's pod status into its record.
    ///
    /// Transient read errors abandon the poll without mutating anything;
    /// the next cycle sees fresh state.
    pub async fn update_session(&self, session: &SessionRecord) -> anyhow::Result<()> {
        let pod_name = super::pod_name(session);
        let age = session.age(Utc::now());

        let pod = match self.cluster.get_pod(&pod_name).await {
            Ok(Some(pod)) => pod,
            Ok(None) => {
                // Not materialized yet; expected shortly after submission
                if session.state != SessionState::WaitingScheduled {
                    self.store
                        .set_state(&session.id, SessionState::WaitingScheduled)?;
                }
                return Ok(());
            }
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "pod read failed; abandoning poll");
                return Ok(());
            }
        };

        let phase = pod_phase(&pod);

        if is_wedged(age, phase, self.config.sessions.stuck_threshold()) {
            return self.repair_wedged(session).await;
        }

        match phase {
            Some("Pending") => {
                let events = best_effort("list pod events", self.cluster.pod_events(&pod_name))
                    .await
                    .unwrap_or_default();
                let summaries: Vec<EventSummary> =
                    events.iter().map(EventSummary::from).collect();
                let reason = classify_pending(&summaries, session.persistent_storage);
                self.store.set_state(&session.id, reason.state())?;
            }
            Some("Failed") => {
                // Terminal; the reconciliation loop cleans the pod up later
                error!(session_id = %session.id, pod = %pod_name, "session pod failed");
                self.store.mark_failed(&session.id)?;
            }
            Some("Running") => {
                self.store
                    .set_cluster_address(&session.id, pod_ip(&pod))?;
                self.store.set_state(&session.id, SessionState::Running)?;
                info!(session_id = %session.id, pod = %pod_name, "session running");
            }
            _ => {}
        }

        Ok(())
    }

    /// Delete and resubmit a wedged session's resources.
    ///
    /// Each step is abandoned on failure and retried by the next poll
    /// cycle; repeated wedging repeats the repair until the age-out sweep
    /// gives up on the session entirely.
    async fn repair_wedged(&self, session: &SessionRecord) -> anyhow::Result<()> {
        warn!(session_id = %session.id, "session wedged; recreating resources");

        self.store.reset_requested_for_repair(&session.id)?;

        if let Err(err) = self.cluster.delete_session_resources(&session.id).await {
            error!(session_id = %session.id, error = %err, "failed to delete wedged resources");
            return Ok(());
        }

        if let Err(err) = self.submit_resources(session).await {
            error!(session_id = %session.id, error = %err, "failed to recreate wedged session");
        }
        Ok(())
    }
}
