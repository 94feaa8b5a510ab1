//! Reconciliation loop between cluster state and session records.
//!
//! Runs periodically: lists every session pod, syncs addresses, ages out
//! sessions past the maximum lifetime, then repairs drift in both
//! directions. Every step is idempotent and keyed by session id, so a crash
//! mid-sweep resumes cleanly on the next period.

use std::collections::HashSet;

use anyhow::Result;
use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use tracing::{info, warn};

use super::{pod_ip, pod_session_id};
use crate::orchestrator::Orchestrator;
use crate::session::{SessionId, SessionRecord, SessionState};

/// Mismatches between live pods and the should-be-live record set
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Drift {
    /// Pods with no live record behind them: reap their resources
    pub reap: Vec<SessionId>,
    /// Records with no pod left: deactivate in bulk
    pub deactivate: Vec<SessionId>,
}

/// Diff the pod set against the should-be-live set.
///
/// Reserved ids are unioned into the live set first, so a reserved session
/// is never torn down for being idle - with or without a pod.
pub(crate) fn compute_drift(
    pod_ids: &HashSet<SessionId>,
    live_ids: &HashSet<SessionId>,
    reserved_ids: &HashSet<SessionId>,
) -> Drift {
    let should_live: HashSet<SessionId> = live_ids.union(reserved_ids).cloned().collect();

    let mut reap: Vec<SessionId> = pod_ids.difference(&should_live).cloned().collect();
    let mut deactivate: Vec<SessionId> = should_live
        .difference(pod_ids)
        .filter(|id| !reserved_ids.contains(*id))
        .cloned()
        .collect();

    reap.sort();
    deactivate.sort();
    Drift { reap, deactivate }
}

impl Orchestrator {
    /// One reconciliation pass.
    ///
    /// A failed pod listing abandons the whole pass; each later step is
    /// individually best-effort.
    pub async fn reap_stale_sessions(&self) -> Result<()> {
        info!("reconciling sessions");

        let pods = match self.cluster.list_session_pods().await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(error = %err, "pod listing failed; abandoning reconcile pass");
                return Ok(());
            }
        };

        self.sync_cluster_addresses(&pods)?;
        self.reap_aged_out(&pods).await?;
        self.repair_drift(&pods).await?;
        self.recover_unrequested()?;
        Ok(())
    }

    /// Re-enqueue initialization for active sessions that never had their
    /// resources requested, so a lost initialize job heals within one pass.
    /// Sessions that never initialized within the maximum lifetime are ended
    /// instead of retried forever.
    fn recover_unrequested(&self) -> Result<()> {
        let cutoff = Utc::now() - self.config.sessions.stale_timeout();
        let mut expired = Vec::new();
        for session in self.store.list_active_unrequested()? {
            if session.created <= cutoff {
                expired.push(session.id);
                continue;
            }
            info!(session_id = %session.id, "requeueing initialization for unrequested session");
            self.queue.enqueue_initialize(session.id);
        }
        if !expired.is_empty() {
            info!(sessions = ?expired, "ending unrequested sessions past maximum lifetime");
            self.store.mark_ended_many(&expired, SessionState::Ended)?;
        }
        Ok(())
    }

    /// Copy each pod's assigned address onto its session record
    fn sync_cluster_addresses(&self, pods: &[Pod]) -> Result<()> {
        for pod in pods {
            let Some(session_id) = pod_session_id(pod) else {
                continue;
            };
            if self.store.get(session_id)?.is_none() {
                continue;
            }
            self.store.set_cluster_address(session_id, pod_ip(pod))?;
        }
        Ok(())
    }

    /// Reap every session older than the maximum lifetime
    async fn reap_aged_out(&self, pods: &[Pod]) -> Result<()> {
        let cutoff = Utc::now() - self.config.sessions.stale_timeout();

        let mut aged = Vec::new();
        for pod in pods {
            let Some(session_id) = pod_session_id(pod) else {
                continue;
            };
            let Some(session) = self.store.get(session_id)? else {
                continue;
            };
            if session.created > cutoff {
                continue;
            }
            aged.push(session);
        }

        if !aged.is_empty() {
            info!(count = aged.len(), "aging out sessions past maximum lifetime");
            self.reap_sessions_batched(&aged).await?;
        }
        Ok(())
    }

    /// Repair drift between the pod set and the should-be-live record set
    async fn repair_drift(&self, pods: &[Pod]) -> Result<()> {
        let pod_ids: HashSet<SessionId> = pods
            .iter()
            .filter_map(pod_session_id)
            .map(str::to_string)
            .collect();
        let live_ids: HashSet<SessionId> = self
            .should_be_live()?
            .into_iter()
            .map(|session| session.id)
            .collect();
        let reserved_ids = self.collab.reserved.reserved_session_ids();

        let drift = compute_drift(&pod_ids, &live_ids, &reserved_ids);
        if !drift.reap.is_empty() {
            info!(sessions = ?drift.reap, "reaping stale session pods");
        }
        if !drift.deactivate.is_empty() {
            info!(sessions = ?drift.deactivate, "deactivating records with no pod");
        }

        for session_id in &drift.reap {
            if let Err(err) = self.reap_session_by_id(session_id).await {
                warn!(session_id = %session_id, error = %err, "stale pod reap failed");
            }
        }

        // No cluster resources left to clean up for these, so this is the
        // one deactivation that bypasses the lifecycle controller
        self.store.deactivate_many(&drift.deactivate)?;
        Ok(())
    }

    /// Sessions that should currently have a pod.
    ///
    /// Built per course because admin and student sessions get different
    /// idle windows, plus a course-less bucket held to the student window.
    fn should_be_live(&self) -> Result<Vec<SessionRecord>> {
        let now = Utc::now();
        let standard_cutoff = now - self.config.sessions.stale_proxy_window();
        let admin_cutoff = now - self.config.sessions.admin_stale_proxy_window();

        let mut live = Vec::new();

        for course in self.collab.courses.active_courses() {
            let admins = self.collab.courses.course_admin_ids(&course.id);

            for session in self.store.list_active_requested(Some(&course.id))? {
                let cutoff = if admins.contains(&session.owner_id) {
                    admin_cutoff
                } else {
                    standard_cutoff
                };
                if session.last_proxy.is_some_and(|at| at >= cutoff) {
                    live.push(session);
                }
            }
        }

        // Course-less sessions are held to the standard window
        for session in self.store.list_active_requested(None)? {
            if session.last_proxy.is_some_and(|at| at >= standard_cutoff) {
                live.push(session);
            }
        }

        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> HashSet<SessionId> {
        values.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_drift_reserved_session_untouched() {
        // Pods {A, B, C}, should-be-live {B, C, D} with D reserved:
        // A is reaped, D is left alone, B and C are untouched.
        let drift = compute_drift(&ids(&["A", "B", "C"]), &ids(&["B", "C"]), &ids(&["D"]));
        assert_eq!(drift.reap, vec!["A".to_string()]);
        assert!(drift.deactivate.is_empty());
    }

    #[test]
    fn test_drift_reserved_pod_not_reaped() {
        // A reserved session keeps its pod even when idle
        let drift = compute_drift(&ids(&["A", "R"]), &ids(&[]), &ids(&["R"]));
        assert_eq!(drift.reap, vec!["A".to_string()]);
        assert!(drift.deactivate.is_empty());
    }

    #[test]
    fn test_drift_record_without_pod_deactivates() {
        let drift = compute_drift(&ids(&["A"]), &ids(&["A", "B"]), &ids(&[]));
        assert!(drift.reap.is_empty());
        assert_eq!(drift.deactivate, vec!["B".to_string()]);
    }

    #[test]
    fn test_drift_converged_is_empty() {
        let drift = compute_drift(&ids(&["A", "B"]), &ids(&["A", "B"]), &ids(&[]));
        assert_eq!(drift, Drift::default());
    }
}
