//! Orchestrator context.
//!
//! Ties together the session store, the cluster client, the per-session
//! locks, and the collaborator interfaces. The lifecycle operations live in
//! the `k8s` submodules as further `impl Orchestrator` blocks:
//! `submit`, `poller`, `reconcile`, and `reap`.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::auth::TokenIssuer;
use crate::catalog::{
    CourseDirectory, GradingBackend, ImageCatalog, ReservedSessions, SecretPresence, StoragePolicy,
};
use crate::config::OrchestratorConfig;
use crate::k8s::{ClusterClient, SpecBuilder};
use crate::lock::SessionLocks;
use crate::queue::JobQueue;
use crate::session::{CreateSession, SessionRecord};
use crate::store::SessionStore;

/// External platform state the core depends on
pub struct Collaborators {
    pub catalog: Arc<dyn ImageCatalog>,
    pub storage: Arc<dyn StoragePolicy>,
    pub courses: Arc<dyn CourseDirectory>,
    pub reserved: Arc<dyn ReservedSessions>,
    pub grading: Arc<dyn GradingBackend>,
    pub tokens: Arc<dyn TokenIssuer>,
}

/// Session orchestration core
pub struct Orchestrator {
    pub(crate) config: OrchestratorConfig,
    pub(crate) store: Arc<dyn SessionStore>,
    pub(crate) cluster: ClusterClient,
    pub(crate) locks: SessionLocks,
    pub(crate) collab: Collaborators,
    pub(crate) queue: JobQueue,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        store: Arc<dyn SessionStore>,
        cluster: ClusterClient,
        collab: Collaborators,
        queue: JobQueue,
    ) -> Self {
        Self {
            config,
            store,
            cluster,
            locks: SessionLocks::new(),
            collab,
            queue,
        }
    }

    /// Create a session record and enqueue its initialization.
    ///
    /// This is the entry point the web layer calls; the returned record's id
    /// is what it polls while the session comes up.
    pub fn create_session(&self, opts: CreateSession) -> Result<SessionRecord> {
        let record = SessionRecord::create(opts);
        self.store.insert(&record)?;
        info!(session_id = %record.id, owner = %record.owner_username, "session created");
        self.queue.enqueue_initialize(record.id.clone());
        Ok(record)
    }

    /// Spec builder over the current collaborators and a resolved secret probe
    pub(crate) fn spec_builder(&self, secrets: SecretPresence) -> SpecBuilder<'_> {
        SpecBuilder {
            config: &self.config,
            catalog: self.collab.catalog.as_ref(),
            storage: self.collab.storage.as_ref(),
            courses: self.collab.courses.as_ref(),
            grading: self.collab.grading.as_ref(),
            tokens: self.collab.tokens.as_ref(),
            secrets,
        }
    }

    pub fn store(&self) -> &dyn SessionStore {
        self.store.as_ref()
    }
}
