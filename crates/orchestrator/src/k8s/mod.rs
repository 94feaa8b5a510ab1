//! Kubernetes integration for IDE session workloads.
//!
//! One pod (and at most one persistent volume claim) exists per active
//! session. The modules here cover the full resource lifecycle:
//! - `spec`: deterministic pod/claim construction from a session record
//! - `submit`: idempotent resource creation
//! - `poller`: per-session status updates and wedge repair
//! - `reconcile`: periodic drift repair between cluster and store
//! - `reap`: teardown of a session's resources and record

pub mod cluster;
pub mod poller;
pub mod pvc;
pub mod reap;
pub mod reconcile;
pub mod spec;
pub mod submit;

pub use cluster::{best_effort, ClusterClient, ClusterError};
pub use spec::{SpecBuilder, WorkloadSpec};

use k8s_openapi::api::core::v1::Pod;

use crate::session::SessionRecord;

/// `app.kubernetes.io/name` value on every resource this crate creates
pub const APP_NAME: &str = "workbench";

/// Role label value for session pods; the reconciler's join key
pub const ROLE_IDE_SESSION: &str = "ide-session";

/// Role label value for persistent session volumes
pub const ROLE_SESSION_STORAGE: &str = "session-storage";

/// Hostname set inside session pods so shells read `user@workbench-ide`
pub const POD_HOSTNAME: &str = "workbench-ide";

/// Deterministic pod name for a session
pub fn pod_name(session: &SessionRecord) -> String {
    format!("ide-{}-{}", session.owner_username, session.id)
}

/// Label selector matching every session pod
pub fn session_role_selector() -> String {
    format!("app.kubernetes.io/name={APP_NAME},role={ROLE_IDE_SESSION}")
}

/// Label selector matching one session's resources
pub fn session_id_selector(session_id: &str) -> String {
    format!("app.kubernetes.io/name={APP_NAME},role={ROLE_IDE_SESSION},session={session_id}")
}

/// Session id recorded on a pod's labels, if any
pub fn pod_session_id(pod: &Pod) -> Option<&str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("session"))
        .map(String::as_str)
}

/// Pod network address, once assigned
pub fn pod_ip(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.pod_ip.as_deref())
}

/// Pod phase string, if reported
pub fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
}
