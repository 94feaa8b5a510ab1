//! Session records and the session state machine.
//!
//! A `SessionRecord` is the persisted state for one IDE session. The cluster
//! side (pod, claim) is always reconstructible from the record; the record is
//! the source of truth for what *should* exist.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique session identifier
pub type SessionId = String;

/// Generate a new unique session ID
pub fn generate_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string()
}

/// Lifecycle state of a session.
///
/// The user-visible text for each state is rendered by `Display`. `Failed`
/// and `Ended` are terminal: no component may move a session out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// Record created, no cluster resources requested yet
    Initializing,
    /// Pod not yet visible in the cluster
    WaitingScheduled,
    /// Scheduling failed on capacity; the cluster is adding nodes
    ScalingUp,
    /// Pod scheduled, persistent volume not yet attached
    WaitingVolume,
    /// Pod scheduled, IDE server not yet serving
    WaitingStartup,
    Running,
    Failed,
    Ended,
}

impl SessionState {
    /// Terminal states are absorbing
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Ended)
    }

    /// Whether a transition from `self` to `to` is legal.
    ///
    /// Terminal states accept nothing. `Initializing` is the entry state
    /// only. Everything else may move between the waiting states freely
    /// because the wedge-repair path recreates resources from scratch.
    pub fn can_transition(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        to != Self::Initializing
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Initializing => "Initializing",
            Self::WaitingScheduled => "Waiting for IDE to be scheduled...",
            Self::ScalingUp => {
                "We are adding more servers to handle your IDE. Give us a minute..."
            }
            Self::WaitingVolume => "Waiting for Persistent Volume to attach...",
            Self::WaitingStartup => "Waiting for IDE server to start...",
            Self::Running => "Running",
            Self::Failed => "Failed",
            Self::Ended => "Ended",
        };
        f.write_str(text)
    }
}

impl FromStr for SessionState {
    type Err = UnknownState;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Initializing" => Ok(Self::Initializing),
            "Waiting for IDE to be scheduled..." => Ok(Self::WaitingScheduled),
            "We are adding more servers to handle your IDE. Give us a minute..." => {
                Ok(Self::ScalingUp)
            }
            "Waiting for Persistent Volume to attach..." => Ok(Self::WaitingVolume),
            "Waiting for IDE server to start..." => Ok(Self::WaitingStartup),
            "Running" => Ok(Self::Running),
            "Failed" => Ok(Self::Failed),
            "Ended" => Ok(Self::Ended),
            other => Err(UnknownState(other.to_string())),
        }
    }
}

/// Error for a state string that is not part of the vocabulary
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown session state: {0:?}")]
pub struct UnknownState(pub String);

/// Workload flavor, derived from the image catalog entry.
///
/// Webtop images are full desktop environments; they run as root, always get
/// persistent storage, and never get admin/autosave/credential features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Standard,
    Webtop,
}

impl SessionKind {
    pub const fn from_webtop(webtop: bool) -> Self {
        if webtop {
            Self::Webtop
        } else {
            Self::Standard
        }
    }

    /// Container uid the IDE process runs as
    pub const fn run_as_user(self) -> i64 {
        match self {
            Self::Standard => 1001,
            Self::Webtop => 0,
        }
    }
}

/// Resource limits and requests for the IDE container
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceBounds {
    #[serde(default)]
    pub limits: BTreeMap<String, String>,
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

/// Desired configuration supplied by the web layer at creation time
#[derive(Debug, Clone, Default)]
pub struct CreateSession {
    pub owner_id: String,
    pub owner_username: String,
    pub course_id: Option<String>,
    pub assignment_id: Option<String>,
    pub grading_run_id: Option<String>,
    pub image_id: String,
    pub image_tag: Option<String>,
    pub repo_url: String,
    pub network_policy: Option<String>,
    pub network_dns_locked: bool,
    pub autosave: bool,
    pub persistent_storage: bool,
    pub resources: Option<ResourceBounds>,
    pub admin: bool,
    pub credentials: bool,
    pub docker: bool,
    pub autograde: bool,
    pub playground: bool,
}

/// Persisted state for one IDE session.
///
/// Desired configuration is immutable after creation; the observed fields
/// (`active`, `state`, `k8s_requested`, `cluster_address`, timestamps) are
/// mutated only by the orchestrator core.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub owner_id: String,
    pub owner_username: String,
    pub course_id: Option<String>,
    pub assignment_id: Option<String>,
    pub grading_run_id: Option<String>,

    pub image_id: String,
    pub image_tag: Option<String>,
    pub repo_url: String,
    pub network_policy: Option<String>,
    pub network_dns_locked: bool,
    pub autosave: bool,
    pub persistent_storage: bool,
    pub resources: Option<ResourceBounds>,
    pub admin: bool,
    pub credentials: bool,
    pub docker: bool,
    pub autograde: bool,
    pub playground: bool,

    pub active: bool,
    pub state: SessionState,
    pub k8s_requested: bool,
    pub cluster_address: Option<String>,
    pub created: DateTime<Utc>,
    pub last_proxy: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
}

impl SessionRecord {
    /// Build a fresh record from the desired configuration.
    ///
    /// New sessions start active in `Initializing` with no cluster resources
    /// requested. `last_proxy` is seeded with the creation time so a brand
    /// new session is inside the idle window before the user first connects.
    pub fn create(opts: CreateSession) -> Self {
        let now = Utc::now();
        Self {
            id: generate_session_id(),
            owner_id: opts.owner_id,
            owner_username: opts.owner_username,
            course_id: opts.course_id,
            assignment_id: opts.assignment_id,
            grading_run_id: opts.grading_run_id,
            image_id: opts.image_id,
            image_tag: opts.image_tag,
            repo_url: opts.repo_url,
            network_policy: opts.network_policy,
            network_dns_locked: opts.network_dns_locked,
            autosave: opts.autosave,
            persistent_storage: opts.persistent_storage,
            resources: opts.resources,
            admin: opts.admin,
            credentials: opts.credentials,
            docker: opts.docker,
            autograde: opts.autograde,
            playground: opts.playground,
            active: true,
            state: SessionState::Initializing,
            k8s_requested: false,
            cluster_address: None,
            created: now,
            last_proxy: Some(now),
            ended: None,
        }
    }

    /// Age of the session since creation
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_text_round_trip() {
        let states = [
            SessionState::Initializing,
            SessionState::WaitingScheduled,
            SessionState::ScalingUp,
            SessionState::WaitingVolume,
            SessionState::WaitingStartup,
            SessionState::Running,
            SessionState::Failed,
            SessionState::Ended,
        ];
        for state in states {
            let parsed: SessionState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("Sleeping".parse::<SessionState>().is_err());
    }

    #[test]
    fn test_terminal_states_are_absorbing() {
        assert!(!SessionState::Failed.can_transition(SessionState::Running));
        assert!(!SessionState::Ended.can_transition(SessionState::WaitingScheduled));
        assert!(!SessionState::Failed.can_transition(SessionState::Ended));
    }

    #[test]
    fn test_initializing_is_entry_only() {
        assert!(!SessionState::Running.can_transition(SessionState::Initializing));
        assert!(SessionState::Initializing.can_transition(SessionState::WaitingScheduled));
    }

    #[test]
    fn test_repair_can_move_backwards() {
        // Wedge repair deletes and recreates resources, so a session can
        // fall back to a scheduling wait from any non-terminal state.
        assert!(SessionState::Running.can_transition(SessionState::WaitingScheduled));
        assert!(SessionState::WaitingStartup.can_transition(SessionState::ScalingUp));
    }

    #[test]
    fn test_new_record_defaults() {
        let record = SessionRecord::create(CreateSession {
            owner_id: "u1".into(),
            owner_username: "abc123".into(),
            image_id: "ide-base".into(),
            ..Default::default()
        });
        assert!(record.active);
        assert_eq!(record.state, SessionState::Initializing);
        assert!(!record.k8s_requested);
        assert!(record.cluster_address.is_none());
        assert_eq!(record.last_proxy, Some(record.created));
    }

    #[test]
    fn test_webtop_kind_uid() {
        assert_eq!(SessionKind::from_webtop(true).run_as_user(), 0);
        assert_eq!(SessionKind::from_webtop(false).run_as_user(), 1001);
    }
}
