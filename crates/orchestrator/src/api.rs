//! DTOs read by the web layer's polling and redirect endpoints.
//!
//! The HTTP surface itself lives outside this crate; these types are the
//! shape of what it reads from session records to tell the user where to
//! connect and what to display.

use serde::Serialize;

use crate::session::{SessionRecord, SessionState};

/// Primary port the IDE server listens on inside the pod
pub const IDE_PORT: u16 = 5000;

/// Connection info for one session
#[derive(Debug, Clone, Serialize)]
pub struct ConnectInfo {
    pub session_id: String,
    pub active: bool,
    /// User-facing state text
    pub state: String,
    pub cluster_address: Option<String>,
    /// True once the IDE is reachable at `cluster_address`
    pub ready: bool,
}

impl From<&SessionRecord> for ConnectInfo {
    fn from(record: &SessionRecord) -> Self {
        let ready = record.state == SessionState::Running && record.cluster_address.is_some();
        // The address is only meaningful while the session is Running
        let cluster_address = if record.state == SessionState::Running {
            record.cluster_address.clone()
        } else {
            None
        };
        Self {
            session_id: record.id.clone(),
            active: record.active,
            state: record.state.to_string(),
            cluster_address,
            ready,
        }
    }
}

/// Session list response for admin views
#[derive(Debug, Clone, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<ConnectInfo>,
    pub count: usize,
}

impl From<Vec<ConnectInfo>> for SessionListResponse {
    fn from(sessions: Vec<ConnectInfo>) -> Self {
        let count = sessions.len();
        Self { sessions, count }
    }
}
