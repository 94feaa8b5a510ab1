//! Session record persistence using `SQLite`.
//!
//! The `SessionStore` trait is the boundary the orchestration core sees; the
//! SQLite implementation keeps the repository self-contained. Mutating
//! methods encode the monotonic-flag rules: `mark_requested` only moves
//! `k8s_requested` false->true, `reset_requested_for_repair` is the single
//! sanctioned true->false path, and nothing reactivates an ended session.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use tracing::warn;

use crate::session::{ResourceBounds, SessionId, SessionRecord, SessionState};

/// Persistence boundary for session records
pub trait SessionStore: Send + Sync {
    fn insert(&self, record: &SessionRecord) -> Result<()>;
    fn get(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Write a new state, refusing illegal transitions
    fn set_state(&self, session_id: &str, state: SessionState) -> Result<()>;
    fn set_cluster_address(&self, session_id: &str, address: Option<&str>) -> Result<()>;

    /// `k8s_requested` false -> true, after resources were submitted
    fn mark_requested(&self, session_id: &str) -> Result<()>;
    /// `k8s_requested` true -> false; wedge repair only
    fn reset_requested_for_repair(&self, session_id: &str) -> Result<()>;

    /// Terminal: `active=false`, `ended=now`, terminal state, address cleared
    fn mark_ended(&self, session_id: &str, state: SessionState) -> Result<()>;
    /// Batched variant used by sweeps; one transaction per call
    fn mark_ended_many(&self, session_ids: &[SessionId], state: SessionState) -> Result<usize>;
    /// `active=false`, `state=Failed`; resources are left for the reaper
    fn mark_failed(&self, session_id: &str) -> Result<()>;
    /// Bulk `active=false` for records whose pod is already gone
    fn deactivate_many(&self, session_ids: &[SessionId]) -> Result<usize>;

    /// Written by the external proxy; exposed for tests simulating traffic
    fn set_last_proxy(&self, session_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Active sessions past `Initializing`, for the admission gate
    fn count_active_past_init(&self) -> Result<usize>;
    /// Active sessions created within the window, for the status poller
    fn list_recent_active(&self, window: chrono::Duration) -> Result<Vec<SessionRecord>>;
    /// Active sessions whose resources were never requested
    fn list_active_unrequested(&self) -> Result<Vec<SessionRecord>>;
    /// Active + requested sessions for one course (None = course-less)
    fn list_active_requested(&self, course_id: Option<&str>) -> Result<Vec<SessionRecord>>;
    fn list_active_in_course(&self, course_id: &str) -> Result<Vec<SessionRecord>>;
    fn list_active_playgrounds(&self) -> Result<Vec<SessionRecord>>;
}

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    owner_id TEXT NOT NULL,
    owner_username TEXT NOT NULL,
    course_id TEXT,
    assignment_id TEXT,
    grading_run_id TEXT,
    image_id TEXT NOT NULL,
    image_tag TEXT,
    repo_url TEXT NOT NULL DEFAULT '',
    network_policy TEXT,
    network_dns_locked INTEGER NOT NULL DEFAULT 1,
    autosave INTEGER NOT NULL DEFAULT 0,
    persistent_storage INTEGER NOT NULL DEFAULT 0,
    resources TEXT,
    admin INTEGER NOT NULL DEFAULT 0,
    credentials INTEGER NOT NULL DEFAULT 0,
    docker INTEGER NOT NULL DEFAULT 0,
    autograde INTEGER NOT NULL DEFAULT 0,
    playground INTEGER NOT NULL DEFAULT 0,
    active INTEGER NOT NULL DEFAULT 1,
    state TEXT NOT NULL,
    k8s_requested INTEGER NOT NULL DEFAULT 0,
    cluster_address TEXT,
    created INTEGER NOT NULL,
    last_proxy INTEGER,
    ended INTEGER
)";

const COLUMNS: &str = "id, owner_id, owner_username, course_id, assignment_id, grading_run_id, \
     image_id, image_tag, repo_url, network_policy, network_dns_locked, autosave, \
     persistent_storage, resources, admin, credentials, docker, autograde, playground, \
     active, state, k8s_requested, cluster_address, created, last_proxy, ended";

/// Session store backed by `SQLite`
pub struct SqliteSessionStore {
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Create or open the session database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create data directory")?;
        }
        let conn = Connection::open(path).context("Failed to open session database")?;
        Self::init(conn)
    }

    /// In-memory store for tests
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn row_to_record(row: &Row<'_>) -> rusqlite::Result<SessionRecord> {
        let resources: Option<String> = row.get("resources")?;
        let state: String = row.get("state")?;
        Ok(SessionRecord {
            id: row.get("id")?,
            owner_id: row.get("owner_id")?,
            owner_username: row.get("owner_username")?,
            course_id: row.get("course_id")?,
            assignment_id: row.get("assignment_id")?,
            grading_run_id: row.get("grading_run_id")?,
            image_id: row.get("image_id")?,
            image_tag: row.get("image_tag")?,
            repo_url: row.get("repo_url")?,
            network_policy: row.get("network_policy")?,
            network_dns_locked: row.get("network_dns_locked")?,
            autosave: row.get("autosave")?,
            persistent_storage: row.get("persistent_storage")?,
            resources: resources.and_then(|json| parse_resources(&json)),
            admin: row.get("admin")?,
            credentials: row.get("credentials")?,
            docker: row.get("docker")?,
            autograde: row.get("autograde")?,
            playground: row.get("playground")?,
            active: row.get("active")?,
            state: state.parse().unwrap_or(SessionState::Failed),
            k8s_requested: row.get("k8s_requested")?,
            cluster_address: row.get("cluster_address")?,
            created: timestamp(row.get("created")?),
            last_proxy: row.get::<_, Option<i64>>("last_proxy")?.map(timestamp),
            ended: row.get::<_, Option<i64>>("ended")?.map(timestamp),
        })
    }

    fn query_records(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, Self::row_to_record)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_resources(json: &str) -> Option<ResourceBounds> {
    match serde_json::from_str(json) {
        Ok(bounds) => Some(bounds),
        Err(err) => {
            warn!(error = %err, "dropping unparseable session resources");
            None
        }
    }
}

impl SessionStore for SqliteSessionStore {
    fn insert(&self, record: &SessionRecord) -> Result<()> {
        let resources = record
            .resources
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            &format!("INSERT INTO sessions ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"),
            params![
                record.id,
                record.owner_id,
                record.owner_username,
                record.course_id,
                record.assignment_id,
                record.grading_run_id,
                record.image_id,
                record.image_tag,
                record.repo_url,
                record.network_policy,
                record.network_dns_locked,
                record.autosave,
                record.persistent_storage,
                resources,
                record.admin,
                record.credentials,
                record.docker,
                record.autograde,
                record.playground,
                record.active,
                record.state.to_string(),
                record.k8s_requested,
                record.cluster_address,
                record.created.timestamp(),
                record.last_proxy.map(|t| t.timestamp()),
                record.ended.map(|t| t.timestamp()),
            ],
        )?;
        Ok(())
    }

    fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare(&format!("SELECT {COLUMNS} FROM sessions WHERE id = ?1"))?;
        let mut rows = stmt.query_map([session_id], Self::row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    fn set_state(&self, session_id: &str, state: SessionState) -> Result<()> {
        let current = self
            .get(session_id)?
            .with_context(|| format!("session not found: {session_id}"))?;
        if current.state == state {
            return Ok(());
        }
        if !current.state.can_transition(state) {
            warn!(
                session_id = %session_id,
                from = %current.state,
                to = %state,
                "refusing illegal state transition"
            );
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET state = ?1 WHERE id = ?2",
            params![state.to_string(), session_id],
        )?;
        Ok(())
    }

    fn set_cluster_address(&self, session_id: &str, address: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET cluster_address = ?1 WHERE id = ?2",
            params![address, session_id],
        )?;
        Ok(())
    }

    fn mark_requested(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET k8s_requested = 1 WHERE id = ?1",
            [session_id],
        )?;
        Ok(())
    }

    fn reset_requested_for_repair(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET k8s_requested = 0 WHERE id = ?1 AND active = 1",
            [session_id],
        )?;
        Ok(())
    }

    fn mark_ended(&self, session_id: &str, state: SessionState) -> Result<()> {
        anyhow::ensure!(state.is_terminal(), "mark_ended requires a terminal state");
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET active = 0, state = ?1, ended = ?2, cluster_address = NULL
             WHERE id = ?3 AND active = 1",
            params![state.to_string(), Utc::now().timestamp(), session_id],
        )?;
        Ok(())
    }

    fn mark_ended_many(&self, session_ids: &[SessionId], state: SessionState) -> Result<usize> {
        anyhow::ensure!(state.is_terminal(), "mark_ended requires a terminal state");
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut changed = 0;
        for session_id in session_ids {
            changed += tx.execute(
                "UPDATE sessions SET active = 0, state = ?1, ended = ?2, cluster_address = NULL
                 WHERE id = ?3 AND active = 1",
                params![state.to_string(), Utc::now().timestamp(), session_id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn mark_failed(&self, session_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET active = 0, state = ?1, cluster_address = NULL
             WHERE id = ?2 AND active = 1",
            params![SessionState::Failed.to_string(), session_id],
        )?;
        Ok(())
    }

    fn deactivate_many(&self, session_ids: &[SessionId]) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let tx = conn.unchecked_transaction()?;
        let mut changed = 0;
        for session_id in session_ids {
            changed += tx.execute(
                "UPDATE sessions SET active = 0, ended = ?1 WHERE id = ?2 AND active = 1",
                params![Utc::now().timestamp(), session_id],
            )?;
        }
        tx.commit()?;
        Ok(changed)
    }

    fn set_last_proxy(&self, session_id: &str, at: DateTime<Utc>) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET last_proxy = ?1 WHERE id = ?2",
            params![at.timestamp(), session_id],
        )?;
        Ok(())
    }

    fn count_active_past_init(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE active = 1 AND state != ?1",
            [SessionState::Initializing.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn list_recent_active(&self, window: chrono::Duration) -> Result<Vec<SessionRecord>> {
        let cutoff = (Utc::now() - window).timestamp();
        self.query_records(
            &format!("SELECT {COLUMNS} FROM sessions WHERE active = 1 AND created >= ?1"),
            &[&cutoff],
        )
    }

    fn list_active_unrequested(&self) -> Result<Vec<SessionRecord>> {
        self.query_records(
            &format!("SELECT {COLUMNS} FROM sessions WHERE active = 1 AND k8s_requested = 0"),
            &[],
        )
    }

    fn list_active_requested(&self, course_id: Option<&str>) -> Result<Vec<SessionRecord>> {
        match course_id {
            Some(course_id) => self.query_records(
                &format!(
                    "SELECT {COLUMNS} FROM sessions
                     WHERE active = 1 AND k8s_requested = 1 AND course_id = ?1"
                ),
                &[&course_id],
            ),
            None => self.query_records(
                &format!(
                    "SELECT {COLUMNS} FROM sessions
                     WHERE active = 1 AND k8s_requested = 1 AND course_id IS NULL"
                ),
                &[],
            ),
        }
    }

    fn list_active_in_course(&self, course_id: &str) -> Result<Vec<SessionRecord>> {
        self.query_records(
            &format!("SELECT {COLUMNS} FROM sessions WHERE active = 1 AND course_id = ?1"),
            &[&course_id],
        )
    }

    fn list_active_playgrounds(&self) -> Result<Vec<SessionRecord>> {
        self.query_records(
            &format!("SELECT {COLUMNS} FROM sessions WHERE active = 1 AND playground = 1"),
            &[],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::CreateSession;

    fn sample(username: &str) -> SessionRecord {
        let mut record = SessionRecord::create(CreateSession {
            owner_id: format!("owner-{username}"),
            owner_username: username.to_string(),
            image_id: "ide-base".into(),
            autosave: true,
            network_dns_locked: true,
            ..Default::default()
        });
        // The store keeps whole-second timestamps
        record.created = timestamp(record.created.timestamp());
        record.last_proxy = record.last_proxy.map(|t| timestamp(t.timestamp()));
        record
    }

    #[test]
    fn test_insert_get_round_trip() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let mut record = sample("abc123");
        record.resources = Some(ResourceBounds {
            limits: [("cpu".to_string(), "2".to_string())].into(),
            requests: Default::default(),
        });
        store.insert(&record).unwrap();
        let loaded = store.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_state_transition_guard() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let record = sample("abc123");
        store.insert(&record).unwrap();

        store.set_state(&record.id, SessionState::Running).unwrap();
        store.mark_ended(&record.id, SessionState::Ended).unwrap();

        // Terminal states are absorbing
        store.set_state(&record.id, SessionState::Running).unwrap();
        let loaded = store.get(&record.id).unwrap().unwrap();
        assert_eq!(loaded.state, SessionState::Ended);
        assert!(!loaded.active);
        assert!(loaded.ended.is_some());
    }

    #[test]
    fn test_mark_ended_never_reactivates() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let record = sample("abc123");
        store.insert(&record).unwrap();
        store.mark_ended(&record.id, SessionState::Ended).unwrap();
        let first_ended = store.get(&record.id).unwrap().unwrap().ended;

        // A second reap is a no-op, not a fresh end time
        store.mark_ended(&record.id, SessionState::Ended).unwrap();
        assert_eq!(store.get(&record.id).unwrap().unwrap().ended, first_ended);
    }

    #[test]
    fn test_requested_flag_is_monotonic() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let record = sample("abc123");
        store.insert(&record).unwrap();
        store.mark_requested(&record.id).unwrap();
        assert!(store.get(&record.id).unwrap().unwrap().k8s_requested);

        store.reset_requested_for_repair(&record.id).unwrap();
        assert!(!store.get(&record.id).unwrap().unwrap().k8s_requested);

        // Repair reset only applies to live sessions
        store.mark_requested(&record.id).unwrap();
        store.mark_ended(&record.id, SessionState::Ended).unwrap();
        store.reset_requested_for_repair(&record.id).unwrap();
        assert!(store.get(&record.id).unwrap().unwrap().k8s_requested);
    }

    #[test]
    fn test_cluster_address_cleared_on_end() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let record = sample("abc123");
        store.insert(&record).unwrap();
        store
            .set_cluster_address(&record.id, Some("10.0.0.7"))
            .unwrap();
        store.mark_ended(&record.id, SessionState::Ended).unwrap();
        assert!(store
            .get(&record.id)
            .unwrap()
            .unwrap()
            .cluster_address
            .is_none());
    }

    #[test]
    fn test_admission_count_excludes_initializing() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let initializing = sample("a");
        store.insert(&initializing).unwrap();

        let running = sample("b");
        store.insert(&running).unwrap();
        store.set_state(&running.id, SessionState::Running).unwrap();

        let ended = sample("c");
        store.insert(&ended).unwrap();
        store.set_state(&ended.id, SessionState::Running).unwrap();
        store.mark_ended(&ended.id, SessionState::Ended).unwrap();

        assert_eq!(store.count_active_past_init().unwrap(), 1);
    }

    #[test]
    fn test_list_active_requested_by_course() {
        let store = SqliteSessionStore::open_in_memory().unwrap();

        let mut in_course = sample("a");
        in_course.course_id = Some("cs101".to_string());
        store.insert(&in_course).unwrap();
        store.mark_requested(&in_course.id).unwrap();

        let mut not_requested = sample("b");
        not_requested.course_id = Some("cs101".to_string());
        store.insert(&not_requested).unwrap();

        let course_less = sample("c");
        store.insert(&course_less).unwrap();
        store.mark_requested(&course_less.id).unwrap();

        let cs101 = store.list_active_requested(Some("cs101")).unwrap();
        assert_eq!(cs101.len(), 1);
        assert_eq!(cs101[0].id, in_course.id);

        let orphans = store.list_active_requested(None).unwrap();
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].id, course_less.id);
    }

    #[test]
    fn test_mark_ended_many_counts() {
        let store = SqliteSessionStore::open_in_memory().unwrap();
        let records: Vec<_> = (0..7).map(|n| sample(&format!("u{n}"))).collect();
        for record in &records {
            store.insert(record).unwrap();
        }
        let ids: Vec<SessionId> = records.iter().map(|r| r.id.clone()).collect();
        assert_eq!(
            store.mark_ended_many(&ids, SessionState::Ended).unwrap(),
            7
        );
        // Second pass touches nothing
        assert_eq!(
            store.mark_ended_many(&ids, SessionState::Ended).unwrap(),
            0
        );
    }
}
