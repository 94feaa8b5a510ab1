//! Session lifecycle flows against the on-disk store.

use chrono::Utc;
use tempfile::TempDir;

use workbench_orchestrator::api::ConnectInfo;
use workbench_orchestrator::session::{CreateSession, SessionId, SessionRecord, SessionState};
use workbench_orchestrator::store::{SessionStore, SqliteSessionStore};

fn open_store(dir: &TempDir) -> SqliteSessionStore {
    SqliteSessionStore::open(&dir.path().join("sessions.db")).unwrap()
}

fn create(store: &dyn SessionStore, username: &str, course: Option<&str>) -> SessionRecord {
    let record = SessionRecord::create(CreateSession {
        owner_id: format!("owner-{username}"),
        owner_username: username.to_string(),
        course_id: course.map(str::to_string),
        image_id: "ide-base".into(),
        autosave: true,
        network_dns_locked: true,
        ..Default::default()
    });
    store.insert(&record).unwrap();
    record
}

#[test]
fn session_happy_path() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let record = create(&store, "abc123", Some("cs101"));

    // Submission marks resources requested
    store.mark_requested(&record.id).unwrap();
    store
        .set_state(&record.id, SessionState::WaitingScheduled)
        .unwrap();
    store
        .set_state(&record.id, SessionState::WaitingStartup)
        .unwrap();

    // Pod comes up; poller records the address
    store
        .set_cluster_address(&record.id, Some("10.0.0.7"))
        .unwrap();
    store.set_state(&record.id, SessionState::Running).unwrap();

    let running = store.get(&record.id).unwrap().unwrap();
    assert!(running.active);
    assert!(running.k8s_requested);
    assert_eq!(running.state, SessionState::Running);

    let info = ConnectInfo::from(&running);
    assert!(info.ready);
    assert_eq!(info.cluster_address.as_deref(), Some("10.0.0.7"));

    // Stop: record finalized, address cleared, state terminal
    store.mark_ended(&record.id, SessionState::Ended).unwrap();
    let ended = store.get(&record.id).unwrap().unwrap();
    assert!(!ended.active);
    assert!(ended.ended.is_some());
    assert!(ended.cluster_address.is_none());
    assert!(!ConnectInfo::from(&ended).ready);
}

#[test]
fn ended_sessions_stay_ended() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let record = create(&store, "abc123", None);

    store.mark_ended(&record.id, SessionState::Ended).unwrap();

    // No state write revives a terminal session
    store.set_state(&record.id, SessionState::Running).unwrap();
    store
        .set_state(&record.id, SessionState::WaitingScheduled)
        .unwrap();
    let loaded = store.get(&record.id).unwrap().unwrap();
    assert_eq!(loaded.state, SessionState::Ended);
    assert!(!loaded.active);

    // Bulk deactivation of an already-ended session changes nothing
    assert_eq!(store.deactivate_many(&[record.id.clone()]).unwrap(), 0);
}

#[test]
fn failed_session_keeps_record_for_reaper() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let record = create(&store, "abc123", None);
    store.mark_requested(&record.id).unwrap();

    store.mark_failed(&record.id).unwrap();
    let failed = store.get(&record.id).unwrap().unwrap();
    assert_eq!(failed.state, SessionState::Failed);
    assert!(!failed.active);
    // The reaper finalizes the end time when it cleans the pod up
    assert!(failed.ended.is_none());
}

#[test]
fn idle_window_filtering_drives_drift() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);

    let fresh = create(&store, "fresh", Some("cs101"));
    store.mark_requested(&fresh.id).unwrap();

    let idle = create(&store, "idle", Some("cs101"));
    store.mark_requested(&idle.id).unwrap();
    store
        .set_last_proxy(&idle.id, Utc::now() - chrono::Duration::minutes(45))
        .unwrap();

    let candidates = store.list_active_requested(Some("cs101")).unwrap();
    assert_eq!(candidates.len(), 2);

    // The reconciler's standard window is 10 minutes; only the fresh
    // session survives the cut
    let cutoff = Utc::now() - chrono::Duration::minutes(10);
    let live: Vec<SessionId> = candidates
        .into_iter()
        .filter(|s| s.last_proxy.is_some_and(|at| at >= cutoff))
        .map(|s| s.id)
        .collect();
    assert_eq!(live, vec![fresh.id]);
}

#[test]
fn wedge_repair_resets_requested_flag() {
    let dir = TempDir::new().unwrap();
    let store = open_store(&dir);
    let record = create(&store, "abc123", None);
    store.mark_requested(&record.id).unwrap();

    // Repair path: flag drops, resources get resubmitted, flag returns
    store.reset_requested_for_repair(&record.id).unwrap();
    assert!(!store.get(&record.id).unwrap().unwrap().k8s_requested);
    store.mark_requested(&record.id).unwrap();
    assert!(store.get(&record.id).unwrap().unwrap().k8s_requested);
}

#[test]
fn store_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let id;
    {
        let store = open_store(&dir);
        id = create(&store, "abc123", None).id;
        store.mark_requested(&id).unwrap();
    }
    let store = open_store(&dir);
    let loaded = store.get(&id).unwrap().unwrap();
    assert!(loaded.k8s_requested);
    assert_eq!(loaded.state, SessionState::Initializing);
}
