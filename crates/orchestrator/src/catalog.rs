//! Collaborator interfaces consumed by the orchestration core.
//!
//! The spec builder and reconciler depend on external platform state (image
//! catalog, storage policy, course membership, reservations, grading). Each
//! concern is an explicit trait so the core stays a function of its inputs;
//! the static implementations here back the worker binary and the tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;

use anyhow::Result;

use crate::config::{CatalogEntryConfig, ImageConfig, StorageConfig};
use crate::session::{SessionId, SessionKind, SessionRecord};

/// One IDE image as known to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageEntry {
    /// Image reference without tag
    pub image: String,
    /// Tag used when the session does not pin one
    pub default_tag: String,
    /// Webtop-style desktop image rather than a code IDE
    pub webtop: bool,
}

impl ImageEntry {
    /// Full image reference for a session, honoring its tag override
    pub fn reference(&self, tag_override: Option<&str>) -> String {
        let tag = tag_override.unwrap_or(&self.default_tag);
        format!("{}:{tag}", self.image)
    }
}

/// Image id -> catalog entry lookup
pub trait ImageCatalog: Send + Sync {
    fn lookup(&self, image_id: &str) -> Option<ImageEntry>;
}

/// Catalog backed by the config file's `[images.catalog]` table
pub struct StaticImageCatalog {
    entries: BTreeMap<String, ImageEntry>,
}

impl StaticImageCatalog {
    pub fn new(entries: BTreeMap<String, ImageEntry>) -> Self {
        Self { entries }
    }

    pub fn from_config(images: &ImageConfig) -> Self {
        let entries = images
            .catalog
            .iter()
            .map(|(id, entry)| (id.clone(), ImageEntry::from(entry)))
            .collect();
        Self { entries }
    }
}

impl From<&CatalogEntryConfig> for ImageEntry {
    fn from(entry: &CatalogEntryConfig) -> Self {
        Self {
            image: entry.image.clone(),
            default_tag: entry.default_tag.clone(),
            webtop: entry.webtop,
        }
    }
}

impl ImageCatalog for StaticImageCatalog {
    fn lookup(&self, image_id: &str) -> Option<ImageEntry> {
        self.entries.get(image_id).cloned()
    }
}

/// Storage class and claim sizing for persistent session volumes
pub trait StoragePolicy: Send + Sync {
    fn storage_class(&self) -> Option<String>;
    fn volume_size(&self, session: &SessionRecord, kind: SessionKind) -> String;
}

/// Policy backed by the `[storage]` config section
pub struct ConfigStoragePolicy {
    storage: StorageConfig,
}

impl ConfigStoragePolicy {
    pub const fn new(storage: StorageConfig) -> Self {
        Self { storage }
    }
}

impl StoragePolicy for ConfigStoragePolicy {
    fn storage_class(&self) -> Option<String> {
        self.storage.storage_class.clone()
    }

    fn volume_size(&self, session: &SessionRecord, kind: SessionKind) -> String {
        if session.playground {
            if kind == SessionKind::Webtop {
                self.storage.webtop_volume_size.clone()
            } else {
                self.storage.playground_volume_size.clone()
            }
        } else {
            self.storage.volume_size.clone()
        }
    }
}

/// Course metadata needed for session environment and reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Course {
    pub id: String,
    pub name: String,
    pub code: String,
    /// Repository holding the course's assignment tests, for admin sessions
    pub tests_repo: Option<String>,
}

/// Course lookups; implementations are expected to cache admin-id sets
pub trait CourseDirectory: Send + Sync {
    fn course(&self, course_id: &str) -> Option<Course>;
    fn active_courses(&self) -> Vec<Course>;
    fn course_admin_ids(&self, course_id: &str) -> HashSet<String>;
}

/// Fixed in-memory course directory
#[derive(Default)]
pub struct StaticCourseDirectory {
    courses: Vec<Course>,
    admins: HashMap<String, HashSet<String>>,
}

impl StaticCourseDirectory {
    pub fn new(courses: Vec<Course>, admins: HashMap<String, HashSet<String>>) -> Self {
        Self { courses, admins }
    }
}

impl CourseDirectory for StaticCourseDirectory {
    fn course(&self, course_id: &str) -> Option<Course> {
        self.courses.iter().find(|c| c.id == course_id).cloned()
    }

    fn active_courses(&self) -> Vec<Course> {
        self.courses.clone()
    }

    fn course_admin_ids(&self, course_id: &str) -> HashSet<String> {
        self.admins.get(course_id).cloned().unwrap_or_default()
    }
}

/// Session ids pinned against reaping by external policy
pub trait ReservedSessions: Send + Sync {
    fn reserved_session_ids(&self) -> HashSet<SessionId>;
}

/// No sessions reserved; the default for the worker binary
pub struct NoReservations;

impl ReservedSessions for NoReservations {
    fn reserved_session_ids(&self) -> HashSet<SessionId> {
        HashSet::new()
    }
}

/// Mutable reservation set, used by tests and embedded deployments
#[derive(Default)]
pub struct StaticReservations {
    ids: Mutex<HashSet<SessionId>>,
}

impl StaticReservations {
    pub fn reserve(&self, id: impl Into<SessionId>) {
        self.ids.lock().unwrap().insert(id.into());
    }

    pub fn release(&self, id: &str) {
        self.ids.lock().unwrap().remove(id);
    }
}

impl ReservedSessions for StaticReservations {
    fn reserved_session_ids(&self) -> HashSet<SessionId> {
        self.ids.lock().unwrap().clone()
    }
}

/// Autograding collaborator.
///
/// Supplies the autograde sidecar's inputs and finalizes the linked grading
/// run when a session is reaped.
pub trait GradingBackend: Send + Sync {
    /// Token the sidecar uses to submit results
    fn grading_token(&self, run_id: &str) -> Option<String>;
    /// Rendered test-exercise script for the assignment
    fn exercise_script(&self, assignment_id: &str) -> Option<String>;
    /// Serialized progress for resuming a previous run
    fn resume_payload(&self, run_id: &str) -> Option<String>;
    /// Mark the run non-pending with an explanatory status
    fn finalize_run(&self, run_id: &str, status: &str) -> Result<()>;
}

/// Grading disabled; autograde sessions degrade to a plain IDE
pub struct NoGradingBackend;

impl GradingBackend for NoGradingBackend {
    fn grading_token(&self, _run_id: &str) -> Option<String> {
        None
    }

    fn exercise_script(&self, _assignment_id: &str) -> Option<String> {
        None
    }

    fn resume_payload(&self, _run_id: &str) -> Option<String> {
        None
    }

    fn finalize_run(&self, _run_id: &str, _status: &str) -> Result<()> {
        Ok(())
    }
}

/// Outcome of the debug-mode secret probe.
///
/// Production runs never probe; both flags default to present. A missing
/// secret disables the matching feature, it never fails a session build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecretPresence {
    /// Git credentials secret available for init/autosave containers
    pub git_credentials: bool,
    /// Registry docker-config secret available for admin sessions
    pub registry_config: bool,
}

impl Default for SecretPresence {
    fn default() -> Self {
        Self {
            git_credentials: true,
            registry_config: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference_tag_override() {
        let entry = ImageEntry {
            image: "registry.workbench.dev/workbench/ide-base".to_string(),
            default_tag: "latest".to_string(),
            webtop: false,
        };
        assert_eq!(
            entry.reference(None),
            "registry.workbench.dev/workbench/ide-base:latest"
        );
        assert_eq!(
            entry.reference(Some("v2.1")),
            "registry.workbench.dev/workbench/ide-base:v2.1"
        );
    }

    #[test]
    fn test_reservations_mutate() {
        let reservations = StaticReservations::default();
        reservations.reserve("s1");
        assert!(reservations.reserved_session_ids().contains("s1"));
        reservations.release("s1");
        assert!(reservations.reserved_session_ids().is_empty());
    }
}
