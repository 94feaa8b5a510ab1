//! Persistent volume claims for session storage.
//!
//! Persistent sessions share one claim per user so work survives across
//! sessions; non-persistent sessions get an ephemeral empty-dir volume and
//! no claim at all.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;

use crate::catalog::StoragePolicy;
use crate::session::{SessionKind, SessionRecord};

/// Name of a user's long-lived persistent volume claim
pub fn user_claim_name(username: &str) -> String {
    format!("ide-volume-{username}")
}

/// Session-scoped volume name, so concurrent sessions never collide
pub fn session_volume_name(session: &SessionRecord) -> String {
    let short_id = &session.id[..6.min(session.id.len())];
    format!("{}-{short_id}-ide", session.owner_username)
}

/// Claim name for a session that gets persistent storage.
///
/// Sessions that asked for persistence share the per-user volume; sessions
/// that had persistence forced on (webtop images) get a session-scoped
/// claim instead, so the user's shared volume is untouched.
pub fn claim_name(session: &SessionRecord) -> String {
    if session.persistent_storage {
        user_claim_name(&session.owner_username)
    } else {
        session_volume_name(session)
    }
}

/// Build the claim object for a persistent session volume
pub fn build_claim(
    session: &SessionRecord,
    kind: SessionKind,
    storage: &dyn StoragePolicy,
) -> PersistentVolumeClaim {
    let labels = BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            super::APP_NAME.to_string(),
        ),
        ("role".to_string(), super::ROLE_SESSION_STORAGE.to_string()),
        ("username".to_string(), session.owner_username.clone()),
    ]);

    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(claim_name(session)),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            // ReadWriteMany so the autosave sidecar and IDE share the volume
            access_modes: Some(vec!["ReadWriteMany".to_string()]),
            volume_mode: Some("Filesystem".to_string()),
            storage_class_name: storage.storage_class(),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(storage.volume_size(session, kind)),
                )])),
                ..VolumeResourceRequirements::default()
            }),
            ..PersistentVolumeClaimSpec::default()
        }),
        ..PersistentVolumeClaim::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ConfigStoragePolicy;
    use crate::config::StorageConfig;
    use crate::session::CreateSession;

    fn session(persistent: bool) -> SessionRecord {
        let mut record = SessionRecord::create(CreateSession {
            owner_username: "abc123".into(),
            image_id: "ide-base".into(),
            persistent_storage: persistent,
            ..Default::default()
        });
        record.id = "0c9e8d4f".into();
        record
    }

    #[test]
    fn test_persistent_claim_is_per_user() {
        assert_eq!(claim_name(&session(true)), "ide-volume-abc123");
    }

    #[test]
    fn test_forced_persistence_claim_is_per_session() {
        // Webtop images force storage on without touching the record flag
        assert_eq!(claim_name(&session(false)), "abc123-0c9e8d-ide");
        assert_eq!(session_volume_name(&session(false)), "abc123-0c9e8d-ide");
    }

    #[test]
    fn test_claim_shape() {
        let policy = ConfigStoragePolicy::new(StorageConfig {
            storage_class: Some("longhorn".to_string()),
            ..StorageConfig::default()
        });
        let claim = build_claim(&session(true), SessionKind::Standard, &policy);

        assert_eq!(claim.metadata.name.as_deref(), Some("ide-volume-abc123"));
        let spec = claim.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteMany"]);
        assert_eq!(spec.storage_class_name.as_deref(), Some("longhorn"));
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests.get("storage").unwrap().0, "100Mi");
    }
}
