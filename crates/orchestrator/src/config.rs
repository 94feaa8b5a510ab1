//! Configuration for the orchestrator.
//!
//! Reads config from ~/.config/workbench/orchestrator.toml; every field has
//! a serde default so a missing or partial file still yields a runnable
//! configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::session::ResourceBounds;

/// Full orchestrator configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Debug mode enables the secret-presence probe and feature degradation
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub images: ImageConfig,

    #[serde(default)]
    pub sessions: SessionLimits,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub network: NetworkConfig,

    #[serde(default)]
    pub store: StoreConfig,

    /// Resource defaults applied when a session carries no explicit bounds
    #[serde(default)]
    pub resources: ResourceDefaults,
}

/// Cluster connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Namespace all session resources live in
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Upper bound on any single cluster API call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// Node selector applied to session pods
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,

    /// Service account session pods run under
    #[serde(default = "default_service_account")]
    pub service_account: String,
}

/// Images for the session pod containers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Registry prefix for the platform-owned sidecar images
    #[serde(default = "default_registry")]
    pub registry: String,

    #[serde(default = "default_init_image")]
    pub init: String,

    #[serde(default = "default_autosave_image")]
    pub autosave: String,

    #[serde(default = "default_dockerd_image")]
    pub dockerd: String,

    #[serde(default = "default_autograde_image")]
    pub autograde: String,

    /// Secret holding git credentials for init/autosave containers
    #[serde(default = "default_git_secret")]
    pub git_secret: String,

    /// Secret holding the registry docker config for admin sessions
    #[serde(default = "default_registry_secret")]
    pub registry_secret: String,

    /// IDE image catalog: image id -> entry
    #[serde(default)]
    pub catalog: BTreeMap<String, CatalogEntryConfig>,
}

/// One image catalog entry as it appears in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogEntryConfig {
    pub image: String,
    #[serde(default = "default_tag")]
    pub default_tag: String,
    #[serde(default)]
    pub webtop: bool,
}

/// Session count and timing limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Maximum sessions allowed to run concurrently
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Maximum lifetime of any session before the age-out sweep reclaims it
    #[serde(default = "default_stale_timeout_hours")]
    pub stale_timeout_hours: u64,

    /// Idle window for standard (student) sessions
    #[serde(default = "default_stale_proxy_minutes")]
    pub stale_proxy_minutes: u64,

    /// Idle window for admin (course staff) sessions
    #[serde(default = "default_admin_stale_proxy_minutes")]
    pub admin_stale_proxy_minutes: u64,

    /// How long a pod may sit short of Running before it is considered wedged
    #[serde(default = "default_stuck_threshold_secs")]
    pub stuck_threshold_secs: u64,

    /// How far back the status poller looks for sessions to update
    #[serde(default = "default_recent_window_minutes")]
    pub recent_window_minutes: u64,
}

/// Persistent volume settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Storage class for session claims; None uses the cluster default
    #[serde(default)]
    pub storage_class: Option<String>,

    #[serde(default = "default_volume_size")]
    pub volume_size: String,

    #[serde(default = "default_volume_size")]
    pub playground_volume_size: String,

    #[serde(default = "default_webtop_volume_size")]
    pub webtop_volume_size: String,
}

/// Network policy settings for session pods
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Allow-listed network policy label values
    #[serde(default = "default_valid_policies")]
    pub valid_policies: Vec<String>,

    /// Fallback policy when a session names one outside the allow-list
    #[serde(default = "default_network_policy")]
    pub default_policy: String,

    /// Resolver used when cluster DNS is locked out
    #[serde(default = "default_nameserver")]
    pub nameserver: String,
}

/// Session store location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// SQLite database path; None uses the platform data directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Default resource bounds per workload kind
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDefaults {
    #[serde(default = "default_standard_bounds")]
    pub standard: ResourceBounds,

    #[serde(default = "default_webtop_bounds")]
    pub webtop: ResourceBounds,
}

fn default_namespace() -> String {
    "workbench".to_string()
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_service_account() -> String {
    "workbench-ide".to_string()
}

fn default_registry() -> String {
    "registry.workbench.dev/workbench".to_string()
}

fn default_init_image() -> String {
    "ide-init".to_string()
}

fn default_autosave_image() -> String {
    "ide-autosave".to_string()
}

fn default_dockerd_image() -> String {
    "ide-dockerd".to_string()
}

fn default_autograde_image() -> String {
    "ide-autograde".to_string()
}

fn default_git_secret() -> String {
    "git".to_string()
}

fn default_registry_secret() -> String {
    "workbench-registry".to_string()
}

fn default_tag() -> String {
    "latest".to_string()
}

fn default_max_sessions() -> usize {
    50
}

fn default_stale_timeout_hours() -> u64 {
    6
}

fn default_stale_proxy_minutes() -> u64 {
    10
}

fn default_admin_stale_proxy_minutes() -> u64 {
    60
}

fn default_stuck_threshold_secs() -> u64 {
    180
}

fn default_recent_window_minutes() -> u64 {
    10
}

fn default_volume_size() -> String {
    "100Mi".to_string()
}

fn default_webtop_volume_size() -> String {
    "500Mi".to_string()
}

fn default_valid_policies() -> Vec<String> {
    vec![
        "student".to_string(),
        "student-ssh".to_string(),
        "admin".to_string(),
    ]
}

fn default_network_policy() -> String {
    "student".to_string()
}

fn default_nameserver() -> String {
    "1.1.1.1".to_string()
}

fn default_standard_bounds() -> ResourceBounds {
    ResourceBounds {
        limits: BTreeMap::from([
            ("cpu".to_string(), "2".to_string()),
            ("memory".to_string(), "500Mi".to_string()),
        ]),
        requests: BTreeMap::from([
            ("cpu".to_string(), "250m".to_string()),
            ("memory".to_string(), "100Mi".to_string()),
        ]),
    }
}

fn default_webtop_bounds() -> ResourceBounds {
    ResourceBounds {
        limits: BTreeMap::from([
            ("cpu".to_string(), "2".to_string()),
            ("memory".to_string(), "3Gi".to_string()),
        ]),
        requests: BTreeMap::from([
            ("cpu".to_string(), "500m".to_string()),
            ("memory".to_string(), "500Mi".to_string()),
        ]),
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            call_timeout_secs: default_call_timeout_secs(),
            node_selector: BTreeMap::new(),
            service_account: default_service_account(),
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            registry: default_registry(),
            init: default_init_image(),
            autosave: default_autosave_image(),
            dockerd: default_dockerd_image(),
            autograde: default_autograde_image(),
            git_secret: default_git_secret(),
            registry_secret: default_registry_secret(),
            catalog: BTreeMap::new(),
        }
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_sessions: default_max_sessions(),
            stale_timeout_hours: default_stale_timeout_hours(),
            stale_proxy_minutes: default_stale_proxy_minutes(),
            admin_stale_proxy_minutes: default_admin_stale_proxy_minutes(),
            stuck_threshold_secs: default_stuck_threshold_secs(),
            recent_window_minutes: default_recent_window_minutes(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_class: None,
            volume_size: default_volume_size(),
            playground_volume_size: default_volume_size(),
            webtop_volume_size: default_webtop_volume_size(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            valid_policies: default_valid_policies(),
            default_policy: default_network_policy(),
            nameserver: default_nameserver(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            standard: default_standard_bounds(),
            webtop: default_webtop_bounds(),
        }
    }
}

impl ImageConfig {
    /// Fully qualified image reference for a platform sidecar image
    pub fn sidecar_image(&self, name: &str) -> String {
        format!("{}/{}", self.registry, name)
    }
}

impl SessionLimits {
    pub fn stale_timeout(&self) -> chrono::Duration {
        chrono::Duration::hours(self.stale_timeout_hours as i64)
    }

    pub fn stale_proxy_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.stale_proxy_minutes as i64)
    }

    pub fn admin_stale_proxy_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.admin_stale_proxy_minutes as i64)
    }

    pub fn stuck_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.stuck_threshold_secs as i64)
    }

    pub fn recent_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.recent_window_minutes as i64)
    }
}

impl OrchestratorConfig {
    /// Load configuration from the default path, falling back to defaults
    pub fn load() -> Self {
        let path = Self::default_config_path();
        Self::load_from_path(&path).unwrap_or_default()
    }

    /// Get default config path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("workbench")
            .join("orchestrator.toml")
    }

    /// Load from a specific path
    pub fn load_from_path(path: &PathBuf) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err, "ignoring unparseable config");
                None
            }
        }
    }

    /// Session store database path
    pub fn store_path(&self) -> PathBuf {
        self.store.path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("workbench")
                .join("sessions.db")
        })
    }

    pub const fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.call_timeout_secs)
    }
}
