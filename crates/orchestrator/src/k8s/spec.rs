//! Resource spec builder for IDE session pods.
//!
//! Pure construction: a session record plus collaborator lookups in, a pod
//! and optional claim out. No cluster calls happen here - secret presence
//! is resolved beforehand and passed in, so repeated builds over the same
//! inputs produce byte-identical specs.
//!
//! The pod always carries an init container (clones the repository), the
//! main IDE container, and an autosave sidecar. The sidecar holds the
//! repository write-credentials so they never reach the student-facing
//! container. Session flags toggle further sidecars and mounts.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction,
    HTTPGetAction, KeyToPath, PersistentVolumeClaim, PersistentVolumeClaimVolumeSource, Pod,
    PodDNSConfig, PodSpec, Probe, ResourceRequirements, SecretKeySelector, SecretVolumeSource,
    SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::ObjectMeta;
use tracing::debug;

use super::pvc;
use crate::auth::TokenIssuer;
use crate::catalog::{
    CourseDirectory, GradingBackend, ImageCatalog, SecretPresence, StoragePolicy,
};
use crate::config::OrchestratorConfig;
use crate::session::{SessionKind, SessionRecord};

/// Primary port the IDE server listens on
pub const IDE_PORT: i32 = 5000;
/// First of the optional user proxy ports
const PROXY_PORT_BASE: i32 = 8000;
/// Number of optional proxy ports (TCP and UDP each)
const PROXY_PORT_COUNT: i32 = 11;

/// Shared volume mount point in every container
const HOME_MOUNT_PATH: &str = "/home/workbench";
/// Shared log volume mount point
const LOG_MOUNT_PATH: &str = "/log";
/// Marker file the autograde sidecar waits on before starting
const AUTOGRADE_READY_MARKER: &str = "/home/workbench/.bashrc";

/// Desired cluster resources for one session
#[derive(Debug, Clone)]
pub struct WorkloadSpec {
    pub pod: Pod,
    pub pvc: Option<PersistentVolumeClaim>,
}

/// Session options after the workload kind has been applied.
///
/// Webtop images never get admin, autosave, or credential features and
/// always get persistent storage, whatever the record says.
#[derive(Debug, Clone)]
struct EffectiveOptions {
    limits: BTreeMap<String, String>,
    requests: BTreeMap<String, String>,
    admin: bool,
    autosave: bool,
    credentials: bool,
    persistent_storage: bool,
}

impl EffectiveOptions {
    fn derive(session: &SessionRecord, kind: SessionKind, config: &OrchestratorConfig) -> Self {
        let defaults = match kind {
            SessionKind::Standard => &config.resources.standard,
            SessionKind::Webtop => &config.resources.webtop,
        };
        let bounds = session.resources.as_ref().unwrap_or(defaults);
        let limits = if bounds.limits.is_empty() {
            defaults.limits.clone()
        } else {
            bounds.limits.clone()
        };
        let requests = if bounds.requests.is_empty() {
            defaults.requests.clone()
        } else {
            bounds.requests.clone()
        };

        match kind {
            SessionKind::Standard => Self {
                limits,
                requests,
                admin: session.admin,
                autosave: session.autosave,
                credentials: session.credentials,
                persistent_storage: session.persistent_storage,
            },
            SessionKind::Webtop => Self {
                limits,
                requests,
                admin: false,
                autosave: false,
                credentials: false,
                persistent_storage: true,
            },
        }
    }
}

/// Builds workload specs from session records and collaborator lookups
pub struct SpecBuilder<'a> {
    pub config: &'a OrchestratorConfig,
    pub catalog: &'a dyn ImageCatalog,
    pub storage: &'a dyn StoragePolicy,
    pub courses: &'a dyn CourseDirectory,
    pub grading: &'a dyn GradingBackend,
    pub tokens: &'a dyn TokenIssuer,
    /// Resolved before building; absence degrades features
    pub secrets: SecretPresence,
}

impl SpecBuilder<'_> {
    /// Build the pod and optional claim for a session
    pub fn build(&self, session: &SessionRecord) -> Result<WorkloadSpec> {
        let entry = self
            .catalog
            .lookup(&session.image_id)
            .with_context(|| format!("unknown image id: {}", session.image_id))?;
        let kind = SessionKind::from_webtop(entry.webtop);
        let opts = EffectiveOptions::derive(session, kind, self.config);

        let include_git = self.secrets.git_credentials;
        let autosave_on = opts.autosave && include_git;
        let include_registry = opts.admin && self.secrets.registry_config;

        // The home volume is the claim when storage is persistent; the
        // names must agree so the pod mounts what the claim provides.
        let home_volume = if opts.persistent_storage {
            pvc::claim_name(session)
        } else {
            pvc::session_volume_name(session)
        };
        let claim = opts
            .persistent_storage
            .then(|| pvc::build_claim(session, kind, self.storage));

        let log_mount = mount("log", LOG_MOUNT_PATH);
        let home_mount = mount(&home_volume, HOME_MOUNT_PATH);

        // Shared volumes: log is always present; the home volume is backed
        // by the user claim or an ephemeral empty-dir.
        let mut volumes = vec![
            Volume {
                name: "log".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            },
            if opts.persistent_storage {
                Volume {
                    name: home_volume.clone(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: home_volume.clone(),
                        ..PersistentVolumeClaimVolumeSource::default()
                    }),
                    ..Volume::default()
                }
            } else {
                Volume {
                    name: home_volume.clone(),
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Volume::default()
                }
            },
        ];

        let mut containers = Vec::new();
        let mut ide_env = Vec::new();
        let mut ide_mounts = vec![log_mount.clone(), home_mount.clone()];
        let mut labels = base_labels(session);

        // Docker-in-docker: privileged daemon sidecar sharing certificates
        // with the IDE over an empty-dir.
        if session.docker {
            volumes.push(Volume {
                name: "dockerd-certs".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Volume::default()
            });
            let certs_mount = mount("dockerd-certs", "/certs");
            ide_mounts.push(certs_mount.clone());
            ide_env.push(env("WORKBENCH_RUN_DOCKERD", "1"));
            containers.push(self.dockerd_container(&log_mount, &home_mount, &certs_mount));
        }

        // Autograde sidecar; missing grading inputs degrade to a plain IDE
        if session.autograde {
            if let Some(container) =
                self.autograde_container(session, &log_mount, &home_mount)
            {
                containers.push(container);
                labels.insert("shell-autograde".to_string(), "ON".to_string());
                ide_env.push(env("WORKBENCH_SHELL_AUTOGRADE", "1"));
            } else {
                debug!(session_id = %session.id, "autograde inputs unavailable; skipping sidecar");
            }
        }

        // Admin sessions may push course tests and images, so they get the
        // registry docker config mounted read-only.
        if include_registry {
            volumes.push(Volume {
                name: "registry-config".to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(self.config.images.registry_secret.clone()),
                    default_mode: Some(0o644),
                    items: Some(vec![KeyToPath {
                        key: ".dockerconfigjson".to_string(),
                        path: "config.json".to_string(),
                        ..KeyToPath::default()
                    }]),
                    ..SecretVolumeSource::default()
                }),
                ..Volume::default()
            });
            ide_mounts.push(mount("registry-config", "/docker"));
        }

        // Webtop desktops need a real /dev/shm
        if kind == SessionKind::Webtop {
            volumes.push(Volume {
                name: "dshm".to_string(),
                empty_dir: Some(EmptyDirVolumeSource {
                    medium: Some("Memory".to_string()),
                    ..EmptyDirVolumeSource::default()
                }),
                ..Volume::default()
            });
            ide_mounts.push(mount("dshm", "/dev/shm"));
        }

        ide_env.extend(self.identity_env(session, &opts)?);

        containers.push(self.ide_container(
            session, &entry, kind, &opts, autosave_on, ide_env, ide_mounts,
        ));
        containers.push(self.autosave_container(
            session,
            kind,
            &opts,
            autosave_on,
            include_git,
            &log_mount,
            &home_mount,
        ));

        labels.insert(
            "network-policy".to_string(),
            self.network_policy(session, &opts),
        );

        let mut spec = PodSpec {
            hostname: Some(super::POD_HOSTNAME.to_string()),
            init_containers: Some(vec![self.init_container(session, include_git, &home_mount)]),
            containers,
            volumes: Some(volumes),
            service_account_name: Some(self.config.cluster.service_account.clone()),
            // Sessions are untrusted: no service env injection, no API token
            enable_service_links: Some(false),
            automount_service_account_token: Some(false),
            ..PodSpec::default()
        };
        if !self.config.cluster.node_selector.is_empty() {
            spec.node_selector = Some(self.config.cluster.node_selector.clone());
        }
        // DNS lock trades cluster DNS for a fixed public resolver
        if session.network_dns_locked {
            spec.dns_policy = Some("None".to_string());
            spec.dns_config = Some(PodDNSConfig {
                nameservers: Some(vec![self.config.network.nameserver.clone()]),
                ..PodDNSConfig::default()
            });
        }

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(super::pod_name(session)),
                namespace: Some(self.config.cluster.namespace.clone()),
                labels: Some(labels),
                ..ObjectMeta::default()
            },
            spec: Some(spec),
            ..Pod::default()
        };

        Ok(WorkloadSpec { pod, pvc: claim })
    }

    /// Clones the repository onto the shared volume; no-op for empty urls
    fn init_container(
        &self,
        session: &SessionRecord,
        include_git: bool,
        home_mount: &VolumeMount,
    ) -> Container {
        let mut env_vars = vec![env("GIT_REPO", session.repo_url.clone())];
        if include_git {
            env_vars.push(git_cred_env(&self.config.images.git_secret));
        }
        Container {
            name: "ide-init".to_string(),
            image: Some(self.config.images.sidecar_image(&self.config.images.init)),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(env_vars),
            volume_mounts: Some(vec![home_mount.clone()]),
            ..Container::default()
        }
    }

    /// Sidecar holding write-credentials, isolated from the IDE container
    #[allow(clippy::too_many_arguments)]
    fn autosave_container(
        &self,
        session: &SessionRecord,
        kind: SessionKind,
        opts: &EffectiveOptions,
        autosave_on: bool,
        include_git: bool,
        log_mount: &VolumeMount,
        home_mount: &VolumeMount,
    ) -> Container {
        let mut env_vars = vec![
            env("AUTOSAVE", if autosave_on { "ON" } else { "OFF" }),
            env("USERNAME", session.owner_username.clone()),
            env("GIT_REPO", session.repo_url.clone()),
        ];
        if include_git {
            env_vars.push(git_cred_env(&self.config.images.git_secret));
        }
        if opts.admin {
            env_vars.push(env("WORKBENCH_ADMIN", "ON"));
            if let Some(repo) = self.course_tests_repo(session) {
                env_vars.push(env("WORKBENCH_TESTS_REPO", repo));
            }
        }

        // Webtop desktops have no checkout to save; only the log volume
        let mut mounts = vec![log_mount.clone()];
        if kind == SessionKind::Standard {
            mounts.push(home_mount.clone());
        }

        Container {
            name: "autosave".to_string(),
            image: Some(
                self.config
                    .images
                    .sidecar_image(&self.config.images.autosave),
            ),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(env_vars),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                run_as_non_root: Some(true),
                run_as_user: Some(1001),
                ..SecurityContext::default()
            }),
            volume_mounts: Some(mounts),
            ..Container::default()
        }
    }

    /// Rootless docker daemon; privileged is required even rootless
    fn dockerd_container(
        &self,
        log_mount: &VolumeMount,
        home_mount: &VolumeMount,
        certs_mount: &VolumeMount,
    ) -> Container {
        Container {
            name: "dockerd".to_string(),
            image: Some(
                self.config
                    .images
                    .sidecar_image(&self.config.images.dockerd),
            ),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(vec![env("WORKBENCH_RUN_DOCKERD", "1")]),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(true),
                run_as_non_root: Some(true),
                run_as_user: Some(1001),
                privileged: Some(true),
                ..SecurityContext::default()
            }),
            volume_mounts: Some(vec![
                log_mount.clone(),
                home_mount.clone(),
                certs_mount.clone(),
            ]),
            ..Container::default()
        }
    }

    /// Grading sidecar; returns None when any grading input is unavailable
    fn autograde_container(
        &self,
        session: &SessionRecord,
        log_mount: &VolumeMount,
        home_mount: &VolumeMount,
    ) -> Option<Container> {
        let run_id = session.grading_run_id.as_deref()?;
        let assignment_id = session.assignment_id.as_deref()?;
        let token = self.grading.grading_token(run_id)?;
        let script = self.grading.exercise_script(assignment_id)?;
        let resume = self.grading.resume_payload(run_id).unwrap_or_default();

        Some(Container {
            name: "autograde".to_string(),
            image: Some(
                self.config
                    .images
                    .sidecar_image(&self.config.images.autograde),
            ),
            image_pull_policy: Some("IfNotPresent".to_string()),
            env: Some(vec![
                env("USERNAME", session.owner_username.clone()),
                env("TOKEN", token),
                env("SUBMISSION_ID", run_id),
                env("EXERCISE_SCRIPT", script),
                env("RESUME", resume),
            ]),
            // Gate startup on the init marker so shells only ever see a
            // fully prepared home volume
            startup_probe: Some(Probe {
                exec: Some(ExecAction {
                    command: Some(vec![
                        "stat".to_string(),
                        AUTOGRADE_READY_MARKER.to_string(),
                    ]),
                }),
                initial_delay_seconds: Some(0),
                period_seconds: Some(1),
                failure_threshold: Some(60),
                ..Probe::default()
            }),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(false),
                privileged: Some(false),
                run_as_user: Some(SessionKind::Standard.run_as_user()),
                ..SecurityContext::default()
            }),
            volume_mounts: Some(vec![log_mount.clone(), home_mount.clone()]),
            ..Container::default()
        })
    }

    /// The IDE server container the user lands in
    #[allow(clippy::too_many_arguments)]
    fn ide_container(
        &self,
        session: &SessionRecord,
        entry: &crate::catalog::ImageEntry,
        kind: SessionKind,
        opts: &EffectiveOptions,
        autosave_on: bool,
        extra_env: Vec<EnvVar>,
        mounts: Vec<VolumeMount>,
    ) -> Container {
        let mut ports = vec![ContainerPort {
            container_port: IDE_PORT,
            ..ContainerPort::default()
        }];
        for offset in 0..PROXY_PORT_COUNT {
            ports.push(ContainerPort {
                container_port: PROXY_PORT_BASE + offset,
                protocol: Some("TCP".to_string()),
                ..ContainerPort::default()
            });
        }
        for offset in 0..PROXY_PORT_COUNT {
            ports.push(ContainerPort {
                container_port: PROXY_PORT_BASE + offset,
                protocol: Some("UDP".to_string()),
                ..ContainerPort::default()
            });
        }

        let mut env_vars = vec![
            env("AUTOSAVE", if autosave_on { "ON" } else { "OFF" }),
            env("REPO_NAME", repo_name(&session.repo_url)),
        ];
        env_vars.extend(extra_env);

        Container {
            name: "ide".to_string(),
            image: Some(entry.reference(session.image_tag.as_deref())),
            image_pull_policy: Some("IfNotPresent".to_string()),
            ports: Some(ports),
            env: Some(env_vars),
            resources: Some(ResourceRequirements {
                limits: Some(quantities(&opts.limits)),
                requests: Some(quantities(&opts.requests)),
                ..ResourceRequirements::default()
            }),
            volume_mounts: Some(mounts),
            // Pod stays unready until the IDE webserver answers
            startup_probe: Some(Probe {
                http_get: Some(HTTPGetAction {
                    path: Some("/".to_string()),
                    port: IntOrString::Int(IDE_PORT),
                    ..HTTPGetAction::default()
                }),
                initial_delay_seconds: Some(3),
                period_seconds: Some(1),
                failure_threshold: Some(60),
                success_threshold: Some(1),
                ..Probe::default()
            }),
            security_context: Some(SecurityContext {
                allow_privilege_escalation: Some(kind == SessionKind::Webtop),
                privileged: Some(false),
                run_as_user: Some(kind.run_as_user()),
                ..SecurityContext::default()
            }),
            ..Container::default()
        }
    }

    /// Environment carrying identity and course context into the IDE
    fn identity_env(
        &self,
        session: &SessionRecord,
        opts: &EffectiveOptions,
    ) -> Result<Vec<EnvVar>> {
        let mut env_vars = Vec::new();

        if let Some(assignment_id) = &session.assignment_id {
            env_vars.push(env("WORKBENCH_ASSIGNMENT_ID", assignment_id));
        }

        if opts.admin {
            env_vars.push(env("WORKBENCH_ADMIN", "ON"));
            if let Some(repo) = self.course_tests_repo(session) {
                env_vars.push(env("WORKBENCH_TESTS_REPO", repo));
            }
        }

        // Admin and credentialed sessions get a bearer token the in-IDE
        // CLI picks up
        if opts.admin || opts.credentials {
            let token = self.tokens.issue(&session.owner_username);
            env_vars.push(env("INCLUSTER", STANDARD.encode(token)));

            if let Some(course_id) = &session.course_id {
                if let Some(course) = self.courses.course(course_id) {
                    let context = serde_json::json!({
                        "id": course.id,
                        "name": course.name,
                        "code": course.code,
                    });
                    // urlsafe encoding: the web layer loads this back out
                    // of a cookie-style value
                    env_vars.push(env(
                        "COURSE_CONTEXT",
                        URL_SAFE.encode(serde_json::to_vec(&context)?),
                    ));
                }
            }
        }

        if let Some(course_id) = &session.course_id {
            if let Some(course) = self.courses.course(course_id) {
                env_vars.push(env("COURSE_CODE", course.code));
            }
        }

        Ok(env_vars)
    }

    fn course_tests_repo(&self, session: &SessionRecord) -> Option<String> {
        let course_id = session.course_id.as_deref()?;
        self.courses.course(course_id)?.tests_repo
    }

    /// Network policy label, validated against the allow-list.
    ///
    /// Admin sessions default to the admin policy when none is set; any
    /// value outside the allow-list falls back to the platform default.
    fn network_policy(&self, session: &SessionRecord, opts: &EffectiveOptions) -> String {
        let requested = session
            .network_policy
            .clone()
            .unwrap_or_else(|| {
                if opts.admin {
                    "admin".to_string()
                } else {
                    self.config.network.default_policy.clone()
                }
            });
        if self
            .config
            .network
            .valid_policies
            .iter()
            .any(|policy| *policy == requested)
        {
            requested
        } else {
            self.config.network.default_policy.clone()
        }
    }
}

fn base_labels(session: &SessionRecord) -> BTreeMap<String, String> {
    BTreeMap::from([
        (
            "app.kubernetes.io/name".to_string(),
            super::APP_NAME.to_string(),
        ),
        ("component".to_string(), super::ROLE_IDE_SESSION.to_string()),
        ("role".to_string(), super::ROLE_IDE_SESSION.to_string()),
        ("username".to_string(), session.owner_username.clone()),
        ("session".to_string(), session.id.clone()),
    ])
}

fn env(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..EnvVar::default()
    }
}

fn git_cred_env(secret_name: &str) -> EnvVar {
    EnvVar {
        name: "GIT_CRED".to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret_name.to_string(),
                key: "credentials".to_string(),
                ..SecretKeySelector::default()
            }),
            ..EnvVarSource::default()
        }),
        ..EnvVar::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..VolumeMount::default()
    }
}

fn quantities(map: &BTreeMap<String, String>) -> BTreeMap<String, Quantity> {
    map.iter()
        .map(|(key, value)| (key.clone(), Quantity(value.clone())))
        .collect()
}

/// Repository name from its url, for shell prompts and init shortcuts
fn repo_name(repo_url: &str) -> String {
    repo_url
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .trim_end_matches(".git")
        .to_string()
}
