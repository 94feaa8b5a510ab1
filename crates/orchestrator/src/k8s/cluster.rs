//! Bounded-timeout Kubernetes client wrapper.
//!
//! Every call site in the orchestration core goes through this wrapper so
//! that error handling is uniform: not-found is a normal answer, conflicts
//! on create are success, everything else is transient and surfaces as a
//! `ClusterError` the caller logs and retries next cycle via `best_effort`.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Event, PersistentVolumeClaim, Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::{debug, warn};

use crate::catalog::SecretPresence;
use crate::config::OrchestratorConfig;

/// Sentinel secret value used in debug deployments to simulate absence
const DEBUG_SECRET_SENTINEL: &str = "DEBUG";

/// Closed error taxonomy for cluster calls
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// Expected for resources that have not materialized yet
    #[error("resource not found")]
    NotFound,

    /// The call exceeded the configured bound
    #[error("cluster call timed out after {0:?}")]
    Timeout(Duration),

    /// Anything else the API server returned
    #[error(transparent)]
    Api(#[from] kube::Error),
}

pub type ClusterResult<T> = Result<T, ClusterError>;

fn classify(err: kube::Error) -> ClusterError {
    if let kube::Error::Api(response) = &err {
        if response.code == 404 {
            return ClusterError::NotFound;
        }
    }
    ClusterError::Api(err)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

/// Run a cluster operation, logging and swallowing any failure.
///
/// This is the single log-and-continue policy for the reconciliation paths:
/// a failed call abandons this cycle's work for that resource and the next
/// periodic invocation retries from fresh state.
pub async fn best_effort<T>(
    operation: &str,
    fut: impl Future<Output = ClusterResult<T>>,
) -> Option<T> {
    match fut.await {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(operation, error = %err, "cluster call failed; continuing");
            None
        }
    }
}

/// Kubernetes client scoped to the session namespace
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    namespace: String,
    call_timeout: Duration,
}

impl ClusterClient {
    /// Connect using the in-cluster or kubeconfig default
    pub async fn connect(config: &OrchestratorConfig) -> anyhow::Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self {
            client,
            namespace: config.cluster.namespace.clone(),
            call_timeout: config.call_timeout(),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn claims(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn events(&self) -> Api<Event> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    /// Bound a cluster call by the configured timeout
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, kube::Error>>,
    ) -> ClusterResult<T> {
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result.map_err(classify),
            Err(_) => Err(ClusterError::Timeout(self.call_timeout)),
        }
    }

    /// Create a session pod; an existing pod with the same name is success
    pub async fn create_pod(&self, pod: &Pod) -> ClusterResult<()> {
        let pods = self.pods();
        match tokio::time::timeout(self.call_timeout, pods.create(&PostParams::default(), pod))
            .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if is_conflict(&err) => {
                debug!(
                    name = pod.metadata.name.as_deref().unwrap_or_default(),
                    "pod already exists"
                );
                Ok(())
            }
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(ClusterError::Timeout(self.call_timeout)),
        }
    }

    /// Create a claim unless it already exists.
    ///
    /// Persistent volumes are shared per user, so an existing claim is the
    /// common case for returning users.
    pub async fn ensure_claim(&self, claim: &PersistentVolumeClaim) -> ClusterResult<()> {
        let claims = self.claims();
        let name = claim.metadata.name.as_deref().unwrap_or_default();

        match self.bounded(claims.get(name)).await {
            Ok(_) => {
                debug!(name, "claim already exists");
                return Ok(());
            }
            Err(ClusterError::NotFound) => {}
            Err(err) => return Err(err),
        }

        match tokio::time::timeout(
            self.call_timeout,
            claims.create(&PostParams::default(), claim),
        )
        .await
        {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(err)) if is_conflict(&err) => Ok(()),
            Ok(Err(err)) => Err(classify(err)),
            Err(_) => Err(ClusterError::Timeout(self.call_timeout)),
        }
    }

    /// Read one pod by name; None when it has not materialized yet
    pub async fn get_pod(&self, name: &str) -> ClusterResult<Option<Pod>> {
        match self.bounded(self.pods().get(name)).await {
            Ok(pod) => Ok(Some(pod)),
            Err(ClusterError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// List every pod carrying the session role label
    pub async fn list_session_pods(&self) -> ClusterResult<Vec<Pod>> {
        let params = ListParams::default().labels(&super::session_role_selector());
        let list = self.bounded(self.pods().list(&params)).await?;
        Ok(list.items)
    }

    /// Events involving the named pod
    pub async fn pod_events(&self, pod_name: &str) -> ClusterResult<Vec<Event>> {
        let params = ListParams::default().fields(&format!("involvedObject.name={pod_name}"));
        let list = self.bounded(self.events().list(&params)).await?;
        Ok(list.items)
    }

    /// Mark every resource carrying this session's id label for deletion.
    ///
    /// Propagation is backgrounded: the call returns before deletion
    /// completes. Deleting already-deleting resources is a no-op.
    pub async fn delete_session_resources(&self, session_id: &str) -> ClusterResult<()> {
        let delete = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        let selector = ListParams::default().labels(&super::session_id_selector(session_id));
        self.bounded(self.pods().delete_collection(&delete, &selector))
            .await?;
        Ok(())
    }

    /// Delete a user's persistent volume claim
    pub async fn delete_claim(&self, name: &str) -> ClusterResult<()> {
        let delete = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..DeleteParams::default()
        };
        match self.bounded(self.claims().delete(name, &delete)).await {
            Ok(_) | Err(ClusterError::NotFound) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Read one key of a named secret; None when the secret or key is absent
    pub async fn read_secret_value(&self, name: &str, key: &str) -> ClusterResult<Option<String>> {
        let secret = match self.bounded(self.secrets().get(name)).await {
            Ok(secret) => secret,
            Err(ClusterError::NotFound) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned()))
    }

    /// Determine which optional secrets are available.
    ///
    /// Production deployments never probe; both features stay enabled. In
    /// debug mode a missing secret, a `DEBUG` sentinel value, or any read
    /// failure disables the matching feature rather than failing the build.
    pub async fn probe_secrets(&self, config: &OrchestratorConfig) -> SecretPresence {
        if !config.debug {
            return SecretPresence::default();
        }

        let git_credentials = match self
            .read_secret_value(&config.images.git_secret, "token")
            .await
        {
            Ok(Some(token)) => token != DEBUG_SECRET_SENTINEL,
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "git secret probe failed; disabling git features");
                false
            }
        };

        let registry_config = match self
            .read_secret_value(&config.images.registry_secret, ".dockerconfigjson")
            .await
        {
            Ok(Some(value)) => value != DEBUG_SECRET_SENTINEL,
            Ok(None) => false,
            Err(err) => {
                warn!(error = %err, "registry secret probe failed; disabling registry mount");
                false
            }
        };

        SecretPresence {
            git_credentials,
            registry_config,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_not_found() {
        let err = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert!(matches!(classify(err), ClusterError::NotFound));
    }

    #[test]
    fn test_conflict_detection() {
        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "already exists".to_string(),
            reason: "AlreadyExists".to_string(),
            code: 409,
        });
        assert!(is_conflict(&conflict));

        let server_error = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        });
        assert!(!is_conflict(&server_error));
        assert!(matches!(classify(server_error), ClusterError::Api(_)));
    }

    #[tokio::test]
    async fn test_best_effort_swallows_errors() {
        let ok = best_effort("noop", async { ClusterResult::Ok(7) }).await;
        assert_eq!(ok, Some(7));

        let failed: Option<()> = best_effort("noop", async {
            Err(ClusterError::Timeout(Duration::from_secs(1)))
        })
        .await;
        assert_eq!(failed, None);
    }
}
