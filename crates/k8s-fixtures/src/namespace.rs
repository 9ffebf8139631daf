//! Namespace-scoped fixture orchestration.
//!
//! [`NamespaceFixture`] composes the cluster client with the convergence
//! poller and the predicate library into domain-level operations: "wait for
//! this deployment to report N replicas", "wait for this service to be
//! gone", "tunnel into this pod". Every timed-out wait logs the
//! pretty-printed last observation so a failed test reports what the
//! cluster looked like, not just that time ran out.

use std::collections::BTreeMap;
use std::time::Duration;

use convergence::{wait, RetryError, RetryPolicy};
use serde::Deserialize;
use thiserror::Error;
use tracing::error;

use crate::diag::{pretty_status, pretty_statuses};
use crate::forward::{PortForwarder, TunnelError, TunnelSpec};
use crate::kubectl::{ClusterClient, Kubectl, KubectlError, DELETE_GRACE_PERIOD};
use crate::predicates;
use crate::resources::{Deployment, Namespace, Pod, Resource, Service, ServiceAccount};

/// Annotation the NEG controller writes once network endpoint groups are
/// published for a service.
pub const NEG_STATUS_ANNOTATION: &str = "cloud.google.com/neg-status";

/// Errors from fixture orchestration.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("cluster request failed: {0}")]
    Client(#[from] KubectlError),

    /// A wait ran out of time. `last` is the rendered last observation.
    #[error("timed out after {elapsed:?} waiting for {what}; last observed:\n{last}")]
    WaitTimeout {
        what: String,
        elapsed: Duration,
        last: String,
    },

    #[error("wait for {what} cancelled after {elapsed:?}")]
    WaitCancelled { what: String, elapsed: Duration },

    #[error("{kind} {name:?} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("service {name:?} has no neg-status annotation")]
    MissingNegStatus { name: String },

    #[error("malformed neg-status annotation on service {name:?}: {source}")]
    MalformedNegStatus {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("neg-status on service {name:?} has no entry for port {port}")]
    MissingNegPort { name: String, port: u16 },

    #[error(transparent)]
    Tunnel(#[from] TunnelError),
}

/// Decoded value of the neg-status annotation.
#[derive(Debug, Deserialize)]
struct NegStatus {
    #[serde(default)]
    network_endpoint_groups: BTreeMap<String, String>,
    #[serde(default)]
    zones: Vec<String>,
}

/// Handle on one namespace of the cluster under test.
///
/// Generic over the client so tests can script observations; production
/// code uses the default [`Kubectl`] client.
pub struct NamespaceFixture<C = Kubectl> {
    name: String,
    client: C,
}

impl NamespaceFixture<Kubectl> {
    /// Fixture for `name`, talking to the given kubeconfig context.
    pub fn new(context: impl Into<String>, name: impl Into<String>) -> Self {
        Self::with_client(Kubectl::new(context), name)
    }
}

impl<C: ClusterClient> NamespaceFixture<C> {
    pub fn with_client(client: C, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    // Getters. Absence is a value, not an error (see the fetch contract in
    // the kubectl module).

    pub async fn get_service(&self, name: &str) -> Result<Option<Service>, KubectlError> {
        self.client.get_service(&self.name, name).await
    }

    pub async fn get_service_account(
        &self,
        name: &str,
    ) -> Result<Option<ServiceAccount>, KubectlError> {
        self.client.get_service_account(&self.name, name).await
    }

    pub async fn get_deployment(&self, name: &str) -> Result<Option<Deployment>, KubectlError> {
        self.client.get_deployment(&self.name, name).await
    }

    pub async fn get_pod(&self, name: &str) -> Result<Option<Pod>, KubectlError> {
        self.client.get_pod(&self.name, name).await
    }

    pub async fn get_namespace(&self) -> Result<Option<Namespace>, KubectlError> {
        self.client.get_namespace(&self.name).await
    }

    pub async fn list_pods_with_labels(
        &self,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, KubectlError> {
        self.client.list_pods(&self.name, labels).await
    }

    /// Pods selected by the deployment's `matchLabels`.
    pub async fn list_deployment_pods(
        &self,
        deployment: &Deployment,
    ) -> Result<Vec<Pod>, KubectlError> {
        self.list_pods_with_labels(&deployment.match_labels()).await
    }

    // Deleters: foreground cascade, default grace, no waiting. Convergence
    // is observed with the wait_for_*_deleted methods.

    pub async fn delete_service(&self, name: &str) -> Result<(), KubectlError> {
        self.client
            .delete(&self.name, Service::KIND, name, DELETE_GRACE_PERIOD)
            .await
    }

    pub async fn delete_service_account(&self, name: &str) -> Result<(), KubectlError> {
        self.client
            .delete(&self.name, ServiceAccount::KIND, name, DELETE_GRACE_PERIOD)
            .await
    }

    pub async fn delete_deployment(&self, name: &str) -> Result<(), KubectlError> {
        self.client
            .delete(&self.name, Deployment::KIND, name, DELETE_GRACE_PERIOD)
            .await
    }

    pub async fn delete_namespace(&self) -> Result<(), KubectlError> {
        self.client
            .delete_namespace(&self.name, DELETE_GRACE_PERIOD)
            .await
    }

    pub async fn apply_manifest(&self, manifest: &str) -> Result<(), KubectlError> {
        self.client.apply_manifest(&self.name, manifest).await
    }

    // Waits: poller + predicate + fetch closure. Suggested policies follow
    // the resource's usual convergence speed: short for services and pods,
    // medium for deployments, long for namespace teardown.

    pub async fn wait_for_service_deleted(
        &self,
        name: &str,
        policy: RetryPolicy,
    ) -> Result<(), FixtureError> {
        let what = format!("service {name} to be deleted");
        wait(
            policy,
            || self.client.get_service(&self.name, name),
            predicates::is_absent,
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_status(last.as_ref())))
    }

    pub async fn wait_for_service_account_deleted(
        &self,
        name: &str,
        policy: RetryPolicy,
    ) -> Result<(), FixtureError> {
        let what = format!("service account {name} to be deleted");
        wait(
            policy,
            || self.client.get_service_account(&self.name, name),
            predicates::is_absent,
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_status(last.as_ref())))
    }

    pub async fn wait_for_namespace_deleted(&self, policy: RetryPolicy) -> Result<(), FixtureError> {
        let what = format!("namespace {} to be deleted", self.name);
        wait(
            policy,
            || self.client.get_namespace(&self.name),
            predicates::is_absent,
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_status(last.as_ref())))
    }

    pub async fn wait_for_deployment_deleted(
        &self,
        name: &str,
        policy: RetryPolicy,
    ) -> Result<(), FixtureError> {
        let what = format!("deployment {name} to be deleted");
        wait(
            policy,
            || self.client.get_deployment(&self.name, name),
            predicates::is_absent,
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_status(last.as_ref())))
    }

    /// Wait until the service exists and carries the neg-status annotation,
    /// i.e. its network endpoint groups are published.
    pub async fn wait_for_service_neg(
        &self,
        name: &str,
        policy: RetryPolicy,
    ) -> Result<(), FixtureError> {
        let what = format!("service {name} to report NEG status");
        wait(
            policy,
            || self.client.get_service(&self.name, name),
            |service| predicates::has_annotation(service, NEG_STATUS_ANNOTATION),
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_status(last.as_ref())))
    }

    pub async fn wait_for_deployment_available_replicas(
        &self,
        name: &str,
        count: i64,
        policy: RetryPolicy,
    ) -> Result<(), FixtureError> {
        let what = format!("deployment {name} to report {count} available replicas");
        wait(
            policy,
            || self.client.get_deployment(&self.name, name),
            |deployment| predicates::replicas_available(deployment, count),
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_status(last.as_ref())))
    }

    /// Wait until the deployment's selector matches exactly `count` pods.
    /// Exact, not "at least": confirms a scale operation landed.
    pub async fn wait_for_deployment_replica_count(
        &self,
        deployment: &Deployment,
        count: usize,
        policy: RetryPolicy,
    ) -> Result<(), FixtureError> {
        let what = format!("deployment {} to have exactly {count} pods", deployment.name());
        let labels = deployment.match_labels();
        wait(
            policy,
            || self.client.list_pods(&self.name, &labels),
            |pods| predicates::pod_count_equals(pods, count),
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_statuses(last)))
    }

    pub async fn wait_for_pod_started(
        &self,
        name: &str,
        policy: RetryPolicy,
    ) -> Result<(), FixtureError> {
        let what = format!("pod {name} to start");
        wait(
            policy,
            || self.client.get_pod(&self.name, name),
            predicates::pod_started,
        )
        .await
        .map(|_| ())
        .map_err(|err| self.wait_error(what, err, |last| pretty_status(last.as_ref())))
    }

    /// Decode the published NEG name and zones for one service port.
    pub async fn get_service_neg(
        &self,
        name: &str,
        port: u16,
    ) -> Result<(String, Vec<String>), FixtureError> {
        let service = self
            .get_service(name)
            .await?
            .ok_or_else(|| FixtureError::NotFound {
                kind: "service",
                name: name.to_string(),
            })?;
        let raw = service
            .metadata
            .annotations
            .get(NEG_STATUS_ANNOTATION)
            .ok_or_else(|| FixtureError::MissingNegStatus {
                name: name.to_string(),
            })?;
        let status: NegStatus =
            serde_json::from_str(raw).map_err(|source| FixtureError::MalformedNegStatus {
                name: name.to_string(),
                source,
            })?;
        let neg_name = status
            .network_endpoint_groups
            .get(&port.to_string())
            .cloned()
            .ok_or_else(|| FixtureError::MissingNegPort {
                name: name.to_string(),
                port,
            })?;
        Ok((neg_name, status.zones))
    }

    /// Open a tunnel to a pod's port. The returned handle is already
    /// `Ready`; the caller owns its teardown.
    pub async fn port_forward_pod(
        &self,
        pod: &Pod,
        remote_port: u16,
        local_port: Option<u16>,
    ) -> Result<PortForwarder, FixtureError> {
        let mut spec = TunnelSpec::new(
            self.client.context(),
            &self.name,
            format!("pod/{}", pod.name()),
            remote_port,
        );
        if let Some(port) = local_port {
            spec = spec.with_local_port(port);
        }
        Ok(PortForwarder::connect(spec).await?)
    }

    fn wait_error<T>(
        &self,
        what: String,
        err: RetryError<T, KubectlError>,
        render: impl FnOnce(&T) -> String,
    ) -> FixtureError {
        match err {
            RetryError::Fetch(err) => FixtureError::Client(err),
            RetryError::Cancelled { elapsed } => FixtureError::WaitCancelled { what, elapsed },
            RetryError::Exhausted { last, elapsed } => {
                let last = render(&last);
                error!(
                    namespace = %self.name,
                    %what,
                    ?elapsed,
                    last = %last,
                    "wait timed out"
                );
                FixtureError::WaitTimeout {
                    what,
                    elapsed,
                    last,
                }
            }
        }
    }
}
