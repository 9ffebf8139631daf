//! Subprocess-backed cluster client.
//!
//! The harness drives the cluster through the same `kubectl` binary a
//! developer uses, rather than an in-process API client: the commands it
//! runs can be replayed verbatim when troubleshooting a failed test.
//!
//! The fetch contract matters more than the transport: a `(NotFound)`
//! failure maps to `Ok(None)` so that "wait until deleted" is a predicate
//! over absence, while every other failure (permissions, connectivity,
//! malformed output) is a hard [`KubectlError`] that aborts the wait.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::resources::{Deployment, Namespace, Pod, PodList, Resource, Service, ServiceAccount};

/// Grace period passed to `kubectl delete` unless the caller overrides it.
pub const DELETE_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Errors from the kubectl subprocess layer.
#[derive(Debug, Error)]
pub enum KubectlError {
    /// The binary could not be started at all.
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// kubectl ran but exited non-zero for a reason other than NotFound.
    #[error("kubectl exited with {status}: {stderr}")]
    Command {
        status: std::process::ExitStatus,
        stderr: String,
    },

    /// I/O towards the child process failed mid-flight.
    #[error("i/o error talking to kubectl: {0}")]
    Io(#[from] std::io::Error),

    /// kubectl produced output that is not the expected JSON.
    #[error("failed to decode kubectl output: {0}")]
    Decode(#[from] serde_json::Error),
}

/// True iff a kubectl failure is the server saying the resource does not
/// exist, e.g. `Error from server (NotFound): pods "foo" not found`.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("(NotFound)")
}

/// Render a label map as a kubectl selector: `k==v` pairs joined by commas.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}=={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Cluster client bound to one kubeconfig context.
///
/// The program name is injectable so tests can substitute a fake
/// executable for the real `kubectl`.
#[derive(Debug, Clone)]
pub struct Kubectl {
    context: String,
    program: String,
}

impl Kubectl {
    pub fn new(context: impl Into<String>) -> Self {
        Self::with_program(context, "kubectl")
    }

    pub fn with_program(context: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            context: context.into(),
            program: program.into(),
        }
    }

    /// The kubeconfig context this client talks to.
    pub fn context(&self) -> &str {
        &self.context
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output, KubectlError> {
        debug!(program = %self.program, context = %self.context, ?args, "running kubectl");
        Command::new(&self.program)
            .arg("--context")
            .arg(&self.context)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| KubectlError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    /// Fetch one resource as raw JSON; `Ok(None)` when the server reports
    /// NotFound.
    pub async fn get_raw(
        &self,
        namespace: Option<&str>,
        kind: &str,
        name: &str,
    ) -> Result<Option<Vec<u8>>, KubectlError> {
        let mut args = Vec::new();
        if let Some(ns) = namespace {
            args.extend(["--namespace", ns]);
        }
        args.extend(["get", kind, name, "-o", "json"]);

        let output = self.run(&args).await?;
        if output.status.success() {
            return Ok(Some(output.stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if is_not_found(&stderr) {
            return Ok(None);
        }
        Err(KubectlError::Command {
            status: output.status,
            stderr,
        })
    }

    /// Fetch and deserialize one resource; `Ok(None)` when absent.
    pub async fn get_as<T: DeserializeOwned>(
        &self,
        namespace: Option<&str>,
        kind: &str,
        name: &str,
    ) -> Result<Option<T>, KubectlError> {
        match self.get_raw(namespace, kind, name).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }
}

/// Operations the namespace orchestrator needs from a cluster.
///
/// [`Kubectl`] is the real implementation; tests drive the orchestrator
/// with a scripted mock instead.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// The context name used for spawned tunnels.
    fn context(&self) -> &str;

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, KubectlError>;

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, KubectlError>;

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, KubectlError>;

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, KubectlError>;

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, KubectlError>;

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, KubectlError>;

    /// Foreground-cascade delete of a namespaced resource. Does not wait
    /// for the deletion to complete; convergence is observed separately.
    async fn delete(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        grace_period: Duration,
    ) -> Result<(), KubectlError>;

    async fn delete_namespace(&self, name: &str, grace_period: Duration)
        -> Result<(), KubectlError>;

    /// Apply a YAML manifest into the namespace via stdin.
    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<(), KubectlError>;
}

#[async_trait]
impl ClusterClient for Kubectl {
    fn context(&self) -> &str {
        &self.context
    }

    async fn get_service(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Service>, KubectlError> {
        self.get_as(Some(namespace), Service::KIND, name).await
    }

    async fn get_service_account(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ServiceAccount>, KubectlError> {
        self.get_as(Some(namespace), ServiceAccount::KIND, name).await
    }

    async fn get_deployment(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Deployment>, KubectlError> {
        self.get_as(Some(namespace), Deployment::KIND, name).await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<Pod>, KubectlError> {
        self.get_as(Some(namespace), Pod::KIND, name).await
    }

    async fn get_namespace(&self, name: &str) -> Result<Option<Namespace>, KubectlError> {
        self.get_as(None, Namespace::KIND, name).await
    }

    async fn list_pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Pod>, KubectlError> {
        let selector = label_selector(labels);
        let output = self
            .run(&[
                "--namespace",
                namespace,
                "get",
                "pods",
                "-l",
                &selector,
                "-o",
                "json",
            ])
            .await?;
        if !output.status.success() {
            return Err(KubectlError::Command {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        let list: PodList = serde_json::from_slice(&output.stdout)?;
        Ok(list.items)
    }

    async fn delete(
        &self,
        namespace: &str,
        kind: &str,
        name: &str,
        grace_period: Duration,
    ) -> Result<(), KubectlError> {
        let grace = format!("--grace-period={}", grace_period.as_secs());
        let output = self
            .run(&[
                "--namespace",
                namespace,
                "delete",
                kind,
                name,
                "--cascade=foreground",
                &grace,
                "--wait=false",
            ])
            .await?;
        if !output.status.success() {
            return Err(KubectlError::Command {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn delete_namespace(
        &self,
        name: &str,
        grace_period: Duration,
    ) -> Result<(), KubectlError> {
        let grace = format!("--grace-period={}", grace_period.as_secs());
        let output = self
            .run(&[
                "delete",
                "namespace",
                name,
                "--cascade=foreground",
                &grace,
                "--wait=false",
            ])
            .await?;
        if !output.status.success() {
            return Err(KubectlError::Command {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }

    async fn apply_manifest(&self, namespace: &str, manifest: &str) -> Result<(), KubectlError> {
        let mut child = Command::new(&self.program)
            .arg("--context")
            .arg(&self.context)
            .args(["--namespace", namespace, "apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| KubectlError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(manifest.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(KubectlError::Command {
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}
