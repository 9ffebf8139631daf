//! Cluster client tests against a fake `kubectl` executable.
//!
//! A shell script standing in for `kubectl` answers a fixed set of
//! commands, which exercises argument construction, JSON decoding and the
//! NotFound-to-None mapping without a cluster.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use k8s_fixtures::kubectl::{ClusterClient, Kubectl, KubectlError};

static INSTALL_COUNTER: AtomicUsize = AtomicUsize::new(0);

const FAKE_KUBECTL: &str = r#"#!/bin/sh
case "$*" in
*"--context test-ctx"*"--namespace test-ns get deployment backend -o json"*)
    printf '%s' '{"metadata":{"name":"backend"},"status":{"availableReplicas":2}}'
    ;;
*"get deployment missing -o json"*)
    echo 'Error from server (NotFound): deployments.apps "missing" not found' >&2
    exit 1
    ;;
*"get service forbidden -o json"*)
    echo 'Error from server (Forbidden): services "forbidden" is forbidden' >&2
    exit 1
    ;;
*"get pods -l app==backend -o json"*)
    printf '%s' '{"items":[{"metadata":{"name":"backend-0"}},{"metadata":{"name":"backend-1"}}]}'
    ;;
*"delete deployment backend --cascade=foreground --grace-period=5 --wait=false"*)
    exit 0
    ;;
*"apply -f -"*)
    cat >/dev/null
    exit 0
    ;;
*)
    echo "unexpected args: $*" >&2
    exit 2
    ;;
esac
"#;

fn install_fake_kubectl() -> Result<PathBuf> {
    let dir = std::env::temp_dir().join(format!(
        "fake-kubectl-{}-{}",
        std::process::id(),
        INSTALL_COUNTER.fetch_add(1, Ordering::SeqCst)
    ));
    fs::create_dir_all(&dir).context("create fake kubectl dir")?;
    let path = dir.join("kubectl");
    fs::write(&path, FAKE_KUBECTL).context("write fake kubectl")?;
    let mut perms = fs::metadata(&path)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).context("chmod fake kubectl")?;
    Ok(path)
}

fn client() -> Result<Kubectl> {
    let program = install_fake_kubectl()?;
    Ok(Kubectl::with_program("test-ctx", program.to_string_lossy()))
}

#[tokio::test]
async fn get_decodes_a_present_resource() -> Result<()> {
    let deployment = client()?
        .get_deployment("test-ns", "backend")
        .await?
        .context("deployment exists")?;

    assert_eq!(deployment.metadata.name, "backend");
    assert_eq!(deployment.available_replicas(), Some(2));
    Ok(())
}

#[tokio::test]
async fn not_found_maps_to_none() -> Result<()> {
    let deployment = client()?.get_deployment("test-ns", "missing").await?;
    assert!(deployment.is_none());
    Ok(())
}

#[tokio::test]
async fn other_server_errors_propagate() -> Result<()> {
    let err = client()?
        .get_service("test-ns", "forbidden")
        .await
        .expect_err("Forbidden must not be swallowed as absence");

    match err {
        KubectlError::Command { stderr, .. } => assert!(stderr.contains("Forbidden")),
        other => panic!("unexpected error: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn list_pods_renders_the_label_selector() -> Result<()> {
    let mut labels = BTreeMap::new();
    labels.insert("app".to_string(), "backend".to_string());

    let pods = client()?.list_pods("test-ns", &labels).await?;

    let names: Vec<&str> = pods.iter().map(|pod| pod.metadata.name.as_str()).collect();
    assert_eq!(names, vec!["backend-0", "backend-1"]);
    Ok(())
}

#[tokio::test]
async fn delete_issues_foreground_cascade() -> Result<()> {
    client()?
        .delete(
            "test-ns",
            "deployment",
            "backend",
            std::time::Duration::from_secs(5),
        )
        .await?;
    Ok(())
}

#[tokio::test]
async fn apply_manifest_streams_stdin() -> Result<()> {
    client()?
        .apply_manifest("test-ns", "apiVersion: v1\nkind: ConfigMap\n")
        .await?;
    Ok(())
}

#[tokio::test]
async fn missing_binary_is_a_spawn_error() {
    let client = Kubectl::with_program("test-ctx", "/nonexistent/kubectl-definitely-missing");
    let err = client
        .get_deployment("test-ns", "backend")
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, KubectlError::Spawn { .. }));
}
