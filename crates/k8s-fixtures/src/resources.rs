//! Typed snapshots of cluster resources.
//!
//! These are read-only value objects deserialized from `kubectl ... -o json`
//! output. Only the fields the harness actually inspects are typed:
//! `metadata` carries name/annotations/labels, while `spec` and `status`
//! stay raw JSON with narrow accessors, so that timeout diagnostics can
//! print exactly what the server reported.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

/// Common metadata block shared by every resource kind.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Minimal view shared by all snapshot types, used for diagnostics.
pub trait Resource {
    /// The lowercase kind name `kubectl` understands.
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;

    /// The raw status block, if the server has reported one.
    fn status_json(&self) -> Option<&Value> {
        None
    }

    fn name(&self) -> &str {
        &self.metadata().name
    }
}

/// Snapshot of an apps/v1 Deployment.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Deployment {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: Option<Value>,
    #[serde(default)]
    pub status: Option<Value>,
}

impl Deployment {
    /// The number of available replicas, if the controller has reported
    /// status yet. A deployment that has never been reconciled has no
    /// `availableReplicas` field at all.
    pub fn available_replicas(&self) -> Option<i64> {
        self.status.as_ref()?.get("availableReplicas")?.as_i64()
    }

    /// The `spec.selector.matchLabels` map, empty if unset.
    /// `matchExpressions` selectors are not supported.
    pub fn match_labels(&self) -> BTreeMap<String, String> {
        let Some(labels) = self
            .spec
            .as_ref()
            .and_then(|spec| spec.get("selector"))
            .and_then(|selector| selector.get("matchLabels"))
            .and_then(Value::as_object)
        else {
            return BTreeMap::new();
        };
        labels
            .iter()
            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
            .collect()
    }
}

impl Resource for Deployment {
    const KIND: &'static str = "deployment";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn status_json(&self) -> Option<&Value> {
        self.status.as_ref()
    }
}

/// Snapshot of a core/v1 Service.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Service {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<Value>,
}

impl Resource for Service {
    const KIND: &'static str = "service";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn status_json(&self) -> Option<&Value> {
        self.status.as_ref()
    }
}

/// Snapshot of a core/v1 ServiceAccount.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServiceAccount {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

impl Resource for ServiceAccount {
    const KIND: &'static str = "serviceaccount";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }
}

/// Snapshot of a core/v1 Pod.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<Value>,
}

impl Pod {
    /// The pod lifecycle phase (`Pending`, `Running`, `Succeeded`,
    /// `Failed`, `Unknown`), if reported.
    pub fn phase(&self) -> Option<&str> {
        self.status.as_ref()?.get("phase")?.as_str()
    }
}

impl Resource for Pod {
    const KIND: &'static str = "pod";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn status_json(&self) -> Option<&Value> {
        self.status.as_ref()
    }
}

/// Snapshot of a core/v1 Namespace.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Namespace {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: Option<Value>,
}

impl Resource for Namespace {
    const KIND: &'static str = "namespace";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn status_json(&self) -> Option<&Value> {
        self.status.as_ref()
    }
}

/// List envelope returned by `kubectl get <kind> -o json` without a name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn deployment_reads_available_replicas_and_selector() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": {"name": "backend", "namespace": "test-ns"},
            "spec": {"selector": {"matchLabels": {"app": "backend", "tier": "api"}}},
            "status": {"availableReplicas": 3, "readyReplicas": 3}
        }))
        .unwrap();

        assert_eq!(deployment.name(), "backend");
        assert_eq!(deployment.available_replicas(), Some(3));
        let labels = deployment.match_labels();
        assert_eq!(labels.get("app").map(String::as_str), Some("backend"));
        assert_eq!(labels.get("tier").map(String::as_str), Some("api"));
    }

    #[test]
    fn deployment_without_status_reports_no_replicas() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": {"name": "fresh"}
        }))
        .unwrap();

        assert_eq!(deployment.available_replicas(), None);
        assert!(deployment.match_labels().is_empty());
    }

    #[test]
    fn pod_phase_is_optional() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "worker-0"},
            "status": {"phase": "Running"}
        }))
        .unwrap();
        assert_eq!(pod.phase(), Some("Running"));

        let bare: Pod = serde_json::from_value(json!({"metadata": {"name": "new"}})).unwrap();
        assert_eq!(bare.phase(), None);
    }

    #[test]
    fn pod_list_deserializes_items() {
        let list: PodList = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                {"metadata": {"name": "a"}},
                {"metadata": {"name": "b"}}
            ]
        }))
        .unwrap();
        assert_eq!(list.items.len(), 2);
    }

    #[test]
    fn missing_annotations_default_to_empty() {
        let service: Service =
            serde_json::from_value(json!({"metadata": {"name": "svc"}})).unwrap();
        assert!(service.metadata.annotations.is_empty());
    }
}
