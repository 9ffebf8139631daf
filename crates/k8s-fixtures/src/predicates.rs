//! Pure predicates over observed resource snapshots.
//!
//! Each function is total: missing status blocks, empty annotation maps and
//! absent resources all evaluate to `false` rather than failing. These are
//! meant to be passed as the check argument of [`convergence::wait`].

use crate::resources::{Deployment, Pod, Resource, Service};

/// True iff the resource was not found. Expresses every "wait until
/// deleted" condition.
pub fn is_absent<T>(observed: &Option<T>) -> bool {
    observed.is_none()
}

/// True iff the service exists and carries the given annotation key.
pub fn has_annotation(observed: &Option<Service>, key: &str) -> bool {
    observed
        .as_ref()
        .is_some_and(|service| service.metadata().annotations.contains_key(key))
}

/// True iff the pod exists and its phase has progressed past scheduling,
/// i.e. is neither `Pending` nor `Unknown`.
pub fn pod_started(observed: &Option<Pod>) -> bool {
    observed
        .as_ref()
        .and_then(Pod::phase)
        .is_some_and(|phase| phase != "Pending" && phase != "Unknown")
}

/// True iff the deployment exists and reports at least `count` available
/// replicas. A deployment with no reported count compares as not ready.
pub fn replicas_available(observed: &Option<Deployment>, count: i64) -> bool {
    observed
        .as_ref()
        .and_then(Deployment::available_replicas)
        .is_some_and(|available| available >= count)
}

/// True iff exactly `count` pods were observed. Exact, not "at least":
/// used to confirm a scale up or down landed on the expected size.
pub fn pod_count_equals(observed: &[Pod], count: usize) -> bool {
    observed.len() == count
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment_with_available(available: Option<i64>) -> Deployment {
        let status = match available {
            Some(n) => json!({"availableReplicas": n}),
            None => json!({}),
        };
        serde_json::from_value(json!({
            "metadata": {"name": "depl"},
            "status": status
        }))
        .unwrap()
    }

    fn pod_with_phase(phase: &str) -> Pod {
        serde_json::from_value(json!({
            "metadata": {"name": "pod"},
            "status": {"phase": phase}
        }))
        .unwrap()
    }

    #[test]
    fn is_absent_only_for_none() {
        assert!(is_absent::<Service>(&None));
        assert!(!is_absent(&Some(Service::default())));
    }

    #[test]
    fn replicas_available_thresholds() {
        assert!(!replicas_available(&None, 3));
        assert!(!replicas_available(&Some(deployment_with_available(None)), 3));
        assert!(!replicas_available(&Some(deployment_with_available(Some(2))), 3));
        assert!(replicas_available(&Some(deployment_with_available(Some(3))), 3));
        assert!(replicas_available(&Some(deployment_with_available(Some(4))), 3));
    }

    #[test]
    fn pod_started_excludes_pending_and_unknown() {
        assert!(!pod_started(&None));
        assert!(!pod_started(&Some(Pod::default())));
        assert!(!pod_started(&Some(pod_with_phase("Pending"))));
        assert!(!pod_started(&Some(pod_with_phase("Unknown"))));
        assert!(pod_started(&Some(pod_with_phase("Running"))));
        assert!(pod_started(&Some(pod_with_phase("Succeeded"))));
        assert!(pod_started(&Some(pod_with_phase("Failed"))));
    }

    #[test]
    fn has_annotation_requires_presence_and_key() {
        let annotated: Service = serde_json::from_value(json!({
            "metadata": {
                "name": "svc",
                "annotations": {"cloud.google.com/neg-status": "{}"}
            }
        }))
        .unwrap();

        assert!(!has_annotation(&None, "cloud.google.com/neg-status"));
        // Present but empty annotation map is false, not an error.
        assert!(!has_annotation(
            &Some(Service::default()),
            "cloud.google.com/neg-status"
        ));
        assert!(has_annotation(&Some(annotated), "cloud.google.com/neg-status"));
    }

    #[test]
    fn pod_count_is_exact() {
        let pods = vec![Pod::default(), Pod::default()];
        assert!(pod_count_equals(&pods, 2));
        assert!(!pod_count_equals(&pods, 1));
        assert!(!pod_count_equals(&pods, 3));
        assert!(pod_count_equals(&[], 0));
    }
}
