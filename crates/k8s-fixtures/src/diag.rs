//! Rendering of last-observed resource state for timeout diagnostics.
//!
//! A failed wait must report what was last seen, not just that time ran
//! out; these helpers turn a snapshot (or its absence) into something a
//! human can act on in test logs.

use crate::resources::Resource;

/// Render a possibly-absent snapshot as its name plus pretty-printed
/// status JSON. Absence renders as `No data`.
pub fn pretty_status<R: Resource>(observed: Option<&R>) -> String {
    let Some(resource) = observed else {
        return "No data".to_string();
    };
    let status = match resource.status_json() {
        Some(status) => serde_json::to_string_pretty(status)
            .unwrap_or_else(|err| format!("can't render resource status: {err}")),
        None => "no status reported".to_string(),
    };
    format!("{}:\n{}", resource.name(), status)
}

/// Render a collection of snapshots, one [`pretty_status`] block each.
pub fn pretty_statuses<R: Resource>(observed: &[R]) -> String {
    observed
        .iter()
        .map(|resource| pretty_status(Some(resource)))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::resources::{Pod, ServiceAccount};
    use serde_json::json;

    #[test]
    fn absent_renders_as_no_data() {
        assert_eq!(pretty_status::<Pod>(None), "No data");
    }

    #[test]
    fn present_renders_name_and_status() {
        let pod: Pod = serde_json::from_value(json!({
            "metadata": {"name": "worker-0"},
            "status": {"phase": "Pending"}
        }))
        .unwrap();

        let rendered = pretty_status(Some(&pod));
        assert!(rendered.starts_with("worker-0:\n"));
        assert!(rendered.contains("\"phase\": \"Pending\""));
    }

    #[test]
    fn statusless_resource_still_renders_name() {
        let account: ServiceAccount =
            serde_json::from_value(json!({"metadata": {"name": "default"}})).unwrap();
        assert_eq!(
            pretty_status(Some(&account)),
            "default:\nno status reported"
        );
    }

    #[test]
    fn collections_render_one_block_per_item() {
        let pods: Vec<Pod> = vec![
            serde_json::from_value(json!({"metadata": {"name": "a"}})).unwrap(),
            serde_json::from_value(json!({"metadata": {"name": "b"}})).unwrap(),
        ];
        let rendered = pretty_statuses(&pods);
        assert!(rendered.contains("a:\n"));
        assert!(rendered.contains("b:\n"));
    }
}
