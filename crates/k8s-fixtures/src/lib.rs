//! Kubernetes fixture layer for the cluster test harness.
//!
//! This crate brings up and observes test fixtures on a cluster and opens
//! ad-hoc tunnels into running workloads. It drives the cluster through the
//! `kubectl` binary so every operation can be replayed by hand, and it
//! leans on the `convergence` crate for all "wait until the control plane
//! catches up" logic.
//!
//! # Components
//!
//! - `resources` - typed snapshots of observed cluster state
//! - `predicates` - pure convergence conditions over those snapshots
//! - `kubectl` - the subprocess-backed cluster client and its trait seam
//! - `forward` - `kubectl port-forward` tunnel lifecycle management
//! - `namespace` - namespace-scoped orchestration of all of the above
//! - `diag` - last-observed-state rendering for timeout reports

pub mod diag;
pub mod forward;
pub mod kubectl;
pub mod namespace;
pub mod predicates;
pub mod resources;

pub use forward::{PortForwarder, TunnelError, TunnelSpec, TunnelState};
pub use kubectl::{ClusterClient, Kubectl, KubectlError};
pub use namespace::{FixtureError, NamespaceFixture, NEG_STATUS_ANNOTATION};
pub use resources::{Deployment, Namespace, Pod, Resource, Service, ServiceAccount};
