//! CAPC - Cluster API infrastructure provider for Apache CloudStack
//!
//! CAPC watches CloudStack infrastructure custom resources and drives the
//! CloudStack API until the cloud matches what the resources declare:
//! isolated networks, public addresses, load-balancer rules, ownership tags
//! and virtual machines.
//!
//! # Architecture
//!
//! Every managed kind is reconciled by the same staged engine:
//! - Load the subject and resolve its owner cluster, failure domain and credentials
//! - Commit a finalizer before the first cloud call
//! - Run the kind-specific create or delete path through the lifecycle manager
//! - Commit status through optimistic patches
//!
//! # Modules
//!
//! - [`crd`] - Custom Resource Definitions for every served version
//! - [`conversion`] - Hub/spoke conversion with the lossy-field stash
//! - [`cloud`] - CloudStack client seam and idempotent lifecycle operations
//! - [`store`] - Resource store seam over the Kubernetes API
//! - [`propagator`] - Maps foreign changes to dependent reconcile requests
//! - [`controller`] - Reconciliation engine and per-kind logic
//! - [`webhook`] - Conversion webhook server
//! - [`config`] - Controller configuration
//! - [`error`] - Error types for the provider

#![warn(missing_docs)]

pub mod cloud;
pub mod config;
pub mod controller;
pub mod conversion;
pub mod crd;
pub mod error;
pub mod propagator;
pub mod store;
pub mod webhook;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Well-known keys
// =============================================================================

/// Label carrying the owning CAPI cluster name
pub const CLUSTER_NAME_LABEL: &str = "cluster.x-k8s.io/cluster-name";

/// Label marking control-plane machines (value is empty)
pub const CONTROL_PLANE_LABEL: &str = "cluster.x-k8s.io/control-plane";

/// Label used to shard controllers across instances
pub const WATCH_FILTER_LABEL: &str = "cluster.x-k8s.io/watch-filter";

/// Annotation pausing reconciliation of a single object
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Annotation marking infrastructure managed outside this provider
pub const MANAGED_BY_ANNOTATION: &str = "cluster.x-k8s.io/managed-by";

/// Annotation holding the serialized hub object on spoke versions
pub const CONVERSION_DATA_ANNOTATION: &str = "cluster.x-k8s.io/conversion-data";

/// Default API server port used for load-balancer rules
pub const DEFAULT_API_SERVER_PORT: i32 = 6443;
