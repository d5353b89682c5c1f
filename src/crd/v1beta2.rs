//! CloudStackCluster v1beta2
//!
//! v1beta2 predates the API server load balancer settings; everything else
//! matches the hub.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{ApiEndpoint, FailureDomainStatusEntry};
use super::v1beta3::CloudStackFailureDomainSpec;

/// Specification for a v1beta2 CloudStackCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta2",
    kind = "CloudStackCluster",
    plural = "cloudstackclusters",
    shortname = "csc",
    status = "CloudStackClusterStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackClusterSpec {
    /// Failure domains machines of this cluster may be placed in
    #[serde(default)]
    pub failure_domains: Vec<CloudStackFailureDomainSpec>,

    /// API server endpoint
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,
}

/// Status for a v1beta2 CloudStackCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackClusterStatus {
    /// Failure domains available to CAPI, keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomainStatusEntry>,

    /// Cluster infrastructure is ready
    #[serde(default)]
    pub ready: bool,

    /// Last invariant violation
    #[serde(default)]
    pub failure_message: Option<String>,
}

/// API version string of this spoke
pub const API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta2";
