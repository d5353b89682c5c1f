//! CloudStackCluster hub version

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::failure_domain::CloudStackFailureDomainSpec;
use crate::crd::types::{ApiEndpoint, ApiServerLoadBalancer, FailureDomainStatusEntry};

/// Specification for a CloudStackCluster
///
/// The cluster owns one CloudStackFailureDomain object per entry in
/// `failure_domains`, and publishes the control-plane endpoint that the
/// isolated network reconciler fills in once a public IP is associated.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta3",
    kind = "CloudStackCluster",
    plural = "cloudstackclusters",
    shortname = "csc",
    status = "CloudStackClusterStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Endpoint","type":"string","jsonPath":".spec.controlPlaneEndpoint.host"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackClusterSpec {
    /// Failure domains machines of this cluster may be placed in
    #[serde(default)]
    pub failure_domains: Vec<CloudStackFailureDomainSpec>,

    /// API server endpoint; host is filled in by the provider when empty
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// API server load balancer settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_load_balancer: Option<ApiServerLoadBalancer>,
}

impl CloudStackClusterSpec {
    /// True unless the load balancer is explicitly disabled
    pub fn load_balancer_enabled(&self) -> bool {
        self.api_server_load_balancer
            .as_ref()
            .map(|lb| lb.enabled)
            .unwrap_or(true)
    }

    /// Ports that need a load-balancer rule, endpoint port first
    ///
    /// Empty when the load balancer is disabled. Duplicates are removed
    /// while keeping the first occurrence.
    pub fn load_balancer_ports(&self) -> Vec<i32> {
        if !self.load_balancer_enabled() {
            return Vec::new();
        }
        let mut ports = vec![self.control_plane_endpoint.port_or_default()];
        if let Some(lb) = &self.api_server_load_balancer {
            for port in &lb.additional_ports {
                if !ports.contains(port) {
                    ports.push(*port);
                }
            }
        }
        ports
    }
}

/// Status for a CloudStackCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackClusterStatus {
    /// Failure domains available to CAPI, keyed by name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub failure_domains: BTreeMap<String, FailureDomainStatusEntry>,

    /// All failure domains are ready and the endpoint is known
    #[serde(default)]
    pub ready: bool,

    /// Last invariant violation, cleared on success
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl CloudStackCluster {
    /// UID of the cluster, used in ownership tags
    pub fn uid(&self) -> &str {
        self.metadata.uid.as_deref().unwrap_or_default()
    }

    /// True if the cluster status reports ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}
