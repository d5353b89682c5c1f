//! CloudStackIsolatedNetwork

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::types::{ApiEndpoint, LoadBalancerStatus};

/// Specification for a CloudStackIsolatedNetwork
///
/// `id` is empty until the network is confirmed to exist in CloudStack;
/// once set it never changes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta3",
    kind = "CloudStackIsolatedNetwork",
    plural = "cloudstackisolatednetworks",
    shortname = "csin",
    status = "CloudStackIsolatedNetworkStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Network","type":"string","jsonPath":".spec.name"}"#,
    printcolumn = r#"{"name":"PublicIP","type":"string","jsonPath":".status.publicIPAddress"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackIsolatedNetworkSpec {
    /// CloudStack network name
    pub name: String,

    /// CloudStack network id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// Failure domain the network lives in
    pub failure_domain_name: String,

    /// API server endpoint served from this network's public IP
    #[serde(default)]
    pub control_plane_endpoint: ApiEndpoint,

    /// Gateway used when creating the network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,

    /// Netmask used when creating the network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub netmask: String,
}

/// Status for a CloudStackIsolatedNetwork
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackIsolatedNetworkStatus {
    /// CloudStack id of the associated public IP
    #[serde(default, rename = "publicIPID", skip_serializing_if = "String::is_empty")]
    pub public_ip_id: String,

    /// Associated public IP address
    #[serde(default, rename = "publicIPAddress", skip_serializing_if = "String::is_empty")]
    pub public_ip_address: String,

    /// Address fronting the API server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_server_load_balancer: Option<LoadBalancerStatus>,

    /// Network, address and load-balancer rules are in place
    #[serde(default)]
    pub ready: bool,

    /// Last invariant violation, cleared on success
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl CloudStackIsolatedNetwork {
    /// True if the network status reports ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}

/// Default CloudStack network name for a cluster without a named network
pub fn default_isolated_network_name(cluster_name: &str) -> String {
    format!("isolated-network-{cluster_name}")
}
