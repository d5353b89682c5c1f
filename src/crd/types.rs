//! Supporting types shared by the CloudStack CRDs

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Host and port of a cluster's API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiEndpoint {
    /// Hostname or IP address
    #[serde(default)]
    pub host: String,
    /// Port, 0 when unset
    #[serde(default)]
    pub port: i32,
}

impl ApiEndpoint {
    /// Port to use for load-balancer rules
    pub fn port_or_default(&self) -> i32 {
        if self.port == 0 {
            crate::DEFAULT_API_SERVER_PORT
        } else {
            self.port
        }
    }
}

/// CloudStack resource addressed by id or name
///
/// The id is authoritative once set; the name is used to resolve it.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceIdentifier {
    /// CloudStack id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// CloudStack name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

/// Reference to a Secret holding CloudStack API credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    /// Secret name
    pub name: String,
    /// Secret namespace
    pub namespace: String,
}

/// Network type as reported by CloudStack
pub const NETWORK_TYPE_ISOLATED: &str = "Isolated";

/// Shared network type
pub const NETWORK_TYPE_SHARED: &str = "Shared";

/// Zone network a failure domain places machines on
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Network {
    /// CloudStack network id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Network name
    #[serde(default)]
    pub name: String,
    /// "Isolated" or "Shared", resolved from CloudStack when empty
    #[serde(default, rename = "type", skip_serializing_if = "String::is_empty")]
    pub type_: String,
    /// Gateway for a newly created isolated network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub gateway: String,
    /// Netmask for a newly created isolated network
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub netmask: String,
}

impl Network {
    /// True if the network is (or will be) an isolated network
    pub fn is_isolated(&self) -> bool {
        self.type_.is_empty() || self.type_.eq_ignore_ascii_case(NETWORK_TYPE_ISOLATED)
    }
}

/// CloudStack zone
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    /// Zone id, resolved from the name when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// Zone name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Network inside the zone
    #[serde(default)]
    pub network: Network,
}

/// Load-balancer settings for the API server
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiServerLoadBalancer {
    /// Create load-balancer rules for the API server
    #[serde(default)]
    pub enabled: bool,
    /// Extra ports forwarded to control-plane machines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_ports: Vec<i32>,
    /// Source CIDRs allowed to reach the load balancer
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_cidrs: Vec<String>,
}

/// Observed public address backing the API server load balancer
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Public IP address
    #[serde(default)]
    pub ip_address: String,
    /// CloudStack id of the public IP address
    #[serde(default)]
    pub ip_address_id: String,
}

/// Address reported for a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address type, e.g. "InternalIP"
    #[serde(rename = "type")]
    pub type_: String,
    /// The address
    pub address: String,
}

/// Data disk attached to a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiskOffering {
    /// CloudStack disk offering id
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    /// CloudStack disk offering name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Size in GB for custom offerings
    #[serde(default)]
    pub custom_size: i64,
    /// Mount path inside the machine; empty means no data disk
    #[serde(default)]
    pub mount_path: String,
    /// Block device name
    #[serde(default)]
    pub device: String,
    /// Filesystem to format the disk with
    #[serde(default)]
    pub filesystem: String,
    /// Filesystem label
    #[serde(default)]
    pub label: String,
}

/// Failure domain entry advertised on a CloudStackCluster status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FailureDomainStatusEntry {
    /// Control-plane machines may be placed here
    #[serde(default)]
    pub control_plane: bool,
}
