//! CloudStack client seam and idempotent resource lifecycle operations
//!
//! [`CloudClient`] is the narrow set of CloudStack API calls the provider
//! makes; the transport behind it is supplied by the embedder through a
//! [`CloudSessionFactory`]. [`LifecycleManager`] builds the idempotent
//! operations the reconcilers use on top of it. Every operation detects
//! work already done by looking it up in CloudStack, never by local state,
//! so it is safe to repeat after a crash or a partial failure.

mod network;
mod tags;
mod vm;

pub use tags::{cluster_tag_key, CLUSTER_TAG_PREFIX, CREATED_BY_TAG};
pub use vm::VmPlacement;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
#[cfg(test)]
use mockall::automock;

use crate::crd::{DiskOffering, ResourceIdentifier};
use crate::{Error, Result};

/// Offering used for isolated networks created by the provider
pub const ISOLATED_NETWORK_OFFERING: &str = "DefaultIsolatedNetworkOfferingWithSourceNatService";

/// CloudStack resource types that carry tags
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceType {
    /// Guest network
    Network,
    /// Public IP address
    PublicIpAddress,
    /// Virtual machine
    UserVm,
}

impl ResourceType {
    /// Name used by the CloudStack tag API
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "Network",
            Self::PublicIpAddress => "PublicIpAddress",
            Self::UserVm => "UserVm",
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a CloudStack object: id once created, name for lookup
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalResourceRef {
    /// CloudStack id
    pub id: String,
    /// CloudStack name
    pub name: String,
}

/// Zone as returned by listZones
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudZone {
    /// Zone id
    pub id: String,
    /// Zone name
    pub name: String,
}

/// Guest network as returned by listNetworks
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CloudNetwork {
    /// Network id
    pub id: String,
    /// Network name
    pub name: String,
    /// "Isolated" or "Shared"
    pub type_: String,
}

/// Public IP address as returned by listPublicIpAddresses
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublicIpAddress {
    /// Address id
    pub id: String,
    /// The address
    pub address: String,
    /// Network the address is associated with
    pub network_id: Option<String>,
    /// Source NAT address of its network
    pub is_source_nat: bool,
}

/// Filter for listPublicIpAddresses
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IpAddressQuery {
    /// Zone to search
    pub zone_id: String,
    /// Exact address
    pub address: Option<String>,
    /// Only addresses associated with this network
    pub network_id: Option<String>,
}

/// Request for associateIpAddress
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AssociateIpRequest {
    /// Network to associate with
    pub network_id: String,
    /// Specific address to associate, any free address when `None`
    pub address: Option<String>,
}

/// Request for createNetwork
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateNetworkRequest {
    /// Network name
    pub name: String,
    /// Zone id
    pub zone_id: String,
    /// Network offering name
    pub offering: String,
    /// Optional gateway
    pub gateway: Option<String>,
    /// Optional netmask
    pub netmask: Option<String>,
    /// Owning account
    pub account: Option<String>,
    /// Domain of the owning account
    pub domain: Option<String>,
}

/// Load-balancer rule as returned by listLoadBalancerRules
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoadBalancerRule {
    /// Rule id
    pub id: String,
    /// Rule name
    pub name: String,
    /// Public IP the rule listens on
    pub public_ip_id: String,
    /// Public port
    pub public_port: i32,
    /// Private port on member VMs
    pub private_port: i32,
}

/// Request for createLoadBalancerRule
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CreateLoadBalancerRuleRequest {
    /// Rule name
    pub name: String,
    /// Public IP id
    pub public_ip_id: String,
    /// Network the member VMs live in
    pub network_id: String,
    /// Public port
    pub public_port: i32,
    /// Private port
    pub private_port: i32,
    /// Allowed source CIDRs, all when empty
    pub cidrs: Vec<String>,
}

/// Virtual machine as returned by listVirtualMachines
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VirtualMachine {
    /// VM id
    pub id: String,
    /// VM name
    pub name: String,
    /// VM state, e.g. "Running"
    pub state: String,
    /// NIC addresses
    pub addresses: Vec<String>,
}

/// Request for deployVirtualMachine
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeployVmRequest {
    /// VM name
    pub name: String,
    /// Zone id
    pub zone_id: String,
    /// Network id
    pub network_id: String,
    /// Service offering id
    pub service_offering_id: String,
    /// Template id
    pub template_id: String,
    /// Data disk offering id
    pub disk_offering_id: Option<String>,
    /// Data disk size in GB for custom offerings
    pub disk_size: Option<i64>,
    /// SSH key pair name
    pub ssh_key: Option<String>,
    /// Affinity groups to join
    pub affinity_group_ids: Vec<String>,
    /// Base64 user data
    pub user_data: String,
    /// Extra VM details
    pub details: BTreeMap<String, String>,
    /// Owning account
    pub account: Option<String>,
    /// Domain of the owning account
    pub domain: Option<String>,
}

/// CloudStack API calls used by the provider
///
/// Implementations report provider failures as [`Error::Cloud`] so that
/// not-found and already-exists responses are classified.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Find a zone by id, or by name when the id is empty
    async fn find_zone(&self, id: &str, name: &str) -> Result<Option<CloudZone>>;

    /// Find a network by id
    async fn find_network_by_id(&self, id: &str) -> Result<Option<CloudNetwork>>;

    /// Find a network by name within a zone
    async fn find_network_by_name(&self, zone_id: &str, name: &str)
        -> Result<Option<CloudNetwork>>;

    /// Create a network
    async fn create_network(&self, request: &CreateNetworkRequest) -> Result<CloudNetwork>;

    /// Delete a network
    async fn delete_network(&self, id: &str) -> Result<()>;

    /// List public IP addresses
    async fn list_public_ip_addresses(&self, query: &IpAddressQuery)
        -> Result<Vec<PublicIpAddress>>;

    /// Associate a public IP address with a network
    async fn associate_ip_address(&self, request: &AssociateIpRequest) -> Result<PublicIpAddress>;

    /// Release a public IP address
    async fn disassociate_ip_address(&self, id: &str) -> Result<()>;

    /// List load-balancer rules of a network
    async fn list_load_balancer_rules(&self, network_id: &str) -> Result<Vec<LoadBalancerRule>>;

    /// Create a load-balancer rule
    async fn create_load_balancer_rule(
        &self,
        request: &CreateLoadBalancerRuleRequest,
    ) -> Result<LoadBalancerRule>;

    /// Delete a load-balancer rule
    async fn delete_load_balancer_rule(&self, id: &str) -> Result<()>;

    /// Ids of the VMs assigned to a load-balancer rule
    async fn list_load_balancer_rule_instances(&self, rule_id: &str) -> Result<Vec<String>>;

    /// Add a VM to a load-balancer rule
    async fn assign_to_load_balancer_rule(&self, rule_id: &str, vm_id: &str) -> Result<()>;

    /// Remove a VM from a load-balancer rule
    async fn remove_from_load_balancer_rule(&self, rule_id: &str, vm_id: &str) -> Result<()>;

    /// Tags on a resource
    async fn list_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<BTreeMap<String, String>>;

    /// Add tags to a resource
    async fn create_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Remove tags from a resource
    async fn delete_tags(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<()>;

    /// Find a VM by id
    async fn find_vm_by_id(&self, id: &str) -> Result<Option<VirtualMachine>>;

    /// Find a VM by name
    async fn find_vm_by_name(&self, name: &str) -> Result<Option<VirtualMachine>>;

    /// Deploy a VM
    async fn deploy_vm(&self, request: &DeployVmRequest) -> Result<VirtualMachine>;

    /// Destroy a VM
    async fn destroy_vm(&self, id: &str, expunge: bool) -> Result<()>;

    /// Resolve a service offering to its id
    async fn resolve_service_offering(
        &self,
        offering: &ResourceIdentifier,
        zone_id: &str,
    ) -> Result<String>;

    /// Resolve a template to its id
    async fn resolve_template(&self, template: &ResourceIdentifier, zone_id: &str)
        -> Result<String>;

    /// Resolve a disk offering to its id
    async fn resolve_disk_offering(&self, disk: &DiskOffering, zone_id: &str) -> Result<String>;
}

/// Credentials read from a failure domain's `acsEndpoint` secret
#[derive(Clone, PartialEq, Eq)]
pub struct CloudCredentials {
    /// CloudStack API URL
    pub api_url: String,
    /// API key
    pub api_key: String,
    /// Secret key
    pub secret_key: String,
    /// Verify the API server certificate
    pub verify_ssl: bool,
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("api_url", &self.api_url)
            .field("verify_ssl", &self.verify_ssl)
            .finish_non_exhaustive()
    }
}

impl CloudCredentials {
    /// Read credentials from a Secret
    ///
    /// `api-url`, `api-key` and `secret-key` are required. `verify-ssl`
    /// defaults to true.
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let name = secret.metadata.name.as_deref().unwrap_or_default();
        let value = |key: &str| -> Option<String> {
            if let Some(v) = secret.string_data.as_ref().and_then(|d| d.get(key)) {
                return Some(v.clone());
            }
            secret
                .data
                .as_ref()
                .and_then(|d| d.get(key))
                .map(|b| String::from_utf8_lossy(&b.0).trim().to_string())
        };
        let required = |key: &str| {
            value(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| Error::invariant(format!("secret {name} is missing key {key}")))
        };

        Ok(Self {
            api_url: required("api-url")?,
            api_key: required("api-key")?,
            secret_key: required("secret-key")?,
            verify_ssl: value("verify-ssl")
                .map(|v| !v.eq_ignore_ascii_case("false"))
                .unwrap_or(true),
        })
    }
}

/// Opens CloudStack sessions for a set of credentials
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudSessionFactory: Send + Sync {
    /// Open a session scoped to the given credentials
    async fn connect(&self, credentials: &CloudCredentials) -> Result<Arc<dyn CloudClient>>;
}

/// Idempotent lifecycle operations on CloudStack resources
///
/// All operations may be called repeatedly; they look up what already
/// exists before acting.
#[derive(Clone)]
pub struct LifecycleManager {
    cloud: Arc<dyn CloudClient>,
}

impl LifecycleManager {
    /// Create a manager over a CloudStack session
    pub fn new(cloud: Arc<dyn CloudClient>) -> Self {
        Self { cloud }
    }

    /// The underlying session
    pub fn client(&self) -> &dyn CloudClient {
        self.cloud.as_ref()
    }
}

/// Map a not-found result to `Ok(None)`
pub(crate) fn ignore_not_found<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
