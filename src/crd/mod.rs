//! Custom Resource Definitions for the CloudStack provider
//!
//! `v1beta3` is the hub and storage version. Older versions are served
//! through the conversion webhook.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::core::crd::merge_crds;
use kube::CustomResourceExt;

pub mod capi;
mod types;
pub mod v1beta1;
pub mod v1beta2;
pub mod v1beta3;

pub use types::{
    ApiEndpoint, ApiServerLoadBalancer, DiskOffering, FailureDomainStatusEntry,
    LoadBalancerStatus, MachineAddress, Network, ResourceIdentifier, SecretRef, Zone,
    NETWORK_TYPE_ISOLATED, NETWORK_TYPE_SHARED,
};
pub use v1beta3::{
    default_isolated_network_name, failure_domain_object_name, provider_id_for,
    CloudStackCluster, CloudStackClusterSpec, CloudStackClusterStatus, CloudStackFailureDomain,
    CloudStackFailureDomainSpec, CloudStackFailureDomainStatus, CloudStackIsolatedNetwork,
    CloudStackIsolatedNetworkSpec, CloudStackIsolatedNetworkStatus, CloudStackMachine,
    CloudStackMachineSpec, CloudStackMachineStatus,
};

/// The kinds reconciled by this provider
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// CloudStackCluster
    Cluster,
    /// CloudStackFailureDomain
    FailureDomain,
    /// CloudStackIsolatedNetwork
    IsolatedNetwork,
    /// CloudStackMachine
    Machine,
}

impl ResourceKind {
    /// Every managed kind
    pub const ALL: [ResourceKind; 4] = [
        Self::Cluster,
        Self::FailureDomain,
        Self::IsolatedNetwork,
        Self::Machine,
    ];

    /// Kind name as it appears in `kind:`
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cluster => "CloudStackCluster",
            Self::FailureDomain => "CloudStackFailureDomain",
            Self::IsolatedNetwork => "CloudStackIsolatedNetwork",
            Self::Machine => "CloudStackMachine",
        }
    }

    /// Look up a kind by name
    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == kind)
    }

    /// ApiResource for the hub version of this kind
    pub fn api_resource(&self) -> kube::discovery::ApiResource {
        use kube::discovery::ApiResource;
        match self {
            Self::Cluster => ApiResource::erase::<CloudStackCluster>(&()),
            Self::FailureDomain => ApiResource::erase::<CloudStackFailureDomain>(&()),
            Self::IsolatedNetwork => ApiResource::erase::<CloudStackIsolatedNetwork>(&()),
            Self::Machine => ApiResource::erase::<CloudStackMachine>(&()),
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every CRD served by the provider with all of its versions merged
///
/// Storage is always the hub version.
pub fn all_crds() -> Result<Vec<CustomResourceDefinition>, crate::Error> {
    let merge = |crds: Vec<CustomResourceDefinition>| {
        merge_crds(crds, "v1beta3").map_err(|e| crate::Error::validation(e.to_string()))
    };
    Ok(vec![
        merge(vec![
            v1beta1::CloudStackCluster::crd(),
            v1beta2::CloudStackCluster::crd(),
            v1beta3::CloudStackCluster::crd(),
        ])?,
        CloudStackFailureDomain::crd(),
        CloudStackIsolatedNetwork::crd(),
        merge(vec![
            v1beta1::CloudStackMachine::crd(),
            v1beta3::CloudStackMachine::crd(),
        ])?,
    ])
}
