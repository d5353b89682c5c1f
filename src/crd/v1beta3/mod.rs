//! Hub version of every CloudStack kind
//!
//! All conversions route through these types and they are the storage
//! version of each CRD.

mod cluster;
mod failure_domain;
mod isolated_network;
mod machine;

pub use cluster::{CloudStackCluster, CloudStackClusterSpec, CloudStackClusterStatus};
pub use failure_domain::{
    failure_domain_object_name, CloudStackFailureDomain, CloudStackFailureDomainSpec,
    CloudStackFailureDomainStatus,
};
pub use isolated_network::{
    default_isolated_network_name, CloudStackIsolatedNetwork, CloudStackIsolatedNetworkSpec,
    CloudStackIsolatedNetworkStatus,
};
pub use machine::{
    provider_id_for, CloudStackMachine, CloudStackMachineSpec, CloudStackMachineStatus,
};

/// API version string of the hub
pub const API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta3";
