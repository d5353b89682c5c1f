//! v1beta1 spoke versions

mod cluster;
mod machine;

pub use cluster::{CloudStackCluster, CloudStackClusterSpec, CloudStackClusterStatus};
pub use machine::{CloudStackMachine, CloudStackMachineSpec, CloudStackMachineStatus};

/// API version string of this spoke
pub const API_VERSION: &str = "infrastructure.cluster.x-k8s.io/v1beta1";
