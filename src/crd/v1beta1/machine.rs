//! CloudStackMachine v1beta1
//!
//! v1beta1 machines carry their zone directly instead of a failure domain
//! name, and have no uncompressed user data switch or detailed status.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::types::{DiskOffering, MachineAddress, ResourceIdentifier};

/// Specification for a v1beta1 CloudStackMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta1",
    kind = "CloudStackMachine",
    plural = "cloudstackmachines",
    shortname = "csm",
    status = "CloudStackMachineStatus",
    derive = "PartialEq",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackMachineSpec {
    /// CloudStack VM id
    #[serde(default, rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// CAPI provider id
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,

    /// Service offering
    #[serde(default)]
    pub offering: ResourceIdentifier,

    /// Template to boot from
    #[serde(default)]
    pub template: ResourceIdentifier,

    /// Optional data disk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_offering: Option<DiskOffering>,

    /// SSH key pair name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,

    /// Extra VM details
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,

    /// Affinity type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,

    /// Existing affinity groups to join
    #[serde(default, rename = "affinityGroupIDs", skip_serializing_if = "Vec::is_empty")]
    pub affinity_group_ids: Vec<String>,

    /// Zone id
    #[serde(default, rename = "zoneID", skip_serializing_if = "String::is_empty")]
    pub zone_id: String,

    /// Zone name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub zone_name: String,
}

/// Status for a v1beta1 CloudStackMachine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackMachineStatus {
    /// VM is running
    #[serde(default)]
    pub ready: bool,

    /// VM state reported by CloudStack
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_state: Option<String>,

    /// Addresses reported by CloudStack
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Last invariant violation
    #[serde(default)]
    pub failure_message: Option<String>,
}
