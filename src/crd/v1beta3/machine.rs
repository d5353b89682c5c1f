//! CloudStackMachine hub version

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::types::{DiskOffering, MachineAddress, ResourceIdentifier};

/// Specification for a CloudStackMachine
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta3",
    kind = "CloudStackMachine",
    plural = "cloudstackmachines",
    shortname = "csm",
    status = "CloudStackMachineStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"InstanceState","type":"string","jsonPath":".status.instanceState"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"ProviderID","type":"string","jsonPath":".spec.providerID"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackMachineSpec {
    /// CloudStack VM id, set once the VM exists
    #[serde(default, rename = "instanceID", skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// CAPI provider id, `cloudstack:///<instance id>`
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

    /// Extra VM details passed to deployVirtualMachine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub details: BTreeMap<String, String>,

    /// Affinity type ("pro", "anti", "no")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<String>,

    /// Existing affinity groups to join
    #[serde(default, rename = "affinityGroupIDs", skip_serializing_if = "Vec::is_empty")]
    pub affinity_group_ids: Vec<String>,

    /// Failure domain the machine is placed in
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failure_domain_name: String,

    /// Send user data uncompressed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uncompressed_user_data: Option<bool>,
}

/// Status for a CloudStackMachine
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

    /// Coarse machine status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    /// Reason for the current status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Last invariant violation, cleared on success
    #[serde(default)]
    pub failure_message: Option<String>,
}

/// Provider id CAPI uses to match nodes to machines
pub fn provider_id_for(instance_id: &str) -> String {
    format!("cloudstack:///{instance_id}")
}
