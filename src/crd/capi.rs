//! Read-only views of the CAPI objects the provider follows
//!
//! CAPI core types are not owned by this provider, so they are fetched as
//! `DynamicObject`s and projected into the few fields reconciliation needs.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::discovery::ApiResource;
use serde::{Deserialize, Serialize};

use crate::Error;

/// API group of CAPI core kinds
pub const CAPI_GROUP: &str = "cluster.x-k8s.io";

/// API version of CAPI core kinds
pub const CAPI_API_VERSION: &str = "cluster.x-k8s.io/v1beta1";

/// Reference from a CAPI object to another object
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    /// API version of the referent
    #[serde(default)]
    pub api_version: String,
    /// Kind of the referent
    #[serde(default)]
    pub kind: String,
    /// Name of the referent
    #[serde(default)]
    pub name: String,
    /// Namespace of the referent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// CAPI Cluster spec subset
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapiClusterSpec {
    /// Reconciliation of the whole cluster is paused
    #[serde(default)]
    pub paused: bool,
    /// Infrastructure cluster, a CloudStackCluster for this provider
    #[serde(default)]
    pub infrastructure_ref: Option<ObjectRef>,
}

/// CAPI Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CapiCluster {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Spec subset
    #[serde(default)]
    pub spec: CapiClusterSpec,
}

/// CAPI Machine bootstrap section
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Bootstrap {
    /// Secret holding the rendered bootstrap data, set once it is ready
    #[serde(default)]
    pub data_secret_name: Option<String>,
}

/// CAPI Machine spec subset
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CapiMachineSpec {
    /// Owning cluster name
    #[serde(default)]
    pub cluster_name: String,
    /// Bootstrap data reference
    #[serde(default)]
    pub bootstrap: Bootstrap,
    /// Infrastructure machine, a CloudStackMachine for this provider
    #[serde(default)]
    pub infrastructure_ref: ObjectRef,
    /// Failure domain chosen by CAPI
    #[serde(default)]
    pub failure_domain: Option<String>,
}

/// CAPI Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct CapiMachine {
    /// Object metadata
    pub metadata: ObjectMeta,
    /// Spec subset
    #[serde(default)]
    pub spec: CapiMachineSpec,
}

impl CapiMachine {
    /// True if the machine carries the control-plane label
    pub fn is_control_plane(&self) -> bool {
        self.metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(crate::CONTROL_PLANE_LABEL))
    }
}

/// ApiResource for a CAPI core kind
pub fn api_resource(kind: &str, plural: &str) -> ApiResource {
    ApiResource {
        group: CAPI_GROUP.to_string(),
        version: "v1beta1".to_string(),
        api_version: CAPI_API_VERSION.to_string(),
        kind: kind.to_string(),
        plural: plural.to_string(),
    }
}

/// Project a dynamic object into one of the typed views
pub fn from_dynamic<T: serde::de::DeserializeOwned>(obj: DynamicObject) -> Result<T, Error> {
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value).map_err(|e| Error::serialization(e.to_string()))
}
