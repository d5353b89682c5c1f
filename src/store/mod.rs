//! Resource store seam
//!
//! [`ResourceStore`] is everything the reconcilers read from and write to
//! the Kubernetes API. Writes are merge patches; when a patch carries
//! `metadata.resourceVersion` the API server rejects it if the object
//! changed since it was read, which surfaces as [`crate::Error::Conflict`].

mod kube;

pub use self::kube::KubeStore;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
#[cfg(test)]
use mockall::automock;
use serde_json::{json, Value};

use crate::crd::capi::{CapiCluster, CapiMachine};
use crate::crd::{
    CloudStackCluster, CloudStackFailureDomain, CloudStackIsolatedNetwork, CloudStackMachine,
    ResourceKind,
};
use crate::Result;

/// Field manager recorded on every write
pub const FIELD_MANAGER: &str = "capc-controller";

/// Reads and writes of provider and CAPI objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get a CloudStackCluster
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<CloudStackCluster>>;

    /// Get a CloudStackFailureDomain
    async fn get_failure_domain(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CloudStackFailureDomain>>;

    /// Get a CloudStackIsolatedNetwork
    async fn get_isolated_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CloudStackIsolatedNetwork>>;

    /// Get a CloudStackMachine
    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<CloudStackMachine>>;

    /// Get a CAPI Cluster
    async fn get_capi_cluster(&self, namespace: &str, name: &str) -> Result<Option<CapiCluster>>;

    /// Get a CAPI Machine
    async fn get_capi_machine(&self, namespace: &str, name: &str) -> Result<Option<CapiMachine>>;

    /// Get a Secret
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>>;

    /// Failure domains labeled with a cluster name
    async fn list_failure_domains(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<CloudStackFailureDomain>>;

    /// Isolated networks labeled with a cluster name
    async fn list_isolated_networks(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<CloudStackIsolatedNetwork>>;

    /// CloudStack machines labeled with a cluster name
    async fn list_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<CloudStackMachine>>;

    /// CAPI machines labeled with a cluster name, optionally control plane only
    async fn list_capi_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
        control_plane_only: bool,
    ) -> Result<Vec<CapiMachine>>;

    /// Create a failure domain; an existing object is success
    async fn create_failure_domain(&self, failure_domain: &CloudStackFailureDomain) -> Result<()>;

    /// Create an isolated network; an existing object is success
    async fn create_isolated_network(&self, network: &CloudStackIsolatedNetwork) -> Result<()>;

    /// Delete an object; a missing object is success
    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()>;

    /// Merge-patch an object's metadata and spec
    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()>;

    /// Merge-patch an object's status subresource
    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()>;
}

/// Add `metadata.resourceVersion` to a merge patch
///
/// Without a version the patch is unconditional.
pub fn with_resource_version(mut patch: Value, metadata: &ObjectMeta) -> Value {
    if let (Some(rv), Some(obj)) = (metadata.resource_version.as_deref(), patch.as_object_mut()) {
        let meta = obj.entry("metadata").or_insert_with(|| json!({}));
        if let Some(meta) = meta.as_object_mut() {
            meta.insert("resourceVersion".to_string(), json!(rv));
        }
    }
    patch
}

/// Merge patch replacing the finalizer list, guarded by resourceVersion
pub fn finalizers_patch(metadata: &ObjectMeta, finalizers: &[String]) -> Value {
    with_resource_version(json!({ "metadata": { "finalizers": finalizers } }), metadata)
}

/// Label set tying an owned object to its cluster
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(crate::CLUSTER_NAME_LABEL.to_string(), cluster_name.to_string())])
}
