//! [`ResourceStore`] backed by the Kubernetes API

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{ResourceStore, FIELD_MANAGER};
use crate::crd::capi::{self, CapiCluster, CapiMachine};
use crate::crd::{
    CloudStackCluster, CloudStackFailureDomain, CloudStackIsolatedNetwork, CloudStackMachine,
    ResourceKind,
};
use crate::{Error, Result, CLUSTER_NAME_LABEL, CONTROL_PLANE_LABEL};

/// Store implementation over a kube client
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a new KubeStore
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_opt<K>(&self, namespace: &str, name: &str) -> Result<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_by_cluster<K>(&self, namespace: &str, cluster_name: &str) -> Result<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + DeserializeOwned
            + Debug,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&format!("{CLUSTER_NAME_LABEL}={cluster_name}"));
        Ok(api.list(&lp).await?.items)
    }

    async fn create_idempotent<K>(&self, obj: &K) -> Result<()>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
            + Clone
            + Serialize
            + DeserializeOwned
            + Debug,
    {
        let namespace = obj.meta().namespace.clone().unwrap_or_default();
        let api: Api<K> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), obj).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                debug!(
                    kind = %K::kind(&()),
                    name = obj.meta().name.as_deref().unwrap_or_default(),
                    "object already exists"
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dynamic_api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &kind.api_resource())
    }
}

/// Map a write failure into the store error taxonomy
fn write_error(kind: ResourceKind, namespace: &str, name: &str, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind.as_str(), name, ae.message),
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind.as_str(), namespace, name),
        other => Error::Kube(other),
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get_cluster(&self, namespace: &str, name: &str) -> Result<Option<CloudStackCluster>> {
        self.get_opt(namespace, name).await
    }

    async fn get_failure_domain(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CloudStackFailureDomain>> {
        self.get_opt(namespace, name).await
    }

    async fn get_isolated_network(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<CloudStackIsolatedNetwork>> {
        self.get_opt(namespace, name).await
    }

    async fn get_machine(&self, namespace: &str, name: &str) -> Result<Option<CloudStackMachine>> {
        self.get_opt(namespace, name).await
    }

    async fn get_capi_cluster(&self, namespace: &str, name: &str) -> Result<Option<CapiCluster>> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            namespace,
            &capi::api_resource("Cluster", "clusters"),
        );
        api.get_opt(name)
            .await?
            .map(capi::from_dynamic)
            .transpose()
    }

    async fn get_capi_machine(&self, namespace: &str, name: &str) -> Result<Option<CapiMachine>> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            namespace,
            &capi::api_resource("Machine", "machines"),
        );
        api.get_opt(name)
            .await?
            .map(capi::from_dynamic)
            .transpose()
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<Secret>> {
        self.get_opt(namespace, name).await
    }

    async fn list_failure_domains(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<CloudStackFailureDomain>> {
        self.list_by_cluster(namespace, cluster_name).await
    }

    async fn list_isolated_networks(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<CloudStackIsolatedNetwork>> {
        self.list_by_cluster(namespace, cluster_name).await
    }

    async fn list_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
    ) -> Result<Vec<CloudStackMachine>> {
        self.list_by_cluster(namespace, cluster_name).await
    }

    async fn list_capi_machines(
        &self,
        namespace: &str,
        cluster_name: &str,
        control_plane_only: bool,
    ) -> Result<Vec<CapiMachine>> {
        let api: Api<DynamicObject> = Api::namespaced_with(
            self.client.clone(),
            namespace,
            &capi::api_resource("Machine", "machines"),
        );
        let mut selector = format!("{CLUSTER_NAME_LABEL}={cluster_name}");
        if control_plane_only {
            selector.push(',');
            selector.push_str(CONTROL_PLANE_LABEL);
        }
        api.list(&ListParams::default().labels(&selector))
            .await?
            .items
            .into_iter()
            .map(capi::from_dynamic)
            .collect()
    }

    async fn create_failure_domain(&self, failure_domain: &CloudStackFailureDomain) -> Result<()> {
        self.create_idempotent(failure_domain).await
    }

    async fn create_isolated_network(&self, network: &CloudStackIsolatedNetwork) -> Result<()> {
        self.create_idempotent(network).await
    }

    async fn delete(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<()> {
        match self
            .dynamic_api(kind, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        self.dynamic_api(kind, namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(|e| write_error(kind, namespace, name, e))
    }

    async fn patch_status(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        patch: &Value,
    ) -> Result<()> {
        self.dynamic_api(kind, namespace)
            .patch_status(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await
            .map(|_| ())
            .map_err(|e| write_error(kind, namespace, name, e))
    }
}
