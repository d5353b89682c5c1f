//! CloudStackCluster reconciliation
//!
//! The cluster fans its `spec.failureDomains` out into owned
//! CloudStackFailureDomain objects and reports ready once every one of them
//! is ready and the control-plane endpoint is known.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::engine::{Outcome, Reconcilable, Scope};
use crate::crd::{
    failure_domain_object_name, CloudStackCluster, CloudStackFailureDomain,
    FailureDomainStatusEntry, ResourceKind,
};
use crate::store::{cluster_labels, ResourceStore};
use crate::Result;

/// Finalizer held on CloudStackClusters
pub const CLUSTER_FINALIZER: &str = "cloudstackcluster.infrastructure.cluster.x-k8s.io";

#[async_trait]
impl Reconcilable for CloudStackCluster {
    const KIND: ResourceKind = ResourceKind::Cluster;
    const FINALIZER: &'static str = CLUSTER_FINALIZER;

    async fn load(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Self>> {
        store.get_cluster(namespace, name).await
    }

    fn as_cluster(&self) -> Option<&CloudStackCluster> {
        Some(self)
    }

    fn failure_domain_name(&self) -> Option<&str> {
        None
    }

    async fn reconcile_normal(&self, scope: &Scope<'_>) -> Result<Outcome> {
        let namespace = scope.namespace();
        let cluster_name = scope.cluster_name();
        let existing = scope
            .store
            .list_failure_domains(&namespace, &cluster_name)
            .await?;

        let mut all_ready = true;
        let mut advertised = BTreeMap::new();
        for spec in &self.spec.failure_domains {
            advertised.insert(
                spec.name.clone(),
                FailureDomainStatusEntry {
                    control_plane: true,
                },
            );

            match existing.iter().find(|fd| fd.spec.name == spec.name) {
                Some(fd) => {
                    if fd.spec != *spec {
                        debug!(failure_domain = %spec.name, "updating failure domain spec");
                        scope.patch(
                            ResourceKind::FailureDomain,
                            &fd.metadata,
                            json!({ "spec": spec }),
                        );
                    }
                    all_ready &= fd.is_ready();
                }
                None => {
                    let mut fd = CloudStackFailureDomain::new(
                        &failure_domain_object_name(&self.name_any(), &spec.name),
                        spec.clone(),
                    );
                    fd.metadata = ObjectMeta {
                        name: fd.metadata.name.take(),
                        namespace: Some(namespace.clone()),
                        labels: Some(cluster_labels(&cluster_name)),
                        owner_references: self.controller_owner_ref(&()).map(|r| vec![r]),
                        ..Default::default()
                    };
                    scope.store.create_failure_domain(&fd).await?;
                    info!(failure_domain = %spec.name, "created failure domain");
                    all_ready = false;
                }
            }
        }

        for stale in existing
            .iter()
            .filter(|fd| !self.spec.failure_domains.iter().any(|s| s.name == fd.spec.name))
        {
            info!(failure_domain = %stale.spec.name, "deleting failure domain no longer listed");
            scope
                .store
                .delete(ResourceKind::FailureDomain, &namespace, &stale.name_any())
                .await?;
        }

        let endpoint_known = !self.spec.control_plane_endpoint.host.is_empty();
        let ready = all_ready && endpoint_known;
        scope.patch_status(
            ResourceKind::Cluster,
            &self.metadata,
            json!({
                "status": {
                    "failureDomains": advertised,
                    "ready": ready,
                    "failureMessage": null,
                }
            }),
        );

        if ready {
            Ok(Outcome::Done)
        } else if !endpoint_known {
            Ok(Outcome::NotReady(
                "Waiting for the control plane endpoint.".to_string(),
            ))
        } else {
            Ok(Outcome::NotReady(
                "Waiting for failure domains to become ready.".to_string(),
            ))
        }
    }

    async fn reconcile_delete(&self, scope: &Scope<'_>) -> Result<Outcome> {
        let namespace = scope.namespace();
        let remaining = scope
            .store
            .list_failure_domains(&namespace, &scope.cluster_name())
            .await?;
        if remaining.is_empty() {
            info!("all failure domains deleted");
            return Ok(Outcome::Done);
        }

        for fd in remaining
            .iter()
            .filter(|fd| fd.metadata.deletion_timestamp.is_none())
        {
            scope
                .store
                .delete(ResourceKind::FailureDomain, &namespace, &fd.name_any())
                .await?;
        }
        Ok(Outcome::NotReady(format!(
            "Waiting for {} failure domain(s) to be deleted.",
            remaining.len()
        )))
    }
}
