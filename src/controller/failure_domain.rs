//! CloudStackFailureDomain reconciliation
//!
//! Resolves the zone and network ids a failure domain refers to. Shared
//! networks are used as they are; isolated networks are handed to an owned
//! CloudStackIsolatedNetwork object and their id is adopted once it is ready.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};
use serde_json::json;
use tracing::{debug, info};

use super::engine::{Outcome, Reconcilable, Scope};
use crate::crd::{
    default_isolated_network_name, CloudStackFailureDomain, CloudStackIsolatedNetwork,
    CloudStackIsolatedNetworkSpec, ResourceKind,
};
use crate::store::{cluster_labels, ResourceStore};
use crate::Result;

/// Finalizer held on CloudStackFailureDomains
pub const FAILURE_DOMAIN_FINALIZER: &str =
    "cloudstackfailuredomain.infrastructure.cluster.x-k8s.io";

/// Object name for the isolated network of a CloudStack network name
pub(super) fn isolated_network_object_name(network_name: &str) -> String {
    network_name.to_ascii_lowercase().replace(['_', ' '], "-")
}

#[async_trait]
impl Reconcilable for CloudStackFailureDomain {
    const KIND: ResourceKind = ResourceKind::FailureDomain;
    const FINALIZER: &'static str = FAILURE_DOMAIN_FINALIZER;

    async fn load(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Self>> {
        store.get_failure_domain(namespace, name).await
    }

    fn failure_domain_name(&self) -> Option<&str> {
        Some(&self.spec.name)
    }

    async fn reconcile_normal(&self, scope: &Scope<'_>) -> Result<Outcome> {
        let lifecycle = scope.lifecycle()?;
        let mut zone = lifecycle.resolve_zone(&self.spec.zone).await?;

        let mut ready = true;
        let mut waiting_on = None;
        if zone.network.is_isolated() {
            if zone.network.name.is_empty() {
                zone.network.name = default_isolated_network_name(&scope.cluster_name());
            }
            let object_name = isolated_network_object_name(&zone.network.name);
            let namespace = scope.namespace();

            match scope
                .store
                .get_isolated_network(&namespace, &object_name)
                .await?
            {
                Some(network) if network.is_ready() && !network.spec.id.is_empty() => {
                    zone.network.id = network.spec.id.clone();
                }
                Some(_) => {
                    ready = false;
                    waiting_on = Some(object_name);
                }
                None => {
                    let mut network = CloudStackIsolatedNetwork::new(
                        &object_name,
                        CloudStackIsolatedNetworkSpec {
                            name: zone.network.name.clone(),
                            id: zone.network.id.clone(),
                            failure_domain_name: self.spec.name.clone(),
                            control_plane_endpoint: scope
                                .cluster
                                .spec
                                .control_plane_endpoint
                                .clone(),
                            gateway: zone.network.gateway.clone(),
                            netmask: zone.network.netmask.clone(),
                        },
                    );
                    network.metadata = ObjectMeta {
                        name: network.metadata.name.take(),
                        namespace: Some(namespace.clone()),
                        labels: Some(cluster_labels(&scope.cluster_name())),
                        owner_references: self.controller_owner_ref(&()).map(|r| vec![r]),
                        ..Default::default()
                    };
                    scope.store.create_isolated_network(&network).await?;
                    info!(network = %object_name, "created isolated network object");
                    ready = false;
                    waiting_on = Some(object_name);
                }
            }
        }

        if zone != self.spec.zone {
            debug!(zone = %zone.name, network = %zone.network.name, "recording resolved zone");
            scope.patch(
                ResourceKind::FailureDomain,
                &self.metadata,
                json!({ "spec": { "zone": zone } }),
            );
        }
        scope.patch_status(
            ResourceKind::FailureDomain,
            &self.metadata,
            json!({ "status": { "ready": ready, "failureMessage": null } }),
        );

        match waiting_on {
            None => Ok(Outcome::Done),
            Some(network) => Ok(Outcome::NotReady(format!(
                "Waiting for isolated network {network}."
            ))),
        }
    }

    async fn reconcile_delete(&self, scope: &Scope<'_>) -> Result<Outcome> {
        let namespace = scope.namespace();
        let cluster_name = scope.cluster_name();

        let machines = scope
            .store
            .list_machines(&namespace, &cluster_name)
            .await?
            .into_iter()
            .filter(|m| m.spec.failure_domain_name == self.spec.name)
            .count();
        if machines > 0 {
            return Ok(Outcome::NotReady(format!(
                "Waiting for {machines} machine(s) in failure domain {} to be deleted.",
                self.spec.name
            )));
        }

        let networks: Vec<_> = scope
            .store
            .list_isolated_networks(&namespace, &cluster_name)
            .await?
            .into_iter()
            .filter(|n| n.spec.failure_domain_name == self.spec.name)
            .collect();
        if networks.is_empty() {
            info!(failure_domain = %self.spec.name, "failure domain resources released");
            return Ok(Outcome::Done);
        }
        for network in networks
            .iter()
            .filter(|n| n.metadata.deletion_timestamp.is_none())
        {
            scope
                .store
                .delete(ResourceKind::IsolatedNetwork, &namespace, &network.name_any())
                .await?;
        }
        Ok(Outcome::NotReady(format!(
            "Waiting for {} isolated network(s) to be deleted.",
            networks.len()
        )))
    }
}
