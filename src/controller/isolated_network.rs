//! CloudStackIsolatedNetwork reconciliation
//!
//! Owns the CloudStack side of an isolated network: the network itself, the
//! public IP fronting the API server and the load-balancer rules on it.

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use super::engine::{Outcome, Reconcilable, Scope};
use crate::cloud::ResourceType;
use crate::crd::{CloudStackCluster, CloudStackIsolatedNetwork, LoadBalancerStatus, ResourceKind};
use crate::store::ResourceStore;
use crate::{Result, MANAGED_BY_ANNOTATION};

/// Finalizer held on CloudStackIsolatedNetworks
pub const ISOLATED_NETWORK_FINALIZER: &str =
    "cloudstackisolatednetwork.infrastructure.cluster.x-k8s.io";

/// True if something other than this provider manages the cluster's endpoint
fn externally_managed(cluster: &CloudStackCluster) -> bool {
    cluster
        .metadata
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(MANAGED_BY_ANNOTATION))
}

#[async_trait]
impl Reconcilable for CloudStackIsolatedNetwork {
    const KIND: ResourceKind = ResourceKind::IsolatedNetwork;
    const FINALIZER: &'static str = ISOLATED_NETWORK_FINALIZER;

    async fn load(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Self>> {
        store.get_isolated_network(namespace, name).await
    }

    fn failure_domain_name(&self) -> Option<&str> {
        Some(&self.spec.failure_domain_name)
    }

    async fn reconcile_normal(&self, scope: &Scope<'_>) -> Result<Outcome> {
        let fd = scope.failure_domain()?;
        if fd.spec.zone.id.is_empty() {
            return Ok(Outcome::NotReady("Zone ID not resolved yet.".to_string()));
        }
        let lifecycle = scope.lifecycle()?;
        let cluster = &scope.cluster;

        let network = lifecycle
            .get_or_create_isolated_network(&fd.spec, &self.spec)
            .await?;
        lifecycle
            .add_cluster_tag(ResourceType::Network, &network.id, cluster)
            .await?;

        let mut updated = self.clone();
        updated.spec.id = network.id.clone();
        let mut status = self.status.clone().unwrap_or_default();

        if externally_managed(cluster) {
            debug!("cluster endpoint is managed externally, skipping public IP");
        } else {
            let endpoint = &cluster.spec.control_plane_endpoint;
            let ip = lifecycle
                .associate_public_ip_address(&fd.spec, &network.id, cluster, &endpoint.host)
                .await?;
            lifecycle
                .add_cluster_tag(ResourceType::PublicIpAddress, &ip.id, cluster)
                .await?;

            status.public_ip_id = ip.id.clone();
            status.public_ip_address = ip.address.clone();
            status.api_server_load_balancer = Some(LoadBalancerStatus {
                ip_address: ip.address.clone(),
                ip_address_id: ip.id.clone(),
            });
            updated.spec.control_plane_endpoint.host = ip.address.clone();
            updated.spec.control_plane_endpoint.port = endpoint.port_or_default();
            updated.status = Some(status.clone());

            let rules = lifecycle.reconcile_load_balancer(&updated, cluster).await?;
            debug!(rules = rules.len(), "load-balancer rules in place");

            if endpoint.host != ip.address {
                info!(address = %ip.address, "recording control plane endpoint");
                scope.patch(
                    ResourceKind::Cluster,
                    &cluster.metadata,
                    json!({
                        "spec": {
                            "controlPlaneEndpoint": {
                                "host": ip.address,
                                "port": endpoint.port_or_default(),
                            }
                        }
                    }),
                );
            }
        }

        if updated.spec != self.spec {
            scope.patch(
                ResourceKind::IsolatedNetwork,
                &self.metadata,
                json!({ "spec": updated.spec }),
            );
        }
        status.ready = true;
        status.failure_message = None;
        scope.patch_status(
            ResourceKind::IsolatedNetwork,
            &self.metadata,
            json!({ "status": status }),
        );
        Ok(Outcome::Done)
    }

    async fn reconcile_delete(&self, scope: &Scope<'_>) -> Result<Outcome> {
        let public_ip_id = self
            .status
            .as_ref()
            .map(|s| s.public_ip_id.as_str())
            .unwrap_or_default();
        if !scope.has_session() && self.spec.id.is_empty() && public_ip_id.is_empty() {
            debug!("nothing was created in CloudStack");
            return Ok(Outcome::Done);
        }

        match scope
            .lifecycle()?
            .dispose_iso_net_resources(self, &scope.cluster)
            .await
        {
            Ok(()) => Ok(Outcome::Done),
            Err(e) if e.is_not_found() => {
                debug!(error = %e, "network resources already gone");
                Ok(Outcome::Done)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::fixtures::{cloud_network, isolated_network};
    use crate::cloud::{
        LoadBalancerRule, MockCloudClient, MockCloudSessionFactory, PublicIpAddress,
    };
    use crate::controller::engine::reconcile;
    use crate::controller::fixtures::*;
    use crate::crd::{CloudStackFailureDomain, CloudStackIsolatedNetworkStatus};
    use crate::store::MockResourceStore;
    use crate::Error;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::runtime::controller::Action;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn subject() -> CloudStackIsolatedNetwork {
        let mut net = isolated_network("");
        net.metadata.labels = labeled("isolated-network-mycluster").labels;
        net.metadata.resource_version = Some("3".to_string());
        net.metadata.finalizers = Some(vec![ISOLATED_NETWORK_FINALIZER.to_string()]);
        net
    }

    fn store_with(
        net: CloudStackIsolatedNetwork,
        cluster: CloudStackCluster,
        fd: CloudStackFailureDomain,
    ) -> MockResourceStore {
        let mut store = MockResourceStore::new();
        store
            .expect_get_capi_cluster()
            .returning(|_, _| Ok(Some(capi_cluster())));
        store
            .expect_get_cluster()
            .returning(move |_, _| Ok(Some(cluster.clone())));
        store
            .expect_list_failure_domains()
            .returning(move |_, _| Ok(vec![fd.clone()]));
        store
            .expect_get_secret()
            .returning(|_, _| Ok(Some(credentials_secret())));
        store
            .expect_get_isolated_network()
            .returning(move |_, _| Ok(Some(net.clone())));
        store
    }

    fn cluster() -> CloudStackCluster {
        let mut cluster = crate::cloud::fixtures::cluster();
        cluster.metadata.labels = labeled("mycluster").labels;
        cluster.metadata.resource_version = Some("7".to_string());
        cluster
    }

    /// Cloud that already has the network and a free public IP on it
    fn provisioned_cloud() -> MockCloudClient {
        let mut cloud = MockCloudClient::new();
        cloud
            .expect_find_network_by_name()
            .returning(|_, _| Ok(Some(cloud_network("net-1"))));
        cloud
            .expect_list_tags()
            .returning(|_, _| Ok(BTreeMap::new()));
        cloud.expect_create_tags().returning(|_, _, _| Ok(()));
        cloud.expect_list_public_ip_addresses().returning(|_| {
            Ok(vec![PublicIpAddress {
                id: "ip-1".to_string(),
                address: "203.0.113.10".to_string(),
                network_id: Some("net-1".to_string()),
                is_source_nat: false,
            }])
        });
        cloud
            .expect_list_load_balancer_rules()
            .returning(|_| Ok(vec![]));
        cloud.expect_create_load_balancer_rule().returning(|req| {
            Ok(LoadBalancerRule {
                id: "rule-1".to_string(),
                name: req.name.clone(),
                public_ip_id: req.public_ip_id.clone(),
                public_port: req.public_port,
                private_port: req.private_port,
            })
        });
        cloud
    }

    // ==========================================================================
    // Story Tests: Provisioning
    // ==========================================================================

    /// Story: Nothing is asked of CloudStack until the zone id is known
    #[tokio::test]
    async fn story_unresolved_zone_requeues_without_cloud_calls() {
        let mut fd = failure_domain();
        fd.spec.zone.id = String::new();
        let mut store = store_with(subject(), cluster(), fd);
        store.expect_patch().never();
        store.expect_patch_status().never();

        // no expectations: any cloud call fails the test
        let ctx = context(store, sessions(MockCloudClient::new()));
        let action = reconcile(Arc::new(subject()), ctx.clone()).await.unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));

        let request = crate::propagator::ReconcileRequest::new(
            ResourceKind::IsolatedNetwork,
            "default",
            "isolated-network-mycluster",
        );
        assert_eq!(ctx.failures(&request), 0);
    }

    /// Story: The network, public IP and endpoint are recorded together
    #[tokio::test]
    async fn story_network_and_endpoint_are_recorded() {
        let writes = WriteLog::default();
        let mut store = store_with(subject(), cluster(), failure_domain());
        writes.attach(&mut store);

        let ctx = context(store, sessions(provisioned_cloud()));
        let action = reconcile(Arc::new(subject()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let writes = writes.writes();
        let net_spec = writes
            .iter()
            .find(|w| w.kind == ResourceKind::IsolatedNetwork && !w.status)
            .unwrap();
        assert_eq!(net_spec.body["spec"]["id"], "net-1");
        assert_eq!(net_spec.body["spec"]["controlPlaneEndpoint"]["host"], "203.0.113.10");
        assert_eq!(net_spec.body["metadata"]["resourceVersion"], "3");

        let net_status = writes
            .iter()
            .find(|w| w.kind == ResourceKind::IsolatedNetwork && w.status)
            .unwrap();
        assert_eq!(net_status.body["status"]["ready"], true);
        assert_eq!(net_status.body["status"]["publicIPID"], "ip-1");
        assert!(net_status.body["metadata"].get("resourceVersion").is_none());

        let cluster_spec = writes
            .iter()
            .find(|w| w.kind == ResourceKind::Cluster)
            .unwrap();
        assert_eq!(
            cluster_spec.body["spec"]["controlPlaneEndpoint"]["host"],
            "203.0.113.10"
        );
        assert_eq!(cluster_spec.body["spec"]["controlPlaneEndpoint"]["port"], 6443);
        assert_eq!(cluster_spec.body["metadata"]["resourceVersion"], "7");
    }

    /// Story: The network id is not recorded when tagging it failed
    #[tokio::test]
    async fn story_id_is_committed_only_after_tagging() {
        let writes = WriteLog::default();
        let mut store = store_with(subject(), cluster(), failure_domain());
        writes.attach(&mut store);

        let mut cloud = MockCloudClient::new();
        cloud
            .expect_find_network_by_name()
            .returning(|_, _| Ok(Some(cloud_network("net-1"))));
        cloud
            .expect_list_tags()
            .returning(|_, _| Err(Error::cloud("listTags", "permission denied")));

        let ctx = context(store, sessions(cloud));
        assert!(reconcile(Arc::new(subject()), ctx).await.is_err());
        assert!(writes.writes().is_empty());
    }

    /// Story: An externally managed endpoint is left alone
    #[tokio::test]
    async fn story_externally_managed_cluster_skips_public_ip() {
        let mut managed = cluster();
        managed.metadata.annotations =
            Some([(MANAGED_BY_ANNOTATION.to_string(), "external".to_string())].into());

        let writes = WriteLog::default();
        let mut store = store_with(subject(), managed, failure_domain());
        writes.attach(&mut store);

        let mut cloud = MockCloudClient::new();
        cloud
            .expect_find_network_by_name()
            .returning(|_, _| Ok(Some(cloud_network("net-1"))));
        cloud
            .expect_list_tags()
            .returning(|_, _| Ok(BTreeMap::new()));
        cloud.expect_create_tags().returning(|_, _, _| Ok(()));
        cloud.expect_list_public_ip_addresses().never();
        cloud.expect_associate_ip_address().never();

        let ctx = context(store, sessions(cloud));
        let action = reconcile(Arc::new(subject()), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert!(writes
            .writes()
            .iter()
            .all(|w| w.kind == ResourceKind::IsolatedNetwork));
        let status = writes
            .status_of(ResourceKind::IsolatedNetwork, "isolated-network-mycluster")
            .unwrap();
        assert_eq!(status["status"]["ready"], true);
    }

    /// Story: A network pointing at an unknown failure domain says so on status
    #[tokio::test]
    async fn story_unknown_failure_domain_is_surfaced_on_status() {
        let mut orphan = subject();
        orphan.spec.failure_domain_name = "does-not-exist".to_string();

        let writes = WriteLog::default();
        let mut store = store_with(orphan.clone(), cluster(), failure_domain());
        writes.attach(&mut store);
        let mut sessions = MockCloudSessionFactory::new();
        sessions.expect_connect().never();

        let ctx = context(store, sessions);
        let err = reconcile(Arc::new(orphan), ctx).await.unwrap_err();
        assert!(err.is_invariant());

        let status = writes
            .status_of(ResourceKind::IsolatedNetwork, "isolated-network-mycluster")
            .unwrap();
        assert!(status["status"]["failureMessage"]
            .as_str()
            .unwrap()
            .contains("does-not-exist"));
    }

    // ==========================================================================
    // Story Tests: Teardown
    // ==========================================================================

    /// Story: Resources CloudStack no longer knows about count as released
    #[tokio::test]
    async fn story_no_match_found_still_clears_finalizer() {
        let mut deleting = subject();
        deleting.spec.id = "net-1".to_string();
        deleting.metadata.deletion_timestamp = Some(Time(Default::default()));
        deleting.status = Some(CloudStackIsolatedNetworkStatus {
            public_ip_id: "ip-1".to_string(),
            ..Default::default()
        });

        let writes = WriteLog::default();
        let mut store = store_with(deleting.clone(), cluster(), failure_domain());
        writes.attach(&mut store);

        let mut cloud = MockCloudClient::new();
        cloud
            .expect_list_load_balancer_rules()
            .returning(|_| Err(Error::cloud("listLoadBalancerRules", "no match found")));
        cloud
            .expect_list_tags()
            .returning(|_, _| Err(Error::cloud("listTags", "no match found")));
        cloud.expect_disassociate_ip_address().never();
        cloud.expect_delete_network().never();

        let ctx = context(store, sessions(cloud));
        let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());

        let writes = writes.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].body["metadata"]["finalizers"], json!([]));
    }

    /// Story: A network that never reached CloudStack is released directly
    #[tokio::test]
    async fn story_untouched_network_without_domain_is_released() {
        let mut deleting = subject();
        deleting.metadata.deletion_timestamp = Some(Time(Default::default()));

        let mut store = MockResourceStore::new();
        store
            .expect_get_capi_cluster()
            .returning(|_, _| Ok(Some(capi_cluster())));
        store
            .expect_get_cluster()
            .returning(|_, _| Ok(Some(cluster())));
        store
            .expect_list_failure_domains()
            .returning(|_, _| Ok(vec![]));
        let loaded = deleting.clone();
        store
            .expect_get_isolated_network()
            .returning(move |_, _| Ok(Some(loaded.clone())));
        store.expect_get_secret().never();
        let writes = WriteLog::default();
        writes.attach(&mut store);

        let mut sessions = MockCloudSessionFactory::new();
        sessions.expect_connect().never();
        let ctx = context(store, sessions);
        let action = reconcile(Arc::new(deleting), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(writes.writes().len(), 1);
    }
}
