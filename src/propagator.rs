//! Event propagation from watched objects to dependent reconciles
//!
//! Watches deliver untyped objects. Each is decoded into a [`ChangedObject`]
//! through a kind lookup table, filtered through pure predicates, and mapped
//! to the [`ReconcileRequest`]s of the objects that depend on it.
//!
//! Mapper lookups never fail the watch: errors are logged and produce no
//! requests, the next change notification retries the mapping.

use std::sync::Arc;

use dashmap::DashMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use tracing::{debug, warn};

use crate::crd::capi::{self, CapiCluster, CapiMachine, CAPI_GROUP};
use crate::crd::{
    CloudStackCluster, CloudStackClusterSpec, CloudStackFailureDomain, CloudStackIsolatedNetwork,
    CloudStackMachine, ResourceKind,
};
use crate::store::ResourceStore;
use crate::{Error, Result, CLUSTER_NAME_LABEL, PAUSED_ANNOTATION, WATCH_FILTER_LABEL};

/// Identity of an object to reconcile
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ReconcileRequest {
    /// Kind of the object
    pub kind: ResourceKind,
    /// Namespace of the object
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ReconcileRequest {
    /// Create a request
    pub fn new(kind: ResourceKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for ReconcileRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

// =============================================================================
// Changed objects
// =============================================================================

/// A watched object of one of the known kinds
#[derive(Clone, Debug, PartialEq)]
pub enum ChangedObject {
    /// CloudStackCluster
    Cluster(Box<CloudStackCluster>),
    /// CloudStackFailureDomain
    FailureDomain(Box<CloudStackFailureDomain>),
    /// CloudStackIsolatedNetwork
    IsolatedNetwork(Box<CloudStackIsolatedNetwork>),
    /// CloudStackMachine
    Machine(Box<CloudStackMachine>),
    /// CAPI Cluster
    CapiCluster(Box<CapiCluster>),
    /// CAPI Machine
    CapiMachine(Box<CapiMachine>),
}

type Decoder = fn(DynamicObject) -> Result<ChangedObject>;

fn decode_cluster(obj: DynamicObject) -> Result<ChangedObject> {
    Ok(ChangedObject::Cluster(Box::new(capi::from_dynamic(obj)?)))
}

fn decode_failure_domain(obj: DynamicObject) -> Result<ChangedObject> {
    Ok(ChangedObject::FailureDomain(Box::new(capi::from_dynamic(
        obj,
    )?)))
}

fn decode_isolated_network(obj: DynamicObject) -> Result<ChangedObject> {
    Ok(ChangedObject::IsolatedNetwork(Box::new(capi::from_dynamic(
        obj,
    )?)))
}

fn decode_machine(obj: DynamicObject) -> Result<ChangedObject> {
    Ok(ChangedObject::Machine(Box::new(capi::from_dynamic(obj)?)))
}

fn decode_capi_cluster(obj: DynamicObject) -> Result<ChangedObject> {
    Ok(ChangedObject::CapiCluster(Box::new(capi::from_dynamic(obj)?)))
}

fn decode_capi_machine(obj: DynamicObject) -> Result<ChangedObject> {
    Ok(ChangedObject::CapiMachine(Box::new(capi::from_dynamic(obj)?)))
}

/// Kind name to decoder
const DECODERS: &[(&str, Decoder)] = &[
    ("CloudStackCluster", decode_cluster),
    ("CloudStackFailureDomain", decode_failure_domain),
    ("CloudStackIsolatedNetwork", decode_isolated_network),
    ("CloudStackMachine", decode_machine),
    ("Cluster", decode_capi_cluster),
    ("Machine", decode_capi_machine),
];

impl ChangedObject {
    /// Decode a watched object by its kind
    ///
    /// An object without type information or of an unknown kind is an error.
    pub fn decode(obj: DynamicObject) -> Result<Self> {
        let kind = obj
            .types
            .as_ref()
            .map(|t| t.kind.clone())
            .ok_or_else(|| Error::serialization("watched object has no kind"))?;
        let (_, decode) = DECODERS
            .iter()
            .find(|(k, _)| *k == kind)
            .ok_or_else(|| Error::serialization(format!("unknown kind {kind}")))?;
        decode(obj)
    }

    /// Kind name of the object
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cluster(_) => "CloudStackCluster",
            Self::FailureDomain(_) => "CloudStackFailureDomain",
            Self::IsolatedNetwork(_) => "CloudStackIsolatedNetwork",
            Self::Machine(_) => "CloudStackMachine",
            Self::CapiCluster(_) => "Cluster",
            Self::CapiMachine(_) => "Machine",
        }
    }

    /// Object metadata
    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Cluster(o) => &o.metadata,
            Self::FailureDomain(o) => &o.metadata,
            Self::IsolatedNetwork(o) => &o.metadata,
            Self::Machine(o) => &o.metadata,
            Self::CapiCluster(o) => &o.metadata,
            Self::CapiMachine(o) => &o.metadata,
        }
    }

    fn key(&self) -> (String, String, String) {
        let meta = self.metadata();
        (
            self.kind().to_string(),
            meta.namespace.clone().unwrap_or_default(),
            meta.name.clone().unwrap_or_default(),
        )
    }
}

// =============================================================================
// Predicates
// =============================================================================

/// True if the object is new or its generation moved
pub fn generation_changed(old: Option<&ObjectMeta>, new: &ObjectMeta) -> bool {
    match old {
        None => true,
        Some(old) => old.generation != new.generation,
    }
}

/// True if the API server load-balancer settings changed
///
/// Absent on both sides is no change. Toggling presence is a change.
pub fn load_balancer_changed(
    old: Option<&CloudStackClusterSpec>,
    new: &CloudStackClusterSpec,
) -> bool {
    match old {
        None => true,
        Some(old) => old.api_server_load_balancer != new.api_server_load_balancer,
    }
}

/// True if the object or its owning CAPI cluster is paused
pub fn is_paused(meta: &ObjectMeta, cluster: Option<&CapiCluster>) -> bool {
    let annotated = meta
        .annotations
        .as_ref()
        .is_some_and(|a| a.contains_key(PAUSED_ANNOTATION));
    annotated || cluster.is_some_and(|c| c.spec.paused)
}

/// True if no filter is configured or the object carries the matching label
pub fn matches_watch_filter(meta: &ObjectMeta, filter: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(value) => meta
            .labels
            .as_ref()
            .and_then(|l| l.get(WATCH_FILTER_LABEL))
            .is_some_and(|v| v == value),
    }
}

/// Name of the CAPI cluster owning an object
///
/// The cluster-name label wins; otherwise an owner reference of kind
/// `Cluster` in the CAPI group.
pub fn owning_cluster_name(meta: &ObjectMeta) -> Option<String> {
    if let Some(name) = meta
        .labels
        .as_ref()
        .and_then(|l| l.get(CLUSTER_NAME_LABEL))
        .filter(|n| !n.is_empty())
    {
        return Some(name.clone());
    }
    meta.owner_references.as_ref().and_then(|refs| {
        refs.iter()
            .find(|r| {
                r.kind == "Cluster"
                    && r.api_version.split('/').next() == Some(CAPI_GROUP)
            })
            .map(|r| r.name.clone())
    })
}

// =============================================================================
// Mappers
// =============================================================================

/// Isolated networks of the cluster owning a CloudStackCluster
pub async fn cluster_to_isolated_networks(
    store: &dyn ResourceStore,
    cluster: &CloudStackCluster,
) -> Vec<ReconcileRequest> {
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, skipping mapping");
        return Vec::new();
    }
    let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
    let Some(cluster_name) = owning_cluster_name(&cluster.metadata) else {
        warn!(cluster = ?cluster.metadata.name, "failed to get owning cluster, skipping mapping");
        return Vec::new();
    };

    match store.list_isolated_networks(&namespace, &cluster_name).await {
        Ok(networks) => networks
            .into_iter()
            .filter_map(|n| n.metadata.name)
            .map(|name| ReconcileRequest::new(ResourceKind::IsolatedNetwork, &namespace, name))
            .collect(),
        Err(e) => {
            warn!(
                error = %e,
                cluster = %cluster_name,
                "failed to list isolated networks, skipping mapping"
            );
            Vec::new()
        }
    }
}

/// CloudStack machines of the cluster owning a CloudStackCluster
pub async fn cluster_to_machines(
    store: &dyn ResourceStore,
    cluster: &CloudStackCluster,
) -> Vec<ReconcileRequest> {
    if cluster.metadata.deletion_timestamp.is_some() {
        debug!("cluster is being deleted, skipping mapping");
        return Vec::new();
    }
    let namespace = cluster.metadata.namespace.clone().unwrap_or_default();
    let Some(cluster_name) = owning_cluster_name(&cluster.metadata) else {
        warn!(cluster = ?cluster.metadata.name, "failed to get owning cluster, skipping mapping");
        return Vec::new();
    };
    capi_machines_to_requests(store, &namespace, &cluster_name, false).await
}

/// Control-plane CloudStack machines of an isolated network's cluster
pub async fn isolated_network_to_control_plane_machines(
    store: &dyn ResourceStore,
    network: &CloudStackIsolatedNetwork,
) -> Vec<ReconcileRequest> {
    if network.metadata.deletion_timestamp.is_some() {
        debug!("isolated network is being deleted, skipping mapping");
        return Vec::new();
    }
    let namespace = network.metadata.namespace.clone().unwrap_or_default();
    let Some(cluster_name) = owning_cluster_name(&network.metadata) else {
        warn!(
            network = ?network.metadata.name,
            "isolated network has no cluster name label, skipping mapping"
        );
        return Vec::new();
    };
    capi_machines_to_requests(store, &namespace, &cluster_name, true).await
}

async fn capi_machines_to_requests(
    store: &dyn ResourceStore,
    namespace: &str,
    cluster_name: &str,
    control_plane_only: bool,
) -> Vec<ReconcileRequest> {
    let machines = match store
        .list_capi_machines(namespace, cluster_name, control_plane_only)
        .await
    {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, cluster = %cluster_name, "failed to list machines, skipping mapping");
            return Vec::new();
        }
    };

    machines
        .into_iter()
        .filter(|m| {
            let infra = &m.spec.infrastructure_ref;
            infra.kind == ResourceKind::Machine.as_str() && !infra.name.is_empty()
        })
        .map(|m| {
            let ns = m
                .metadata
                .namespace
                .unwrap_or_else(|| namespace.to_string());
            ReconcileRequest::new(ResourceKind::Machine, ns, m.spec.infrastructure_ref.name)
        })
        .collect()
}

// =============================================================================
// Propagator
// =============================================================================

/// Turns change notifications into dependent reconcile requests
///
/// Remembers the last object seen per identity so update predicates can
/// compare old and new.
pub struct Propagator {
    store: Arc<dyn ResourceStore>,
    last_seen: DashMap<(String, String, String), ChangedObject>,
}

impl Propagator {
    /// Create a propagator over a store
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            last_seen: DashMap::new(),
        }
    }

    /// Requests for everything depending on a changed object
    pub async fn on_change(&self, obj: ChangedObject) -> Vec<ReconcileRequest> {
        let previous = self.last_seen.insert(obj.key(), obj.clone());
        let store = self.store.as_ref();

        match &obj {
            ChangedObject::Cluster(cluster) => {
                let old = match &previous {
                    Some(ChangedObject::Cluster(c)) => Some(c.as_ref()),
                    _ => None,
                };
                let mut requests = Vec::new();
                if load_balancer_changed(old.map(|c| &c.spec), &cluster.spec) {
                    requests.extend(cluster_to_isolated_networks(store, cluster).await);
                }
                if generation_changed(old.map(|c| &c.metadata), &cluster.metadata) {
                    requests.extend(cluster_to_machines(store, cluster).await);
                }
                requests
            }
            ChangedObject::IsolatedNetwork(network) => {
                isolated_network_to_control_plane_machines(store, network).await
            }
            _ => Vec::new(),
        }
    }

    /// Drop the remembered state of a deleted object
    pub fn forget(&self, obj: &ChangedObject) {
        self.last_seen.remove(&obj.key());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::capi::{CapiMachineSpec, ObjectRef};
    use crate::crd::{ApiServerLoadBalancer, CloudStackIsolatedNetworkSpec};
    use crate::store::MockResourceStore;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{OwnerReference, Time};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn labels(pairs: &[(&str, &str)]) -> Option<BTreeMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn cs_cluster() -> CloudStackCluster {
        let mut cluster = CloudStackCluster::new("mycluster", Default::default());
        cluster.metadata.namespace = Some("default".to_string());
        cluster.metadata.generation = Some(1);
        cluster.metadata.owner_references = Some(vec![OwnerReference {
            api_version: "cluster.x-k8s.io/v1beta1".to_string(),
            kind: "Cluster".to_string(),
            name: "mycluster".to_string(),
            uid: "capi-uid".to_string(),
            ..Default::default()
        }]);
        cluster
    }

    fn capi_machine(name: &str, infra_kind: &str, infra_name: &str) -> CapiMachine {
        CapiMachine {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: CapiMachineSpec {
                cluster_name: "mycluster".to_string(),
                infrastructure_ref: ObjectRef {
                    kind: infra_kind.to_string(),
                    name: infra_name.to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        }
    }

    fn isolated_network(name: &str) -> CloudStackIsolatedNetwork {
        let mut net =
            CloudStackIsolatedNetwork::new(name, CloudStackIsolatedNetworkSpec::default());
        net.metadata.namespace = Some("default".to_string());
        net.metadata.labels = labels(&[(CLUSTER_NAME_LABEL, "mycluster")]);
        net
    }

    // ==========================================================================
    // Story Tests: Decoding Watched Objects
    // ==========================================================================

    /// Story: A watched CAPI machine decodes into its typed view
    #[test]
    fn story_known_kind_decodes() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Machine",
            "metadata": {"name": "cp-0", "namespace": "default"},
            "spec": {"clusterName": "mycluster"}
        }))
        .unwrap();

        let changed = ChangedObject::decode(obj).unwrap();
        assert_eq!(changed.kind(), "Machine");
        assert_eq!(changed.metadata().name.as_deref(), Some("cp-0"));
    }

    /// Story: An unknown kind is reported, never silently ignored
    #[test]
    fn story_unknown_kind_is_an_error() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm"}
        }))
        .unwrap();

        let err = ChangedObject::decode(obj).unwrap_err();
        assert!(err.to_string().contains("unknown kind ConfigMap"));
    }

    // ==========================================================================
    // Story Tests: Predicates
    // ==========================================================================

    #[test]
    fn generation_predicate() {
        let new = ObjectMeta {
            generation: Some(2),
            ..Default::default()
        };
        let old = ObjectMeta {
            generation: Some(1),
            ..Default::default()
        };
        assert!(generation_changed(None, &new));
        assert!(generation_changed(Some(&old), &new));
        assert!(!generation_changed(Some(&new), &new));
    }

    /// Story: Only load-balancer edits reach the isolated network reconciler
    #[test]
    fn story_load_balancer_predicate() {
        let none = CloudStackClusterSpec::default();
        let enabled = CloudStackClusterSpec {
            api_server_load_balancer: Some(ApiServerLoadBalancer {
                enabled: true,
                ..Default::default()
            }),
            ..Default::default()
        };
        let with_port = CloudStackClusterSpec {
            api_server_load_balancer: Some(ApiServerLoadBalancer {
                enabled: true,
                additional_ports: vec![443],
                ..Default::default()
            }),
            ..Default::default()
        };

        assert!(!load_balancer_changed(Some(&none), &none));
        assert!(load_balancer_changed(Some(&none), &enabled));
        assert!(load_balancer_changed(Some(&enabled), &none));
        assert!(load_balancer_changed(Some(&enabled), &with_port));
        assert!(!load_balancer_changed(Some(&with_port), &with_port));
    }

    #[test]
    fn paused_by_annotation_or_cluster() {
        let annotated = ObjectMeta {
            annotations: labels(&[(PAUSED_ANNOTATION, "")]),
            ..Default::default()
        };
        assert!(is_paused(&annotated, None));

        let mut cluster = CapiCluster::default();
        assert!(!is_paused(&ObjectMeta::default(), Some(&cluster)));
        cluster.spec.paused = true;
        assert!(is_paused(&ObjectMeta::default(), Some(&cluster)));
    }

    #[test]
    fn watch_filter_takes_explicit_value() {
        let meta = ObjectMeta {
            labels: labels(&[(WATCH_FILTER_LABEL, "shard-a")]),
            ..Default::default()
        };
        assert!(matches_watch_filter(&meta, None));
        assert!(matches_watch_filter(&meta, Some("shard-a")));
        assert!(!matches_watch_filter(&meta, Some("shard-b")));
        assert!(!matches_watch_filter(&ObjectMeta::default(), Some("shard-a")));
    }

    #[test]
    fn owner_label_wins_over_owner_reference() {
        let mut cluster = cs_cluster();
        assert_eq!(owning_cluster_name(&cluster.metadata).as_deref(), Some("mycluster"));

        cluster.metadata.labels = labels(&[(CLUSTER_NAME_LABEL, "other")]);
        assert_eq!(owning_cluster_name(&cluster.metadata).as_deref(), Some("other"));

        assert_eq!(owning_cluster_name(&ObjectMeta::default()), None);
    }

    // ==========================================================================
    // Story Tests: Mapping Changes to Dependents
    // ==========================================================================

    /// Story: A deleted cluster produces no requests and no lookups
    #[tokio::test]
    async fn story_deleted_cluster_propagates_nothing() {
        let mut store = MockResourceStore::new();
        store.expect_list_isolated_networks().never();
        store.expect_list_capi_machines().never();

        let mut cluster = cs_cluster();
        cluster.metadata.deletion_timestamp = Some(Time(Default::default()));

        assert!(cluster_to_isolated_networks(&store, &cluster).await.is_empty());
        assert!(cluster_to_machines(&store, &cluster).await.is_empty());

        let propagator = Propagator::new(Arc::new(store));
        let requests = propagator
            .on_change(ChangedObject::Cluster(Box::new(cluster)))
            .await;
        assert!(requests.is_empty());
    }

    /// Story: Only CAPI machines backed by a named CloudStackMachine are enqueued
    #[tokio::test]
    async fn story_cluster_change_enqueues_cloudstack_machines_in_list_order() {
        let mut store = MockResourceStore::new();
        store
            .expect_list_capi_machines()
            .withf(|ns, cluster, cp_only| ns == "default" && cluster == "mycluster" && !cp_only)
            .returning(|_, _, _| {
                Ok(vec![
                    capi_machine("m-0", "CloudStackMachine", "csm-0"),
                    capi_machine("m-1", "DockerMachine", "dm-1"),
                    capi_machine("m-2", "CloudStackMachine", ""),
                    capi_machine("m-3", "CloudStackMachine", "csm-3"),
                ])
            });

        let requests = cluster_to_machines(&store, &cs_cluster()).await;
        assert_eq!(
            requests,
            vec![
                ReconcileRequest::new(ResourceKind::Machine, "default", "csm-0"),
                ReconcileRequest::new(ResourceKind::Machine, "default", "csm-3"),
            ]
        );
    }

    /// Story: A ready isolated network wakes only control-plane machines
    #[tokio::test]
    async fn story_isolated_network_enqueues_control_plane_machines() {
        let mut store = MockResourceStore::new();
        store
            .expect_list_capi_machines()
            .withf(|_, cluster, cp_only| cluster == "mycluster" && *cp_only)
            .times(1)
            .returning(|_, _, _| Ok(vec![capi_machine("cp-0", "CloudStackMachine", "csm-cp-0")]));

        let requests =
            isolated_network_to_control_plane_machines(&store, &isolated_network("net")).await;
        assert_eq!(
            requests,
            vec![ReconcileRequest::new(ResourceKind::Machine, "default", "csm-cp-0")]
        );
    }

    /// Story: A failed lookup is logged and yields nothing
    #[tokio::test]
    async fn story_lookup_failure_yields_empty() {
        let mut store = MockResourceStore::new();
        store
            .expect_list_isolated_networks()
            .returning(|_, _| Err(Error::internal_with_context("boom", "list")));

        assert!(cluster_to_isolated_networks(&store, &cs_cluster()).await.is_empty());
    }

    /// Story: A status-only cluster update does not re-enqueue dependents
    #[tokio::test]
    async fn story_unchanged_cluster_update_is_filtered() {
        let mut store = MockResourceStore::new();
        store
            .expect_list_isolated_networks()
            .times(1)
            .returning(|_, _| Ok(vec![isolated_network("isolated-network-mycluster")]));
        store
            .expect_list_capi_machines()
            .times(1)
            .returning(|_, _, _| Ok(vec![]));

        let propagator = Propagator::new(Arc::new(store));
        let first = propagator
            .on_change(ChangedObject::Cluster(Box::new(cs_cluster())))
            .await;
        assert_eq!(
            first,
            vec![ReconcileRequest::new(
                ResourceKind::IsolatedNetwork,
                "default",
                "isolated-network-mycluster"
            )]
        );

        let mut status_only = cs_cluster();
        status_only.status = Some(Default::default());
        let second = propagator
            .on_change(ChangedObject::Cluster(Box::new(status_only)))
            .await;
        assert!(second.is_empty());
    }
}
