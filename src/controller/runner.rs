//! Controller runner - wires every kind into a kube-runtime controller
//!
//! Owned children (failure domains, isolated networks) wake their owners
//! through `owns`. Changes that cross ownership, a cluster's load-balancer
//! spec or an isolated network becoming ready, are routed by the
//! [`Propagator`] into the dependent controllers' trigger channels.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::{SinkExt, StreamExt};
use kube::api::DynamicObject;
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client};
use tracing::{debug, info, warn};

use super::engine::{error_policy, reconcile};
use super::Context;
use crate::config::ControllerConfig;
use crate::crd::{
    CloudStackCluster, CloudStackFailureDomain, CloudStackIsolatedNetwork, CloudStackMachine,
    ResourceKind,
};
use crate::propagator::{ChangedObject, Propagator, ReconcileRequest};
use crate::{Result, WATCH_FILTER_LABEL};

/// Watcher timeout (seconds) - must be less than the client read timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Pending propagated requests per kind before the propagator waits
const TRIGGER_CAPACITY: usize = 256;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config(config: &ControllerConfig) -> WatcherConfig {
    let base = WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);
    match &config.watch_filter {
        Some(value) => base.labels(&format!("{WATCH_FILTER_LABEL}={value}")),
        None => base,
    }
}

fn controller_config(config: &ControllerConfig) -> controller::Config {
    controller::Config::default().concurrency(config.concurrency)
}

/// Trigger channels of the controllers the propagator feeds
struct Routes {
    isolated_networks: mpsc::Sender<ObjectRef<CloudStackIsolatedNetwork>>,
    machines: mpsc::Sender<ObjectRef<CloudStackMachine>>,
}

impl Routes {
    async fn send(&mut self, request: ReconcileRequest) {
        let sent = match request.kind {
            ResourceKind::IsolatedNetwork => {
                let obj = ObjectRef::new(&request.name).within(&request.namespace);
                self.isolated_networks.send(obj).await
            }
            ResourceKind::Machine => {
                let obj = ObjectRef::new(&request.name).within(&request.namespace);
                self.machines.send(obj).await
            }
            ResourceKind::Cluster | ResourceKind::FailureDomain => {
                debug!(object = %request, "no trigger channel for kind");
                return;
            }
        };
        if let Err(e) = sent {
            warn!(object = %request, error = %e, "dropping propagated request");
        }
    }
}

/// Build one controller future per kind
///
/// The isolated-network and machine controllers also reconcile whatever
/// arrives on their trigger streams.
fn build_controllers(
    client: Client,
    ctx: Arc<Context>,
    isolated_network_triggers: mpsc::Receiver<ObjectRef<CloudStackIsolatedNetwork>>,
    machine_triggers: mpsc::Receiver<ObjectRef<CloudStackMachine>>,
) -> Vec<ControllerFuture> {
    let wc = watcher_config(&ctx.config);
    let cc = controller_config(&ctx.config);

    let clusters: Api<CloudStackCluster> = Api::all(client.clone());
    let failure_domains: Api<CloudStackFailureDomain> = Api::all(client.clone());
    let isolated_networks: Api<CloudStackIsolatedNetwork> = Api::all(client.clone());
    let machines: Api<CloudStackMachine> = Api::all(client);

    info!("- CloudStackCluster controller");
    let cluster_ctrl = Controller::new(clusters, wc.clone())
        .owns(failure_domains.clone(), wc.clone())
        .with_config(cc.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<CloudStackCluster>,
            error_policy::<CloudStackCluster>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("CloudStackCluster"));

    info!("- CloudStackFailureDomain controller");
    let failure_domain_ctrl = Controller::new(failure_domains, wc.clone())
        .owns(isolated_networks.clone(), wc.clone())
        .with_config(cc.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<CloudStackFailureDomain>,
            error_policy::<CloudStackFailureDomain>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("CloudStackFailureDomain"));

    info!("- CloudStackIsolatedNetwork controller");
    let isolated_network_ctrl = Controller::new(isolated_networks, wc.clone())
        .reconcile_on(isolated_network_triggers)
        .with_config(cc.clone())
        .shutdown_on_signal()
        .run(
            reconcile::<CloudStackIsolatedNetwork>,
            error_policy::<CloudStackIsolatedNetwork>,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("CloudStackIsolatedNetwork"));

    info!("- CloudStackMachine controller");
    let machine_ctrl = Controller::new(machines, wc)
        .reconcile_on(machine_triggers)
        .with_config(cc)
        .shutdown_on_signal()
        .run(
            reconcile::<CloudStackMachine>,
            error_policy::<CloudStackMachine>,
            ctx,
        )
        .for_each(log_reconcile_result("CloudStackMachine"));

    vec![
        Box::pin(cluster_ctrl),
        Box::pin(failure_domain_ctrl),
        Box::pin(isolated_network_ctrl),
        Box::pin(machine_ctrl),
    ]
}

/// Watch clusters and isolated networks and route dependent requests
async fn propagate_changes(client: Client, ctx: Arc<Context>, mut routes: Routes) {
    let propagator = Propagator::new(ctx.store.clone());
    let wc = watcher_config(&ctx.config);

    let cluster_api: Api<DynamicObject> =
        Api::all_with(client.clone(), &ResourceKind::Cluster.api_resource());
    let network_api: Api<DynamicObject> =
        Api::all_with(client, &ResourceKind::IsolatedNetwork.api_resource());
    let mut events = std::pin::pin!(futures::stream::select(
        watcher::watcher(cluster_api, wc.clone()).default_backoff(),
        watcher::watcher(network_api, wc).default_backoff(),
    ));

    while let Some(event) = events.next().await {
        let (obj, deleted) = match event {
            Ok(Event::Apply(obj) | Event::InitApply(obj)) => (obj, false),
            Ok(Event::Delete(obj)) => (obj, true),
            Ok(Event::Init | Event::InitDone) => continue,
            Err(e) => {
                warn!(error = %e, "propagation watch failed, retrying");
                continue;
            }
        };
        let changed = match ChangedObject::decode(obj) {
            Ok(changed) => changed,
            Err(e) => {
                warn!(error = %e, "ignoring undecodable object");
                continue;
            }
        };
        if deleted {
            propagator.forget(&changed);
            continue;
        }
        for request in propagator.on_change(changed).await {
            routes.send(request).await;
        }
    }
}

/// Run every controller until shutdown
///
/// Returns once the controllers stop on a termination signal.
pub async fn run(client: Client, ctx: Arc<Context>) -> Result<()> {
    let (network_tx, network_rx) = mpsc::channel(TRIGGER_CAPACITY);
    let (machine_tx, machine_rx) = mpsc::channel(TRIGGER_CAPACITY);
    let routes = Routes {
        isolated_networks: network_tx,
        machines: machine_tx,
    };

    info!("Starting controllers:");
    let controllers = build_controllers(client.clone(), ctx.clone(), network_rx, machine_rx);
    let propagation = propagate_changes(client, ctx, routes);

    tokio::select! {
        _ = futures::future::join_all(controllers) => info!("controllers stopped"),
        _ = propagation => warn!("propagation watch ended"),
    }
    Ok(())
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(std::result::Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> (
        Routes,
        mpsc::Receiver<ObjectRef<CloudStackIsolatedNetwork>>,
        mpsc::Receiver<ObjectRef<CloudStackMachine>>,
    ) {
        let (network_tx, network_rx) = mpsc::channel(4);
        let (machine_tx, machine_rx) = mpsc::channel(4);
        (
            Routes {
                isolated_networks: network_tx,
                machines: machine_tx,
            },
            network_rx,
            machine_rx,
        )
    }

    #[tokio::test]
    async fn requests_are_routed_by_kind() {
        let (mut routes, mut networks, mut machines) = routes();
        routes
            .send(ReconcileRequest::new(ResourceKind::Machine, "default", "cp-0"))
            .await;
        routes
            .send(ReconcileRequest::new(
                ResourceKind::IsolatedNetwork,
                "default",
                "isolated-network-mycluster",
            ))
            .await;
        routes
            .send(ReconcileRequest::new(ResourceKind::Cluster, "default", "mycluster"))
            .await;
        drop(routes);

        let machine = machines.next().await.unwrap();
        assert_eq!(machine.name, "cp-0");
        assert_eq!(machine.namespace.as_deref(), Some("default"));
        assert!(machines.next().await.is_none());

        let network = networks.next().await.unwrap();
        assert_eq!(network.name, "isolated-network-mycluster");
        assert!(networks.next().await.is_none());
    }

    #[test]
    fn watch_filter_becomes_label_selector() {
        let config = ControllerConfig {
            watch_filter: Some("shard-a".to_string()),
            ..Default::default()
        };
        assert_eq!(
            watcher_config(&config).label_selector.as_deref(),
            Some("cluster.x-k8s.io/watch-filter=shard-a")
        );
        assert!(watcher_config(&ControllerConfig::default())
            .label_selector
            .is_none());
    }
}
