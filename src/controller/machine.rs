//! CloudStackMachine reconciliation
//!
//! A machine becomes a CloudStack VM in its failure domain's zone and
//! network, booted with the bootstrap data CAPI rendered for it.
//! Control-plane machines also join the API server load-balancer rules.

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info};

use super::engine::{Outcome, Reconcilable, Scope};
use super::failure_domain::isolated_network_object_name;
use crate::cloud::{VirtualMachine, VmPlacement};
use crate::crd::capi::{CapiMachine, CAPI_GROUP};
use crate::crd::{
    provider_id_for, CloudStackCluster, CloudStackFailureDomain, CloudStackMachine,
    MachineAddress, ResourceKind,
};
use crate::store::ResourceStore;
use crate::{Error, Result};

/// Finalizer held on CloudStackMachines
pub const MACHINE_FINALIZER: &str = "cloudstackmachine.infrastructure.cluster.x-k8s.io";

/// Key of the bootstrap data in a CAPI bootstrap secret
const BOOTSTRAP_DATA_KEY: &str = "value";

const VM_STATE_RUNNING: &str = "Running";
const VM_STATE_ERROR: &str = "Error";

/// Name of the CAPI Machine owning this machine
fn owning_machine_name(meta: &ObjectMeta) -> Option<&str> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.kind == "Machine" && r.api_version.split('/').next() == Some(CAPI_GROUP))
        .map(|r| r.name.as_str())
}

/// Failure domain for a machine CAPI left unplaced
///
/// Stable for a given machine name so a retry lands in the same domain.
fn pick_failure_domain<'c>(cluster: &'c CloudStackCluster, machine_name: &str) -> Option<&'c str> {
    let domains = &cluster.spec.failure_domains;
    if domains.is_empty() {
        return None;
    }
    let index = machine_name.bytes().map(usize::from).sum::<usize>() % domains.len();
    Some(&domains[index].name)
}

fn internal_addresses(vm: &VirtualMachine) -> Vec<MachineAddress> {
    vm.addresses
        .iter()
        .map(|address| MachineAddress {
            type_: "InternalIP".to_string(),
            address: address.clone(),
        })
        .collect()
}

impl CloudStackMachine {
    /// Join the API server load balancer once the isolated network has one
    ///
    /// Returns false while the network is not ready yet.
    async fn join_load_balancer(
        &self,
        scope: &Scope<'_>,
        fd: &CloudStackFailureDomain,
        vm_id: &str,
    ) -> Result<bool> {
        let object_name = isolated_network_object_name(&fd.spec.zone.network.name);
        let Some(network) = scope
            .store
            .get_isolated_network(&scope.namespace(), &object_name)
            .await?
        else {
            return Ok(false);
        };
        let public_ip_id = network
            .status
            .as_ref()
            .map(|s| s.public_ip_id.as_str())
            .unwrap_or_default();
        if !network.is_ready() || network.spec.id.is_empty() || public_ip_id.is_empty() {
            return Ok(false);
        }
        scope
            .lifecycle()?
            .assign_vm_to_load_balancer_rules(&network.spec.id, public_ip_id, vm_id)
            .await?;
        Ok(true)
    }

    async fn bootstrap_data(&self, scope: &Scope<'_>, secret_name: &str) -> Result<Vec<u8>> {
        let namespace = self.namespace().unwrap_or_default();
        let secret = scope
            .store
            .get_secret(&namespace, secret_name)
            .await?
            .ok_or_else(|| Error::not_found("Secret", &namespace, secret_name))?;
        secret
            .data
            .and_then(|mut d| d.remove(BOOTSTRAP_DATA_KEY))
            .map(|b| b.0)
            .ok_or_else(|| {
                Error::invariant(format!(
                    "bootstrap secret {secret_name} has no {BOOTSTRAP_DATA_KEY} key"
                ))
            })
    }
}

#[async_trait]
impl Reconcilable for CloudStackMachine {
    const KIND: ResourceKind = ResourceKind::Machine;
    const FINALIZER: &'static str = MACHINE_FINALIZER;

    async fn load(
        store: &dyn ResourceStore,
        namespace: &str,
        name: &str,
    ) -> Result<Option<Self>> {
        store.get_machine(namespace, name).await
    }

    fn failure_domain_name(&self) -> Option<&str> {
        Some(self.spec.failure_domain_name.as_str()).filter(|n| !n.is_empty())
    }

    async fn reconcile_normal(&self, scope: &Scope<'_>) -> Result<Outcome> {
        let namespace = self.namespace().unwrap_or_default();
        let capi_machine: Option<CapiMachine> = match owning_machine_name(&self.metadata) {
            Some(name) => scope.store.get_capi_machine(&namespace, name).await?,
            None => None,
        };
        let Some(capi_machine) = capi_machine else {
            return Ok(Outcome::NotReady("Waiting for the owning Machine.".to_string()));
        };

        if self.spec.failure_domain_name.is_empty() {
            let chosen = capi_machine
                .spec
                .failure_domain
                .as_deref()
                .filter(|fd| !fd.is_empty())
                .or_else(|| pick_failure_domain(&scope.cluster, &self.name_any()));
            let Some(chosen) = chosen else {
                return Err(Error::invariant("cluster has no failure domains"));
            };
            info!(failure_domain = chosen, "placing machine");
            scope.patch(
                ResourceKind::Machine,
                &self.metadata,
                json!({ "spec": { "failureDomainName": chosen } }),
            );
            return Ok(Outcome::NotReady(
                "Waiting for the failure domain to be recorded.".to_string(),
            ));
        }

        let fd = scope.failure_domain()?;
        if fd.spec.zone.id.is_empty() {
            return Ok(Outcome::NotReady("Zone ID not resolved yet.".to_string()));
        }
        if fd.spec.zone.network.id.is_empty() {
            return Ok(Outcome::NotReady("Network ID not resolved yet.".to_string()));
        }
        let Some(secret_name) = capi_machine.spec.bootstrap.data_secret_name.as_deref() else {
            return Ok(Outcome::NotReady("Waiting for bootstrap data.".to_string()));
        };
        let user_data = self.bootstrap_data(scope, secret_name).await?;

        let name = self.name_any();
        let vm = scope
            .lifecycle()?
            .get_or_create_vm(VmPlacement {
                name: &name,
                cluster: &scope.cluster,
                spec: &self.spec,
                failure_domain: &fd.spec,
                user_data: &user_data,
            })
            .await?;
        if vm.state == VM_STATE_ERROR {
            return Err(Error::invariant(format!("VM {} is in Error state", vm.id)));
        }

        if self.spec.instance_id.as_deref() != Some(vm.id.as_str()) {
            scope.patch(
                ResourceKind::Machine,
                &self.metadata,
                json!({
                    "spec": {
                        "instanceID": vm.id,
                        "providerID": provider_id_for(&vm.id),
                    }
                }),
            );
        }

        let running = vm.state == VM_STATE_RUNNING;
        let mut waiting = None;
        if !running {
            waiting = Some(format!("VM {} is {}.", vm.id, vm.state));
        } else if capi_machine.is_control_plane()
            && scope.cluster.spec.load_balancer_enabled()
            && fd.spec.zone.network.is_isolated()
            && !self.join_load_balancer(scope, fd, &vm.id).await?
        {
            waiting = Some("Waiting for the API server load balancer.".to_string());
        }

        scope.patch_status(
            ResourceKind::Machine,
            &self.metadata,
            json!({
                "status": {
                    "ready": waiting.is_none(),
                    "instanceState": vm.state,
                    "addresses": internal_addresses(&vm),
                    "failureMessage": null,
                }
            }),
        );

        match waiting {
            None => Ok(Outcome::Done),
            Some(reason) => Ok(Outcome::NotReady(reason)),
        }
    }

    async fn reconcile_delete(&self, scope: &Scope<'_>) -> Result<Outcome> {
        if !scope.has_session() {
            if self.spec.instance_id.as_deref().is_some_and(|id| !id.is_empty()) {
                return Err(Error::invariant(format!(
                    "failure domain {} is gone, cannot destroy VM",
                    self.spec.failure_domain_name
                )));
            }
            debug!("machine never reached CloudStack");
            return Ok(Outcome::Done);
        }
        let lifecycle = scope.lifecycle()?;

        let instance_id = match self.spec.instance_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => match lifecycle.client().find_vm_by_name(&self.name_any()).await? {
                Some(vm) => vm.id,
                None => return Ok(Outcome::Done),
            },
        };

        let fd = scope.failure_domain()?;
        if !fd.spec.zone.network.id.is_empty() {
            lifecycle
                .remove_vm_from_load_balancer_rules(&fd.spec.zone.network.id, &instance_id)
                .await?;
        }
        lifecycle.destroy_vm(&instance_id).await?;
        Ok(Outcome::Done)
    }
}
