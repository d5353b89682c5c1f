//! Virtual machines and their load-balancer membership

use std::io::Write;

use base64::{engine::general_purpose::STANDARD, Engine};
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::{debug, info, warn};

use super::{ignore_not_found, DeployVmRequest, LifecycleManager, ResourceType, VirtualMachine};
use crate::crd::{CloudStackCluster, CloudStackFailureDomainSpec, CloudStackMachineSpec};
use crate::{Error, Result};

/// Everything needed to deploy one machine
#[derive(Clone, Copy, Debug)]
pub struct VmPlacement<'a> {
    /// VM name, the CloudStackMachine name
    pub name: &'a str,
    /// Cluster the VM is tagged as owned by
    pub cluster: &'a CloudStackCluster,
    /// Machine spec
    pub spec: &'a CloudStackMachineSpec,
    /// Failure domain the machine is placed in, with zone and network resolved
    pub failure_domain: &'a CloudStackFailureDomainSpec,
    /// Raw bootstrap data
    pub user_data: &'a [u8],
}

/// Encode bootstrap data for deployVirtualMachine
///
/// Data is gzip-compressed unless the machine asks for it uncompressed,
/// then base64 encoded.
pub fn encode_user_data(data: &[u8], uncompressed: bool) -> Result<String> {
    if uncompressed {
        return Ok(STANDARD.encode(data));
    }
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|_| encoder.finish())
        .map(|compressed| STANDARD.encode(compressed))
        .map_err(|e| Error::serialization(format!("compressing user data: {e}")))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

impl LifecycleManager {
    /// Find the machine's VM by id, then by name, deploying it when absent
    ///
    /// A recorded instance id whose VM has disappeared is an invariant
    /// violation; the machine is not silently recreated. A VM returned
    /// without a recorded id carries the cluster's ownership tag.
    pub async fn get_or_create_vm(&self, placement: VmPlacement<'_>) -> Result<VirtualMachine> {
        if let Some(id) = placement.spec.instance_id.as_deref() {
            return self.cloud.find_vm_by_id(id).await?.ok_or_else(|| {
                Error::invariant(format!(
                    "VM {id} of machine {} no longer exists",
                    placement.name
                ))
            });
        }

        if let Some(vm) = self.cloud.find_vm_by_name(placement.name).await? {
            debug!(vm = %vm.name, id = %vm.id, "adopting existing VM");
            self.add_cluster_tag(ResourceType::UserVm, &vm.id, placement.cluster)
                .await?;
            return Ok(vm);
        }

        let fd = placement.failure_domain;
        let zone_id = &fd.zone.id;
        let service_offering_id = self
            .cloud
            .resolve_service_offering(&placement.spec.offering, zone_id)
            .await?;
        let template_id = self
            .cloud
            .resolve_template(&placement.spec.template, zone_id)
            .await?;
        let (disk_offering_id, disk_size) = match &placement.spec.disk_offering {
            Some(disk) if !disk.id.is_empty() || !disk.name.is_empty() => {
                let id = self.cloud.resolve_disk_offering(disk, zone_id).await?;
                (Some(id), (disk.custom_size > 0).then_some(disk.custom_size))
            }
            _ => (None, None),
        };

        let request = DeployVmRequest {
            name: placement.name.to_string(),
            zone_id: zone_id.clone(),
            network_id: fd.zone.network.id.clone(),
            service_offering_id,
            template_id,
            disk_offering_id,
            disk_size,
            ssh_key: placement.spec.ssh_key.clone(),
            affinity_group_ids: placement.spec.affinity_group_ids.clone(),
            user_data: encode_user_data(
                placement.user_data,
                placement.spec.uncompressed_user_data.unwrap_or(false),
            )?,
            details: placement.spec.details.clone(),
            account: non_empty(&fd.account),
            domain: non_empty(&fd.domain),
        };

        let vm = match self.cloud.deploy_vm(&request).await {
            Ok(vm) => vm,
            Err(e) if e.is_already_exists() => {
                warn!(vm = %placement.name, "VM deployed concurrently, re-resolving");
                self.cloud
                    .find_vm_by_name(placement.name)
                    .await?
                    .ok_or_else(|| e.with_context("re-resolving VM"))?
            }
            Err(e) => return Err(e.with_context("deploying VM")),
        };

        self.add_created_by_tag(ResourceType::UserVm, &vm.id).await?;
        self.add_cluster_tag(ResourceType::UserVm, &vm.id, placement.cluster)
            .await?;
        info!(vm = %vm.name, id = %vm.id, "deployed VM");
        Ok(vm)
    }

    /// Destroy and expunge a VM, tolerating one that is already gone
    pub async fn destroy_vm(&self, id: &str) -> Result<()> {
        if ignore_not_found(self.cloud.destroy_vm(id, true).await)?.is_some() {
            info!(id, "destroyed VM");
        }
        Ok(())
    }

    /// Add a VM to every rule on the network's public IP
    pub async fn assign_vm_to_load_balancer_rules(
        &self,
        network_id: &str,
        public_ip_id: &str,
        vm_id: &str,
    ) -> Result<()> {
        for rule in self.cloud.list_load_balancer_rules(network_id).await? {
            if rule.public_ip_id != public_ip_id {
                continue;
            }
            let members = self.cloud.list_load_balancer_rule_instances(&rule.id).await?;
            if members.iter().any(|m| m == vm_id) {
                continue;
            }
            self.cloud
                .assign_to_load_balancer_rule(&rule.id, vm_id)
                .await
                .map_err(|e| e.with_context("assigning VM to load-balancer rule"))?;
            debug!(rule = %rule.name, vm_id, "assigned VM to load-balancer rule");
        }
        Ok(())
    }

    /// Remove a VM from every rule of the network
    pub async fn remove_vm_from_load_balancer_rules(
        &self,
        network_id: &str,
        vm_id: &str,
    ) -> Result<()> {
        let rules = ignore_not_found(self.cloud.list_load_balancer_rules(network_id).await)?
            .unwrap_or_default();
        for rule in rules {
            let members = ignore_not_found(
                self.cloud.list_load_balancer_rule_instances(&rule.id).await,
            )?
            .unwrap_or_default();
            if members.iter().any(|m| m == vm_id) {
                ignore_not_found(self.cloud.remove_from_load_balancer_rule(&rule.id, vm_id).await)?;
            }
        }
        Ok(())
    }
}
