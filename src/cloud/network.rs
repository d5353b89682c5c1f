//! Zones, isolated networks, public addresses and load-balancer rules

use tracing::{debug, info, warn};

use super::{
    ignore_not_found, AssociateIpRequest, CreateLoadBalancerRuleRequest, CreateNetworkRequest,
    ExternalResourceRef, IpAddressQuery, LifecycleManager, LoadBalancerRule, PublicIpAddress,
    ResourceType, ISOLATED_NETWORK_OFFERING,
};
use crate::crd::{
    CloudStackCluster, CloudStackFailureDomainSpec, CloudStackIsolatedNetwork,
    CloudStackIsolatedNetworkSpec, Zone, NETWORK_TYPE_ISOLATED,
};
use crate::{Error, Result};

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

/// Name of the load-balancer rule for an API server port
pub fn load_balancer_rule_name(port: i32) -> String {
    format!("K8s_API_{port}")
}

impl LifecycleManager {
    /// Resolve a failure domain's zone and network ids
    ///
    /// A missing zone is an invariant violation. A missing isolated network
    /// is fine; it is created by the isolated network reconciler. A missing
    /// shared network is an invariant violation.
    pub async fn resolve_zone(&self, zone: &Zone) -> Result<Zone> {
        let found = self
            .cloud
            .find_zone(&zone.id, &zone.name)
            .await?
            .ok_or_else(|| {
                Error::invariant(format!(
                    "zone {} not found",
                    non_empty(&zone.id).unwrap_or_else(|| zone.name.clone())
                ))
            })?;

        let mut resolved = zone.clone();
        resolved.id = found.id;
        resolved.name = found.name;

        let network = if resolved.network.id.is_empty() {
            self.cloud
                .find_network_by_name(&resolved.id, &resolved.network.name)
                .await?
        } else {
            self.cloud.find_network_by_id(&resolved.network.id).await?
        };

        match network {
            Some(net) => {
                resolved.network.id = net.id;
                resolved.network.name = net.name;
                resolved.network.type_ = net.type_;
            }
            None if resolved.network.is_isolated() => {
                resolved.network.type_ = NETWORK_TYPE_ISOLATED.to_string();
            }
            None => {
                return Err(Error::invariant(format!(
                    "shared network {} not found in zone {}",
                    resolved.network.name, resolved.name
                )));
            }
        }
        Ok(resolved)
    }

    /// Find the isolated network by name, creating it when absent
    ///
    /// Never creates a second network for the same name: a create that
    /// loses a race re-resolves the winner by name.
    pub async fn get_or_create_isolated_network(
        &self,
        fd: &CloudStackFailureDomainSpec,
        desired: &CloudStackIsolatedNetworkSpec,
    ) -> Result<ExternalResourceRef> {
        let zone_id = &fd.zone.id;

        if let Some(found) = self
            .cloud
            .find_network_by_name(zone_id, &desired.name)
            .await?
        {
            if !desired.id.is_empty() && desired.id != found.id {
                return Err(Error::invariant(format!(
                    "network {} has id {} but {} is recorded",
                    desired.name, found.id, desired.id
                )));
            }
            debug!(network = %desired.name, id = %found.id, "adopting existing network");
            return Ok(ExternalResourceRef {
                id: found.id,
                name: found.name,
            });
        }

        if !desired.id.is_empty() {
            return match self.cloud.find_network_by_id(&desired.id).await? {
                Some(found) => Ok(ExternalResourceRef {
                    id: found.id,
                    name: found.name,
                }),
                None => Err(Error::invariant(format!(
                    "network {} ({}) no longer exists in CloudStack",
                    desired.name, desired.id
                ))),
            };
        }

        let request = CreateNetworkRequest {
            name: desired.name.clone(),
            zone_id: zone_id.clone(),
            offering: ISOLATED_NETWORK_OFFERING.to_string(),
            gateway: non_empty(&desired.gateway),
            netmask: non_empty(&desired.netmask),
            account: non_empty(&fd.account),
            domain: non_empty(&fd.domain),
        };
        let created = match self.cloud.create_network(&request).await {
            Ok(created) => created,
            Err(e) if e.is_already_exists() => {
                warn!(network = %desired.name, "network created concurrently, re-resolving");
                self.cloud
                    .find_network_by_name(zone_id, &desired.name)
                    .await?
                    .ok_or_else(|| e.with_context("re-resolving isolated network"))?
            }
            Err(e) => return Err(e.with_context("creating isolated network")),
        };

        self.add_created_by_tag(ResourceType::Network, &created.id)
            .await?;
        info!(network = %created.name, id = %created.id, "created isolated network");
        Ok(ExternalResourceRef {
            id: created.id,
            name: created.name,
        })
    }

    /// Associate the cluster's public IP with the isolated network
    ///
    /// A non-empty `desired_host` names the address to use. Otherwise an
    /// address already on the network is reused, preferring one tagged for
    /// this cluster, and a fresh one is allocated only when none exists.
    pub async fn associate_public_ip_address(
        &self,
        fd: &CloudStackFailureDomainSpec,
        network_id: &str,
        cluster: &CloudStackCluster,
        desired_host: &str,
    ) -> Result<PublicIpAddress> {
        if !desired_host.is_empty() {
            let query = IpAddressQuery {
                zone_id: fd.zone.id.clone(),
                address: Some(desired_host.to_string()),
                network_id: None,
            };
            let ip = self
                .cloud
                .list_public_ip_addresses(&query)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| {
                    Error::invariant(format!(
                        "public IP {desired_host} not found in zone {}",
                        fd.zone.name
                    ))
                })?;
            if ip.network_id.as_deref() == Some(network_id) {
                return Ok(ip);
            }
            return self
                .cloud
                .associate_ip_address(&AssociateIpRequest {
                    network_id: network_id.to_string(),
                    address: Some(ip.address),
                })
                .await
                .map_err(|e| e.with_context("associating requested public IP"));
        }

        let query = IpAddressQuery {
            zone_id: fd.zone.id.clone(),
            address: None,
            network_id: Some(network_id.to_string()),
        };
        let candidates: Vec<_> = self
            .cloud
            .list_public_ip_addresses(&query)
            .await?
            .into_iter()
            .filter(|ip| !ip.is_source_nat)
            .collect();

        let tag = super::cluster_tag_key(cluster.uid());
        for ip in &candidates {
            let tags = self
                .cloud
                .list_tags(ResourceType::PublicIpAddress, &ip.id)
                .await?;
            if tags.contains_key(&tag) {
                return Ok(ip.clone());
            }
        }
        if let Some(ip) = candidates.into_iter().next() {
            debug!(address = %ip.address, "reusing untagged public IP on network");
            return Ok(ip);
        }

        let ip = self
            .cloud
            .associate_ip_address(&AssociateIpRequest {
                network_id: network_id.to_string(),
                address: None,
            })
            .await
            .map_err(|e| e.with_context("allocating public IP"))?;
        self.add_created_by_tag(ResourceType::PublicIpAddress, &ip.id)
            .await?;
        info!(address = %ip.address, network_id, "allocated public IP");
        Ok(ip)
    }

    /// Make the network's load-balancer rules match the cluster spec
    ///
    /// One rule per required port on the network's public IP. Rules on
    /// another IP, on ports no longer required, or duplicating a kept rule
    /// are deleted. Matching rules are left alone.
    pub async fn reconcile_load_balancer(
        &self,
        network: &CloudStackIsolatedNetwork,
        cluster: &CloudStackCluster,
    ) -> Result<Vec<LoadBalancerRule>> {
        let network_id = &network.spec.id;
        let public_ip_id = network
            .status
            .as_ref()
            .map(|s| s.public_ip_id.as_str())
            .unwrap_or_default();
        if network_id.is_empty() || public_ip_id.is_empty() {
            return Err(Error::invariant(format!(
                "isolated network {} has no id or public IP yet",
                network.spec.name
            )));
        }

        let required = cluster.spec.load_balancer_ports();
        let cidrs = cluster
            .spec
            .api_server_load_balancer
            .as_ref()
            .map(|lb| lb.allowed_cidrs.clone())
            .unwrap_or_default();

        let mut kept: Vec<LoadBalancerRule> = Vec::new();
        for rule in self.cloud.list_load_balancer_rules(network_id).await? {
            let wanted = rule.public_ip_id == public_ip_id
                && rule.private_port == rule.public_port
                && required.contains(&rule.public_port)
                && !kept.iter().any(|k| k.public_port == rule.public_port);
            if wanted {
                kept.push(rule);
                continue;
            }
            info!(rule = %rule.name, port = rule.public_port, "deleting stale load-balancer rule");
            ignore_not_found(self.cloud.delete_load_balancer_rule(&rule.id).await)?;
        }

        for port in required {
            if kept.iter().any(|k| k.public_port == port) {
                continue;
            }
            let request = CreateLoadBalancerRuleRequest {
                name: load_balancer_rule_name(port),
                public_ip_id: public_ip_id.to_string(),
                network_id: network_id.clone(),
                public_port: port,
                private_port: port,
                cidrs: cidrs.clone(),
            };
            let rule = self
                .cloud
                .create_load_balancer_rule(&request)
                .await
                .map_err(|e| e.with_context("creating load-balancer rule"))?;
            info!(rule = %rule.name, port, "created load-balancer rule");
            kept.push(rule);
        }

        Ok(kept)
    }

    /// Tear down the network's load-balancer rules, public IP and network
    ///
    /// Runs in that order. Each step treats "not found" as already done.
    /// The IP and the network are only released when no other cluster uses
    /// them and the provider created them.
    pub async fn dispose_iso_net_resources(
        &self,
        network: &CloudStackIsolatedNetwork,
        cluster: &CloudStackCluster,
    ) -> Result<()> {
        let network_id = network.spec.id.as_str();
        let public_ip_id = network
            .status
            .as_ref()
            .map(|s| s.public_ip_id.as_str())
            .unwrap_or_default();

        if !network_id.is_empty() {
            let rules = ignore_not_found(self.cloud.list_load_balancer_rules(network_id).await)?
                .unwrap_or_default();
            for rule in rules
                .iter()
                .filter(|r| public_ip_id.is_empty() || r.public_ip_id == public_ip_id)
            {
                ignore_not_found(self.cloud.delete_load_balancer_rule(&rule.id).await)?;
            }
        }

        if !public_ip_id.is_empty() {
            self.delete_cluster_tag(ResourceType::PublicIpAddress, public_ip_id, cluster)
                .await?;
            if self
                .tags_allow_disposal(ResourceType::PublicIpAddress, public_ip_id)
                .await?
            {
                ignore_not_found(self.cloud.disassociate_ip_address(public_ip_id).await)?;
                info!(public_ip_id, "released public IP");
            }
        }

        if !network_id.is_empty() {
            self.delete_cluster_tag(ResourceType::Network, network_id, cluster)
                .await?;
            if self
                .tags_allow_disposal(ResourceType::Network, network_id)
                .await?
            {
                ignore_not_found(self.cloud.delete_network(network_id).await)?;
                info!(network_id, "deleted isolated network");
            }
        }

        Ok(())
    }
}
