//! CloudStackCluster conversions
//!
//! The API server load balancer settings are the only hub-only field.

use tracing::debug;

use super::{map_fields, map_optional, marshal_stash, take_stash, Convertible};
use crate::crd::{v1beta1, v1beta2, v1beta3 as hub, ApiServerLoadBalancer};
use crate::Result;

type ClusterStash = super::HubStash<hub::CloudStackClusterSpec, hub::CloudStackClusterStatus>;

impl Convertible for v1beta2::CloudStackCluster {
    type Hub = hub::CloudStackCluster;

    fn convert_to(&self) -> Result<Self::Hub> {
        let mut metadata = self.metadata.clone();
        let stash: Option<ClusterStash> = take_stash(&mut metadata);
        let mut spec: hub::CloudStackClusterSpec = map_fields(&self.spec)?;
        let status = map_optional(self.status.as_ref())?;

        spec.api_server_load_balancer = match stash {
            Some(stash) => stash.spec.api_server_load_balancer,
            // v1beta2 clusters always had a load balancer
            None => {
                debug!(
                    name = metadata.name.as_deref().unwrap_or_default(),
                    "no conversion data, enabling API server load balancer"
                );
                Some(ApiServerLoadBalancer {
                    enabled: true,
                    ..Default::default()
                })
            }
        };

        Ok(hub::CloudStackCluster {
            metadata,
            spec,
            status,
        })
    }

    fn convert_from(hub: &Self::Hub, _prior: Option<&Self>) -> Result<Self> {
        let mut metadata = hub.metadata.clone();
        marshal_stash(hub, &mut metadata)?;
        Ok(Self {
            metadata,
            spec: map_fields(&hub.spec)?,
            status: map_optional(hub.status.as_ref())?,
        })
    }
}

impl Convertible for v1beta1::CloudStackCluster {
    type Hub = hub::CloudStackCluster;

    fn convert_to(&self) -> Result<Self::Hub> {
        let mut metadata = self.metadata.clone();
        let stash: Option<ClusterStash> = take_stash(&mut metadata);
        let mut spec: hub::CloudStackClusterSpec = map_fields(&self.spec)?;
        if let Some(stash) = stash {
            spec.api_server_load_balancer = stash.spec.api_server_load_balancer;
        }

        Ok(hub::CloudStackCluster {
            metadata,
            spec,
            status: map_optional(self.status.as_ref())?,
        })
    }

    fn convert_from(hub: &Self::Hub, _prior: Option<&Self>) -> Result<Self> {
        let mut metadata = hub.metadata.clone();
        marshal_stash(hub, &mut metadata)?;
        Ok(Self {
            metadata,
            spec: map_fields(&hub.spec)?,
            status: map_optional(hub.status.as_ref())?,
        })
    }
}
