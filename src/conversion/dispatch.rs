//! Version dispatch for untyped objects
//!
//! The conversion webhook receives objects as raw JSON. They are decoded
//! into a closed set of known (apiVersion, kind) pairs through a lookup
//! table; anything else is rejected.

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::Convertible;
use crate::crd::{v1beta1, v1beta2, v1beta3 as hub};
use crate::{Error, Result};

/// An object at one of the served versions
#[derive(Clone, Debug, PartialEq)]
pub enum VersionedObject {
    /// CloudStackCluster at v1beta1
    ClusterV1beta1(Box<v1beta1::CloudStackCluster>),
    /// CloudStackCluster at v1beta2
    ClusterV1beta2(Box<v1beta2::CloudStackCluster>),
    /// CloudStackMachine at v1beta1
    MachineV1beta1(Box<v1beta1::CloudStackMachine>),
    /// Any kind at the hub version
    Hub(HubObject),
}

/// An object at the hub version
#[derive(Clone, Debug, PartialEq)]
pub enum HubObject {
    /// CloudStackCluster
    Cluster(Box<hub::CloudStackCluster>),
    /// CloudStackFailureDomain
    FailureDomain(Box<hub::CloudStackFailureDomain>),
    /// CloudStackIsolatedNetwork
    IsolatedNetwork(Box<hub::CloudStackIsolatedNetwork>),
    /// CloudStackMachine
    Machine(Box<hub::CloudStackMachine>),
}

type Decoder = fn(Value) -> Result<VersionedObject>;

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::conversion(e.to_string()))
}

fn cluster_v1beta1(v: Value) -> Result<VersionedObject> {
    Ok(VersionedObject::ClusterV1beta1(Box::new(decode(v)?)))
}

fn cluster_v1beta2(v: Value) -> Result<VersionedObject> {
    Ok(VersionedObject::ClusterV1beta2(Box::new(decode(v)?)))
}

fn machine_v1beta1(v: Value) -> Result<VersionedObject> {
    Ok(VersionedObject::MachineV1beta1(Box::new(decode(v)?)))
}

fn hub_cluster(v: Value) -> Result<VersionedObject> {
    Ok(VersionedObject::Hub(HubObject::Cluster(Box::new(decode(v)?))))
}

fn hub_failure_domain(v: Value) -> Result<VersionedObject> {
    Ok(VersionedObject::Hub(HubObject::FailureDomain(Box::new(decode(v)?))))
}

fn hub_isolated_network(v: Value) -> Result<VersionedObject> {
    Ok(VersionedObject::Hub(HubObject::IsolatedNetwork(Box::new(decode(v)?))))
}

fn hub_machine(v: Value) -> Result<VersionedObject> {
    Ok(VersionedObject::Hub(HubObject::Machine(Box::new(decode(v)?))))
}

const DECODERS: &[(&str, &str, Decoder)] = &[
    (v1beta1::API_VERSION, "CloudStackCluster", cluster_v1beta1),
    (v1beta2::API_VERSION, "CloudStackCluster", cluster_v1beta2),
    (v1beta1::API_VERSION, "CloudStackMachine", machine_v1beta1),
    (hub::API_VERSION, "CloudStackCluster", hub_cluster),
    (hub::API_VERSION, "CloudStackFailureDomain", hub_failure_domain),
    (hub::API_VERSION, "CloudStackIsolatedNetwork", hub_isolated_network),
    (hub::API_VERSION, "CloudStackMachine", hub_machine),
];

impl VersionedObject {
    /// Decode a raw object by its apiVersion and kind
    pub fn decode(value: Value) -> Result<Self> {
        let api_version = value
            .get("apiVersion")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let decoder = DECODERS
            .iter()
            .find(|(v, k, _)| *v == api_version && *k == kind)
            .map(|(_, _, d)| *d)
            .ok_or_else(|| {
                Error::conversion(format!("unsupported object {kind} at {api_version}"))
            })?;
        decoder(value)
    }

    /// Up-convert to the hub
    pub fn into_hub(self) -> Result<HubObject> {
        Ok(match self {
            Self::ClusterV1beta1(c) => HubObject::Cluster(Box::new(c.convert_to()?)),
            Self::ClusterV1beta2(c) => HubObject::Cluster(Box::new(c.convert_to()?)),
            Self::MachineV1beta1(m) => HubObject::Machine(Box::new(m.convert_to()?)),
            Self::Hub(hub) => hub,
        })
    }

    /// Serialize including apiVersion and kind
    pub fn into_value(self) -> Result<Value> {
        let value = match self {
            Self::ClusterV1beta1(c) => serde_json::to_value(*c)?,
            Self::ClusterV1beta2(c) => serde_json::to_value(*c)?,
            Self::MachineV1beta1(m) => serde_json::to_value(*m)?,
            Self::Hub(HubObject::Cluster(c)) => serde_json::to_value(*c)?,
            Self::Hub(HubObject::FailureDomain(fd)) => serde_json::to_value(*fd)?,
            Self::Hub(HubObject::IsolatedNetwork(n)) => serde_json::to_value(*n)?,
            Self::Hub(HubObject::Machine(m)) => serde_json::to_value(*m)?,
        };
        Ok(value)
    }
}

impl HubObject {
    /// Down-convert to the given apiVersion
    ///
    /// A conversion review carries only the object being converted, so no
    /// prior spoke representation is available here. Spoke-only fields such
    /// as a v1beta1 machine's zoneID and zoneName come back empty.
    pub fn into_version(self, api_version: &str) -> Result<VersionedObject> {
        if api_version == hub::API_VERSION {
            return Ok(VersionedObject::Hub(self));
        }
        match (self, api_version) {
            (Self::Cluster(c), v1beta2::API_VERSION) => Ok(VersionedObject::ClusterV1beta2(
                Box::new(v1beta2::CloudStackCluster::convert_from(&c, None)?),
            )),
            (Self::Cluster(c), v1beta1::API_VERSION) => Ok(VersionedObject::ClusterV1beta1(
                Box::new(v1beta1::CloudStackCluster::convert_from(&c, None)?),
            )),
            (Self::Machine(m), v1beta1::API_VERSION) => Ok(VersionedObject::MachineV1beta1(
                Box::new(v1beta1::CloudStackMachine::convert_from(&m, None)?),
            )),
            (other, _) => Err(Error::conversion(format!(
                "{} is not served at {api_version}",
                other.kind()
            ))),
        }
    }

    /// Kind name
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Cluster(_) => "CloudStackCluster",
            Self::FailureDomain(_) => "CloudStackFailureDomain",
            Self::IsolatedNetwork(_) => "CloudStackIsolatedNetwork",
            Self::Machine(_) => "CloudStackMachine",
        }
    }
}

/// Convert a raw object to `desired_api_version` through the hub
///
/// Objects already at the desired version are returned unchanged.
pub fn convert_object(object: Value, desired_api_version: &str) -> Result<Value> {
    if object.get("apiVersion").and_then(Value::as_str) == Some(desired_api_version) {
        return Ok(object);
    }
    VersionedObject::decode(object)?
        .into_hub()?
        .into_version(desired_api_version)?
        .into_value()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn v1beta2_cluster() -> Value {
        json!({
            "apiVersion": v1beta2::API_VERSION,
            "kind": "CloudStackCluster",
            "metadata": {"name": "mycluster", "namespace": "default"},
            "spec": {
                "controlPlaneEndpoint": {"host": "10.0.0.1", "port": 6443},
                "failureDomains": []
            }
        })
    }

    #[test]
    fn converts_spoke_to_hub() {
        let out = convert_object(v1beta2_cluster(), hub::API_VERSION).unwrap();
        assert_eq!(out["apiVersion"], hub::API_VERSION);
        assert_eq!(out["kind"], "CloudStackCluster");
        assert_eq!(out["spec"]["apiServerLoadBalancer"]["enabled"], true);
        assert_eq!(out["spec"]["controlPlaneEndpoint"]["host"], "10.0.0.1");
    }

    #[test]
    fn converts_spoke_to_spoke_through_hub() {
        let out = convert_object(v1beta2_cluster(), v1beta1::API_VERSION).unwrap();
        assert_eq!(out["apiVersion"], v1beta1::API_VERSION);
        assert!(out["metadata"]["annotations"][crate::CONVERSION_DATA_ANNOTATION].is_string());
    }

    #[test]
    fn spoke_only_machine_fields_are_empty_after_a_review_round_trip() {
        let machine = json!({
            "apiVersion": v1beta1::API_VERSION,
            "kind": "CloudStackMachine",
            "metadata": {"name": "cp-0", "namespace": "default"},
            "spec": {
                "offering": {"name": "Large"},
                "template": {"name": "ubuntu"},
                "zoneID": "zone-1",
                "zoneName": "zone1"
            }
        });
        let hub = convert_object(machine, hub::API_VERSION).unwrap();
        let down = convert_object(hub, v1beta1::API_VERSION).unwrap();

        assert_eq!(down["spec"]["offering"]["name"], "Large");
        assert!(down["spec"].get("zoneID").is_none());
        assert!(down["spec"].get("zoneName").is_none());
    }

    #[test]
    fn same_version_is_passed_through() {
        let input = v1beta2_cluster();
        let out = convert_object(input.clone(), v1beta2::API_VERSION).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let err = convert_object(
            json!({
                "apiVersion": v1beta1::API_VERSION,
                "kind": "CloudStackAffinityGroup",
                "metadata": {"name": "ag"}
            }),
            hub::API_VERSION,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported object CloudStackAffinityGroup"));
    }

    #[test]
    fn hub_only_kind_cannot_be_down_converted() {
        let err = convert_object(
            json!({
                "apiVersion": hub::API_VERSION,
                "kind": "CloudStackIsolatedNetwork",
                "metadata": {"name": "net", "namespace": "default"},
                "spec": {"name": "isolated-network-mycluster", "failureDomainName": "fd1"}
            }),
            v1beta1::API_VERSION,
        )
        .unwrap_err();
        assert!(err.to_string().contains("not served at"));
    }
}
