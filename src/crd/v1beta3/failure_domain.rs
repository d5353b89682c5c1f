//! CloudStackFailureDomain

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::crd::types::{SecretRef, Zone};

/// Specification for a CloudStackFailureDomain
///
/// A failure domain names a zone, the network inside it and the secret
/// holding the credentials used for every CloudStack call made on its behalf.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "infrastructure.cluster.x-k8s.io",
    version = "v1beta3",
    kind = "CloudStackFailureDomain",
    plural = "cloudstackfailuredomains",
    shortname = "csfd",
    status = "CloudStackFailureDomainStatus",
    derive = "PartialEq",
    namespaced,
    printcolumn = r#"{"name":"Zone","type":"string","jsonPath":".spec.zone.name"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackFailureDomainSpec {
    /// Failure domain name, unique within a cluster
    pub name: String,

    /// Zone and network
    pub zone: Zone,

    /// CloudStack account machines are created under
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account: String,

    /// CloudStack domain of the account
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,

    /// Secret with `api-url`, `api-key`, `secret-key` and `verify-ssl`
    pub acs_endpoint: SecretRef,
}

/// Status for a CloudStackFailureDomain
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStackFailureDomainStatus {
    /// Zone and network are resolved
    #[serde(default)]
    pub ready: bool,

    /// Last invariant violation, cleared on success
    #[serde(default)]
    pub failure_message: Option<String>,
}

impl CloudStackFailureDomain {
    /// True if the failure domain status reports ready
    pub fn is_ready(&self) -> bool {
        self.status.as_ref().map(|s| s.ready).unwrap_or(false)
    }
}

/// Object name for a failure domain owned by a cluster
///
/// Kubernetes names are lower-case, CloudStack failure domain names need not be.
pub fn failure_domain_object_name(cluster_name: &str, fd_name: &str) -> String {
    format!("{}-{}", cluster_name, fd_name.to_ascii_lowercase().replace('_', "-"))
}
