//! Ownership tags
//!
//! Every resource the provider uses carries `CAPC_cluster_<uid>` for each
//! cluster using it. Resources the provider created also carry
//! `created_by_CAPC`. A resource is only released once no cluster tag is
//! left and it was created by the provider, so shared and pre-existing
//! resources are never deleted.

use std::collections::BTreeMap;

use tracing::debug;

use super::{ignore_not_found, LifecycleManager, ResourceType};
use crate::crd::CloudStackCluster;
use crate::Result;

/// Prefix of per-cluster ownership tags
pub const CLUSTER_TAG_PREFIX: &str = "CAPC_cluster_";

/// Tag marking resources created by the provider
pub const CREATED_BY_TAG: &str = "created_by_CAPC";

/// Ownership tag key for a cluster UID
pub fn cluster_tag_key(cluster_uid: &str) -> String {
    format!("{CLUSTER_TAG_PREFIX}{cluster_uid}")
}

fn single(key: String) -> BTreeMap<String, String> {
    BTreeMap::from([(key, "1".to_string())])
}

impl LifecycleManager {
    /// Tag a resource as used by `cluster`
    ///
    /// Existing tags are checked first; a duplicate-tag error from a racing
    /// writer counts as success.
    pub async fn add_cluster_tag(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        cluster: &CloudStackCluster,
    ) -> Result<()> {
        let key = cluster_tag_key(cluster.uid());
        let existing = self.cloud.list_tags(resource_type, resource_id).await?;
        if existing.contains_key(&key) {
            return Ok(());
        }

        match self
            .cloud
            .create_tags(resource_type, resource_id, &single(key))
            .await
        {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    /// Mark a resource as created by the provider
    pub async fn add_created_by_tag(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<()> {
        match self
            .cloud
            .create_tags(resource_type, resource_id, &single(CREATED_BY_TAG.to_string()))
            .await
        {
            Err(e) if e.is_already_exists() => Ok(()),
            other => other,
        }
    }

    /// Remove `cluster`'s ownership tag, tolerating a missing resource
    pub async fn delete_cluster_tag(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
        cluster: &CloudStackCluster,
    ) -> Result<()> {
        let key = cluster_tag_key(cluster.uid());
        let listed = self.cloud.list_tags(resource_type, resource_id).await;
        let Some(existing) = ignore_not_found(listed)? else {
            return Ok(());
        };
        if !existing.contains_key(&key) {
            return Ok(());
        }
        ignore_not_found(
            self.cloud
                .delete_tags(resource_type, resource_id, &single(key))
                .await,
        )?;
        Ok(())
    }

    /// True if the provider created the resource and no cluster uses it
    pub async fn tags_allow_disposal(
        &self,
        resource_type: ResourceType,
        resource_id: &str,
    ) -> Result<bool> {
        let Some(tags) = ignore_not_found(self.cloud.list_tags(resource_type, resource_id).await)?
        else {
            return Ok(false);
        };
        let created_by_us = tags.contains_key(CREATED_BY_TAG);
        let in_use = tags.keys().any(|k| k.starts_with(CLUSTER_TAG_PREFIX));
        debug!(
            resource_type = %resource_type,
            resource_id,
            created_by_us,
            in_use,
            "checked disposal tags"
        );
        Ok(created_by_us && !in_use)
    }
}
