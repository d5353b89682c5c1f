//! Conversion-data stash
//!
//! The stash is the hub object serialized without metadata and stored in
//! the `cluster.x-k8s.io/conversion-data` annotation of a spoke object.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Result, CONVERSION_DATA_ANNOTATION};

/// Parsed stash payload
#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "S: DeserializeOwned, T: DeserializeOwned"))]
pub struct HubStash<S, T> {
    /// Hub spec at down-conversion time
    pub spec: S,
    /// Hub status at down-conversion time
    #[serde(default)]
    pub status: Option<T>,
}

/// Serialize `hub` into the stash annotation on `metadata`
///
/// Any previous stash is replaced.
pub fn marshal_stash<H: Serialize>(hub: &H, metadata: &mut ObjectMeta) -> Result<()> {
    let mut value = serde_json::to_value(hub)?;
    if let Some(map) = value.as_object_mut() {
        map.remove("metadata");
    }
    let data = serde_json::to_string(&value)?;
    metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(CONVERSION_DATA_ANNOTATION.to_string(), data);
    Ok(())
}

/// Remove the stash annotation from `metadata` and parse it
///
/// Returns `None` when there is no stash or it cannot be parsed; a broken
/// stash is logged and otherwise ignored. An annotation map left empty is
/// dropped so that objects without annotations round-trip unchanged.
pub fn take_stash<S, T>(metadata: &mut ObjectMeta) -> Option<HubStash<S, T>>
where
    S: DeserializeOwned,
    T: DeserializeOwned,
{
    let annotations = metadata.annotations.as_mut()?;
    let raw = annotations.remove(CONVERSION_DATA_ANNOTATION);
    if annotations.is_empty() {
        metadata.annotations = None;
    }
    let raw = raw?;

    match serde_json::from_str::<HubStash<S, T>>(&raw) {
        Ok(stash) => Some(stash),
        Err(error) => {
            warn!(
                name = metadata.name.as_deref().unwrap_or_default(),
                %error,
                "ignoring malformed conversion data"
            );
            None
        }
    }
}
