//! Hub-and-spoke version conversion
//!
//! Every non-hub version converts to and from the hub. Fields shared by both
//! sides are mapped generically through their serde representation. Fields
//! only the hub can express survive a down-conversion in the conversion-data
//! stash annotation and are restored from it on the next up-conversion.

mod cluster;
mod dispatch;
mod machine;
mod stash;

pub use dispatch::{convert_object, HubObject, VersionedObject};
pub use stash::{marshal_stash, take_stash, HubStash};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::Result;

/// A spoke version that converts losslessly through the hub
pub trait Convertible: Sized {
    /// Hub type for this kind
    type Hub;

    /// Up-convert to the hub, restoring hub-only fields from the stash
    fn convert_to(&self) -> Result<Self::Hub>;

    /// Down-convert from the hub, stashing the hub on the result
    ///
    /// `prior` is the previous representation of the object at this
    /// version, when known. Spoke-only fields are taken from it.
    fn convert_from(hub: &Self::Hub, prior: Option<&Self>) -> Result<Self>;
}

/// Map the fields common to two representations
///
/// Fields absent on the target are dropped; fields absent on the source
/// take the target's serde default.
pub(crate) fn map_fields<S: Serialize, T: DeserializeOwned>(source: &S) -> Result<T> {
    let value = serde_json::to_value(source)?;
    serde_json::from_value(value).map_err(|e| crate::Error::conversion(e.to_string()))
}

/// [`map_fields`] for optional sections such as status
pub(crate) fn map_optional<S: Serialize, T: DeserializeOwned>(
    source: Option<&S>,
) -> Result<Option<T>> {
    source.map(map_fields).transpose()
}
