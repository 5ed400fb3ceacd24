use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize};

use crate::CoreError;

/// An explicit `null` reads the same as an absent field.
fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Option::unwrap_or_default)
}

/// How a single ref moved. Parsed for completeness; forwarding treats every
/// kind the same.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateType {
    Create,
    UpdateFastForward,
    UpdateNonFastForward,
    Delete,
    /// Absent, or a value this build does not know about.
    #[default]
    #[serde(other)]
    Unspecified,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdate {
    #[serde(default, deserialize_with = "nullable")]
    pub ref_name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub update_type: UpdateType,
    #[serde(default, deserialize_with = "nullable")]
    pub old_id: String,
    #[serde(default, deserialize_with = "nullable")]
    pub new_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefUpdateEvent {
    #[serde(default, deserialize_with = "nullable")]
    pub email: String,
    /// Keyed by ref name. Iteration order is unspecified.
    #[serde(default, deserialize_with = "nullable")]
    pub ref_updates: HashMap<String, RefUpdate>,
}

/// A Cloud Source Repositories push notification as delivered over Pub/Sub.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(default, deserialize_with = "nullable")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable")]
    pub url: String,
    #[serde(default, deserialize_with = "nullable")]
    pub event_time: String,
    #[serde(default, deserialize_with = "nullable")]
    pub ref_update_event: RefUpdateEvent,
}

impl Notification {
    /// Decode a raw message payload. Unknown fields are ignored and missing
    /// ones fall back to empty values; anything that is not a JSON object of
    /// the expected shape is rejected.
    pub fn parse(data: &[u8]) -> Result<Self, CoreError> {
        Ok(serde_json::from_slice(data)?)
    }

    pub fn ref_updates(&self) -> impl Iterator<Item = &RefUpdate> {
        self.ref_update_event.ref_updates.values()
    }

    pub fn is_empty(&self) -> bool {
        self.ref_update_event.ref_updates.is_empty()
    }
}
