//! Typed views of the JSON policy blobs.

use std::{collections::HashSet, time::Duration};

use indexmap::IndexMap;
use serde::Deserialize;
use tracing::debug;

/// Kind of key an access-list entry refers to.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Registry address.
    Hotkey,
    /// Owning account.
    Coldkey,
    /// Anything else; ignored.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct AccessEntry {
    #[serde(rename = "type")]
    kind: KeyType,
}

/// Access list partitioned by key type.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessList {
    /// Listed hotkeys.
    pub hotkeys: HashSet<String>,
    /// Listed coldkeys.
    pub coldkeys: HashSet<String>,
}

impl AccessList {
    /// Parses `{ "<identity>": { "type": "hotkey" | "coldkey", ... } }`.
    ///
    /// # Errors
    /// Returns the JSON error when the blob does not have that shape.
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        let entries: IndexMap<String, AccessEntry> = serde_json::from_slice(raw)?;
        let mut list = Self::default();
        for (identity, entry) in entries {
            match entry.kind {
                KeyType::Hotkey => {
                    list.hotkeys.insert(identity);
                }
                KeyType::Coldkey => {
                    list.coldkeys.insert(identity);
                }
                KeyType::Unknown => debug!(%identity, "ignoring access entry of unknown type"),
            }
        }
        Ok(list)
    }
}

/// Parses the reward-weight blob, dropping labels that contain `manual` and
/// keeping the remaining values in document order.
///
/// # Errors
/// Returns the JSON error when the blob is not a label → number map.
pub fn parse_reward_weights(raw: &[u8]) -> Result<Vec<f32>, serde_json::Error> {
    let labelled: IndexMap<String, f32> = serde_json::from_slice(raw)?;
    Ok(labelled
        .into_iter()
        .filter(|(label, _)| !label.contains("manual"))
        .map(|(_, weight)| weight)
        .collect())
}

/// Timing settings blob; absent fields fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct SettingsBlob {
    /// Seconds between validator requests.
    #[serde(default)]
    pub request_frequency: Option<u64>,
    /// Seconds before a query times out.
    #[serde(default)]
    pub query_timeout: Option<u64>,
}

impl SettingsBlob {
    /// Default request frequency.
    pub const DEFAULT_REQUEST_FREQUENCY: Duration = Duration::from_secs(35);
    /// Default query timeout.
    pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Parses the blob.
    ///
    /// # Errors
    /// Returns the JSON error on malformed input.
    pub fn parse(raw: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(raw)
    }

    /// Request frequency with the default applied.
    #[must_use]
    pub fn request_frequency(&self) -> Duration {
        self.request_frequency
            .map_or(Self::DEFAULT_REQUEST_FREQUENCY, Duration::from_secs)
    }

    /// Query timeout with the default applied.
    #[must_use]
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
            .map_or(Self::DEFAULT_QUERY_TIMEOUT, Duration::from_secs)
    }
}
