//! Policy state refreshed from the configuration store.
//!
//! [`ConfigCache`] holds an `Arc<PolicySnapshot>`. A refresh builds a complete new
//! snapshot off to the side and swaps the pointer, so a reader sees either the old
//! generation or the new one and never a mix of both.

/// Blob parsers.
pub mod blobs;

use std::{collections::HashSet, sync::Arc, time::Duration};

use blobs::{parse_reward_weights, AccessList, SettingsBlob};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::{
    options::NodeKind,
    store::{ConfigStore, StoreError},
};

/// Why a refresh was abandoned.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A blob could not be downloaded.
    #[error("fetching {key}: {source}")]
    Fetch {
        /// Object key.
        key: String,
        /// Store error.
        #[source]
        source: StoreError,
    },
    /// A blob did not parse.
    #[error("parsing {key}: {source}")]
    Malformed {
        /// Object key.
        key: String,
        /// Parse error.
        #[source]
        source: serde_json::Error,
    },
}

/// One complete generation of policy values.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PolicySnapshot {
    /// Refresh counter; `0` before the first successful refresh.
    pub generation: u64,
    /// When this generation was installed.
    pub refreshed_at: Option<DateTime<Utc>>,
    /// Denied hotkeys.
    pub hotkey_blacklist: HashSet<String>,
    /// Denied coldkeys.
    pub coldkey_blacklist: HashSet<String>,
    /// Allowed hotkeys.
    pub hotkey_whitelist: HashSet<String>,
    /// Allowed coldkeys.
    pub coldkey_whitelist: HashSet<String>,
    /// Reward weighting, `manual` labels excluded.
    pub reward_weights: Vec<f32>,
    /// Interval between validator requests.
    pub request_frequency: Duration,
    /// Per-query deadline.
    pub query_timeout: Duration,
}

impl Default for PolicySnapshot {
    fn default() -> Self {
        Self {
            generation: 0,
            refreshed_at: None,
            hotkey_blacklist: HashSet::new(),
            coldkey_blacklist: HashSet::new(),
            hotkey_whitelist: HashSet::new(),
            coldkey_whitelist: HashSet::new(),
            reward_weights: Vec::new(),
            request_frequency: SettingsBlob::DEFAULT_REQUEST_FREQUENCY,
            query_timeout: SettingsBlob::DEFAULT_QUERY_TIMEOUT,
        }
    }
}

impl PolicySnapshot {
    /// Whether either key is denied.
    #[must_use]
    pub fn is_blacklisted(&self, hotkey: &str, coldkey: &str) -> bool {
        self.hotkey_blacklist.contains(hotkey) || self.coldkey_blacklist.contains(coldkey)
    }

    /// Whether either key is explicitly allowed.
    #[must_use]
    pub fn is_whitelisted(&self, hotkey: &str, coldkey: &str) -> bool {
        self.hotkey_whitelist.contains(hotkey) || self.coldkey_whitelist.contains(coldkey)
    }
}

/// Shared handle to the current policy generation.
#[derive(Debug, Clone, Default)]
pub struct ConfigCache {
    current: Arc<RwLock<Arc<PolicySnapshot>>>,
}

impl ConfigCache {
    /// Cache holding the default snapshot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation. The lock is held only for the pointer clone.
    #[must_use]
    pub fn read(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&*self.current.read())
    }

    /// Installs `snapshot` as the next generation and returns its number.
    pub fn replace(&self, mut snapshot: PolicySnapshot) -> u64 {
        let mut current = self.current.write();
        snapshot.generation = current.generation + 1;
        snapshot.refreshed_at = Some(Utc::now());
        let generation = snapshot.generation;
        *current = Arc::new(snapshot);
        generation
    }
}

/// Object keys of the four policy blobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobKeys {
    /// Bucket holding the blobs.
    pub bucket: String,
    /// Deny list.
    pub blacklist: String,
    /// Allow list.
    pub whitelist: String,
    /// Reward weights.
    pub weights: String,
    /// Timing settings.
    pub settings: String,
}

impl BlobKeys {
    /// Keys followed by nodes of `kind`.
    #[must_use]
    pub fn for_kind(kind: NodeKind, bucket: impl Into<String>) -> Self {
        let role = kind.as_str();
        Self {
            bucket: bucket.into(),
            blacklist: format!("{role}_blacklist.json"),
            whitelist: format!("{role}_whitelist.json"),
            weights: "validator_weights.json".into(),
            settings: format!("{role}_settings.json"),
        }
    }
}

/// Downloads and parses all four blobs into a snapshot.
#[derive(Clone)]
pub struct PolicyLoader {
    store: Arc<dyn ConfigStore>,
    keys: BlobKeys,
}

impl std::fmt::Debug for PolicyLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyLoader")
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl PolicyLoader {
    /// Creates a loader.
    #[must_use]
    pub fn new(store: Arc<dyn ConfigStore>, keys: BlobKeys) -> Self {
        Self { store, keys }
    }

    /// Keys this loader fetches.
    #[must_use]
    pub const fn keys(&self) -> &BlobKeys {
        &self.keys
    }

    /// Builds a complete snapshot, or fails without partial results.
    ///
    /// # Errors
    /// Returns the first fetch or parse failure.
    pub async fn load(&self) -> Result<PolicySnapshot, PolicyError> {
        let blacklist = self
            .parse(&self.keys.blacklist, AccessList::parse)
            .await?;
        let whitelist = self
            .parse(&self.keys.whitelist, AccessList::parse)
            .await?;
        let reward_weights = self
            .parse(&self.keys.weights, parse_reward_weights)
            .await?;
        let settings = self
            .parse(&self.keys.settings, SettingsBlob::parse)
            .await?;

        Ok(PolicySnapshot {
            generation: 0,
            refreshed_at: None,
            hotkey_blacklist: blacklist.hotkeys,
            coldkey_blacklist: blacklist.coldkeys,
            hotkey_whitelist: whitelist.hotkeys,
            coldkey_whitelist: whitelist.coldkeys,
            reward_weights,
            request_frequency: settings.request_frequency(),
            query_timeout: settings.query_timeout(),
        })
    }

    async fn parse<T>(
        &self,
        key: &str,
        parser: fn(&[u8]) -> Result<T, serde_json::Error>,
    ) -> Result<T, PolicyError> {
        let raw = self
            .store
            .fetch(&self.keys.bucket, key)
            .await
            .map_err(|source| PolicyError::Fetch {
                key: key.to_string(),
                source,
            })?;
        parser(&raw).map_err(|source| PolicyError::Malformed {
            key: key.to_string(),
            source,
        })
    }
}
