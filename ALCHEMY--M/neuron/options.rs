//! Node options resolved before the lifecycle manager starts.
//!
//! Options are loaded from a TOML document (every field optional) and then
//! overridden by command-line flags in the binary. They are read-only once the
//! runtime is built.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use rand::Rng;
use serde::{Deserialize, Serialize};
use shared_logging::{LogLevel, DEFAULT_MAX_BYTES};
use thiserror::Error;

/// Errors raised while loading or validating options.
#[derive(Debug, Error)]
pub enum OptionsError {
    /// Options file could not be read.
    #[error("reading options {path}: {source}")]
    Io {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Options file is not valid TOML for [`NodeOptions`].
    #[error("parsing options {path}: {source}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: toml::de::Error,
    },
    /// A value is out of range.
    #[error("invalid option: {0}")]
    Invalid(String),
}

/// Which role the node plays; selects the policy blobs it follows.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Serves generation requests.
    #[default]
    Miner,
    /// Queries and scores miners.
    Validator,
}

impl NodeKind {
    /// Lowercase name used in paths and blob keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Miner => "miner",
            Self::Validator => "validator",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Miner => write!(f, "Miner"),
            Self::Validator => write!(f, "Validator"),
        }
    }
}

/// Opaque identity handle: the registry address (hotkey) and its owner (coldkey).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Identity {
    /// Address registered in the metagraph.
    pub hotkey: String,
    /// Owning account.
    #[serde(default)]
    pub coldkey: String,
}

impl Identity {
    /// Builds an identity.
    #[must_use]
    pub fn new(hotkey: impl Into<String>, coldkey: impl Into<String>) -> Self {
        Self {
            hotkey: hotkey.into(),
            coldkey: coldkey.into(),
        }
    }
}

/// Experiment-tracking settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WandbOptions {
    /// Project name.
    #[serde(default)]
    pub project: String,
    /// Entity (team) name.
    #[serde(default)]
    pub entity: String,
    /// Local directory holding run folders.
    #[serde(default = "default_artifacts_dir")]
    pub artifacts_dir: PathBuf,
}

impl Default for WandbOptions {
    fn default() -> Self {
        Self {
            project: String::new(),
            entity: String::new(),
            artifacts_dir: default_artifacts_dir(),
        }
    }
}

/// Where policy blobs are fetched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    /// Bucket holding every policy blob.
    #[serde(default = "default_bucket")]
    pub bucket: String,
    /// Public endpoint of the object store.
    #[serde(default = "default_store_endpoint")]
    pub endpoint: String,
    /// Local directory used instead of the endpoint when set.
    #[serde(default)]
    pub local_root: Option<PathBuf>,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            bucket: default_bucket(),
            endpoint: default_store_endpoint(),
            local_root: None,
        }
    }
}

/// Timer settings for both actors, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TimingOptions {
    /// Registered-state tick.
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Delay appended after every lifecycle iteration.
    #[serde(default = "default_trailing_secs")]
    pub trailing_secs: u64,
    /// Back-off while unregistered.
    #[serde(default = "default_backoff_secs")]
    pub unregistered_backoff_secs: u64,
    /// Telemetry and weight submission every N registered steps.
    #[serde(default = "default_report_every")]
    pub report_every: u64,
    /// Base interval of the background worker.
    #[serde(default = "default_background_secs")]
    pub background_secs: u64,
    /// Artifact cleanup every N background ticks.
    #[serde(default = "default_cleanup_every")]
    pub cleanup_every: u64,
    /// Grace period between a deregistration and the hard exit.
    #[serde(default = "default_grace_secs")]
    pub termination_grace_secs: u64,
}

impl Default for TimingOptions {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            trailing_secs: default_trailing_secs(),
            unregistered_backoff_secs: default_backoff_secs(),
            report_every: default_report_every(),
            background_secs: default_background_secs(),
            cleanup_every: default_cleanup_every(),
            termination_grace_secs: default_grace_secs(),
        }
    }
}

/// Read-only options consumed by the lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeOptions {
    /// Subnet identifier.
    #[serde(default = "default_netuid")]
    pub netuid: u16,
    /// Node role.
    #[serde(default)]
    pub kind: NodeKind,
    /// Registry identity.
    #[serde(default)]
    pub identity: Identity,
    /// Inference device selector.
    #[serde(default = "default_device")]
    pub device: String,
    /// Generator seed; random when absent from the document.
    #[serde(default = "random_seed")]
    pub seed: u64,
    /// Classifier-free guidance scale.
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    /// Inference steps per image.
    #[serde(default = "default_steps")]
    pub steps: u32,
    /// Images generated per prompt.
    #[serde(default = "default_num_images")]
    pub num_images: u32,
    /// Port of the serving boundary.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Compile models for throughput after loading.
    #[serde(default)]
    pub optimize: bool,
    /// Root of per-identity working directories.
    #[serde(default = "default_logging_dir")]
    pub logging_dir: PathBuf,
    /// Structured JSON log file, if any.
    #[serde(default)]
    pub json_log: Option<PathBuf>,
    /// Records below this level are not written to the JSON log.
    #[serde(default = "default_json_log_level")]
    pub json_log_level: LogLevel,
    /// JSON log size that triggers rotation to `<path>.1`.
    #[serde(default = "default_json_log_max_bytes")]
    pub json_log_max_bytes: u64,
    /// Experiment tracking.
    #[serde(default)]
    pub wandb: WandbOptions,
    /// Policy store.
    #[serde(default)]
    pub store: StoreOptions,
    /// Timers.
    #[serde(default)]
    pub timing: TimingOptions,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            netuid: default_netuid(),
            kind: NodeKind::default(),
            identity: Identity::default(),
            device: default_device(),
            seed: random_seed(),
            guidance_scale: default_guidance_scale(),
            steps: default_steps(),
            num_images: default_num_images(),
            port: default_port(),
            optimize: false,
            logging_dir: default_logging_dir(),
            json_log: None,
            json_log_level: default_json_log_level(),
            json_log_max_bytes: default_json_log_max_bytes(),
            wandb: WandbOptions::default(),
            store: StoreOptions::default(),
            timing: TimingOptions::default(),
        }
    }
}

/// Arguments handed to generation pipelines.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationArgs {
    /// Guidance scale.
    pub guidance_scale: f32,
    /// Inference steps.
    pub num_inference_steps: u32,
    /// Images per prompt.
    pub num_images_per_prompt: u32,
    /// Seed of the generator.
    pub seed: u64,
    /// Device the generator lives on.
    pub device: String,
}

impl NodeOptions {
    /// Loads options from a TOML file and validates them.
    ///
    /// # Errors
    /// Returns [`OptionsError`] on I/O, parse or validation failures.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, OptionsError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| OptionsError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let options = Self::from_toml(&raw).map_err(|source| OptionsError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        options.validate()?;
        Ok(options)
    }

    /// Parses a TOML document without validating it.
    ///
    /// # Errors
    /// Returns the TOML error when the document does not match.
    pub fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Checks values that would make the node misbehave.
    ///
    /// # Errors
    /// Returns [`OptionsError::Invalid`] naming the first bad value.
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.identity.hotkey.trim().is_empty() {
            return Err(OptionsError::Invalid("identity.hotkey is empty".into()));
        }
        if !(self.guidance_scale.is_finite() && self.guidance_scale > 0.0) {
            return Err(OptionsError::Invalid(format!(
                "guidance_scale must be positive, got {}",
                self.guidance_scale
            )));
        }
        if self.steps == 0 || self.num_images == 0 {
            return Err(OptionsError::Invalid(
                "steps and num_images must be at least 1".into(),
            ));
        }
        let timing = &self.timing;
        for (name, value) in [
            ("timing.tick_secs", timing.tick_secs),
            ("timing.unregistered_backoff_secs", timing.unregistered_backoff_secs),
            ("timing.report_every", timing.report_every),
            ("timing.background_secs", timing.background_secs),
            ("timing.cleanup_every", timing.cleanup_every),
            ("json_log_max_bytes", self.json_log_max_bytes),
        ] {
            if value == 0 {
                return Err(OptionsError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Generation arguments derived from the options.
    #[must_use]
    pub fn generation_args(&self) -> GenerationArgs {
        GenerationArgs {
            guidance_scale: self.guidance_scale,
            num_inference_steps: self.steps,
            num_images_per_prompt: self.num_images,
            seed: self.seed,
            device: self.device.clone(),
        }
    }

    /// Per-identity working directory: `<logging_dir>/<hotkey>/netuid<N>/<kind>`.
    #[must_use]
    pub fn full_path(&self) -> PathBuf {
        self.logging_dir
            .join(&self.identity.hotkey)
            .join(format!("netuid{}", self.netuid))
            .join(self.kind.as_str())
    }

    /// Creates [`Self::full_path`] if missing and returns it.
    ///
    /// # Errors
    /// Propagates the filesystem error.
    pub fn ensure_full_path(&self) -> Result<PathBuf, OptionsError> {
        let path = self.full_path();
        fs::create_dir_all(&path).map_err(|source| OptionsError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Grace period before an emergency exit.
    #[must_use]
    pub const fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.timing.termination_grace_secs)
    }
}

fn default_netuid() -> u16 {
    1
}

fn default_device() -> String {
    "cuda:0".into()
}

fn random_seed() -> u64 {
    rand::thread_rng().gen_range(0..100_000_000_000)
}

const fn default_guidance_scale() -> f32 {
    7.5
}

const fn default_steps() -> u32 {
    30
}

const fn default_num_images() -> u32 {
    1
}

const fn default_port() -> u16 {
    8091
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("logs")
}

const fn default_json_log_level() -> LogLevel {
    LogLevel::Info
}

const fn default_json_log_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

fn default_artifacts_dir() -> PathBuf {
    PathBuf::from("wandb")
}

fn default_bucket() -> String {
    "alchemy-public".into()
}

fn default_store_endpoint() -> String {
    "https://storage.googleapis.com".into()
}

const fn default_tick_secs() -> u64 {
    60
}

const fn default_trailing_secs() -> u64 {
    30
}

const fn default_backoff_secs() -> u64 {
    120
}

const fn default_report_every() -> u64 {
    5
}

const fn default_background_secs() -> u64 {
    60
}

const fn default_cleanup_every() -> u64 {
    300
}

const fn default_grace_secs() -> u64 {
    10
}
