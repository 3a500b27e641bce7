//! Configuration system for loghaul.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $LOGHAUL_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/loghaul/config.toml
//!   3. ~/.config/loghaul/config.toml

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::decode::DEFAULT_DECOMPRESS_SIZE_LIMIT;
use crate::wire::MAX_SEQUENCE_COUNT;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoghaulConfig {
    pub buffers: BufferConfig,
    pub workers: WorkerConfig,
    pub chunks: ChunkConfig,
    pub decoder: DecoderConfig,
    pub shutdown: ShutdownConfig,
    pub listener: ListenerConfig,
}

/// How `insert` behaves when the buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertPolicy {
    /// Block the producer until slots free up.
    Cached,
    /// Fail immediately with `OutOfCapacity`.
    #[default]
    FailFast,
}

impl std::str::FromStr for InsertPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(InsertPolicy::Cached),
            "fail_fast" => Ok(InsertPolicy::FailFast),
            other => Err(ConfigError::Invalid(format!("unknown insert policy {other:?}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Slots in the process buffer. Power of two recommended.
    pub process_buffer_size: usize,
    /// Slots in the output buffer. Power of two recommended.
    pub output_buffer_size: usize,
    /// Policy used by the pipeline when publishing decoded datagrams.
    pub insert_policy: InsertPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Filter-stage workers.
    pub processors: usize,
    /// Output-stage workers.
    pub outputs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    /// Incomplete sets older than this (since first fragment) are evicted.
    pub max_age_ms: u64,
    /// How often the evictor scans.
    pub eviction_period_ms: u64,
    /// Live incomplete sets allowed at once.
    pub max_sets: usize,
    /// Largest sequence count accepted for one message.
    pub max_fragments: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoderConfig {
    /// Upper bound on decoded payload bytes.
    pub decompress_size_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long each worker pool gets to drain on stop.
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// UDP address the daemon feed binds to.
    pub bind: SocketAddr,
    /// Identity stamped on every message from this listener.
    pub input_id: String,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            process_buffer_size: 65_536,
            output_buffer_size: 65_536,
            insert_policy: InsertPolicy::FailFast,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            processors: 5,
            outputs: 3,
        }
    }
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_age_ms: 5_000,
            eviction_period_ms: 1_000,
            max_sets: 16_384,
            max_fragments: 128,
        }
    }
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            decompress_size_limit: DEFAULT_DECOMPRESS_SIZE_LIMIT,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 10_000,
        }
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 12201)),
            input_id: "gelf-udp".into(),
        }
    }
}

impl ChunkConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn eviction_period(&self) -> Duration {
        Duration::from_millis(self.eviction_period_ms)
    }
}

impl ShutdownConfig {
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("loghaul")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl LoghaulConfig {
    /// Load config: env vars → file → defaults. The result is validated.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            Self::from_toml_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            LoghaulConfig::default()
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("LOGHAUL_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&LoghaulConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Reject settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.buffers;
        for (name, size) in [
            ("buffers.process_buffer_size", b.process_buffer_size),
            ("buffers.output_buffer_size", b.output_buffer_size),
        ] {
            if size == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be at least 1")));
            }
            if !size.is_power_of_two() {
                tracing::warn!(setting = name, size, "buffer size is not a power of two");
            }
        }

        if self.workers.processors == 0 {
            return Err(ConfigError::Invalid("workers.processors must be at least 1".into()));
        }
        if self.workers.outputs == 0 {
            return Err(ConfigError::Invalid("workers.outputs must be at least 1".into()));
        }

        let c = &self.chunks;
        if !(1..=MAX_SEQUENCE_COUNT).contains(&c.max_fragments) {
            return Err(ConfigError::Invalid(format!(
                "chunks.max_fragments must be in 1..={MAX_SEQUENCE_COUNT}, got {}",
                c.max_fragments
            )));
        }
        if c.max_sets == 0 {
            return Err(ConfigError::Invalid("chunks.max_sets must be at least 1".into()));
        }
        if c.eviction_period_ms == 0 {
            return Err(ConfigError::Invalid(
                "chunks.eviction_period_ms must be non-zero".into(),
            ));
        }
        if self.decoder.decompress_size_limit == 0 {
            return Err(ConfigError::Invalid(
                "decoder.decompress_size_limit must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Apply LOGHAUL_* overrides. `lookup` resolves a variable name, which
    /// lets tests inject values without touching the process environment.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T, ConfigError> {
            value
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("{key}={value:?} does not parse")))
        }

        macro_rules! override_field {
            ($key:literal, $field:expr) => {
                if let Some(v) = lookup($key) {
                    $field = parsed($key, v)?;
                }
            };
        }

        override_field!("LOGHAUL_BUFFERS__PROCESS_BUFFER_SIZE", self.buffers.process_buffer_size);
        override_field!("LOGHAUL_BUFFERS__OUTPUT_BUFFER_SIZE", self.buffers.output_buffer_size);
        override_field!("LOGHAUL_BUFFERS__INSERT_POLICY", self.buffers.insert_policy);
        override_field!("LOGHAUL_WORKERS__PROCESSORS", self.workers.processors);
        override_field!("LOGHAUL_WORKERS__OUTPUTS", self.workers.outputs);
        override_field!("LOGHAUL_CHUNKS__MAX_AGE_MS", self.chunks.max_age_ms);
        override_field!("LOGHAUL_CHUNKS__EVICTION_PERIOD_MS", self.chunks.eviction_period_ms);
        override_field!("LOGHAUL_CHUNKS__MAX_SETS", self.chunks.max_sets);
        override_field!("LOGHAUL_CHUNKS__MAX_FRAGMENTS", self.chunks.max_fragments);
        override_field!(
            "LOGHAUL_DECODER__DECOMPRESS_SIZE_LIMIT",
            self.decoder.decompress_size_limit
        );
        override_field!("LOGHAUL_SHUTDOWN__DRAIN_TIMEOUT_MS", self.shutdown.drain_timeout_ms);
        override_field!("LOGHAUL_LISTENER__BIND", self.listener.bind);
        if let Some(v) = lookup("LOGHAUL_LISTENER__INPUT_ID") {
            self.listener.input_id = v;
        }
        Ok(())
    }
}
