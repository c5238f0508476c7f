//! Runtime Configuration
//!
//! Configuration for the Vein runtime. Values can be set programmatically or
//! loaded from environment variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `VEIN_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `VEIN_ARENA_CHUNK_SIZE` | Arena chunk size in bytes | 8192 (8KB) |
//! | `VEIN_ARENA_MAX_CHUNKS` | Maximum chunks per arena | 4096 |
//! | `VEIN_SLOT_POOL_INITIAL` | Slots in the first pool chunk | 256 |
//! | `VEIN_SLOT_POOL_MAX` | Maximum slots in the pool | 16777216 |
//! | `VEIN_SCC_CAPACITY` | Maximum live SCCs | 65536 |
//! | `VEIN_DEFERRED_RC` | Defer C ABI decrements to safe points | false |
//! | `VEIN_DEFERRED_BATCH` | Decrements processed per safe point | 128 |
//! | `VEIN_DEFERRED_MAX` | Queue length that forces a batch | 1024 |
//! | `VEIN_HANDLE_SECRET` | Fixed handle secret, hex or decimal | random |
//! | `VEIN_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust
//! use vein_runtime::config::RuntimeConfig;
//!
//! let config = RuntimeConfig::builder()
//!     .arena_chunk_size(64 * 1024)
//!     .deferred_batch(32)
//!     .build()
//!     .unwrap();
//! assert_eq!(config.deferred.batch, 32);
//! ```

use std::env;

use thiserror::Error;

/// Smallest accepted arena chunk.
pub const MIN_ARENA_CHUNK: usize = 1024;

/// Log level for runtime logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    /// No logging.
    Off,
    /// Error messages only.
    Error,
    /// Warnings and errors.
    Warn,
    /// Informational messages (default).
    #[default]
    Info,
    /// Debug messages.
    Debug,
    /// Trace-level messages.
    Trace,
}

impl LogLevel {
    /// Parse a log level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" | "none" | "0" => Some(LogLevel::Off),
            "error" | "err" | "1" => Some(LogLevel::Error),
            "warn" | "warning" | "2" => Some(LogLevel::Warn),
            "info" | "3" => Some(LogLevel::Info),
            "debug" | "4" => Some(LogLevel::Debug),
            "trace" | "5" => Some(LogLevel::Trace),
            _ => None,
        }
    }

    /// Convert to a string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Arena configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Bytes per chunk.
    /// Default: 8KB.
    pub chunk_size: usize,

    /// Maximum chunks per arena.
    /// Default: 4096.
    pub max_chunks: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            chunk_size: 8 * 1024, // 8 KB
            max_chunks: 4096,
        }
    }
}

/// Slot pool configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPoolConfig {
    /// Slots in the first chunk. Each later chunk doubles.
    /// Default: 256.
    pub initial_slots: usize,

    /// Maximum total slots.
    /// Default: 16M.
    pub max_slots: usize,
}

impl Default for SlotPoolConfig {
    fn default() -> Self {
        Self {
            initial_slots: 256,
            max_slots: 1 << 24,
        }
    }
}

/// SCC registry configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SccConfig {
    /// Maximum number of live SCCs.
    /// Default: 65536.
    pub capacity: usize,
}

impl Default for SccConfig {
    fn default() -> Self {
        Self { capacity: 65536 }
    }
}

/// Deferred decrement configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredConfig {
    /// Route `vein_dec_ref` through the deferred queue.
    /// Default: false.
    pub enabled: bool,

    /// Decrements processed per safe point.
    /// Default: 128.
    pub batch: usize,

    /// Queue length that forces a batch on enqueue.
    /// Default: 1024.
    pub max_queue: usize,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            batch: 128,
            max_queue: 1024,
        }
    }
}

/// Handle configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandleConfig {
    /// Fixed secret mixed into handle tags.
    /// Default: `None`, a random secret per process.
    pub secret: Option<u64>,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log level.
    /// Default: Info.
    pub level: LogLevel,

    /// Include timestamps in log output.
    /// Default: true.
    pub timestamps: bool,

    /// Include source location in log output.
    /// Default: false (only in debug builds).
    pub source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            timestamps: true,
            source_location: cfg!(debug_assertions),
        }
    }
}

/// Complete runtime configuration.
///
/// Use `RuntimeConfig::default()` for sensible defaults, or
/// `RuntimeConfig::from_env()` to load from environment variables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Arena configuration.
    pub arena: ArenaConfig,

    /// Slot pool configuration.
    pub slots: SlotPoolConfig,

    /// SCC registry configuration.
    pub scc: SccConfig,

    /// Deferred decrement configuration.
    pub deferred: DeferredConfig,

    /// Handle configuration.
    pub handle: HandleConfig,

    /// Logging configuration.
    pub log: LogConfig,
}

impl RuntimeConfig {
    /// Create a new builder for RuntimeConfig.
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset variables keep their defaults. Invalid values are ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("VEIN_ARENA_CHUNK_SIZE") {
            if val >= MIN_ARENA_CHUNK {
                config.arena.chunk_size = val;
            }
        }

        if let Some(val) = parse_env_usize("VEIN_ARENA_MAX_CHUNKS") {
            if val > 0 {
                config.arena.max_chunks = val;
            }
        }

        if let Some(val) = parse_env_usize("VEIN_SLOT_POOL_INITIAL") {
            if val > 0 {
                config.slots.initial_slots = val;
            }
        }

        if let Some(val) = parse_env_usize("VEIN_SLOT_POOL_MAX") {
            if val >= config.slots.initial_slots {
                config.slots.max_slots = val;
            }
        }

        if let Some(val) = parse_env_usize("VEIN_SCC_CAPACITY") {
            if val > 0 {
                config.scc.capacity = val;
            }
        }

        if let Some(val) = parse_env_bool("VEIN_DEFERRED_RC") {
            config.deferred.enabled = val;
        }

        if let Some(val) = parse_env_usize("VEIN_DEFERRED_BATCH") {
            if val > 0 {
                config.deferred.batch = val;
            }
        }

        if let Some(val) = parse_env_usize("VEIN_DEFERRED_MAX") {
            if val > 0 {
                config.deferred.max_queue = val;
            }
        }

        if let Some(val) = parse_env_u64("VEIN_HANDLE_SECRET") {
            config.handle.secret = Some(val);
        }

        if let Ok(val) = env::var("VEIN_LOG_LEVEL") {
            if let Some(level) = LogLevel::from_str(&val) {
                config.log.level = level;
            }
        }

        config
    }

    /// Validate the configuration and return any errors.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.arena.chunk_size < MIN_ARENA_CHUNK {
            return Err(ConfigError::InvalidValue {
                field: "arena.chunk_size".into(),
                message: format!("must be at least {MIN_ARENA_CHUNK} bytes"),
            });
        }

        if self.arena.max_chunks == 0 {
            return Err(ConfigError::InvalidValue {
                field: "arena.max_chunks".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.slots.initial_slots == 0 {
            return Err(ConfigError::InvalidValue {
                field: "slots.initial_slots".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.slots.max_slots < self.slots.initial_slots {
            return Err(ConfigError::InvalidValue {
                field: "slots.max_slots".into(),
                message: "must be at least initial_slots".into(),
            });
        }

        if self.scc.capacity == 0 || self.scc.capacity > u32::MAX as usize {
            return Err(ConfigError::InvalidValue {
                field: "scc.capacity".into(),
                message: "must be between 1 and u32::MAX".into(),
            });
        }

        if self.deferred.batch == 0 {
            return Err(ConfigError::InvalidValue {
                field: "deferred.batch".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.deferred.max_queue < self.deferred.batch {
            return Err(ConfigError::InvalidValue {
                field: "deferred.max_queue".into(),
                message: "must be at least deferred.batch".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for RuntimeConfig.
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the arena chunk size in bytes.
    pub fn arena_chunk_size(mut self, size: usize) -> Self {
        self.config.arena.chunk_size = size;
        self
    }

    /// Set the maximum chunks per arena.
    pub fn arena_max_chunks(mut self, n: usize) -> Self {
        self.config.arena.max_chunks = n;
        self
    }

    /// Set the slot count of the first pool chunk.
    pub fn slot_pool_initial(mut self, n: usize) -> Self {
        self.config.slots.initial_slots = n;
        self
    }

    /// Set the maximum slot count.
    pub fn slot_pool_max(mut self, n: usize) -> Self {
        self.config.slots.max_slots = n;
        self
    }

    /// Set the maximum number of live SCCs.
    pub fn scc_capacity(mut self, n: usize) -> Self {
        self.config.scc.capacity = n;
        self
    }

    /// Enable deferred decrements for the C ABI.
    pub fn deferred_rc(mut self, enabled: bool) -> Self {
        self.config.deferred.enabled = enabled;
        self
    }

    /// Set the number of decrements processed per safe point.
    pub fn deferred_batch(mut self, k: usize) -> Self {
        self.config.deferred.batch = k;
        self
    }

    /// Set the queue length that forces a batch.
    pub fn deferred_max(mut self, n: usize) -> Self {
        self.config.deferred.max_queue = n;
        self
    }

    /// Fix the handle secret.
    pub fn handle_secret(mut self, secret: u64) -> Self {
        self.config.handle.secret = Some(secret);
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build the configuration.
    ///
    /// This validates the configuration and returns an error if invalid.
    pub fn build(self) -> Result<RuntimeConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }

    /// Build the configuration without validation.
    pub fn build_unchecked(self) -> RuntimeConfig {
        self.config
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

/// Parse an environment variable as bool.
fn parse_env_bool(name: &str) -> Option<bool> {
    env::var(name).ok().and_then(|s| match s.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    })
}

/// Parse an environment variable as u64, accepting a `0x` prefix.
fn parse_env_u64(name: &str) -> Option<u64> {
    env::var(name).ok().and_then(|s| {
        let s = s.trim();
        match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16).ok(),
            None => s.parse().ok(),
        }
    })
}
