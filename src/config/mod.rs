//! Configuration module for the lock manager.
//!
//! All tunables live in [`DlmConfig`]. A configuration can be loaded from a
//! JSON file, overlaid from `DLM_*` environment variables, or built from one
//! of the presets.

use crate::error::{DlmError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a lock namespace and its service tasks.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlmConfig {
    /// Callback and request timeouts.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Client-side unused lock cache.
    #[serde(default)]
    pub lru: LruConfig,
    /// Callback worker pool.
    #[serde(default)]
    pub ast: AstConfig,
    /// Diagnostic dumps.
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    /// Allocation limits.
    #[serde(default)]
    pub limits: LimitsConfig,
    /// Observability configuration.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl DlmConfig {
    /// Load configuration from a file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DlmError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = serde_json::from_str(&content)
            .map_err(|e| DlmError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from the defaults overlaid with `DLM_*` variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay tunables using `lookup` to read variables.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("DLM_OBD_TIMEOUT") {
            self.timeouts.obd_timeout = Duration::from_secs(parse_env("DLM_OBD_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("DLM_LDLM_TIMEOUT") {
            self.timeouts.ldlm_timeout = Duration::from_secs(parse_env("DLM_LDLM_TIMEOUT", &v)?);
        }
        if let Some(v) = lookup("DLM_MAX_UNUSED") {
            self.lru.max_unused = parse_env("DLM_MAX_UNUSED", &v)?;
        }
        if let Some(v) = lookup("DLM_MAX_AGE") {
            self.lru.max_age = Duration::from_secs(parse_env("DLM_MAX_AGE", &v)?);
        }
        if let Some(v) = lookup("DLM_DUMP_ON_TIMEOUT") {
            self.diagnostics.dump_on_timeout = parse_flag(&v);
        }
        if let Some(v) = lookup("DLM_DUMP_ON_EVICTION") {
            self.diagnostics.dump_on_eviction = parse_flag(&v);
        }
        if let Some(v) = lookup("DLM_BL_THREADS") {
            self.ast.bl_threads = parse_env("DLM_BL_THREADS", &v)?;
        }
        Ok(())
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.timeouts.obd_timeout < Duration::from_secs(1) {
            return Err(DlmError::InvalidConfig {
                field: "timeouts.obd_timeout".to_string(),
                reason: "Global timeout must be at least one second".to_string(),
            });
        }

        if self.timeouts.ldlm_timeout.is_zero() {
            return Err(DlmError::InvalidConfig {
                field: "timeouts.ldlm_timeout".to_string(),
                reason: "Callback timeout must be non-zero".to_string(),
            });
        }

        if self.ast.bl_threads == 0 || self.ast.bl_threads > MAX_BL_THREADS {
            return Err(DlmError::InvalidConfig {
                field: "ast.bl_threads".to_string(),
                reason: format!("Worker count must be between 1 and {}", MAX_BL_THREADS),
            });
        }

        if self.lru.lock_volume_factor == 0 {
            return Err(DlmError::InvalidConfig {
                field: "lru.lock_volume_factor".to_string(),
                reason: "Lock volume factor must be non-zero".to_string(),
            });
        }

        if self.ast.max_cancel_batch == Some(0) {
            return Err(DlmError::InvalidConfig {
                field: "ast.max_cancel_batch".to_string(),
                reason: "Cancel batches must hold at least one handle".to_string(),
            });
        }

        Ok(())
    }

    /// Short timeouts and a small cache for local development.
    pub fn development() -> Self {
        Self {
            timeouts: TimeoutConfig {
                obd_timeout: Duration::from_secs(10),
                ldlm_timeout: Duration::from_secs(3),
            },
            lru: LruConfig {
                max_unused: 16,
                max_age: Duration::from_secs(60),
                ..LruConfig::default()
            },
            diagnostics: DiagnosticsConfig {
                dump_on_timeout: true,
                dump_on_eviction: true,
            },
            observability: ObservabilityConfig {
                log_level: "debug".to_string(),
                ..ObservabilityConfig::default()
            },
            ..Self::default()
        }
    }

    /// Tiny timeouts and a single worker, suited to paused-clock tests.
    pub fn testing() -> Self {
        Self {
            timeouts: TimeoutConfig {
                obd_timeout: Duration::from_secs(4),
                ldlm_timeout: Duration::from_secs(1),
            },
            ast: AstConfig {
                bl_threads: 1,
                max_cancel_batch: None,
            },
            ..Self::development()
        }
    }

    /// Timeout applied to callback and cancel RPCs.
    ///
    /// `max(1, min(ldlm_timeout, obd_timeout / 3))`, in whole seconds.
    pub fn rq_timeout(&self) -> Duration {
        let ldlm = self.timeouts.ldlm_timeout.as_secs();
        let third = self.timeouts.obd_timeout.as_secs() / 3;
        Duration::from_secs(ldlm.min(third).max(1))
    }

    /// Time a blocked holder gets to answer a blocking callback.
    pub fn callback_window(&self) -> Duration {
        self.timeouts.obd_timeout / 2
    }
}

const MAX_BL_THREADS: usize = 128;

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse::<T>().map_err(|e| DlmError::InvalidConfig {
        field: key.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "yes" | "on")
}

/// Callback and request timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Global operation timeout.
    #[serde(with = "humantime_serde")]
    pub obd_timeout: Duration,
    /// Lock manager callback timeout.
    #[serde(with = "humantime_serde")]
    pub ldlm_timeout: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            obd_timeout: Duration::from_secs(100),
            ldlm_timeout: Duration::from_secs(20),
        }
    }
}

/// Unused lock cache tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LruConfig {
    /// Unused locks kept before the cache starts shedding.
    pub max_unused: usize,
    /// Unused locks younger than this survive aged cancellation.
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
    /// Size the cache from the server's lock volume instead of `max_unused`.
    pub lru_resize: bool,
    /// Lock cost at or below which shrinking cancels a lock.
    pub shrink_thumb: u64,
    /// Multiplier applied to a lock's volume.
    pub lock_volume_factor: u64,
    /// Idle time after which a glimpsed write lock is given back.
    #[serde(with = "humantime_serde")]
    pub glimpse_idle: Duration,
}

impl Default for LruConfig {
    fn default() -> Self {
        Self {
            max_unused: 100,
            max_age: Duration::from_secs(36000),
            lru_resize: false,
            shrink_thumb: 256,
            lock_volume_factor: 1,
            glimpse_idle: Duration::from_secs(10),
        }
    }
}

/// Blocking callback worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AstConfig {
    /// Number of blocking callback workers.
    pub bl_threads: usize,
    /// Upper bound on handles per cancel RPC; `None` sizes batches from the
    /// request buffer.
    pub max_cancel_batch: Option<usize>,
}

impl Default for AstConfig {
    fn default() -> Self {
        Self {
            bl_threads: 2,
            max_cancel_batch: None,
        }
    }
}

/// Diagnostic dump triggers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Dump state when a callback timer expires.
    pub dump_on_timeout: bool,
    /// Dump state after an eviction pass.
    pub dump_on_eviction: bool,
}

/// Allocation limits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum live locks per namespace (0 = unlimited).
    pub max_locks: usize,
}

/// Observability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable metrics recording.
    pub metrics_enabled: bool,
    /// Log level.
    pub log_level: String,
    /// Enable JSON logging.
    pub json_logs: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            metrics_enabled: true,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

/// Serde helper for durations written as `"20s"`, `"10m"` or `"250ms"`.
pub mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let parse = |v: &str| v.trim().parse::<u64>().map_err(|e| format!("{}: {:?}", e, s));
        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse(secs).map(Duration::from_secs)
        } else if let Some(m) = s.strip_suffix('m') {
            parse(m).and_then(|v| scaled(v, 60, s))
        } else if let Some(h) = s.strip_suffix('h') {
            parse(h).and_then(|v| scaled(v, 3600, s))
        } else {
            // bare numbers are seconds, like the tunables they mirror
            parse(s).map(Duration::from_secs)
        }
    }

    fn scaled(value: u64, unit_secs: u64, s: &str) -> Result<Duration, String> {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration out of range: {:?}", s))
    }
}
