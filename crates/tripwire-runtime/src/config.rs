//! Instrumenter configuration loading (`tripwire.toml`).

#![allow(missing_docs)]

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use smol_str::SmolStr;

use crate::cache::CacheTuning;
use crate::error::ConfigError;

pub const DEFAULT_TOOL_ID: u8 = 4;
pub const DEFAULT_TOOL_NAME: &str = "tripwire";
const DEFAULT_SWEEP_INTERVAL_MS: u64 = 60_000;
const DEFAULT_SWEEP_LOCK_TIMEOUT_MS: u64 = 50;
const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Tuning of the three resolver caches.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CacheConfig {
    pub lines: CacheTuning,
    pub descendants: CacheTuning,
    pub parameters: CacheTuning,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lines: CacheTuning::with_initial_capacity(256),
            descendants: CacheTuning::with_initial_capacity(128),
            parameters: CacheTuning::with_initial_capacity(64),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstrumenterConfig {
    pub tool_id: u8,
    pub tool_name: SmolStr,
    /// `None` disables the background sweep.
    pub sweep_interval: Option<Duration>,
    pub sweep_lock_timeout: Duration,
    pub log_level: SmolStr,
    pub caches: CacheConfig,
}

impl Default for InstrumenterConfig {
    fn default() -> Self {
        Self {
            tool_id: DEFAULT_TOOL_ID,
            tool_name: SmolStr::new_inline(DEFAULT_TOOL_NAME),
            sweep_interval: Some(Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS)),
            sweep_lock_timeout: Duration::from_millis(DEFAULT_SWEEP_LOCK_TIMEOUT_MS),
            log_level: SmolStr::new_inline("info"),
            caches: CacheConfig::default(),
        }
    }
}

impl InstrumenterConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|err| ConfigError::Io {
            path: path.display().to_string().into(),
            message: err.to_string().into(),
        })?;
        Self::from_toml_str(&text, &path.display().to_string())
    }

    /// Parse `text`; `origin` names the source in error messages.
    pub fn from_toml_str(text: &str, origin: &str) -> Result<Self, ConfigError> {
        let raw: TripwireToml = toml::from_str(text).map_err(|err| ConfigError::Parse {
            path: origin.into(),
            message: err.to_string().into(),
        })?;
        raw.into_config()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TripwireToml {
    instrumenter: Option<InstrumenterSection>,
    log: Option<LogSection>,
    cache: Option<CacheSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstrumenterSection {
    tool_id: Option<u8>,
    tool_name: Option<String>,
    sweep_interval_ms: Option<u64>,
    sweep_lock_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct LogSection {
    level: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CacheSection {
    lines: Option<TuningSection>,
    descendants: Option<TuningSection>,
    parameters: Option<TuningSection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct TuningSection {
    initial_capacity: Option<usize>,
    min_capacity: Option<usize>,
    max_capacity: Option<usize>,
    growth_factor: Option<f64>,
    shrink_factor: Option<f64>,
    hit_ratio_threshold: Option<f64>,
    check_interval: Option<u64>,
    eviction_fraction: Option<f64>,
}

impl TripwireToml {
    fn into_config(self) -> Result<InstrumenterConfig, ConfigError> {
        let defaults = InstrumenterConfig::default();
        let mut config = defaults.clone();

        if let Some(section) = self.instrumenter {
            config.tool_id = section.tool_id.unwrap_or(defaults.tool_id);
            if let Some(name) = section.tool_name {
                if name.trim().is_empty() {
                    return Err(ConfigError::Invalid(
                        "instrumenter.tool_name must not be empty".into(),
                    ));
                }
                config.tool_name = name.into();
            }
            if let Some(interval) = section.sweep_interval_ms {
                config.sweep_interval = (interval > 0).then(|| Duration::from_millis(interval));
            }
            if let Some(timeout) = section.sweep_lock_timeout_ms {
                if timeout == 0 {
                    return Err(ConfigError::Invalid(
                        "instrumenter.sweep_lock_timeout_ms must be > 0".into(),
                    ));
                }
                config.sweep_lock_timeout = Duration::from_millis(timeout);
            }
        }

        if let Some(log) = self.log {
            let level = log.level.trim().to_ascii_lowercase();
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(ConfigError::Invalid(
                    format!("invalid log.level '{}'", log.level).into(),
                ));
            }
            config.log_level = level.into();
        }

        if let Some(cache) = self.cache {
            let base = defaults.caches;
            config.caches = CacheConfig {
                lines: cache.lines.unwrap_or_default().into_tuning("lines", base.lines)?,
                descendants: cache
                    .descendants
                    .unwrap_or_default()
                    .into_tuning("descendants", base.descendants)?,
                parameters: cache
                    .parameters
                    .unwrap_or_default()
                    .into_tuning("parameters", base.parameters)?,
            };
        }
        Ok(config)
    }
}

impl TuningSection {
    fn into_tuning(self, name: &str, base: CacheTuning) -> Result<CacheTuning, ConfigError> {
        let tuning = CacheTuning {
            initial_capacity: self.initial_capacity.unwrap_or(base.initial_capacity),
            min_capacity: self.min_capacity.unwrap_or(base.min_capacity),
            max_capacity: self.max_capacity.unwrap_or(base.max_capacity),
            growth_factor: self.growth_factor.unwrap_or(base.growth_factor),
            shrink_factor: self.shrink_factor.unwrap_or(base.shrink_factor),
            hit_ratio_threshold: self.hit_ratio_threshold.unwrap_or(base.hit_ratio_threshold),
            check_interval: self.check_interval.unwrap_or(base.check_interval),
            eviction_fraction: self.eviction_fraction.unwrap_or(base.eviction_fraction),
        };
        let invalid = |field: &str, rule: &str| {
            Err(ConfigError::Invalid(
                format!("cache.{name}.{field} {rule}").into(),
            ))
        };
        if tuning.min_capacity == 0 {
            return invalid("min_capacity", "must be > 0");
        }
        if tuning.max_capacity < tuning.min_capacity {
            return invalid("max_capacity", "must be >= min_capacity");
        }
        if tuning.growth_factor <= 1.0 {
            return invalid("growth_factor", "must be > 1");
        }
        if !(tuning.shrink_factor > 0.0 && tuning.shrink_factor < 1.0) {
            return invalid("shrink_factor", "must be in (0, 1)");
        }
        if !(tuning.hit_ratio_threshold > 0.0 && tuning.hit_ratio_threshold <= 1.0) {
            return invalid("hit_ratio_threshold", "must be in (0, 1]");
        }
        if tuning.check_interval == 0 {
            return invalid("check_interval", "must be > 0");
        }
        if !(tuning.eviction_fraction > 0.0 && tuning.eviction_fraction <= 1.0) {
            return invalid("eviction_fraction", "must be in (0, 1]");
        }
        Ok(tuning)
    }
}
