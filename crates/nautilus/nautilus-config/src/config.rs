use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct BusConfig {
    #[serde(default = "defaults::segment_name")]
    pub segment_name: String,
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    /// Producer ticks per second.
    #[serde(default = "defaults::tick_hz")]
    pub tick_hz: f64,
    /// Stop the producer after this many ticks and remove the segment.
    #[serde(default)]
    pub max_ticks: Option<u64>,
    /// Remove a leftover segment of the same name before creating ours.
    #[serde(default)]
    pub reclaim_stale: bool,
    #[serde(default = "defaults::open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "defaults::report_interval_ms")]
    pub report_interval_ms: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

mod defaults {
    pub fn segment_name() -> String {
        nautilus_state::STATE_SEGMENT_NAME.into()
    }

    pub fn log_level() -> String {
        "info".into()
    }

    pub fn tick_hz() -> f64 {
        50.0
    }

    pub fn open_timeout_ms() -> u64 {
        5_000
    }

    pub fn report_interval_ms() -> u64 {
        1_000
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            segment_name: defaults::segment_name(),
            log_level: defaults::log_level(),
            tick_hz: defaults::tick_hz(),
            max_ticks: None,
            reclaim_stale: false,
            open_timeout_ms: defaults::open_timeout_ms(),
            report_interval_ms: defaults::report_interval_ms(),
        }
    }
}

impl BusConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_toml_str(&toml_to_str)
    }

    /// Load `path` if given, otherwise use the defaults.
    pub fn load_or_default(path: Option<String>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: BusConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.segment_name.is_empty() || self.segment_name.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "segment_name {:?} must be non-empty and contain no '/'",
                self.segment_name
            )));
        }
        if !(self.tick_hz.is_finite() && self.tick_hz > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "tick_hz must be positive, got {}",
                self.tick_hz
            )));
        }
        if self.report_interval_ms == 0 {
            return Err(ConfigError::Invalid("report_interval_ms must be positive".into()));
        }
        Ok(())
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_hz)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}
