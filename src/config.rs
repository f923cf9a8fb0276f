use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::tunables;

/// Top-level configuration for the beamsync service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (trace, debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// HTTP control surface configuration.
    #[serde(default)]
    pub api: ApiConfig,

    /// Tables to serve, one aligner/serializer pair each.
    #[serde(default)]
    pub tables: Vec<TableConfig>,

    /// Signal source configuration.
    #[serde(default)]
    pub source: SourceConfig,

    /// Alignment tunables, applied process-wide at startup.
    #[serde(default)]
    pub tunables: TunablesConfig,
}

/// HTTP control surface configuration.
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    /// Listen address. Default: ":8432".
    #[serde(default = "default_api_addr")]
    pub addr: String,
}

/// One table: an endpoint prefix and its signal list.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    /// Endpoint prefix, e.g. "BSA:".
    pub prefix: String,

    /// Initial signal names. May be replaced at runtime through the
    /// signals endpoint.
    #[serde(default)]
    pub signals: Vec<String>,
}

/// Signal source configuration.
#[derive(Debug, Default, Deserialize)]
pub struct SourceConfig {
    /// Built-in simulation source.
    #[serde(default)]
    pub sim: SimSourceConfig,
}

/// Simulation source configuration.
#[derive(Debug, Deserialize)]
pub struct SimSourceConfig {
    /// Drive configured signals with synthetic updates. Default: true
    /// (without it, columns stay silent until an external transport is
    /// wired in).
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Updates per second per signal. Default: 10.
    #[serde(default = "default_sim_rate")]
    pub rate_hz: f64,

    /// Every this many ticks one signal misses a tick as a disconnect.
    /// Default: 0 (disabled).
    #[serde(default)]
    pub dropout_period: u64,
}

/// Alignment tunables.
#[derive(Debug, Deserialize)]
pub struct TunablesConfig {
    /// Expected event rate, bounds the pending-slice count. Default: 20/s.
    #[serde(default = "default_event_rate")]
    pub event_rate: f64,

    /// Age after which partial slices are force-flushed. Default: 2.5s.
    #[serde(default = "default_event_age", with = "humantime_serde")]
    pub event_age: Duration,

    /// Holdoff between downstream deliveries. Default: 2s.
    #[serde(default = "default_flush_period", with = "humantime_serde")]
    pub flush_period: Duration,

    /// Ingress queue depth for scalar signals. Default: 130.
    #[serde(default = "default_scalar_depth")]
    pub scalar_depth: usize,

    /// Ingress queue depth for array signals. Default: 15.
    #[serde(default = "default_array_depth")]
    pub array_depth: usize,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_api_addr() -> String {
    ":8432".to_string()
}

fn default_true() -> bool {
    true
}

fn default_sim_rate() -> f64 {
    10.0
}

fn default_event_rate() -> f64 {
    20.0
}

fn default_event_age() -> Duration {
    Duration::from_millis(2500)
}

fn default_flush_period() -> Duration {
    Duration::from_secs(2)
}

fn default_scalar_depth() -> usize {
    130
}

fn default_array_depth() -> usize {
    15
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            api: ApiConfig::default(),
            tables: Vec::new(),
            source: SourceConfig::default(),
            tunables: TunablesConfig::default(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: default_api_addr(),
        }
    }
}

impl Default for SimSourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate_hz: default_sim_rate(),
            dropout_period: 0,
        }
    }
}

impl Default for TunablesConfig {
    fn default() -> Self {
        Self {
            event_rate: default_event_rate(),
            event_age: default_event_age(),
            flush_period: default_flush_period(),
            scalar_depth: default_scalar_depth(),
            array_depth: default_array_depth(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            bail!("at least one table is required");
        }

        let mut prefixes = std::collections::HashSet::new();
        for table in &self.tables {
            if table.prefix.is_empty() {
                bail!("table prefix must not be empty");
            }
            if !prefixes.insert(&table.prefix) {
                bail!("duplicate table prefix: {}", table.prefix);
            }
            for signal in &table.signals {
                if signal.is_empty() {
                    bail!("empty signal name in table {}", table.prefix);
                }
            }
        }

        if self.source.sim.enabled && self.source.sim.rate_hz <= 0.0 {
            bail!("source.sim.rate_hz must be positive");
        }

        if self.tunables.event_rate <= 0.0 {
            bail!("tunables.event_rate must be positive");
        }

        Ok(())
    }

    /// Push the tunables into the process-wide settings.
    pub fn apply_tunables(&self) {
        tunables::set_event_rate(self.tunables.event_rate);
        tunables::set_event_age(self.tunables.event_age.as_secs_f64());
        tunables::set_flush_period(self.tunables.flush_period.as_secs_f64());
        tunables::set_scalar_depth(self.tunables.scalar_depth);
        tunables::set_array_depth(self.tunables.array_depth);
    }
}
