use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Setting parameters makes the remote plan a new schedule and is slow.
    #[serde(default = "default_set_parameters_timeout_secs")]
    pub set_parameters_timeout_secs: u64,
    #[serde(default = "default_confirm_timeout_secs")]
    pub confirm_timeout_secs: u64,
    #[serde(default = "default_status_timeout_secs")]
    pub status_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_set_parameters_timeout_secs() -> u64 {
    35
}

fn default_confirm_timeout_secs() -> u64 {
    10
}

fn default_status_timeout_secs() -> u64 {
    5
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            set_parameters_timeout_secs: default_set_parameters_timeout_secs(),
            confirm_timeout_secs: default_confirm_timeout_secs(),
            status_timeout_secs: default_status_timeout_secs(),
        }
    }
}

impl GatewayConfig {
    pub fn set_parameters_timeout(&self) -> Duration {
        Duration::from_secs(self.set_parameters_timeout_secs)
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_secs(self.confirm_timeout_secs)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs(self.status_timeout_secs)
    }
}

/// Inclusive bounds for negotiated values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParameterLimits {
    #[serde(default = "default_temperature_min")]
    pub temperature_min: f64,
    #[serde(default = "default_temperature_max")]
    pub temperature_max: f64,
    #[serde(default)]
    pub load_rate_min: f64,
    #[serde(default = "default_load_rate_max")]
    pub load_rate_max: f64,
}

fn default_temperature_min() -> f64 {
    -15.0
}

fn default_temperature_max() -> f64 {
    45.0
}

fn default_load_rate_max() -> f64 {
    100.0
}

impl Default for ParameterLimits {
    fn default() -> Self {
        Self {
            temperature_min: default_temperature_min(),
            temperature_max: default_temperature_max(),
            load_rate_min: 0.0,
            load_rate_max: default_load_rate_max(),
        }
    }
}

/// A recommended `(temperature, load rate)` pair. The first entry is offered
/// when the user asks for the default.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PresetParameter {
    pub temperature: f64,
    pub load_rate: f64,
}

fn default_presets() -> Vec<PresetParameter> {
    vec![
        PresetParameter {
            temperature: 22.0,
            load_rate: 90.0,
        },
        PresetParameter {
            temperature: 25.0,
            load_rate: 80.0,
        },
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollerSettings {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    /// Runaway guard: 600 polls at 1s is roughly ten minutes.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// The terminal notification is held back until at least this long after the
    /// poller started, so it never talks over the confirmation reply.
    #[serde(default = "default_min_duration_secs")]
    pub min_duration_secs: u64,
    #[serde(default = "default_sink_ready_timeout_secs")]
    pub sink_ready_timeout_secs: u64,
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_max_iterations() -> u32 {
    600
}

fn default_min_duration_secs() -> u64 {
    18
}

fn default_sink_ready_timeout_secs() -> u64 {
    3
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval_ms: default_poll_interval_ms(),
            max_iterations: default_max_iterations(),
            min_duration_secs: default_min_duration_secs(),
            sink_ready_timeout_secs: default_sink_ready_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub limits: ParameterLimits,
    #[serde(default = "default_presets")]
    pub presets: Vec<PresetParameter>,
    #[serde(default)]
    pub poller: PollerSettings,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            gateway: GatewayConfig::default(),
            limits: ParameterLimits::default(),
            presets: default_presets(),
            poller: PollerSettings::default(),
        }
    }
}

impl OptimizerConfig {
    /// Get the directory containing the executable
    fn get_base_dir() -> PathBuf {
        match std::env::current_exe() {
            Ok(exe_path) => exe_path
                .parent()
                .map(|p| p.to_path_buf())
                .unwrap_or_else(|| PathBuf::from(".")),
            Err(_) => PathBuf::from("."),
        }
    }

    pub fn config_path() -> PathBuf {
        Self::get_base_dir().join("loadtune_config.toml")
    }

    /// Load `loadtune_config.toml` next to the executable, then apply env
    /// overrides. Missing or broken files fall back to defaults.
    pub fn load() -> Self {
        let path = Self::config_path();
        let config = match Self::load_from_path(&path) {
            Ok(config) => {
                tracing::info!("Loaded config from {:?}", path);
                config
            }
            Err(e) => {
                if path.exists() {
                    tracing::error!("Failed to load {:?}: {:#}", path, e);
                } else {
                    tracing::warn!("No config file found, using defaults + env vars");
                }
                Self::default()
            }
        };
        config.with_env_overrides()
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {:?}", path))?;
        let config: OptimizerConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse {:?}", path))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let toml_string = toml::to_string_pretty(self).context("Failed to serialize config")?;

        fs::write(path, toml_string)
            .with_context(|| format!("Failed to write config to {:?}", path))?;

        tracing::info!("Saved config to {:?}", path);
        Ok(())
    }

    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_path())
    }

    pub fn validate(&self) -> Result<()> {
        let limits = &self.limits;
        if limits.temperature_min > limits.temperature_max {
            bail!(
                "temperature_min ({}) is greater than temperature_max ({})",
                limits.temperature_min,
                limits.temperature_max
            );
        }
        if limits.load_rate_min > limits.load_rate_max {
            bail!(
                "load_rate_min ({}) is greater than load_rate_max ({})",
                limits.load_rate_min,
                limits.load_rate_max
            );
        }
        if self.presets.is_empty() {
            bail!("at least one preset parameter is required");
        }
        for (index, preset) in self.presets.iter().enumerate() {
            let temperature_ok = (limits.temperature_min..=limits.temperature_max)
                .contains(&preset.temperature);
            let load_rate_ok =
                (limits.load_rate_min..=limits.load_rate_max).contains(&preset.load_rate);
            if !temperature_ok || !load_rate_ok {
                bail!(
                    "preset #{} ({}, {}) is outside the configured limits",
                    index,
                    preset.temperature,
                    preset.load_rate
                );
            }
        }
        if self.gateway.base_url.trim().is_empty() {
            bail!("gateway base_url cannot be empty");
        }
        if self.poller.interval_ms == 0 {
            bail!("poller interval_ms must be greater than zero");
        }
        if self.poller.max_iterations == 0 {
            bail!("poller max_iterations must be greater than zero");
        }
        Ok(())
    }

    /// Apply `LOADTUNE_*` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = env::var("LOADTUNE_GATEWAY_URL") {
            if !url.trim().is_empty() {
                self.gateway.base_url = url.trim().trim_end_matches('/').to_string();
            }
        }

        if let Ok(value) = env::var("LOADTUNE_SET_PARAMETERS_TIMEOUT_SECS") {
            if let Ok(seconds) = value.parse() {
                self.gateway.set_parameters_timeout_secs = seconds;
            }
        }

        if let Ok(value) = env::var("LOADTUNE_CONFIRM_TIMEOUT_SECS") {
            if let Ok(seconds) = value.parse() {
                self.gateway.confirm_timeout_secs = seconds;
            }
        }

        if let Ok(value) = env::var("LOADTUNE_POLL_MIN_DURATION_SECS") {
            if let Ok(seconds) = value.parse() {
                self.poller.min_duration_secs = seconds;
            }
        }

        if let Ok(value) = env::var("LOADTUNE_POLL_MAX_ITERATIONS") {
            if let Ok(count) = value.parse() {
                self.poller.max_iterations = count;
            }
        }

        self
    }
}
