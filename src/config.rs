use anyhow::{Context, Result};
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::controller::ControllerMode;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub collector: CollectorConfig,
    pub sinks: SinksConfig,
    pub controller: ControllerConfig,
    pub pump: PumpConfig,
    pub loads: LoadsConfig,
    pub weather: WeatherConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CollectorConfig {
    pub base_interval_secs: u64,
    /// Applied to the base interval between 22:00 and 06:00.
    pub night_multiplier: u32,
    pub source_timeout_secs: u64,
    pub sink_timeout_secs: u64,
    /// Gaps longer than this are not integrated into energy deltas.
    pub max_integration_gap_secs: i64,
    pub timezone: String,
    pub trend_dead_band_c: f64,
    pub rain_pop_threshold: f64,
}

impl CollectorConfig {
    pub fn base_interval(&self) -> Duration {
        Duration::from_secs(self.base_interval_secs.max(1))
    }
    pub fn source_timeout(&self) -> Duration {
        Duration::from_secs(self.source_timeout_secs.max(1))
    }
    pub fn sink_timeout(&self) -> Duration {
        Duration::from_secs(self.sink_timeout_secs.max(1))
    }
    pub fn tz(&self) -> Result<chrono_tz::Tz> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| anyhow::anyhow!("unknown timezone '{}': {}", self.timezone, e))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinkToggle {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinksConfig {
    pub sqlite: SinkToggle,
    pub csv: SinkToggle,
    pub jsonl: SinkToggle,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    pub mode: ControllerMode,
    /// Minimum record completeness before the model is consulted.
    ///
    /// The score only counts measured and forecast fields: identity, calendar, the three
    /// training targets and `completeness_score` itself are excluded, so it reads lower than a
    /// plain non-null ratio over every column.
    pub min_completeness: f64,
    pub model_path: Option<PathBuf>,
    pub max_model_age_days: Option<i64>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
pub struct SpeedBand {
    pub temp_c: f64,
    pub speed: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpConfig {
    pub default_min_speed: u8,
    pub max_speed: u8,
    pub speed_step: u8,
    pub min_volt: f64,
    pub max_volt: f64,
    #[serde(default)]
    pub speed_table: Vec<SpeedBand>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoadsConfig {
    pub min_volt: f64,
    pub max_volt: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WeatherProvider {
    Simulated,
    OpenWeather,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WeatherConfig {
    pub provider: WeatherProvider,
    pub base_url: String,
    pub api_key: Option<String>,
    pub latitude: f64,
    pub longitude: f64,
    pub http_timeout_seconds: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from("config/default.toml")
    }

    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("DESS__").split("__"));
        let cfg: Config = figment
            .extract()
            .with_context(|| format!("failed to load configuration from {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let c = &self.collector;
        if c.base_interval_secs == 0 {
            anyhow::bail!("collector.base_interval_secs must be positive");
        }
        if c.night_multiplier == 0 {
            anyhow::bail!("collector.night_multiplier must be at least 1");
        }
        if c.max_integration_gap_secs <= 0 {
            anyhow::bail!("collector.max_integration_gap_secs must be positive");
        }
        if !(c.trend_dead_band_c >= 0.0) {
            anyhow::bail!("collector.trend_dead_band_c must be non-negative");
        }
        c.tz()?;

        if !(0.0..=1.0).contains(&self.controller.min_completeness) {
            anyhow::bail!(
                "controller.min_completeness must be within [0, 1], got {}",
                self.controller.min_completeness
            );
        }

        let p = &self.pump;
        if p.default_min_speed > p.max_speed {
            anyhow::bail!(
                "pump.default_min_speed ({}) exceeds pump.max_speed ({})",
                p.default_min_speed,
                p.max_speed
            );
        }
        if p.min_volt > p.max_volt {
            anyhow::bail!("pump.min_volt exceeds pump.max_volt");
        }
        if let Some(band) = p.speed_table.iter().find(|b| b.speed > p.max_speed) {
            anyhow::bail!(
                "pump.speed_table entry at {}°C exceeds max speed {}",
                band.temp_c,
                p.max_speed
            );
        }
        if self.loads.min_volt > self.loads.max_volt {
            anyhow::bail!("loads.min_volt exceeds loads.max_volt");
        }

        if self.weather.provider == WeatherProvider::OpenWeather
            && self.weather.api_key.as_deref().map_or(true, str::is_empty)
        {
            anyhow::bail!("weather.api_key must be set for the openweather provider");
        }
        Ok(())
    }
}
