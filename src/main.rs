use anyhow::{Context, Result};
use dess_monitor::collector::CollectionLoop;
use dess_monitor::config::{Config, WeatherProvider};
use dess_monitor::controller::HybridController;
use dess_monitor::features::FeatureSettings;
use dess_monitor::ml::{self, ModelHandle};
use dess_monitor::sinks::MultiSinkWriter;
use dess_monitor::sources::openweather::OpenWeatherClient;
use dess_monitor::sources::{Sources, WeatherSource};
use dess_monitor::telemetry::{cancel_on_shutdown, init_tracing};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cfg = Config::load()?;
    let settings = FeatureSettings::from_config(&cfg.collector)?;

    let weather: Arc<dyn WeatherSource> = match cfg.weather.provider {
        WeatherProvider::OpenWeather => Arc::new(OpenWeatherClient::new(&cfg.weather)?),
        WeatherProvider::Simulated => simulated_weather(settings.tz)?,
    };
    let sources = build_sources(settings.tz, weather)?;

    let writer = MultiSinkWriter::open(&cfg.sinks, cfg.collector.sink_timeout())
        .context("failed to open sinks")?;

    let model = load_model(&cfg);
    let controller = HybridController::new(
        &cfg.controller,
        cfg.pump.clone(),
        cfg.loads.clone(),
        model.as_ref(),
    )?;

    let mut collector = CollectionLoop::new(&cfg.collector, sources, writer, controller, model)?;
    collector.recover().await?;

    let token = CancellationToken::new();
    cancel_on_shutdown(token.clone());

    info!(
        timezone = %settings.tz,
        weather = ?cfg.weather.provider,
        "starting solar pond monitor"
    );
    let stats = collector.run(token).await?;
    info!(
        total_collected = stats.total_collected,
        total_skipped = stats.total_skipped,
        "shutdown complete"
    );
    Ok(())
}

fn load_model(cfg: &Config) -> Option<ModelHandle> {
    let path = cfg.controller.model_path.as_ref()?;
    match ml::load_model(path) {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "model not loaded");
            None
        }
    }
}

#[cfg(feature = "sim")]
fn simulated_weather(tz: chrono_tz::Tz) -> Result<Arc<dyn WeatherSource>> {
    use dess_monitor::sources::sim::SimulatedWeather;
    Ok(Arc::new(SimulatedWeather::new(tz, rand::random())))
}

#[cfg(not(feature = "sim"))]
fn simulated_weather(_tz: chrono_tz::Tz) -> Result<Arc<dyn WeatherSource>> {
    anyhow::bail!("weather.provider = \"simulated\" requires the `sim` feature")
}

#[cfg(feature = "sim")]
fn build_sources(tz: chrono_tz::Tz, weather: Arc<dyn WeatherSource>) -> Result<Sources> {
    use dess_monitor::sources::sim::{SimulatedDevices, SimulatedInverter};
    warn!("using simulated inverter and pond devices");
    Ok(Sources {
        inverter: Arc::new(SimulatedInverter::new(tz, rand::random())),
        weather,
        devices: Arc::new(SimulatedDevices::new(tz, rand::random())),
    })
}

#[cfg(not(feature = "sim"))]
fn build_sources(_tz: chrono_tz::Tz, _weather: Arc<dyn WeatherSource>) -> Result<Sources> {
    anyhow::bail!("no inverter or device driver is compiled in; enable the `sim` feature")
}
