//! OpenWeatherMap One Call client.
//!
//! One request returns both current conditions and the hourly forecast, so the response is
//! cached briefly and shared between [`WeatherSource::current`] and [`WeatherSource::forecast`].

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use reqwest::Client;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use super::{SourceError, WeatherSource};
use crate::config::WeatherConfig;
use crate::domain::{Forecast, ForecastPoint, RawSnapshot, SourceKind};

/// Responses younger than this are reused within a cycle.
const RESPONSE_TTL: Duration = Duration::from_secs(60);

pub const SOURCE_NAME: &str = "openweather";

pub struct OpenWeatherClient {
    client: Client,
    base_url: String,
    api_key: String,
    latitude: f64,
    longitude: f64,
    cache: Mutex<Option<(Instant, OneCallResponse)>>,
}

impl OpenWeatherClient {
    pub fn new(cfg: &WeatherConfig) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_seconds.max(1)))
            .build()?;
        Ok(Self {
            client,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone().unwrap_or_default(),
            latitude: cfg.latitude,
            longitude: cfg.longitude,
            cache: Mutex::new(None),
        })
    }

    async fn fetch(&self) -> Result<OneCallResponse, SourceError> {
        let cached = self
            .cache
            .lock()
            .as_ref()
            .filter(|(at, _)| at.elapsed() < RESPONSE_TTL)
            .map(|(_, resp)| resp.clone());
        if let Some(resp) = cached {
            return Ok(resp);
        }

        debug!(url = %self.base_url, "fetching OpenWeather one call");
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("lat", self.latitude.to_string()),
                ("lon", self.longitude.to_string()),
                ("appid", self.api_key.clone()),
                ("units", "metric".to_string()),
                ("exclude", "minutely,alerts".to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "OpenWeather API returned error status");
            return Err(SourceError::Unavailable(format!("HTTP {}", status)));
        }

        let parsed: OneCallResponse = response.json().await?;
        *self.cache.lock() = Some((Instant::now(), parsed.clone()));
        Ok(parsed)
    }
}

#[async_trait]
impl WeatherSource for OpenWeatherClient {
    async fn current(&self) -> Result<RawSnapshot, SourceError> {
        let resp = self.fetch().await?;
        let cur = resp
            .current
            .ok_or_else(|| SourceError::Protocol("response has no 'current' block".into()))?;

        let captured_at = cur.dt.unwrap_or_else(|| Utc::now().timestamp());
        let mut snap = RawSnapshot::new(SourceKind::Weather, captured_at);
        let numeric = [
            ("ambient_temp", cur.temp),
            ("humidity", cur.humidity),
            ("pressure_hpa", cur.pressure),
            ("wind_speed_mps", cur.wind_speed),
            ("clouds_pct", cur.clouds),
            ("uvi", cur.uvi),
        ];
        for (key, value) in numeric {
            if let Some(v) = value {
                snap.insert(key, v);
            }
        }
        if let Some(desc) = cur.weather.first().map(|w| w.description.clone()) {
            snap.insert("weather_description", desc);
        }
        Ok(snap)
    }

    async fn forecast(&self) -> Result<Forecast, SourceError> {
        let resp = self.fetch().await?;
        let points = resp
            .hourly
            .into_iter()
            .map(|h| ForecastPoint {
                ts: h.dt,
                temp_c: h.temp,
                clouds_pct: h.clouds,
                rain_mm: h.rain.and_then(|r| r.one_hour),
                pop: h.pop,
                wind_mps: h.wind_speed,
                uvi: h.uvi,
            })
            .collect();
        Ok(Forecast::new(SOURCE_NAME, points))
    }
}

// One Call response structures
#[derive(Debug, Clone, Deserialize)]
struct OneCallResponse {
    current: Option<CurrentBlock>,
    #[serde(default)]
    hourly: Vec<HourlyBlock>,
}

#[derive(Debug, Clone, Deserialize)]
struct CurrentBlock {
    dt: Option<i64>,
    temp: Option<f64>,
    humidity: Option<f64>,
    pressure: Option<f64>,
    wind_speed: Option<f64>,
    clouds: Option<f64>,
    uvi: Option<f64>,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Debug, Clone, Deserialize)]
struct Condition {
    description: String,
}

#[derive(Debug, Clone, Deserialize)]
struct HourlyBlock {
    dt: i64,
    temp: Option<f64>,
    clouds: Option<f64>,
    pop: Option<f64>,
    wind_speed: Option<f64>,
    uvi: Option<f64>,
    rain: Option<RainBlock>,
}

#[derive(Debug, Clone, Deserialize)]
struct RainBlock {
    #[serde(rename = "1h")]
    one_hour: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WeatherProvider;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(base_url: String) -> WeatherConfig {
        WeatherConfig {
            provider: WeatherProvider::OpenWeather,
            base_url,
            api_key: Some("secret".into()),
            latitude: 50.45,
            longitude: 30.52,
            http_timeout_seconds: 5,
        }
    }

    fn body() -> serde_json::Value {
        serde_json::json!({
            "current": {
                "dt": 1_720_000_000,
                "temp": 21.5,
                "humidity": 60,
                "pressure": 1012,
                "wind_speed": 3.2,
                "clouds": 40,
                "uvi": 5.1,
                "weather": [{"description": "scattered clouds"}]
            },
            "hourly": [
                {"dt": 1_720_003_600, "temp": 22.0, "clouds": 50, "pop": 0.2, "wind_speed": 3.0, "uvi": 4.0},
                {"dt": 1_720_007_200, "temp": 23.0, "clouds": 70, "pop": 0.6, "wind_speed": 4.0,
                 "uvi": 2.0, "rain": {"1h": 0.8}}
            ]
        })
    }

    #[tokio::test]
    async fn test_current_and_forecast_share_one_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/3.0/onecall"))
            .and(query_param("appid", "secret"))
            .and(query_param("units", "metric"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body()))
            .expect(1)
            .mount(&server)
            .await;

        let client = OpenWeatherClient::new(&config(format!("{}/data/3.0/onecall", server.uri()))).unwrap();
        let snap = client.current().await.unwrap();
        assert_eq!(snap.number("ambient_temp"), Some(21.5));
        assert_eq!(snap.number("wind_speed_mps"), Some(3.2));
        assert_eq!(snap.text("weather_description"), Some("scattered clouds"));
        assert_eq!(snap.captured_at, 1_720_000_000);

        let fc = client.forecast().await.unwrap();
        assert_eq!(fc.source, SOURCE_NAME);
        assert_eq!(fc.points.len(), 2);
        assert_eq!(fc.points[1].rain_mm, Some(0.8));
        assert_eq!(fc.points[0].rain_mm, None);
    }

    #[tokio::test]
    async fn test_http_error_is_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let client = OpenWeatherClient::new(&config(server.uri())).unwrap();
        let err = client.current().await.unwrap_err();
        assert!(matches!(err, SourceError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&server)
            .await;

        let client = OpenWeatherClient::new(&config(server.uri())).unwrap();
        let err = client.forecast().await.unwrap_err();
        assert!(matches!(err, SourceError::Protocol(_)));
    }
}
