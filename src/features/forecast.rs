//! Next-hour values and rolling 3h/6h aggregates over the hourly forecast.

use crate::domain::{Forecast, ForecastPoint};

/// Aggregates over one forecast horizon. Every field is `None` when the horizon is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HorizonAggregate {
    /// Last temperature in the horizon minus the first
    pub temp_delta: Option<f64>,
    pub max_pop: Option<f64>,
    pub total_rain_mm: Option<f64>,
    pub mean_clouds: Option<f64>,
    pub will_rain: Option<bool>,
}

impl HorizonAggregate {
    /// Aggregate `points`; `pop_threshold` decides when a point counts as rainy.
    pub fn over(points: &[ForecastPoint], pop_threshold: f64) -> Self {
        if points.is_empty() {
            return Self::default();
        }

        let temps: Vec<f64> = points.iter().filter_map(|p| p.temp_c).collect();
        let temp_delta = match temps.as_slice() {
            [first, .., last] => Some(last - first),
            _ => None,
        };

        let max_pop = points
            .iter()
            .filter_map(|p| p.pop)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |a| a.max(v))));

        // Missing rain reports count as dry hours.
        let total_rain_mm = Some(points.iter().map(|p| p.rain_mm.unwrap_or(0.0)).sum());

        let clouds: Vec<f64> = points.iter().filter_map(|p| p.clouds_pct).collect();
        let mean_clouds = if clouds.is_empty() {
            None
        } else {
            Some(clouds.iter().sum::<f64>() / clouds.len() as f64)
        };

        let will_rain = Some(points.iter().any(|p| {
            p.rain_mm.is_some_and(|r| r > 0.0) || p.pop.is_some_and(|pop| pop >= pop_threshold)
        }));

        Self {
            temp_delta,
            max_pop,
            total_rain_mm,
            mean_clouds,
            will_rain,
        }
    }
}

/// Forecast-derived record fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForecastFeatures {
    pub source: Option<String>,
    pub next_hour: Option<ForecastPoint>,
    pub next_3h: HorizonAggregate,
    pub next_6h: HorizonAggregate,
}

impl ForecastFeatures {
    pub fn from_forecast(forecast: Option<&Forecast>, now_ts: i64, pop_threshold: f64) -> Self {
        let Some(fc) = forecast.filter(|fc| !fc.is_empty()) else {
            return Self::default();
        };
        Self {
            source: Some(fc.source.clone()),
            next_hour: fc.next_after(now_ts).cloned(),
            next_3h: HorizonAggregate::over(fc.window(now_ts, 3), pop_threshold),
            next_6h: HorizonAggregate::over(fc.window(now_ts, 6), pop_threshold),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(ts: i64, temp: f64, clouds: f64, rain: Option<f64>, pop: f64) -> ForecastPoint {
        ForecastPoint {
            temp_c: Some(temp),
            clouds_pct: Some(clouds),
            rain_mm: rain,
            pop: Some(pop),
            ..ForecastPoint::new(ts)
        }
    }

    fn sample(now: i64) -> Forecast {
        Forecast::new(
            "test",
            vec![
                point(now, 99.0, 100.0, Some(9.0), 1.0),
                point(now + 3600, 10.0, 20.0, None, 0.1),
                point(now + 7200, 12.0, 40.0, Some(0.0), 0.2),
                point(now + 10_800, 13.0, 60.0, None, 0.3),
                point(now + 14_400, 11.0, 80.0, Some(1.5), 0.9),
            ],
        )
    }

    #[test]
    fn test_three_hour_aggregates() {
        let now = 1_000_000;
        let feats = ForecastFeatures::from_forecast(Some(&sample(now)), now, 0.5);
        let agg = feats.next_3h;
        assert_eq!(agg.temp_delta, Some(3.0));
        assert_eq!(agg.max_pop, Some(0.3));
        assert_eq!(agg.total_rain_mm, Some(0.0));
        assert_eq!(agg.mean_clouds, Some(40.0));
        assert_eq!(agg.will_rain, Some(false));
    }

    #[test]
    fn test_six_hour_horizon_sees_rain() {
        let now = 1_000_000;
        let feats = ForecastFeatures::from_forecast(Some(&sample(now)), now, 0.5);
        assert_eq!(feats.next_6h.will_rain, Some(true));
        assert_eq!(feats.next_6h.total_rain_mm, Some(1.5));
        assert_eq!(feats.next_6h.temp_delta, Some(1.0));
        assert_eq!(feats.next_hour.map(|p| p.ts), Some(now + 3600));
        assert_eq!(feats.source.as_deref(), Some("test"));
    }

    #[test]
    fn test_empty_horizon_is_null_not_zero() {
        let feats = ForecastFeatures::from_forecast(Some(&sample(0)), 10_000_000, 0.5);
        assert_eq!(feats.next_3h, HorizonAggregate::default());
        assert_eq!(feats.next_6h.total_rain_mm, None);
        // Stale forecast still yields its last point as the next-hour value.
        assert_eq!(feats.next_hour.map(|p| p.ts), Some(14_400));
    }

    #[test]
    fn test_single_temperature_has_no_delta() {
        let pts = [point(3600, 10.0, 0.0, None, 0.0)];
        assert_eq!(HorizonAggregate::over(&pts, 0.5).temp_delta, None);
    }

    #[test]
    fn test_missing_forecast() {
        assert_eq!(ForecastFeatures::from_forecast(None, 0, 0.5), ForecastFeatures::default());
    }
}
