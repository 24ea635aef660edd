use serde::{Deserialize, Serialize};

/// One hourly forecast point, as supplied by the weather collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    pub ts: i64,
    pub temp_c: Option<f64>,
    pub clouds_pct: Option<f64>,
    pub rain_mm: Option<f64>,
    /// Probability of precipitation (0-1)
    pub pop: Option<f64>,
    pub wind_mps: Option<f64>,
    pub uvi: Option<f64>,
}

impl ForecastPoint {
    pub fn new(ts: i64) -> Self {
        Self {
            ts,
            temp_c: None,
            clouds_pct: None,
            rain_mm: None,
            pop: None,
            wind_mps: None,
            uvi: None,
        }
    }
}

/// Hourly forecast ordered by `ts` ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub source: String,
    pub points: Vec<ForecastPoint>,
}

impl Forecast {
    pub fn new(source: impl Into<String>, mut points: Vec<ForecastPoint>) -> Self {
        points.sort_by_key(|p| p.ts);
        Self {
            source: source.into(),
            points,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points with `now < ts <= now + hours`.
    pub fn window(&self, now_ts: i64, hours: i64) -> &[ForecastPoint] {
        let end = now_ts + hours * 3600;
        let start = self.points.partition_point(|p| p.ts <= now_ts);
        let stop = self.points.partition_point(|p| p.ts <= end);
        &self.points[start..stop.max(start)]
    }

    /// First point strictly after `now_ts`, else the latest point.
    pub fn next_after(&self, now_ts: i64) -> Option<&ForecastPoint> {
        self.points
            .iter()
            .find(|p| p.ts > now_ts)
            .or_else(|| self.points.last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hourly(start: i64, n: i64) -> Forecast {
        Forecast::new("test", (0..n).map(|i| ForecastPoint::new(start + i * 3600)).collect())
    }

    #[test]
    fn test_window_excludes_now_and_includes_horizon_end() {
        let fc = hourly(1000, 8);
        let w = fc.window(1000, 3);
        assert_eq!(w.len(), 3);
        assert_eq!(w[0].ts, 1000 + 3600);
        assert_eq!(w[2].ts, 1000 + 3 * 3600);
    }

    #[test]
    fn test_window_empty_when_forecast_is_stale() {
        let fc = hourly(0, 3);
        assert!(fc.window(100_000, 6).is_empty());
    }

    #[test]
    fn test_next_after_falls_back_to_last_point() {
        let fc = hourly(0, 3);
        assert_eq!(fc.next_after(100_000).unwrap().ts, 7200);
        assert_eq!(fc.next_after(10).unwrap().ts, 3600);
    }

    #[test]
    fn test_new_sorts_points() {
        let fc = Forecast::new("x", vec![ForecastPoint::new(30), ForecastPoint::new(10)]);
        assert_eq!(fc.points[0].ts, 10);
    }
}
