//! Simulated sources for development without hardware or an API key.
//!
//! PV follows a half-sine between 06:00 and 20:00 local time with random cloud dimming;
//! the pond slowly tracks the air temperature.

use async_trait::async_trait;
use chrono::{DateTime, Timelike, Utc};
use chrono_tz::Tz;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

use super::{DeviceSource, InverterSource, SourceError, WeatherSource};
use crate::domain::{Forecast, ForecastPoint, RawSnapshot, SourceKind};

const PV_PEAK_W: f64 = 1800.0;
const NOMINAL_BATTERY_V: f64 = 25.6;

/// Fractional local hour of `ts`.
fn local_hour(ts: i64, tz: Tz) -> f64 {
    let local = DateTime::from_timestamp(ts, 0)
        .unwrap_or_default()
        .with_timezone(&tz);
    local.hour() as f64 + local.minute() as f64 / 60.0
}

/// Clear-sky PV fraction (0-1) for a local hour.
fn sun_factor(hour: f64) -> f64 {
    if !(6.0..=20.0).contains(&hour) {
        return 0.0;
    }
    (PI * (hour - 6.0) / 14.0).sin().max(0.0)
}

/// Diurnal air temperature around a 14:00 peak.
fn air_temp(hour: f64) -> f64 {
    16.0 + 6.0 * (PI * (hour - 8.0) / 12.0).sin()
}

pub struct SimulatedInverter {
    tz: Tz,
    rng: Mutex<StdRng>,
    soc: Mutex<f64>,
}

impl SimulatedInverter {
    pub fn new(tz: Tz, seed: u64) -> Self {
        Self {
            tz,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            soc: Mutex::new(70.0),
        }
    }

    pub fn snapshot_at(&self, ts: i64) -> RawSnapshot {
        let hour = local_hour(ts, self.tz);
        let mut rng = self.rng.lock();
        let cloud_dimming = rng.gen_range(0.6..=1.0);
        let pv1 = PV_PEAK_W / 2.0 * sun_factor(hour) * cloud_dimming;
        let pv2 = pv1 * rng.gen_range(0.9..=1.0);
        let load = rng.gen_range(150.0..450.0);

        let mut soc = self.soc.lock();
        let on_grid = *soc < 25.0;
        let net = pv1 + pv2 - if on_grid { 0.0 } else { load };
        *soc = (*soc + net / 500.0).clamp(5.0, 100.0);

        let voltage = NOMINAL_BATTERY_V + (*soc - 50.0) / 50.0 * 1.2;
        let (chg, dis) = if net >= 0.0 {
            (net / voltage, 0.0)
        } else {
            (0.0, -net / voltage)
        };
        let mode = if on_grid { "LINE MODE" } else { "BATTERY MODE" };

        RawSnapshot::new(SourceKind::Inverter, ts)
            .with("battery_voltage", (voltage * 10.0).round() / 10.0)
            .with("battery_soc", soc.round())
            .with("battery_current_chg", (chg * 10.0).round() / 10.0)
            .with("battery_current_dis", (dis * 10.0).round() / 10.0)
            .with("pv1_voltage", if pv1 > 0.0 { 110.0 } else { 0.0 })
            .with("pv1_power", pv1.round())
            .with("pv2_voltage", if pv2 > 0.0 { 108.0 } else { 0.0 })
            .with("pv2_power", pv2.round())
            .with("pv_total_power", (pv1 + pv2).round())
            .with("output_voltage", 230.0)
            .with("output_power", load.round())
            .with("output_apparent_power", (load * 1.1).round())
            .with("ac_output_load", (load / 30.0).round())
            .with("ac_input_voltage", if on_grid { 229.0 } else { 0.0 })
            .with("ac_input_frequency", if on_grid { 50.0 } else { 0.0 })
            .with("working_mode", mode)
            .with("mains_status", if on_grid { "Normal" } else { "Abnormal" })
    }
}

#[async_trait]
impl InverterSource for SimulatedInverter {
    async fn poll(&self) -> Result<RawSnapshot, SourceError> {
        Ok(self.snapshot_at(Utc::now().timestamp()))
    }
}

pub struct SimulatedWeather {
    tz: Tz,
    rng: Mutex<StdRng>,
}

impl SimulatedWeather {
    pub fn new(tz: Tz, seed: u64) -> Self {
        Self {
            tz,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn current_at(&self, ts: i64) -> RawSnapshot {
        let hour = local_hour(ts, self.tz);
        let mut rng = self.rng.lock();
        let clouds: f64 = rng.gen_range(0.0..100.0);
        RawSnapshot::new(SourceKind::Weather, ts)
            .with("ambient_temp", (air_temp(hour) * 10.0).round() / 10.0)
            .with("humidity", rng.gen_range(40.0..90.0_f64).round())
            .with("pressure_hpa", rng.gen_range(1000.0..1025.0_f64).round())
            .with("wind_speed_mps", (rng.gen_range(0.0..8.0_f64) * 10.0).round() / 10.0)
            .with("clouds_pct", clouds.round())
            .with("uvi", (8.0 * sun_factor(hour) * (1.0 - clouds / 200.0) * 10.0).round() / 10.0)
            .with("weather_description", if clouds > 60.0 { "overcast clouds" } else { "clear sky" })
    }

    /// Twelve hourly points starting at the next full hour.
    pub fn forecast_at(&self, ts: i64) -> Forecast {
        let first = ts - ts.rem_euclid(3600) + 3600;
        let mut rng = self.rng.lock();
        let points = (0..12)
            .map(|i| {
                let pt = first + i * 3600;
                let hour = local_hour(pt, self.tz);
                let pop: f64 = rng.gen_range(0.0..1.0);
                ForecastPoint {
                    ts: pt,
                    temp_c: Some((air_temp(hour) * 10.0).round() / 10.0),
                    clouds_pct: Some(rng.gen_range(0.0..100.0_f64).round()),
                    rain_mm: (pop > 0.7).then(|| (pop - 0.7) * 5.0),
                    pop: Some((pop * 100.0).round() / 100.0),
                    wind_mps: Some((rng.gen_range(0.0..8.0_f64) * 10.0).round() / 10.0),
                    uvi: Some((8.0 * sun_factor(hour) * 10.0).round() / 10.0),
                }
            })
            .collect();
        Forecast::new("sim", points)
    }
}

#[async_trait]
impl WeatherSource for SimulatedWeather {
    async fn current(&self) -> Result<RawSnapshot, SourceError> {
        Ok(self.current_at(Utc::now().timestamp()))
    }

    async fn forecast(&self) -> Result<Forecast, SourceError> {
        Ok(self.forecast_at(Utc::now().timestamp()))
    }
}

pub struct SimulatedDevices {
    tz: Tz,
    state: Mutex<DeviceState>,
}

struct DeviceState {
    rng: StdRng,
    water_temp: f64,
    pump_speed: u8,
    started_at: i64,
}

impl SimulatedDevices {
    pub fn new(tz: Tz, seed: u64) -> Self {
        Self {
            tz,
            state: Mutex::new(DeviceState {
                rng: StdRng::seed_from_u64(seed),
                water_temp: 15.0,
                pump_speed: 40,
                started_at: Utc::now().timestamp(),
            }),
        }
    }

    /// Last speed commanded to the simulated pump.
    pub fn set_pump_speed(&self, speed: u8) {
        self.state.lock().pump_speed = speed.min(100);
    }

    pub fn status_at(&self, ts: i64) -> RawSnapshot {
        let hour = local_hour(ts, self.tz);
        let mut st = self.state.lock();
        // The pond lags the air by a few percent per sample.
        let jitter = st.rng.gen_range(-0.05..0.05);
        st.water_temp += (air_temp(hour) - st.water_temp) * 0.02 + jitter;
        let relays_on: u32 = st.rng.gen_range(0..=3);
        let uptime = (ts - st.started_at).max(0);

        RawSnapshot::new(SourceKind::Devices, ts)
            .with("water_temp", (st.water_temp * 100.0).round() / 100.0)
            .with("devices_on_count", relays_on as f64)
            .with("total_load_watt", relays_on as f64 * 60.0)
            .with("pump_speed", st.pump_speed as f64)
            .with("pump_mode", 1.0)
            .with("pump_uptime_today_sec", (uptime % 86_400) as f64)
            .with("pump_current_uptime_sec", uptime as f64)
    }
}

#[async_trait]
impl DeviceSource for SimulatedDevices {
    async fn status(&self) -> Result<RawSnapshot, SourceError> {
        Ok(self.status_at(Utc::now().timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_pv_at_night() {
        let inv = SimulatedInverter::new(Tz::UTC, 7);
        // 02:00 UTC
        let snap = inv.snapshot_at(1_720_058_400);
        assert_eq!(snap.number("pv_total_power"), Some(0.0));
    }

    #[test]
    fn test_pv_at_noon() {
        let inv = SimulatedInverter::new(Tz::UTC, 7);
        // 12:00 UTC
        let snap = inv.snapshot_at(1_720_094_400);
        assert!(snap.number("pv_total_power").unwrap() > 0.0);
        assert!(snap.text("working_mode").is_some());
    }

    #[test]
    fn test_forecast_is_hourly_and_in_future() {
        let wx = SimulatedWeather::new(Tz::UTC, 1);
        let now = 1_720_094_400 + 120;
        let fc = wx.forecast_at(now);
        assert_eq!(fc.points.len(), 12);
        assert!(fc.points.iter().all(|p| p.ts > now));
        assert_eq!(fc.points[1].ts - fc.points[0].ts, 3600);
    }

    #[test]
    fn test_pump_speed_reported() {
        let dev = SimulatedDevices::new(Tz::UTC, 3);
        dev.set_pump_speed(55);
        let snap = dev.status_at(Utc::now().timestamp());
        assert_eq!(snap.number("pump_speed"), Some(55.0));
        assert!(snap.number("water_temp").is_some());
    }

    #[tokio::test]
    async fn test_sources_poll() {
        let inv = SimulatedInverter::new(Tz::UTC, 1);
        assert!(inv.poll().await.is_ok());
        let wx = SimulatedWeather::new(Tz::UTC, 1);
        assert!(!wx.forecast().await.unwrap().is_empty());
    }
}
