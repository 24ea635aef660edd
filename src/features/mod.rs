//! Feature engineering: raw snapshots plus the previous record in, one [`ComputedRecord`] out.
//!
//! [`FeatureComputer::compute`] is pure. It never fails on missing inputs; an absent source
//! or field becomes `None` in the record and is reflected in the completeness score.

pub mod calendar;
pub mod completeness;
pub mod energy;
pub mod forecast;

use anyhow::Result;
use chrono_tz::Tz;
use std::collections::BTreeMap;

use crate::config::CollectorConfig;
use crate::domain::{
    ComputedRecord, FieldValue, RawSnapshot, SnapshotBundle, WaterTrend, FIELD_NAMES,
};

use calendar::CalendarFeatures;
use energy::PowerSample;
use forecast::ForecastFeatures;

/// Working mode reported while the inverter passes mains power through.
pub const LINE_MODE: &str = "LINE MODE";

/// Below this ambient temperature wind starts to cool the pond.
const COOLING_REFERENCE_C: f64 = 20.0;

/// Raw field names accepted in place of the record field names.
mod aliases {
    pub const BATTERY_SOC: &[&str] = &["battery_soc", "battery_capacity"];
    pub const BATTERY_CURRENT_CHG: &[&str] = &["battery_current_chg", "battery_charging_current"];
    pub const BATTERY_CURRENT_DIS: &[&str] =
        &["battery_current_dis", "battery_discharging_current"];
    pub const AMBIENT_TEMP: &[&str] = &["ambient_temp", "temp"];
    pub const PRESSURE: &[&str] = &["pressure_hpa", "pressure"];
    pub const WIND: &[&str] = &["wind_speed_mps", "wind_speed"];
    pub const CLOUDS: &[&str] = &["clouds_pct", "clouds"];
    pub const DESCRIPTION: &[&str] = &["weather_description", "description"];
    pub const WATER_TEMP: &[&str] = &["water_temp", "pondtemp"];
    /// Tuya thermometers report tenths of a degree.
    pub const WATER_TEMP_TENTHS: &str = "temp_current";
    pub const PUMP_SPEED: &[&str] = &["pump_speed", "P"];

    /// Alias-only names; together with the record field names they are never copied to `extra`.
    pub const ALL: &[&str] = &[
        "battery_capacity",
        "battery_charging_current",
        "battery_discharging_current",
        "temp",
        "pressure",
        "wind_speed",
        "clouds",
        "description",
        "pondtemp",
        WATER_TEMP_TENTHS,
        "P",
    ];
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureSettings {
    pub tz: Tz,
    pub trend_dead_band_c: f64,
    pub max_integration_gap_secs: i64,
    pub rain_pop_threshold: f64,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            tz: Tz::UTC,
            trend_dead_band_c: 0.1,
            max_integration_gap_secs: 3600,
            rain_pop_threshold: 0.5,
        }
    }
}

impl FeatureSettings {
    pub fn from_config(cfg: &CollectorConfig) -> Result<Self> {
        Ok(Self {
            tz: cfg.tz()?,
            trend_dead_band_c: cfg.trend_dead_band_c,
            max_integration_gap_secs: cfg.max_integration_gap_secs,
            rain_pop_threshold: cfg.rain_pop_threshold,
        })
    }
}

/// Read-only view over an optional snapshot.
#[derive(Clone, Copy)]
struct Fields<'a>(Option<&'a RawSnapshot>);

impl<'a> Fields<'a> {
    fn num(&self, key: &str) -> Option<f64> {
        self.0.and_then(|s| s.number(key))
    }

    fn num_any(&self, keys: &[&str]) -> Option<f64> {
        self.0.and_then(|s| s.number_any(keys))
    }

    fn int(&self, key: &str) -> Option<i64> {
        self.0.and_then(|s| s.integer(key))
    }

    fn text_any(&self, keys: &[&str]) -> Option<String> {
        self.0
            .and_then(|s| keys.iter().find_map(|k| s.text(k)))
            .map(str::to_string)
    }
}

/// Classify `current` against `previous` with a symmetric dead band.
pub fn classify_trend(previous: f64, current: f64, dead_band: f64) -> WaterTrend {
    let diff = current - previous;
    if diff.abs() <= dead_band {
        WaterTrend::Stable
    } else if diff > 0.0 {
        WaterTrend::Warming
    } else {
        WaterTrend::Cooling
    }
}

/// Water temperature from the pond sensor, falling back to tenths-of-degree readings.
fn water_temp(fields: Fields<'_>) -> Option<f64> {
    fields.num_any(aliases::WATER_TEMP).or_else(|| {
        fields
            .num(aliases::WATER_TEMP_TENTHS)
            .map(|tenths| round_to(tenths / 10.0, 1))
    })
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, Default)]
pub struct FeatureComputer {
    settings: FeatureSettings,
}

impl FeatureComputer {
    pub fn new(settings: FeatureSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &FeatureSettings {
        &self.settings
    }

    /// Build the record for `now_ts` from this cycle's snapshots and the previous record.
    pub fn compute(
        &self,
        previous: Option<&ComputedRecord>,
        bundle: &SnapshotBundle,
        now_ts: i64,
    ) -> ComputedRecord {
        let cal = CalendarFeatures::from_unix(now_ts, self.settings.tz);
        let inv = Fields(bundle.inverter.as_ref());
        let wx = Fields(bundle.weather.as_ref());
        let dev = Fields(bundle.devices.as_ref());

        // inverter
        let battery_voltage = inv.num("battery_voltage");
        let battery_current_chg = inv.num_any(aliases::BATTERY_CURRENT_CHG);
        let battery_current_dis = inv.num_any(aliases::BATTERY_CURRENT_DIS);
        let battery_power = match (battery_current_chg, battery_current_dis, battery_voltage) {
            (Some(chg), Some(dis), Some(v)) => Some(round_to((chg - dis) * v, 2)),
            _ => None,
        };

        let pv1_power = inv.num("pv1_power");
        let pv2_power = inv.num("pv2_power");
        let pv_total_power = inv.num("pv_total_power").or(match (pv1_power, pv2_power) {
            (None, None) => None,
            (a, b) => Some(a.unwrap_or(0.0) + b.unwrap_or(0.0)),
        });

        let output_power = inv.num("output_power");
        let working_mode = inv.text_any(&["working_mode"]);
        let on_grid = working_mode.as_deref().map(|m| m == LINE_MODE);
        let grid_power = match on_grid {
            Some(true) => output_power,
            Some(false) => Some(0.0),
            None => None,
        };

        // weather and pond
        let ambient_temp = wx.num_any(aliases::AMBIENT_TEMP);
        let wind_speed_mps = wx.num_any(aliases::WIND);
        let water_temp = water_temp(dev).or_else(|| water_temp(wx));

        let temp_diff_air_water = match (ambient_temp, water_temp) {
            (Some(air), Some(water)) => Some(round_to(air - water, 2)),
            _ => None,
        };
        let equivalent_cooling_index = match (ambient_temp, wind_speed_mps) {
            (Some(air), Some(wind)) => Some(round_to((COOLING_REFERENCE_C - air).max(0.0) * wind, 3)),
            _ => None,
        };
        let water_temp_trend = match (previous.and_then(|p| p.water_temp), water_temp) {
            (Some(prev), Some(curr)) => {
                Some(classify_trend(prev, curr, self.settings.trend_dead_band_c))
            }
            _ => None,
        };

        let fc = ForecastFeatures::from_forecast(
            bundle.forecast.as_ref(),
            now_ts,
            self.settings.rain_pop_threshold,
        );
        let next = fc.next_hour.as_ref();

        let mut record = ComputedRecord {
            timestamp: cal.timestamp,
            unix_ts: now_ts,
            hour: cal.hour,
            day_of_week: cal.day_of_week,
            month: cal.month,
            is_weekend: cal.is_weekend,
            is_daytime: cal.is_daytime,
            is_night: cal.is_night,
            season: cal.season,

            battery_voltage,
            battery_soc: inv.num_any(aliases::BATTERY_SOC),
            battery_current_chg,
            battery_current_dis,
            battery_power,

            pv1_voltage: inv.num("pv1_voltage"),
            pv1_power,
            pv2_voltage: inv.num("pv2_voltage"),
            pv2_power,
            pv_total_power,

            output_voltage: inv.num("output_voltage"),
            output_power,
            output_apparent_power: inv.num("output_apparent_power"),
            ac_output_load: inv.num("ac_output_load"),

            ac_input_voltage: inv.num("ac_input_voltage"),
            ac_input_frequency: inv.num("ac_input_frequency"),
            grid_power,

            inverter_on: on_grid.map(|grid| !grid),
            working_mode,
            mains_status: inv.text_any(&["mains_status"]),

            ambient_temp,
            water_temp,
            humidity: wx.num("humidity"),
            pressure_hpa: wx.num_any(aliases::PRESSURE),
            wind_speed_mps,
            clouds_pct: wx.num_any(aliases::CLOUDS),
            uvi: wx.num("uvi"),
            weather_description: wx.text_any(aliases::DESCRIPTION),

            temp_diff_air_water,
            water_temp_trend,
            equivalent_cooling_index,

            fc_source: fc.source.clone(),
            fc_dt: next.map(|p| p.ts),
            fc_temp_c: next.and_then(|p| p.temp_c),
            fc_clouds_pct: next.and_then(|p| p.clouds_pct),
            fc_pop: next.and_then(|p| p.pop),
            fc_rain_mm: next.and_then(|p| p.rain_mm),
            fc_wind_mps: next.and_then(|p| p.wind_mps),
            fc_uvi: next.and_then(|p| p.uvi),

            fc3h_temp_delta: fc.next_3h.temp_delta,
            fc6h_temp_delta: fc.next_6h.temp_delta,
            fc3h_max_pop: fc.next_3h.max_pop,
            fc6h_max_pop: fc.next_6h.max_pop,
            fc3h_total_rain_mm: fc.next_3h.total_rain_mm,
            fc6h_total_rain_mm: fc.next_6h.total_rain_mm,
            fc3h_mean_clouds: fc.next_3h.mean_clouds,
            fc6h_mean_clouds: fc.next_6h.mean_clouds,
            will_rain_next_3h: fc.next_3h.will_rain,
            will_rain_next_6h: fc.next_6h.will_rain,

            total_load_watt: dev.num("total_load_watt"),
            devices_on_count: dev
                .int("devices_on_count")
                .and_then(|n| u32::try_from(n).ok()),
            pump_speed: dev
                .num_any(aliases::PUMP_SPEED)
                .map(|s| s.round().clamp(0.0, 100.0) as u8),
            pump_mode: dev.int("pump_mode"),
            pump_uptime_today_sec: dev.int("pump_uptime_today_sec"),
            pump_current_uptime_sec: dev.int("pump_current_uptime_sec"),

            energy_from_pv_wh: None,
            energy_from_grid_wh: None,
            energy_to_load_wh: None,
            energy_to_battery_wh: None,
            energy_from_battery_wh: None,

            next_hour_pv_power: None,
            optimal_pump_speed: None,
            should_charge_battery: None,

            completeness_score: 0.0,
            extra: carry_extras(bundle),
        };

        if let Some(prev) = previous {
            let deltas = energy::integrate(
                &PowerSample::of(prev),
                prev.unix_ts,
                &PowerSample::of(&record),
                now_ts,
                self.settings.max_integration_gap_secs,
            );
            record.energy_from_pv_wh = deltas.from_pv_wh;
            record.energy_from_grid_wh = deltas.from_grid_wh;
            record.energy_to_load_wh = deltas.to_load_wh;
            record.energy_to_battery_wh = deltas.to_battery_wh;
            record.energy_from_battery_wh = deltas.from_battery_wh;
        }

        record.completeness_score = completeness::score(&record);
        record
    }
}

/// Snapshot fields the record does not model. The first source reporting a key wins.
fn carry_extras(bundle: &SnapshotBundle) -> BTreeMap<String, FieldValue> {
    let mut extra = BTreeMap::new();
    let snapshots = [&bundle.inverter, &bundle.weather, &bundle.devices];
    for snap in snapshots.into_iter().flatten() {
        for (key, value) in &snap.fields {
            if FIELD_NAMES.contains(&key.as_str()) || aliases::ALL.contains(&key.as_str()) {
                continue;
            }
            // NaN and infinities have no JSON form and would come back as null.
            if matches!(value, FieldValue::Number(v) if !v.is_finite()) {
                continue;
            }
            extra.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    extra
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Forecast, ForecastPoint, SourceKind};

    fn inverter(ts: i64, pv_w: f64) -> RawSnapshot {
        RawSnapshot::new(SourceKind::Inverter, ts)
            .with("pv_total_power", pv_w)
            .with("battery_voltage", 26.0)
            .with("battery_current_chg", 5.0)
            .with("battery_current_dis", 0.0)
            .with("output_power", 300.0)
            .with("working_mode", "BATTERY MODE")
    }

    fn bundle(ts: i64, pv_w: f64, water: f64) -> SnapshotBundle {
        SnapshotBundle {
            inverter: Some(inverter(ts, pv_w)),
            weather: Some(
                RawSnapshot::new(SourceKind::Weather, ts)
                    .with("ambient_temp", 15.0)
                    .with("wind_speed", 2.0),
            ),
            forecast: None,
            devices: Some(RawSnapshot::new(SourceKind::Devices, ts).with("water_temp", water)),
        }
    }

    #[test]
    fn test_pv_energy_scenario() {
        let fc = FeatureComputer::default();
        let prev = fc.compute(None, &bundle(1000, 100.0, 12.8), 1000);
        let curr = fc.compute(Some(&prev), &bundle(1300, 200.0, 12.84), 1300);
        assert!((curr.energy_from_pv_wh.unwrap() - 12.5).abs() < 1e-9);
        assert_eq!(curr.water_temp_trend, Some(WaterTrend::Stable));
    }

    #[test]
    fn test_first_record_has_null_deltas() {
        let fc = FeatureComputer::default();
        let first = fc.compute(None, &bundle(1000, 100.0, 12.8), 1000);
        assert!(first.has_no_energy_deltas());
        assert_eq!(first.water_temp_trend, None);
    }

    #[test]
    fn test_outage_gap_nulls_all_deltas() {
        let fc = FeatureComputer::default();
        let prev = fc.compute(None, &bundle(0, 100.0, 12.0), 0);
        let curr = fc.compute(Some(&prev), &bundle(5 * 3600, 100.0, 12.0), 5 * 3600);
        assert!(curr.has_no_energy_deltas());
    }

    #[test]
    fn test_compute_is_idempotent() {
        let fc = FeatureComputer::default();
        let prev = fc.compute(None, &bundle(1000, 100.0, 12.8), 1000);
        let b = bundle(1300, 200.0, 13.5);
        assert_eq!(fc.compute(Some(&prev), &b, 1300), fc.compute(Some(&prev), &b, 1300));
    }

    #[test]
    fn test_trend_classification() {
        assert_eq!(classify_trend(12.8, 12.84, 0.1), WaterTrend::Stable);
        assert_eq!(classify_trend(12.8, 13.0, 0.1), WaterTrend::Warming);
        assert_eq!(classify_trend(12.8, 12.5, 0.1), WaterTrend::Cooling);
    }

    #[test]
    fn test_derived_inverter_fields() {
        let fc = FeatureComputer::default();
        let rec = fc.compute(None, &bundle(1000, 100.0, 12.0), 1000);
        assert_eq!(rec.battery_power, Some(130.0));
        assert_eq!(rec.inverter_on, Some(true));
        assert_eq!(rec.grid_power, Some(0.0));

        let mut line = bundle(1000, 0.0, 12.0);
        if let Some(inv) = line.inverter.as_mut() {
            inv.insert("working_mode", LINE_MODE);
        }
        let rec = fc.compute(None, &line, 1000);
        assert_eq!(rec.inverter_on, Some(false));
        assert_eq!(rec.grid_power, Some(300.0));
    }

    #[test]
    fn test_environment_features() {
        let fc = FeatureComputer::default();
        let rec = fc.compute(None, &bundle(1000, 100.0, 12.0), 1000);
        assert_eq!(rec.temp_diff_air_water, Some(3.0));
        // (20 - 15) * 2 m/s
        assert_eq!(rec.equivalent_cooling_index, Some(10.0));
        assert_eq!(rec.wind_speed_mps, Some(2.0));
    }

    #[test]
    fn test_water_temp_from_tenths() {
        let fc = FeatureComputer::default();
        let b = SnapshotBundle {
            devices: Some(RawSnapshot::new(SourceKind::Devices, 0).with("temp_current", 184.0)),
            ..Default::default()
        };
        assert_eq!(fc.compute(None, &b, 0).water_temp, Some(18.4));
    }

    #[test]
    fn test_missing_sources_are_null_not_fatal() {
        let fc = FeatureComputer::default();
        let rec = fc.compute(None, &SnapshotBundle::default(), 1000);
        assert_eq!(rec.battery_voltage, None);
        assert_eq!(rec.fc3h_max_pop, None);
        assert_eq!(rec.completeness_score, 0.0);
    }

    #[test]
    fn test_unknown_fields_carried_into_extra() {
        let fc = FeatureComputer::default();
        let mut b = bundle(1000, 100.0, 12.0);
        if let Some(dev) = b.devices.as_mut() {
            dev.insert("pond_ph", 7.1);
            dev.insert("pondtemp", 11.0);
        }
        let rec = fc.compute(None, &b, 1000);
        assert_eq!(rec.extra.get("pond_ph"), Some(&FieldValue::Number(7.1)));
        assert!(!rec.extra.contains_key("pondtemp"));
        assert!(!rec.extra.contains_key("pv_total_power"));
    }

    #[test]
    fn test_forecast_fields_populated() {
        let fc = FeatureComputer::default();
        let now = 10_000;
        let mut p1 = ForecastPoint::new(now + 3600);
        p1.temp_c = Some(10.0);
        p1.pop = Some(0.7);
        let mut p2 = ForecastPoint::new(now + 7200);
        p2.temp_c = Some(8.0);
        let b = SnapshotBundle {
            forecast: Some(Forecast::new("sim", vec![p1, p2])),
            ..Default::default()
        };
        let rec = fc.compute(None, &b, now);
        assert_eq!(rec.fc_dt, Some(now + 3600));
        assert_eq!(rec.fc3h_temp_delta, Some(-2.0));
        assert_eq!(rec.will_rain_next_3h, Some(true));
        assert_eq!(rec.fc_source.as_deref(), Some("sim"));
    }

    #[test]
    fn test_score_stays_in_unit_interval() {
        let fc = FeatureComputer::default();
        let rec = fc.compute(None, &bundle(1000, 100.0, 12.0), 1000);
        assert!(rec.completeness_score > 0.0 && rec.completeness_score < 1.0);
    }

    #[test]
    fn test_non_finite_extras_are_dropped() {
        let fc = FeatureComputer::default();
        let mut b = bundle(1000, 100.0, 12.0);
        if let Some(inv) = b.inverter.as_mut() {
            inv.insert("grid_freq_raw", f64::NAN);
            inv.insert("grid_freq_peak", f64::INFINITY);
            inv.insert("grid_freq_avg", 49.98);
        }
        let rec = fc.compute(None, &b, 1000);
        assert!(!rec.extra.contains_key("grid_freq_raw"));
        assert!(!rec.extra.contains_key("grid_freq_peak"));
        assert_eq!(rec.extra.get("grid_freq_avg"), Some(&FieldValue::Number(49.98)));
    }
}
