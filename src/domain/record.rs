//! The persisted unit of truth.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use strum::{Display, EnumString};

use super::snapshot::FieldValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Season {
    Winter,
    Spring,
    Summer,
    Autumn,
}

impl Season {
    pub fn from_month(month: u32) -> Self {
        match month {
            12 | 1 | 2 => Season::Winter,
            3..=5 => Season::Spring,
            6..=8 => Season::Summer,
            _ => Season::Autumn,
        }
    }
}

/// Water temperature direction relative to the previous record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum WaterTrend {
    Stable,
    Warming,
    Cooling,
}

/// Typed record fields in declaration order; also the flat-file base header.
pub const FIELD_NAMES: &[&str] = &[
    "timestamp",
    "unix_ts",
    "hour",
    "day_of_week",
    "month",
    "is_weekend",
    "is_daytime",
    "is_night",
    "season",
    "battery_voltage",
    "battery_soc",
    "battery_current_chg",
    "battery_current_dis",
    "battery_power",
    "pv1_voltage",
    "pv1_power",
    "pv2_voltage",
    "pv2_power",
    "pv_total_power",
    "output_voltage",
    "output_power",
    "output_apparent_power",
    "ac_output_load",
    "ac_input_voltage",
    "ac_input_frequency",
    "grid_power",
    "working_mode",
    "mains_status",
    "inverter_on",
    "ambient_temp",
    "water_temp",
    "humidity",
    "pressure_hpa",
    "wind_speed_mps",
    "clouds_pct",
    "uvi",
    "weather_description",
    "temp_diff_air_water",
    "water_temp_trend",
    "equivalent_cooling_index",
    "fc_source",
    "fc_dt",
    "fc_temp_c",
    "fc_clouds_pct",
    "fc_pop",
    "fc_rain_mm",
    "fc_wind_mps",
    "fc_uvi",
    "fc3h_temp_delta",
    "fc6h_temp_delta",
    "fc3h_max_pop",
    "fc6h_max_pop",
    "fc3h_total_rain_mm",
    "fc6h_total_rain_mm",
    "fc3h_mean_clouds",
    "fc6h_mean_clouds",
    "will_rain_next_3h",
    "will_rain_next_6h",
    "total_load_watt",
    "devices_on_count",
    "pump_speed",
    "pump_mode",
    "pump_uptime_today_sec",
    "pump_current_uptime_sec",
    "energy_from_pv_wh",
    "energy_from_grid_wh",
    "energy_to_load_wh",
    "energy_to_battery_wh",
    "energy_from_battery_wh",
    "next_hour_pv_power",
    "optimal_pump_speed",
    "should_charge_battery",
    "completeness_score",
];

/// One feature record per collection cycle.
///
/// Fixed typed fields cover every known sensor; anything a source reports that is not
/// modelled here lands in `extra` and is flattened into the serialized form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputedRecord {
    // identity
    pub timestamp: String,
    pub unix_ts: i64,

    // calendar
    pub hour: u32,
    pub day_of_week: u32,
    pub month: u32,
    pub is_weekend: bool,
    pub is_daytime: bool,
    pub is_night: bool,
    pub season: Season,

    // battery
    pub battery_voltage: Option<f64>,
    pub battery_soc: Option<f64>,
    pub battery_current_chg: Option<f64>,
    pub battery_current_dis: Option<f64>,
    /// Signed battery power (W), positive while charging
    pub battery_power: Option<f64>,

    // PV strings
    pub pv1_voltage: Option<f64>,
    pub pv1_power: Option<f64>,
    pub pv2_voltage: Option<f64>,
    pub pv2_power: Option<f64>,
    pub pv_total_power: Option<f64>,

    // inverter output
    pub output_voltage: Option<f64>,
    pub output_power: Option<f64>,
    pub output_apparent_power: Option<f64>,
    pub ac_output_load: Option<f64>,

    // grid
    pub ac_input_voltage: Option<f64>,
    pub ac_input_frequency: Option<f64>,
    pub grid_power: Option<f64>,

    // working mode
    pub working_mode: Option<String>,
    pub mains_status: Option<String>,
    pub inverter_on: Option<bool>,

    // current weather / pond
    pub ambient_temp: Option<f64>,
    pub water_temp: Option<f64>,
    pub humidity: Option<f64>,
    pub pressure_hpa: Option<f64>,
    pub wind_speed_mps: Option<f64>,
    pub clouds_pct: Option<f64>,
    pub uvi: Option<f64>,
    pub weather_description: Option<String>,

    // derived environment
    pub temp_diff_air_water: Option<f64>,
    pub water_temp_trend: Option<WaterTrend>,
    pub equivalent_cooling_index: Option<f64>,

    // next-hour forecast
    pub fc_source: Option<String>,
    pub fc_dt: Option<i64>,
    pub fc_temp_c: Option<f64>,
    pub fc_clouds_pct: Option<f64>,
    pub fc_pop: Option<f64>,
    pub fc_rain_mm: Option<f64>,
    pub fc_wind_mps: Option<f64>,
    pub fc_uvi: Option<f64>,

    // forecast aggregates
    pub fc3h_temp_delta: Option<f64>,
    pub fc6h_temp_delta: Option<f64>,
    pub fc3h_max_pop: Option<f64>,
    pub fc6h_max_pop: Option<f64>,
    pub fc3h_total_rain_mm: Option<f64>,
    pub fc6h_total_rain_mm: Option<f64>,
    pub fc3h_mean_clouds: Option<f64>,
    pub fc6h_mean_clouds: Option<f64>,
    pub will_rain_next_3h: Option<bool>,
    pub will_rain_next_6h: Option<bool>,

    // devices
    pub total_load_watt: Option<f64>,
    pub devices_on_count: Option<u32>,
    pub pump_speed: Option<u8>,
    pub pump_mode: Option<i64>,
    pub pump_uptime_today_sec: Option<i64>,
    pub pump_current_uptime_sec: Option<i64>,

    // energy since the previous record (Wh)
    pub energy_from_pv_wh: Option<f64>,
    pub energy_from_grid_wh: Option<f64>,
    pub energy_to_load_wh: Option<f64>,
    pub energy_to_battery_wh: Option<f64>,
    pub energy_from_battery_wh: Option<f64>,

    // supervised-learning targets, filled offline
    pub next_hour_pv_power: Option<f64>,
    pub optimal_pump_speed: Option<u8>,
    pub should_charge_battery: Option<bool>,

    pub completeness_score: f64,

    #[serde(flatten)]
    pub extra: BTreeMap<String, FieldValue>,
}

impl ComputedRecord {
    /// Serialized form with fields in declaration order and `extra` appended.
    pub fn to_json_map(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }

    /// True when all five energy deltas are null.
    pub fn has_no_energy_deltas(&self) -> bool {
        self.energy_from_pv_wh.is_none()
            && self.energy_from_grid_wh.is_none()
            && self.energy_to_load_wh.is_none()
            && self.energy_to_battery_wh.is_none()
            && self.energy_from_battery_wh.is_none()
    }

    /// One-line human summary used by the collector log.
    pub fn summary(&self) -> String {
        fn show<T: std::fmt::Display>(v: &Option<T>) -> String {
            v.as_ref().map_or_else(|| "n/a".to_string(), |x| x.to_string())
        }
        format!(
            "water={}°C trend={} air={}°C pv={}W batt={}V pump={} mode={}",
            show(&self.water_temp),
            show(&self.water_temp_trend),
            show(&self.ambient_temp),
            show(&self.pv_total_power),
            show(&self.battery_voltage),
            show(&self.pump_speed),
            show(&self.working_mode),
        )
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Record with every typed field set, targets included.
    pub(crate) fn fully_populated() -> ComputedRecord {
        ComputedRecord {
            timestamp: "2024-07-06T12:00:00Z".into(),
            unix_ts: 1_720_267_200,
            hour: 12,
            day_of_week: 5,
            month: 7,
            is_weekend: true,
            is_daytime: true,
            is_night: false,
            season: Season::Summer,
            battery_voltage: Some(26.4),
            battery_soc: Some(80.0),
            battery_current_chg: Some(10.0),
            battery_current_dis: Some(0.0),
            battery_power: Some(264.0),
            pv1_voltage: Some(110.0),
            pv1_power: Some(400.0),
            pv2_voltage: Some(108.0),
            pv2_power: Some(380.0),
            pv_total_power: Some(780.0),
            output_voltage: Some(230.0),
            output_power: Some(350.0),
            output_apparent_power: Some(400.0),
            ac_output_load: Some(12.0),
            ac_input_voltage: Some(231.0),
            ac_input_frequency: Some(50.0),
            grid_power: Some(0.0),
            working_mode: Some("BATTERY MODE".into()),
            mains_status: Some("OK".into()),
            inverter_on: Some(true),
            ambient_temp: Some(24.0),
            water_temp: Some(19.5),
            humidity: Some(55.0),
            pressure_hpa: Some(1013.0),
            wind_speed_mps: Some(3.0),
            clouds_pct: Some(20.0),
            uvi: Some(6.0),
            weather_description: Some("few clouds".into()),
            temp_diff_air_water: Some(4.5),
            water_temp_trend: Some(WaterTrend::Stable),
            equivalent_cooling_index: Some(0.0),
            fc_source: Some("sim".into()),
            fc_dt: Some(1_720_270_800),
            fc_temp_c: Some(25.0),
            fc_clouds_pct: Some(30.0),
            fc_pop: Some(0.1),
            fc_rain_mm: Some(0.0),
            fc_wind_mps: Some(3.5),
            fc_uvi: Some(5.0),
            fc3h_temp_delta: Some(1.0),
            fc6h_temp_delta: Some(-2.0),
            fc3h_max_pop: Some(0.1),
            fc6h_max_pop: Some(0.4),
            fc3h_total_rain_mm: Some(0.0),
            fc6h_total_rain_mm: Some(0.0),
            fc3h_mean_clouds: Some(30.0),
            fc6h_mean_clouds: Some(40.0),
            will_rain_next_3h: Some(false),
            will_rain_next_6h: Some(false),
            total_load_watt: Some(120.0),
            devices_on_count: Some(2),
            pump_speed: Some(40),
            pump_mode: Some(1),
            pump_uptime_today_sec: Some(3600),
            pump_current_uptime_sec: Some(600),
            energy_from_pv_wh: Some(65.0),
            energy_from_grid_wh: Some(0.0),
            energy_to_load_wh: Some(29.0),
            energy_to_battery_wh: Some(22.0),
            energy_from_battery_wh: Some(0.0),
            next_hour_pv_power: Some(800.0),
            optimal_pump_speed: Some(45),
            should_charge_battery: Some(true),
            completeness_score: 1.0,
            extra: BTreeMap::new(),
        }
    }
}
