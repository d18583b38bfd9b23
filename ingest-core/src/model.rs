use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decoded response body, exactly as the weather API returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct RawPayload(pub Value);

impl RawPayload {
    pub fn as_value(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for RawPayload {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// One normalized observation, mapped 1:1 onto a `weather_data` row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    // location
    pub city: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub localtime: Option<NaiveDateTime>,

    // conditions
    pub temperature: Option<f64>,
    pub feels_like: Option<f64>,
    pub weather_description: Option<String>,
    pub weather_icon: Option<String>,
    pub wind_speed: Option<f64>,
    pub wind_degree: Option<i32>,
    pub wind_dir: Option<String>,
    pub pressure: Option<i32>,
    pub precip: Option<f64>,
    pub humidity: Option<i32>,
    pub cloudcover: Option<i32>,
    pub uv_index: Option<i32>,
    pub visibility: Option<f64>,
    pub is_day: bool,

    // astronomy
    pub sunrise: Option<NaiveTime>,
    pub sunset: Option<NaiveTime>,
    pub moonrise: Option<NaiveTime>,
    pub moonset: Option<NaiveTime>,
    pub moon_phase: Option<String>,
    pub moon_illumination: Option<i32>,

    // air quality
    pub air_quality_co: Option<f64>,
    pub air_quality_no2: Option<f64>,
    pub air_quality_o3: Option<f64>,
    pub air_quality_so2: Option<f64>,
    pub air_quality_pm2_5: Option<f64>,
    pub air_quality_pm10: Option<f64>,
    pub us_epa_index: Option<i32>,
    pub gb_defra_index: Option<i32>,
}

impl WeatherSnapshot {
    /// True when none of the air-quality fields carry a value.
    pub fn air_quality_is_empty(&self) -> bool {
        [
            self.air_quality_co,
            self.air_quality_no2,
            self.air_quality_o3,
            self.air_quality_so2,
            self.air_quality_pm2_5,
            self.air_quality_pm10,
        ]
        .iter()
        .all(Option::is_none)
            && self.us_epa_index.is_none()
            && self.gb_defra_index.is_none()
    }
}
