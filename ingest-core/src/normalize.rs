//! Maps a weatherstack `current` payload onto the flat [`WeatherSnapshot`] row.
//!
//! Every field is optional in the source. A missing or mistyped value becomes `None`
//! instead of failing the run; only a payload that is not a JSON object is rejected.

use chrono::{NaiveDateTime, NaiveTime};
use serde_json::{Map, Value};

use crate::error::{IngestError, Result};
use crate::model::{RawPayload, WeatherSnapshot};

const LOCALTIME_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%d %H:%M:%S"];
const TIME_OF_DAY_FORMATS: &[&str] = &["%I:%M %p", "%H:%M", "%H:%M:%S"];

/// Turns a raw payload into a snapshot. Pure and deterministic.
pub fn normalize(payload: &RawPayload) -> Result<WeatherSnapshot> {
    let root = payload.as_value().as_object().ok_or_else(|| {
        IngestError::Parse(format!(
            "expected a JSON object, got {}",
            json_type_name(payload.as_value())
        ))
    })?;

    let empty = Map::new();
    let location = object_field(root, "location").unwrap_or(&empty);
    let current = object_field(root, "current").unwrap_or(&empty);
    let astro = object_field(current, "astro").unwrap_or(&empty);
    let air_quality = object_field(current, "air_quality");

    // Astronomy lives under `location` in older payloads and under `current.astro` in newer ones.
    let astro_field = |key: &str| {
        location
            .get(key)
            .filter(|v| !v.is_null())
            .or_else(|| astro.get(key))
    };

    let pollutant = |key: &str| air_quality.and_then(|aq| aq.get(key)).and_then(as_f64);
    let index = |flat_key: &str, nested_key: &str| {
        current
            .get(flat_key)
            .and_then(as_i32)
            .or_else(|| air_quality.and_then(|aq| aq.get(nested_key)).and_then(as_i32))
    };

    Ok(WeatherSnapshot {
        city: location.get("name").and_then(as_text),
        country: location.get("country").and_then(as_text),
        region: location.get("region").and_then(as_text),
        localtime: location.get("localtime").and_then(as_localtime),

        temperature: current.get("temperature").and_then(as_f64),
        feels_like: current.get("feelslike").and_then(as_f64),
        weather_description: first_text(current.get("weather_descriptions")),
        weather_icon: first_text(current.get("weather_icons")),
        wind_speed: current.get("wind_speed").and_then(as_f64),
        wind_degree: current.get("wind_degree").and_then(as_i32),
        wind_dir: current.get("wind_dir").and_then(as_text),
        pressure: current.get("pressure").and_then(as_i32),
        precip: current.get("precip").and_then(as_f64),
        humidity: current.get("humidity").and_then(as_i32),
        cloudcover: current.get("cloudcover").and_then(as_i32),
        uv_index: current.get("uv_index").and_then(as_i32),
        visibility: current.get("visibility").and_then(as_f64),
        is_day: current.get("is_day").and_then(Value::as_str) == Some("yes"),

        sunrise: astro_field("sunrise").and_then(as_time_of_day),
        sunset: astro_field("sunset").and_then(as_time_of_day),
        moonrise: astro_field("moonrise").and_then(as_time_of_day),
        moonset: astro_field("moonset").and_then(as_time_of_day),
        moon_phase: astro_field("moon_phase").and_then(as_text),
        moon_illumination: astro_field("moon_illumination").and_then(as_i32),

        air_quality_co: pollutant("co"),
        air_quality_no2: pollutant("no2"),
        air_quality_o3: pollutant("o3"),
        air_quality_so2: pollutant("so2"),
        air_quality_pm2_5: pollutant("pm2_5"),
        air_quality_pm10: pollutant("pm10"),
        us_epa_index: index("us_epa_index", "us-epa-index"),
        gb_defra_index: index("gb_defra_index", "gb-defra-index"),
    })
}

fn object_field<'a>(obj: &'a Map<String, Value>, key: &str) -> Option<&'a Map<String, Value>> {
    obj.get(key).and_then(Value::as_object)
}

fn as_text(value: &Value) -> Option<String> {
    value.as_str().map(str::to_owned)
}

fn first_text(value: Option<&Value>) -> Option<String> {
    value?.as_array()?.first().and_then(as_text)
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn as_i32(value: &Value) -> Option<i32> {
    match value {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i32::try_from(i).ok(),
            None => n
                .as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= i32::MIN as f64 && *f <= i32::MAX as f64)
                .map(|f| f as i32),
        },
        Value::String(s) => s.trim().parse::<i32>().ok(),
        _ => None,
    }
}

fn as_localtime(value: &Value) -> Option<NaiveDateTime> {
    let s = value.as_str()?.trim();
    LOCALTIME_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
}

fn as_time_of_day(value: &Value) -> Option<NaiveTime> {
    let s = value.as_str()?.trim();
    TIME_OF_DAY_FORMATS
        .iter()
        .find_map(|fmt| NaiveTime::parse_from_str(s, fmt).ok())
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
