//! Persistence boundary: the fixed `weather_data` table and the stores that write to it.
//!
//! The DDL and the INSERT are both rendered from [`COLUMNS`], and every value reaches
//! the database as a bound parameter produced by [`bind_values`].

use async_trait::async_trait;
use chrono::{NaiveDateTime, NaiveTime};
use std::fmt::Debug;

use crate::{error::Result, model::WeatherSnapshot};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

pub const TABLE_NAME: &str = "weather_data";

#[async_trait]
pub trait SnapshotStore: Send + Sync + Debug {
    /// Create the snapshot table if it does not exist. Never alters an existing table.
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert one row atomically. Append-only: the same snapshot twice gives two rows.
    async fn persist(&self, snapshot: &WeatherSnapshot) -> Result<()>;

    /// Release any held connections. Called once at the end of a run.
    async fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Float,
    Integer,
    Boolean,
    Timestamp,
    Time,
}

impl ColumnType {
    pub fn sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Float => "FLOAT",
            ColumnType::Integer => "INTEGER",
            ColumnType::Boolean => "BOOLEAN",
            ColumnType::Timestamp => "TIMESTAMP",
            ColumnType::Time => "TIME",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub ty: ColumnType,
}

const fn col(name: &'static str, ty: ColumnType) -> Column {
    Column { name, ty }
}

/// Data columns of `weather_data`, in table order. The surrogate `id` is not listed.
pub const COLUMNS: [Column; 32] = {
    use ColumnType::*;
    [
        col("city", Text),
        col("country", Text),
        col("region", Text),
        col("localtime", Timestamp),
        col("temperature", Float),
        col("feels_like", Float),
        col("weather_description", Text),
        col("weather_icon", Text),
        col("wind_speed", Float),
        col("wind_degree", Integer),
        col("wind_dir", Text),
        col("pressure", Integer),
        col("precip", Float),
        col("humidity", Integer),
        col("cloudcover", Integer),
        col("uv_index", Integer),
        col("visibility", Float),
        col("is_day", Boolean),
        col("sunrise", Time),
        col("sunset", Time),
        col("moonrise", Time),
        col("moonset", Time),
        col("moon_phase", Text),
        col("moon_illumination", Integer),
        col("air_quality_co", Float),
        col("air_quality_no2", Float),
        col("air_quality_o3", Float),
        col("air_quality_so2", Float),
        col("air_quality_pm2_5", Float),
        col("air_quality_pm10", Float),
        col("us_epa_index", Integer),
        col("gb_defra_index", Integer),
    ]
};

/// A single bound parameter. Nulls stay typed so the driver can bind them uniformly.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(Option<String>),
    Float(Option<f64>),
    Integer(Option<i32>),
    Boolean(bool),
    Timestamp(Option<NaiveDateTime>),
    Time(Option<NaiveTime>),
}

impl SqlValue {
    pub fn column_type(&self) -> ColumnType {
        match self {
            SqlValue::Text(_) => ColumnType::Text,
            SqlValue::Float(_) => ColumnType::Float,
            SqlValue::Integer(_) => ColumnType::Integer,
            SqlValue::Boolean(_) => ColumnType::Boolean,
            SqlValue::Timestamp(_) => ColumnType::Timestamp,
            SqlValue::Time(_) => ColumnType::Time,
        }
    }
}

/// `(column, value)` pairs for every column in [`COLUMNS`], in the same order.
pub fn bind_values(s: &WeatherSnapshot) -> [(&'static str, SqlValue); 32] {
    use SqlValue::*;
    [
        ("city", Text(s.city.clone())),
        ("country", Text(s.country.clone())),
        ("region", Text(s.region.clone())),
        ("localtime", Timestamp(s.localtime)),
        ("temperature", Float(s.temperature)),
        ("feels_like", Float(s.feels_like)),
        ("weather_description", Text(s.weather_description.clone())),
        ("weather_icon", Text(s.weather_icon.clone())),
        ("wind_speed", Float(s.wind_speed)),
        ("wind_degree", Integer(s.wind_degree)),
        ("wind_dir", Text(s.wind_dir.clone())),
        ("pressure", Integer(s.pressure)),
        ("precip", Float(s.precip)),
        ("humidity", Integer(s.humidity)),
        ("cloudcover", Integer(s.cloudcover)),
        ("uv_index", Integer(s.uv_index)),
        ("visibility", Float(s.visibility)),
        ("is_day", Boolean(s.is_day)),
        ("sunrise", Time(s.sunrise)),
        ("sunset", Time(s.sunset)),
        ("moonrise", Time(s.moonrise)),
        ("moonset", Time(s.moonset)),
        ("moon_phase", Text(s.moon_phase.clone())),
        ("moon_illumination", Integer(s.moon_illumination)),
        ("air_quality_co", Float(s.air_quality_co)),
        ("air_quality_no2", Float(s.air_quality_no2)),
        ("air_quality_o3", Float(s.air_quality_o3)),
        ("air_quality_so2", Float(s.air_quality_so2)),
        ("air_quality_pm2_5", Float(s.air_quality_pm2_5)),
        ("air_quality_pm10", Float(s.air_quality_pm10)),
        ("us_epa_index", Integer(s.us_epa_index)),
        ("gb_defra_index", Integer(s.gb_defra_index)),
    ]
}

/// Identifiers are always quoted; `localtime` is a reserved word in PostgreSQL.
fn quoted(name: &str) -> String {
    format!("\"{name}\"")
}

pub fn create_table_sql() -> String {
    let columns: Vec<String> = COLUMNS
        .iter()
        .map(|c| format!("    {} {}", quoted(c.name), c.ty.sql()))
        .collect();

    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    id SERIAL PRIMARY KEY,\n{}\n)",
        quoted(TABLE_NAME),
        columns.join(",\n")
    )
}

pub fn insert_sql() -> String {
    let names: Vec<String> = COLUMNS.iter().map(|c| quoted(c.name)).collect();
    let placeholders: Vec<String> = (1..=COLUMNS.len()).map(|i| format!("${i}")).collect();

    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quoted(TABLE_NAME),
        names.join(", "),
        placeholders.join(", ")
    )
}
