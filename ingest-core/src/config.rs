use anyhow::{Context, anyhow};
use backon::ExponentialBuilder;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::error::{IngestError, Result};

pub const DEFAULT_ENDPOINT: &str = "http://api.weatherstack.com";

pub const ENV_API_KEY: &str = "WEATHER_API_KEY";
pub const ENV_LOCATION: &str = "WEATHER_LOCATION";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_ENDPOINT: &str = "WEATHER_API_ENDPOINT";

/// Backoff settings for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; `0` disables retrying.
    pub max_retries: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            min_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_max_times(self.max_retries)
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms.max(self.min_delay_ms)));

        if self.jitter { builder.with_jitter() } else { builder }
    }
}

/// Top-level configuration stored on disk. Every field is optional here;
/// [`Settings::resolve`] decides whether the merged result is usable.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Settings {
    pub api_key: Option<String>,
    pub location: Option<String>,
    pub database_url: Option<String>,

    /// Base URL of the weather API, without the `/current` path.
    pub endpoint: Option<String>,
    pub http_timeout_secs: Option<u64>,
    pub db_timeout_secs: Option<u64>,

    /// Example TOML:
    /// [retry]
    /// max_retries = 3
    pub retry: RetryPolicy,
}

/// Validated configuration handed to the run coordinator.
#[derive(Clone, PartialEq)]
pub struct RunConfig {
    pub api_key: String,
    pub location: String,
    pub database_url: String,
    pub endpoint: String,
    pub http_timeout: Duration,
    pub db_timeout: Duration,
    pub retry: RetryPolicy,
}

impl std::fmt::Debug for RunConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunConfig")
            .field("api_key", &"<redacted>")
            .field("location", &self.location)
            .field("database_url", &"<redacted>")
            .field("endpoint", &self.endpoint)
            .field("http_timeout", &self.http_timeout)
            .field("db_timeout", &self.db_timeout)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Settings {
    /// Load config from disk, or return an empty default if it doesn't exist yet.
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let settings: Settings = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(settings)
    }

    /// Save config to disk, creating parent directories as needed.
    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let toml =
            toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")?;

        fs::write(path, toml)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Path to the config file.
    pub fn config_file_path() -> anyhow::Result<PathBuf> {
        let dirs = ProjectDirs::from("dev", "weather-ingest", "weather-ingest")
            .ok_or_else(|| anyhow!("Could not determine platform config directory"))?;

        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Overlay values found through `lookup` (normally `std::env::var`).
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |slot: &mut Option<String>, key: &str| {
            if let Some(value) = lookup(key).filter(|v| !v.trim().is_empty()) {
                *slot = Some(value);
            }
        };

        set(&mut self.api_key, ENV_API_KEY);
        set(&mut self.location, ENV_LOCATION);
        set(&mut self.database_url, ENV_DATABASE_URL);
        set(&mut self.endpoint, ENV_ENDPOINT);
    }

    /// Overlay explicitly supplied values, e.g. command-line flags.
    pub fn apply_overrides(&mut self, overrides: Settings) {
        if overrides.api_key.is_some() {
            self.api_key = overrides.api_key;
        }
        if overrides.location.is_some() {
            self.location = overrides.location;
        }
        if overrides.database_url.is_some() {
            self.database_url = overrides.database_url;
        }
        if overrides.endpoint.is_some() {
            self.endpoint = overrides.endpoint;
        }
        if overrides.http_timeout_secs.is_some() {
            self.http_timeout_secs = overrides.http_timeout_secs;
        }
        if overrides.db_timeout_secs.is_some() {
            self.db_timeout_secs = overrides.db_timeout_secs;
        }
    }

    /// Validate and freeze into a [`RunConfig`]. Missing or blank key, location or
    /// database URL is a configuration error; there are no fallbacks for them.
    pub fn resolve(&self) -> Result<RunConfig> {
        let api_key = required(&self.api_key, "API key", ENV_API_KEY)?;
        let location = required(&self.location, "location", ENV_LOCATION)?;
        let database_url = self.database_url()?;

        let endpoint = match self.endpoint.as_deref().map(str::trim) {
            None => DEFAULT_ENDPOINT.to_string(),
            Some("") => return Err(IngestError::Config("endpoint must not be blank".into())),
            Some(e) => e.trim_end_matches('/').to_string(),
        };

        let http_timeout = timeout(self.http_timeout_secs, "http_timeout_secs")?;
        let db_timeout = self.db_timeout()?;

        Ok(RunConfig {
            api_key,
            location,
            database_url,
            endpoint,
            http_timeout,
            db_timeout,
            retry: self.retry,
        })
    }

    /// The database half of [`Settings::resolve`], for commands that never call the API.
    pub fn database_url(&self) -> Result<String> {
        required(&self.database_url, "database URL", ENV_DATABASE_URL)
    }

    pub fn db_timeout(&self) -> Result<Duration> {
        timeout(self.db_timeout_secs, "db_timeout_secs")
    }
}

fn required(value: &Option<String>, what: &str, env: &str) -> Result<String> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(IngestError::Config(format!(
            "No {what} configured.\n\
             Hint: set {env}, pass it on the command line, or run `weather-ingest configure`."
        ))),
    }
}

fn timeout(secs: Option<u64>, field: &str) -> Result<Duration> {
    match secs {
        None => Ok(Duration::from_secs(10)),
        Some(0) => Err(IngestError::Config(format!("{field} must be greater than zero"))),
        Some(s) => Ok(Duration::from_secs(s)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn complete() -> Settings {
        Settings {
            api_key: Some("KEY".into()),
            location: Some("Leipzig".into()),
            database_url: Some("postgres://localhost/weather_db".into()),
            ..Settings::default()
        }
    }

    #[test]
    fn resolve_errors_when_api_key_missing() {
        let cfg = Settings {
            api_key: None,
            ..complete()
        };
        let err = cfg.resolve().unwrap_err();

        assert!(matches!(err, IngestError::Config(_)));
        assert!(err.to_string().contains("No API key configured"));
        assert!(err.to_string().contains(ENV_API_KEY));
    }

    #[test]
    fn resolve_rejects_blank_values() {
        let cfg = Settings {
            location: Some("   ".into()),
            ..complete()
        };
        assert!(cfg.resolve().unwrap_err().to_string().contains("No location configured"));

        let cfg = Settings {
            database_url: Some(String::new()),
            ..complete()
        };
        assert!(cfg.resolve().unwrap_err().to_string().contains("No database URL configured"));
    }

    #[test]
    fn resolve_fills_tuning_defaults() {
        let run = complete().resolve().expect("complete settings must resolve");

        assert_eq!(run.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(run.http_timeout, Duration::from_secs(10));
        assert_eq!(run.db_timeout, Duration::from_secs(10));
        assert_eq!(run.retry, RetryPolicy::default());
    }

    #[test]
    fn resolve_rejects_zero_timeout() {
        let cfg = Settings {
            http_timeout_secs: Some(0),
            ..complete()
        };
        assert!(matches!(cfg.resolve(), Err(IngestError::Config(_))));
    }

    #[test]
    fn database_settings_resolve_without_api_fields() {
        let cfg = Settings {
            database_url: Some(" postgres://localhost/weather_db ".into()),
            ..Settings::default()
        };
        assert_eq!(cfg.database_url().unwrap(), "postgres://localhost/weather_db");
        assert_eq!(cfg.db_timeout().unwrap(), Duration::from_secs(10));

        let cfg = Settings {
            db_timeout_secs: Some(0),
            ..cfg
        };
        assert!(matches!(cfg.db_timeout(), Err(IngestError::Config(_))));
        assert!(matches!(Settings::default().database_url(), Err(IngestError::Config(_))));
    }

    #[test]
    fn env_overrides_file_and_flags_override_env() {
        let mut cfg = complete();
        let env: HashMap<&str, &str> =
            [(ENV_LOCATION, "Berlin"), (ENV_API_KEY, ""), (ENV_ENDPOINT, "http://localhost:9/")]
                .into_iter()
                .collect();

        cfg.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.location.as_deref(), Some("Berlin"));
        // blank env values never clobber configured ones
        assert_eq!(cfg.api_key.as_deref(), Some("KEY"));

        cfg.apply_overrides(Settings {
            location: Some("Dresden".into()),
            ..Settings::default()
        });
        let run = cfg.resolve().unwrap();
        assert_eq!(run.location, "Dresden");
        assert_eq!(run.endpoint, "http://localhost:9");
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let run = complete().resolve().unwrap();
        let shown = format!("{run:?}");
        assert!(!shown.contains("KEY\""));
        assert!(!shown.contains("postgres://"));
        assert!(shown.contains("Leipzig"));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = complete();
        cfg.retry.max_retries = 5;
        cfg.save_to(&path).unwrap();

        let loaded = Settings::load_from(&path).unwrap();
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn load_missing_file_gives_empty_settings() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Settings::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded, Settings::default());
    }

    #[test]
    fn partial_retry_table_keeps_defaults() {
        let toml = "location = \"Leipzig\"\n[retry]\nmax_retries = 1\n";
        let cfg: Settings = toml::from_str(toml).unwrap();
        assert_eq!(cfg.retry.max_retries, 1);
        assert_eq!(cfg.retry.min_delay_ms, RetryPolicy::default().min_delay_ms);
    }
}
