use std::{env, path::PathBuf, str::FromStr, time::Duration};

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_with::{DurationSeconds, serde_as};

use crate::error::{ChampionResult, ConfigError};

/// Prefix for every environment override recognized by the engine.
const ENV_PREFIX: &str = "CHAMPION_";

// ================================================================================================
// Top-level configuration
// ================================================================================================

/// Centralized, strongly-typed configuration.
///
/// Precedence is explicit: built-in defaults, then an optional JSON config
/// file, then `CHAMPION_*` environment variables. Callers that accept CLI
/// overrides apply them on top via the `with_*` setters.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ChampionConfig {
    /// Root of the local data lake.
    pub lake_base: PathBuf,

    /// Directory for run checkpoints, task caches and load markers.
    pub state_dir: PathBuf,

    /// Directory for quarantined rows and the validation audit log.
    pub quarantine_dir: PathBuf,

    pub warehouse: WarehouseConfig,
    pub http: HttpConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub validation: ValidationConfig,
    pub task: TaskConfig,

    /// Timezone cron triggers are authored in. Default `Asia/Kolkata`.
    pub schedule_tz: String,
}

impl Default for ChampionConfig {
    fn default() -> Self {
        Self {
            lake_base: PathBuf::from("./data/lake"),
            state_dir: PathBuf::from("./data/state"),
            quarantine_dir: PathBuf::from("./data/quarantine"),
            warehouse: WarehouseConfig::default(),
            http: HttpConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            validation: ValidationConfig::default(),
            task: TaskConfig::default(),
            schedule_tz: "Asia/Kolkata".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WarehouseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            user: "default".to_string(),
            password: String::new(),
            database: "champion".to_string(),
        }
    }
}

impl WarehouseConfig {
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub connect_timeout: Duration,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub read_timeout: Duration,

    /// Bounded retries on network errors, 5xx and 429.
    pub retries: u32,

    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            retries: 3,
            user_agent: format!("champion/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub threshold: u32,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            cooldown: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Rows per streaming validation chunk.
    pub batch_rows: usize,

    /// Violations retained in memory as samples; the rest stream to disk.
    pub max_samples: usize,

    /// Fail the enclosing task on critical violations.
    pub fail_on_errors: bool,

    /// Allowed |Δ| vs previous close for `price_reasonableness`, in percent.
    pub max_price_move_pct: f64,

    /// `data_freshness` ceiling on `ingest_time - event_time`.
    pub max_staleness_hours: i64,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            batch_rows: 10_000,
            max_samples: 100,
            fail_on_errors: false,
            max_price_move_pct: 20.0,
            max_staleness_hours: 48,
        }
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct TaskConfig {
    /// Bounded task-level concurrency for a flow run.
    pub parallelism: usize,

    #[serde_as(as = "DurationSeconds<u64>")]
    pub timeout: Duration,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            timeout: Duration::from_secs(1800),
        }
    }
}

// ================================================================================================
// Loading & precedence
// ================================================================================================

impl ChampionConfig {
    /// Defaults, then the given config file (if any), then the environment.
    pub fn load(file: Option<&std::path::Path>) -> ChampionResult<Self> {
        let mut config = match file {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.schedule_timezone()?;
        Ok(config)
    }

    pub fn from_file(path: &std::path::Path) -> ChampionResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        let config = serde_json::from_str(&raw).map_err(|e| ConfigError::File {
            path: path.display().to_string(),
            msg: e.to_string(),
        })?;
        Ok(config)
    }

    pub fn schedule_timezone(&self) -> ChampionResult<Tz> {
        Tz::from_str(&self.schedule_tz)
            .map_err(|_| {
                ConfigError::InvalidValue {
                    key: "CHAMPION_SCHEDULE_TZ".to_string(),
                    value: self.schedule_tz.clone(),
                    msg: "not an IANA timezone".to_string(),
                }
                .into()
            })
    }

    fn apply_env_overrides(&mut self) -> ChampionResult<()> {
        if let Some(v) = env_opt("LAKE_BASE") {
            self.lake_base = PathBuf::from(v);
        }
        if let Some(v) = env_opt("STATE_DIR") {
            self.state_dir = PathBuf::from(v);
        }
        if let Some(v) = env_opt("QUARANTINE_DIR") {
            self.quarantine_dir = PathBuf::from(v);
        }

        if let Some(v) = env_opt("WAREHOUSE_HOST") {
            self.warehouse.host = v;
        }
        if let Some(v) = env_opt("WAREHOUSE_PORT") {
            self.warehouse.port = parse_env("WAREHOUSE_PORT", &v)?;
        }
        if let Some(v) = env_opt("WAREHOUSE_USER") {
            self.warehouse.user = v;
        }
        if let Some(v) = env_opt("WAREHOUSE_PASSWORD") {
            self.warehouse.password = v;
        }
        if let Some(v) = env_opt("WAREHOUSE_DATABASE") {
            self.warehouse.database = v;
        }

        if let Some(v) = env_opt("HTTP_TIMEOUT_CONNECT") {
            self.http.connect_timeout = parse_duration_env("HTTP_TIMEOUT_CONNECT", &v)?;
        }
        if let Some(v) = env_opt("HTTP_TIMEOUT_READ") {
            self.http.read_timeout = parse_duration_env("HTTP_TIMEOUT_READ", &v)?;
        }
        if let Some(v) = env_opt("HTTP_RETRIES") {
            self.http.retries = parse_env("HTTP_RETRIES", &v)?;
        }

        if let Some(v) = env_opt("CB_THRESHOLD") {
            self.circuit_breaker.threshold = parse_env("CB_THRESHOLD", &v)?;
        }
        if let Some(v) = env_opt("CB_COOLDOWN") {
            self.circuit_breaker.cooldown = parse_duration_env("CB_COOLDOWN", &v)?;
        }

        if let Some(v) = env_opt("VALIDATION_BATCH_ROWS") {
            self.validation.batch_rows = parse_env("VALIDATION_BATCH_ROWS", &v)?;
        }
        if let Some(v) = env_opt("VALIDATION_MAX_SAMPLES") {
            self.validation.max_samples = parse_env("VALIDATION_MAX_SAMPLES", &v)?;
        }

        if let Some(v) = env_opt("TASK_PARALLELISM") {
            self.task.parallelism = parse_env("TASK_PARALLELISM", &v)?;
        }
        if let Some(v) = env_opt("TASK_TIMEOUT") {
            self.task.timeout = parse_duration_env("TASK_TIMEOUT", &v)?;
        }

        if let Some(v) = env_opt("SCHEDULE_TZ") {
            self.schedule_tz = v;
        }

        Ok(())
    }
}

fn env_opt(key: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}{key}")).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(key: &str, value: &str) -> ChampionResult<T>
where
    T::Err: std::fmt::Display,
{
    value.parse().map_err(|e: T::Err| {
        ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
            msg: e.to_string(),
        }
        .into()
    })
}

/// Accepts humantime strings ("30s", "5m") or a bare number of seconds.
fn parse_duration_env(key: &str, value: &str) -> ChampionResult<Duration> {
    if let Ok(secs) = value.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).map_err(|e| {
        ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: value.to_string(),
            msg: e.to_string(),
        }
        .into()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = ChampionConfig::default();
        assert_eq!(config.task.parallelism, 4);
        assert_eq!(config.validation.batch_rows, 10_000);
        assert_eq!(config.validation.max_samples, 100);
        assert_eq!(config.schedule_tz, "Asia/Kolkata");
        assert!(config.schedule_timezone().is_ok());
    }

    #[test]
    fn duration_env_accepts_bare_seconds_and_humantime() {
        assert_eq!(
            parse_duration_env("TASK_TIMEOUT", "90").unwrap(),
            Duration::from_secs(90)
        );
        assert_eq!(
            parse_duration_env("TASK_TIMEOUT", "5m").unwrap(),
            Duration::from_secs(300)
        );
        assert!(parse_duration_env("TASK_TIMEOUT", "soon").is_err());
    }

    #[test]
    fn file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("champion.json");
        std::fs::write(
            &path,
            r#"{"task": {"parallelism": 8}, "warehouse": {"database": "champion_test"}}"#,
        )
        .unwrap();

        let config = ChampionConfig::from_file(&path).unwrap();
        assert_eq!(config.task.parallelism, 8);
        assert_eq!(config.warehouse.database, "champion_test");
        // Untouched sections keep their defaults.
        assert_eq!(config.validation.batch_rows, 10_000);
    }

    #[test]
    fn rejects_unknown_timezone() {
        let config = ChampionConfig {
            schedule_tz: "Mars/Olympus_Mons".to_string(),
            ..Default::default()
        };
        assert!(config.schedule_timezone().is_err());
    }
}
