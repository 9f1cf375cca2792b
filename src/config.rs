use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::Value;

use crate::rollup::channel::{Calculation, ChannelSpec, Operation};
use crate::rollup::error::RollupError;
use crate::rollup::key::{KeyField, KeySpec};
use crate::rollup::registry::{SeriesDefinition, SeriesRegistry};
use crate::rollup::resolution::{CalendarZone, Resolution};

/// Top-level configuration for the rollup daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Zone whose calendar drives bucket truncation: utc, local or
    /// a fixed offset such as +05:30. Default: "local".
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// Rollup record store configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Rollup series maintained by this process.
    #[serde(default)]
    pub series: Vec<SeriesConfig>,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Serve /metrics and /healthz. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

/// Rollup record store configuration.
#[derive(Debug, Default, Deserialize)]
pub struct StoreConfig {
    /// Backend holding rollup records. Default: memory.
    #[serde(default)]
    pub backend: StoreBackend,

    /// SQLite backend configuration.
    #[serde(default)]
    pub sqlite: SqliteConfig,
}

/// SQLite backend configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SqliteConfig {
    /// Database file. Default: "rollups.db".
    #[serde(default = "default_sqlite_path")]
    pub path: PathBuf,

    /// How long a writer waits for a competing lock. Default: 5s.
    #[serde(default = "default_busy_timeout", with = "humantime_serde")]
    pub busy_timeout: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations when the store opens. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// One rollup series.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SeriesConfig {
    /// Unique series name.
    #[serde(default)]
    pub name: String,

    /// Event source the series is attached to. Default: the series name.
    #[serde(default)]
    pub source: Option<String>,

    /// Bucket resolutions to maintain.
    #[serde(default)]
    pub resolutions: Vec<Resolution>,

    /// Dotted path of the event timestamp. Default: event creation time.
    #[serde(default)]
    pub date_field: Option<String>,

    /// Grouping key: `1`/`true` copies the same-named event field,
    /// `{ path: a.b }` resolves a dotted path.
    #[serde(default)]
    pub key: BTreeMap<String, Value>,

    /// Numeric channels keyed by name.
    #[serde(default)]
    pub channels: BTreeMap<String, ChannelConfig>,
}

/// One numeric channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChannelConfig {
    /// Dotted path of the value on the event.
    #[serde(default)]
    pub source: String,

    /// Accumulations applied on write.
    #[serde(default)]
    pub operations: Vec<Operation>,

    /// Statistics derived on read.
    #[serde(default)]
    pub calculations: Vec<Calculation>,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_timezone() -> String {
    "local".to_string()
}

fn default_true() -> bool {
    true
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("rollups.db")
}

fn default_busy_timeout() -> Duration {
    Duration::from_secs(5)
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            timezone: default_timezone(),
            health: HealthConfig::default(),
            store: StoreConfig::default(),
            series: Vec::new(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_health_addr(),
        }
    }
}

impl Default for SqliteConfig {
    fn default() -> Self {
        Self {
            path: default_sqlite_path(),
            busy_timeout: default_busy_timeout(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("loading config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("parsing config")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.health.enabled && self.health.addr.is_empty() {
            bail!("health.addr is required when health is enabled");
        }

        self.zone()?;

        if self.store.backend == StoreBackend::Sqlite {
            if self.store.sqlite.path.as_os_str().is_empty() {
                bail!("store.sqlite.path is required");
            }
            if self.store.sqlite.busy_timeout.is_zero() {
                bail!("store.sqlite.busy_timeout must be positive");
            }
        }

        if self.series.is_empty() {
            bail!("series must contain at least one entry");
        }

        self.registry()?;

        Ok(())
    }

    /// Resolves the configured calendar zone.
    pub fn zone(&self) -> Result<CalendarZone> {
        CalendarZone::parse(&self.timezone).with_context(|| {
            format!(
                "invalid timezone: {} (expected utc, local or +HH:MM)",
                self.timezone
            )
        })
    }

    /// Builds the series registry, validating every series.
    pub fn registry(&self) -> Result<SeriesRegistry> {
        let mut registry = SeriesRegistry::new();
        for (i, series) in self.series.iter().enumerate() {
            let definition = series
                .to_definition()
                .with_context(|| format!("invalid series[{i}]"))?;
            registry
                .register(definition)
                .with_context(|| format!("invalid series[{i}]"))?;
        }
        Ok(registry)
    }
}

impl SeriesConfig {
    /// Converts this entry into a validated series definition.
    pub fn to_definition(&self) -> Result<SeriesDefinition, RollupError> {
        let mut key = KeySpec::new();
        for (field, marker) in &self.key {
            key = key.field(field.clone(), self.key_field(field, marker)?);
        }

        let mut definition = SeriesDefinition::new(self.name.clone())
            .resolutions(self.resolutions.iter().copied())
            .key(key);
        if let Some(source) = &self.source {
            definition = definition.source(source.clone());
        }
        if let Some(date_field) = &self.date_field {
            definition = definition.date_field(date_field.clone());
        }
        for (name, channel) in &self.channels {
            definition = definition.channel(
                name.clone(),
                ChannelSpec::new(channel.source.clone())
                    .with_operations(channel.operations.iter().copied())
                    .with_calculations(channel.calculations.iter().copied()),
            );
        }

        definition.validate()?;
        Ok(definition)
    }

    fn key_field(&self, field: &str, marker: &Value) -> Result<KeyField, RollupError> {
        let invalid = || RollupError::InvalidKeyField {
            series: self.name.clone(),
            field: field.to_string(),
        };

        if field.is_empty() {
            return Err(invalid());
        }

        match marker {
            Value::Bool(true) => Ok(KeyField::Literal),
            Value::Number(n) if n.as_u64() == Some(1) => Ok(KeyField::Literal),
            Value::Object(spec) => match spec.get("path") {
                Some(Value::String(path)) if spec.len() == 1 && !path.is_empty() => {
                    Ok(KeyField::path(path.clone()))
                }
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rollup::event::SourceEvent;
    use chrono::Utc;
    use serde_json::json;

    const PAGEVIEWS: &str = r#"
log_level: debug
timezone: utc
store:
  backend: sqlite
  sqlite:
    path: /tmp/rollups.db
    busy_timeout: 250ms
series:
  - name: pageviews
    source: pageview
    resolutions: [hour, day]
    date_field: occurredAt
    key:
      url: 1
      mobile: true
      host: { path: request.host }
    channels:
      duration:
        source: loadMs
        operations: [sum, min, max]
        calculations: [average, range, range_min, range_max]
"#;

    fn valid_config() -> Config {
        Config {
            series: vec![SeriesConfig {
                name: "pageviews".to_string(),
                resolutions: vec![Resolution::Hour],
                key: BTreeMap::from([("url".to_string(), json!(1))]),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.timezone, "local");
        assert!(cfg.health.enabled);
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.store.sqlite.path, PathBuf::from("rollups.db"));
        assert_eq!(cfg.store.sqlite.busy_timeout, Duration::from_secs(5));
        assert!(cfg.store.sqlite.migrations.enabled);
    }

    #[test]
    fn test_parse_full_config() {
        let cfg = Config::from_yaml(PAGEVIEWS).expect("valid config");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.zone().expect("zone"), CalendarZone::Utc);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.store.sqlite.busy_timeout, Duration::from_millis(250));

        let registry = cfg.registry().expect("registry");
        let series = registry.get("pageviews").expect("series");
        assert_eq!(series.source, "pageview");
        assert_eq!(series.resolutions, vec![Resolution::Hour, Resolution::Day]);
        assert_eq!(series.date_field.as_deref(), Some("occurredAt"));
        assert_eq!(series.key.len(), 3);
        let duration = series.channels.get("duration").expect("channel");
        assert!(duration.accumulates(Operation::Max));
        assert!(duration.calculates(Calculation::RangeMax));

        let Value::Object(fields) = json!({
            "url": "/home",
            "mobile": false,
            "request": {"host": "example.com"},
        }) else {
            panic!("object");
        };
        let key = series.key.extract(&SourceEvent::new("pageview", Utc::now(), fields));
        assert_eq!(key.get("url"), Some(&json!("/home")));
        assert_eq!(key.get("mobile"), Some(&json!(false)));
        assert_eq!(key.get("host"), Some(&json!("example.com")));
    }

    #[test]
    fn test_source_defaults_to_series_name() {
        let registry = valid_config().registry().expect("registry");
        assert_eq!(registry.for_source("pageviews").len(), 1);
    }

    #[test]
    fn test_validation_unknown_resolution() {
        let yaml = "series:\n  - name: s\n    resolutions: [week]\n    key: { url: 1 }\n";
        let err = Config::from_yaml(yaml).unwrap_err();
        assert!(format!("{err:#}").contains("week"));
    }

    #[test]
    fn test_validation_missing_series() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("series"));
    }

    #[test]
    fn test_validation_missing_series_name() {
        let mut cfg = valid_config();
        cfg.series[0].name = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(matches!(
            err.root_cause().downcast_ref::<RollupError>(),
            Some(RollupError::MissingSeriesName)
        ));
    }

    #[test]
    fn test_validation_empty_resolutions_and_key() {
        let mut cfg = valid_config();
        cfg.series[0].resolutions.clear();
        assert!(format!("{:#}", cfg.validate().unwrap_err()).contains("resolution"));

        let mut cfg = valid_config();
        cfg.series[0].key.clear();
        assert!(format!("{:#}", cfg.validate().unwrap_err()).contains("key spec"));
    }

    #[test]
    fn test_validation_invalid_key_markers() {
        for marker in [json!(0), json!(false), json!("url"), json!({"path": ""}), json!([1])] {
            let mut cfg = valid_config();
            cfg.series[0].key = BTreeMap::from([("url".to_string(), marker.clone())]);
            let err = cfg.validate().unwrap_err();
            assert!(
                matches!(
                    err.root_cause().downcast_ref::<RollupError>(),
                    Some(RollupError::InvalidKeyField { .. })
                ),
                "marker {marker} should be rejected"
            );
        }
    }

    #[test]
    fn test_validation_duplicate_series() {
        let mut cfg = valid_config();
        cfg.series.push(cfg.series[0].clone());
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("more than once"));
    }

    #[test]
    fn test_validation_channel_without_operations() {
        let mut cfg = valid_config();
        cfg.series[0].channels.insert(
            "duration".to_string(),
            ChannelConfig {
                source: "loadMs".to_string(),
                ..Default::default()
            },
        );
        let err = cfg.validate().unwrap_err();
        assert!(format!("{err:#}").contains("at least one operation"));
    }

    #[test]
    fn test_validation_timezone() {
        let mut cfg = valid_config();
        cfg.timezone = "mars".to_string();
        assert!(cfg.validate().unwrap_err().to_string().contains("timezone"));

        cfg.timezone = "+05:30".to_string();
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_sqlite_busy_timeout_zero() {
        let mut cfg = valid_config();
        cfg.store.backend = StoreBackend::Sqlite;
        cfg.store.sqlite.busy_timeout = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("busy_timeout"));

        cfg.store.sqlite.busy_timeout = Duration::from_secs(1);
        assert!(cfg.validate().is_ok());
    }
}
