use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::reduce::tolerance::ToleranceFormula;

/// Top-level configuration for the reductoor pipeline.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Node stream listener configuration.
    #[serde(default)]
    pub listen: ListenConfig,

    /// Pipeline channel capacities.
    #[serde(default)]
    pub channels: ChannelsConfig,

    /// Persistence writer configuration.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Metric store connection configuration.
    #[serde(default)]
    pub store: StoreConfig,

    /// Reduction engine configuration.
    #[serde(default)]
    pub reduction: ReductionConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,

    /// How often to log pipeline status. Default: 30s.
    #[serde(default = "default_status_interval", with = "humantime_serde")]
    pub status_interval: Duration,
}

/// Node stream listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenConfig {
    /// Stream URL template; `{addr}` is replaced with the node address.
    #[serde(default = "default_url_template")]
    pub url_template: String,

    /// Basic auth username (empty disables auth).
    #[serde(default)]
    pub username: String,

    /// Basic auth password.
    #[serde(default)]
    pub password: String,

    /// Accept self-signed TLS certificates. BMCs ship with them. Default: true.
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,

    /// TCP connect timeout. Default: 10s.
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Reconnect when a stream goes silent for this long. Default: 90s.
    #[serde(default = "default_idle_timeout", with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Initial reconnect backoff. Default: 1s.
    #[serde(default = "default_backoff", with = "humantime_serde")]
    pub backoff: Duration,

    /// Reconnect backoff ceiling. Default: 60s.
    #[serde(default = "default_backoff_max", with = "humantime_serde")]
    pub backoff_max: Duration,
}

impl ListenConfig {
    /// Expands the URL template for one node address.
    pub fn url_for(&self, addr: &str) -> String {
        self.url_template.replace("{addr}", addr)
    }
}

/// Pipeline channel capacities.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelsConfig {
    /// Read queue capacity in batches. Default: 256.
    #[serde(default = "default_read_capacity")]
    pub read_capacity: usize,

    /// Write queue capacity in records. Default: 4096.
    #[serde(default = "default_write_capacity")]
    pub write_capacity: usize,
}

/// Persistence writer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct WriterConfig {
    /// Records per flush. Default: 5000.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Maximum time between flushes. Default: 1s.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Concurrent insert workers. More than one trades per-series write
    /// order for throughput. Default: 1.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

/// Metric store connection configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// PostgreSQL host. Default: "localhost".
    #[serde(default = "default_store_host")]
    pub host: String,

    /// PostgreSQL port. Default: 5432.
    #[serde(default = "default_store_port")]
    pub port: u16,

    /// Target database name. Default: "telemetry".
    #[serde(default = "default_store_database")]
    pub database: String,

    /// PostgreSQL username (empty omits auth from the DSN).
    #[serde(default)]
    pub username: String,

    /// PostgreSQL password.
    #[serde(default)]
    pub password: String,

    /// Maximum pool connections. Default: 8.
    #[serde(default = "default_pool_max")]
    pub pool_max: u32,

    /// Connection acquire timeout. Default: 10s.
    #[serde(default = "default_store_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Schema migration configuration.
    #[serde(default)]
    pub migrations: MigrationsConfig,
}

/// Schema migration behavior configuration.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct MigrationsConfig {
    /// Run migrations on startup. Default: false.
    #[serde(default)]
    pub enabled: bool,
}

/// Reduction engine configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ReductionConfig {
    /// Tolerance formula (cv, stddev, mean). Default: cv.
    #[serde(default)]
    pub formula: ToleranceFormula,

    /// Width of the tolerance recomputation buckets. Default: 1h.
    #[serde(default = "default_tolerance_bucket", with = "humantime_serde")]
    pub tolerance_bucket: Duration,

    /// Tick spacing for reconstruction. Default: 1s.
    #[serde(default = "default_reconstruct_gap", with = "humantime_serde")]
    pub reconstruct_gap: Duration,

    /// Rollup bucket width. Default: 1m.
    #[serde(default = "default_rollup_width", with = "humantime_serde")]
    pub rollup_width: Duration,

    /// Acceptable mean reconstruction error for validate, in percent.
    /// Default: 5.0.
    #[serde(default = "default_error_bound_pct")]
    pub error_bound_pct: f64,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_status_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_url_template() -> String {
    "https://{addr}/redfish/v1/SSE?$filter=EventFormatType%20eq%20MetricReport".to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_backoff() -> Duration {
    Duration::from_secs(1)
}

fn default_backoff_max() -> Duration {
    Duration::from_secs(60)
}

fn default_read_capacity() -> usize {
    256
}

fn default_write_capacity() -> usize {
    4096
}

fn default_batch_size() -> usize {
    5000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_workers() -> usize {
    1
}

fn default_store_host() -> String {
    "localhost".to_string()
}

fn default_store_port() -> u16 {
    5432
}

fn default_store_database() -> String {
    "telemetry".to_string()
}

fn default_pool_max() -> u32 {
    8
}

fn default_store_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_tolerance_bucket() -> Duration {
    Duration::from_secs(3600)
}

fn default_reconstruct_gap() -> Duration {
    Duration::from_secs(1)
}

fn default_rollup_width() -> Duration {
    Duration::from_secs(60)
}

fn default_error_bound_pct() -> f64 {
    5.0
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            listen: ListenConfig::default(),
            channels: ChannelsConfig::default(),
            writer: WriterConfig::default(),
            store: StoreConfig::default(),
            reduction: ReductionConfig::default(),
            health: HealthConfig::default(),
            status_interval: default_status_interval(),
        }
    }
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            url_template: default_url_template(),
            username: String::new(),
            password: String::new(),
            accept_invalid_certs: true,
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            backoff: default_backoff(),
            backoff_max: default_backoff_max(),
        }
    }
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            read_capacity: default_read_capacity(),
            write_capacity: default_write_capacity(),
        }
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            workers: default_workers(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            host: default_store_host(),
            port: default_store_port(),
            database: default_store_database(),
            username: String::new(),
            password: String::new(),
            pool_max: default_pool_max(),
            connect_timeout: default_store_connect_timeout(),
            migrations: MigrationsConfig::default(),
        }
    }
}

impl Default for ReductionConfig {
    fn default() -> Self {
        Self {
            formula: ToleranceFormula::default(),
            tolerance_bucket: default_tolerance_bucket(),
            reconstruct_gap: default_reconstruct_gap(),
            rollup_width: default_rollup_width(),
            error_bound_pct: default_error_bound_pct(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.listen.url_template.contains("{addr}") {
            bail!("listen.url_template must contain {{addr}}");
        }
        if self.listen.backoff.is_zero() {
            bail!("listen.backoff must be positive");
        }
        if self.listen.backoff_max < self.listen.backoff {
            bail!("listen.backoff_max must be at least listen.backoff");
        }
        if self.listen.idle_timeout.is_zero() {
            bail!("listen.idle_timeout must be positive");
        }

        if self.channels.read_capacity == 0 {
            bail!("channels.read_capacity must be positive");
        }
        if self.channels.write_capacity == 0 {
            bail!("channels.write_capacity must be positive");
        }

        if self.writer.batch_size == 0 {
            bail!("writer.batch_size must be positive");
        }
        if self.writer.flush_interval.is_zero() {
            bail!("writer.flush_interval must be positive");
        }
        if self.writer.workers == 0 {
            bail!("writer.workers must be positive");
        }

        if self.store.host.is_empty() {
            bail!("store.host is required");
        }
        if self.store.database.is_empty() {
            bail!("store.database is required");
        }
        if self.store.pool_max == 0 {
            bail!("store.pool_max must be positive");
        }

        if self.reduction.tolerance_bucket.is_zero() {
            bail!("reduction.tolerance_bucket must be positive");
        }
        if self.reduction.reconstruct_gap.is_zero() {
            bail!("reduction.reconstruct_gap must be positive");
        }
        if self.reduction.rollup_width.is_zero() {
            bail!("reduction.rollup_width must be positive");
        }
        if self.reduction.error_bound_pct <= 0.0 {
            bail!("reduction.error_bound_pct must be positive");
        }

        if self.status_interval.is_zero() {
            bail!("status_interval must be positive");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let cfg = Config::default();
        assert_eq!(cfg.log_level, "info");
        assert_eq!(cfg.status_interval, Duration::from_secs(30));
        assert_eq!(cfg.health.addr, ":9090");
        assert_eq!(cfg.channels.read_capacity, 256);
        assert_eq!(cfg.channels.write_capacity, 4096);
        assert_eq!(cfg.writer.workers, 1);
        assert_eq!(cfg.store.port, 5432);
        assert_eq!(cfg.reduction.formula, ToleranceFormula::Cv);
        assert_eq!(cfg.reduction.tolerance_bucket, Duration::from_secs(3600));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_url_for_replaces_addr() {
        let cfg = ListenConfig {
            url_template: "https://{addr}/sse".to_string(),
            ..Default::default()
        };
        assert_eq!(cfg.url_for("10.0.0.7"), "https://10.0.0.7/sse");
    }

    #[test]
    fn test_partial_yaml_applies_defaults() {
        let yaml = r#"
listen:
  username: monitor
  password: secret
store:
  host: db.cluster.local
  database: telemetry
reduction:
  formula: stddev
  tolerance_bucket: 30m
"#;
        let cfg: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(cfg.listen.username, "monitor");
        assert_eq!(cfg.listen.backoff, Duration::from_secs(1));
        assert_eq!(cfg.store.host, "db.cluster.local");
        assert_eq!(cfg.store.pool_max, 8);
        assert_eq!(cfg.reduction.formula, ToleranceFormula::Stddev);
        assert_eq!(cfg.reduction.tolerance_bucket, Duration::from_secs(1800));
        assert_eq!(cfg.writer.batch_size, 5000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_validation_url_template_requires_addr() {
        let mut cfg = Config::default();
        cfg.listen.url_template = "https://fixed-host/sse".to_string();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("url_template"));
    }

    #[test]
    fn test_validation_backoff_max_below_base() {
        let mut cfg = Config::default();
        cfg.listen.backoff = Duration::from_secs(10);
        cfg.listen.backoff_max = Duration::from_secs(5);
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("backoff_max"));
    }

    #[test]
    fn test_validation_zero_channel_capacity() {
        let mut cfg = Config::default();
        cfg.channels.read_capacity = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("read_capacity"));
    }

    #[test]
    fn test_validation_zero_workers() {
        let mut cfg = Config::default();
        cfg.writer.workers = 0;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("workers"));
    }

    #[test]
    fn test_validation_zero_rollup_width() {
        let mut cfg = Config::default();
        cfg.reduction.rollup_width = Duration::ZERO;
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("rollup_width"));
    }

    #[test]
    fn test_validation_missing_store_host() {
        let mut cfg = Config::default();
        cfg.store.host = String::new();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("store.host"));
    }

    #[test]
    fn test_load_reads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        std::io::Write::write_all(
            &mut file,
            b"log_level: debug\nstore:\n  host: db01\n  database: telemetry\nwriter:\n  batch_size: 250\n",
        )
        .expect("write yaml");

        let cfg = Config::load(file.path()).expect("load");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.store.host, "db01");
        assert_eq!(cfg.writer.batch_size, 250);
    }

    #[test]
    fn test_load_rejects_invalid_config_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        std::io::Write::write_all(&mut file, b"writer:\n  batch_size: 0\n").expect("write yaml");

        let err = Config::load(file.path()).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_load_missing_file_names_path() {
        let err = Config::load(std::path::Path::new("/nonexistent/reductoor.yaml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/reductoor.yaml"));
    }
}
