//! Configuration file management for warden.
//!
//! Provides a TOML config file at `~/.config/warden/config.toml` and a
//! resolution chain: CLI flag > env var > config file > default.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use warden_core::RunIdentity;
use warden_core::logs::PipelineConfig;

pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 19981;
pub const DEFAULT_POST_SEND_DELAY_SECS: u64 = 30;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub run: RunSection,
    pub report: ReportSection,
    pub logs: LogsSection,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSection {
    pub pod_id: String,
    pub test_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub token: String,
    pub post_send_delay_secs: u64,
}

impl Default for ReportSection {
    fn default() -> Self {
        Self {
            webhook_url: None,
            token: String::new(),
            post_send_delay_secs: DEFAULT_POST_SEND_DELAY_SECS,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sink_url: Option<String>,
    pub token: String,
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for LogsSection {
    fn default() -> Self {
        let pipeline = PipelineConfig::default();
        Self {
            sink_url: None,
            token: String::new(),
            batch_size: pipeline.batch_size,
            flush_interval_ms: pipeline.flush_interval.as_millis() as u64,
            queue_capacity: pipeline.queue_capacity,
        }
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the warden config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/warden` or `~/.config/warden`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("warden");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("warden")
}

pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse the config file. `Ok(None)` if there is none.
pub fn load_config() -> Result<Option<ConfigFile>> {
    let path = config_path();
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config(config: &ConfigFile) -> Result<()> {
    let path = config_path();
    let dir = config_dir();
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create config directory {}", dir.display()))?;

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(&path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Tokens live in this file.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(&path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` falls through to the rest of
/// the chain.
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub bind: Option<String>,
    pub port: Option<u16>,
    pub tests: Option<String>,
    pub command: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    pub bind: String,
    pub port: u16,
    pub identity: RunIdentity,
    pub webhook_url: Option<String>,
    pub webhook_token: String,
    pub post_send_delay: Duration,
    pub log_sink_url: Option<String>,
    pub log_sink_token: String,
    pub pipeline: PipelineConfig,
    /// Raw catalog source (JSON, base64 or `URL:`).
    pub tests: Option<String>,
    /// Worker command line.
    pub command: Option<String>,
}

impl WardenConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// | field | env var |
    /// |---|---|
    /// | bind | `WARDEN_BIND` |
    /// | port | `WARDEN_PORT` |
    /// | pod id / test id | `WARDEN_POD_ID` / `WARDEN_TEST_ID` |
    /// | webhook | `WARDEN_WEBHOOK_URL`, `WARDEN_WEBHOOK_TOKEN`, `WARDEN_POST_SEND_DELAY_SECS` |
    /// | log sink | `WARDEN_LOG_SINK_URL`, `WARDEN_LOG_SINK_TOKEN` |
    /// | log batching | `WARDEN_LOG_BATCH_SIZE`, `WARDEN_LOG_FLUSH_INTERVAL_MS`, `WARDEN_LOG_QUEUE_CAPACITY` |
    /// | catalog / worker | `WARDEN_TESTS` / `WARDEN_COMMAND` |
    pub fn resolve(cli: Overrides) -> Result<Self> {
        let file = load_config()?.unwrap_or_default();

        let bind = cli
            .bind
            .or_else(|| env_string("WARDEN_BIND"))
            .unwrap_or(file.server.bind);
        let port = match cli.port {
            Some(port) => port,
            None => env_parse("WARDEN_PORT")?.unwrap_or(file.server.port),
        };

        let identity = RunIdentity {
            pod_id: env_string("WARDEN_POD_ID").unwrap_or(file.run.pod_id),
            test_id: env_string("WARDEN_TEST_ID").unwrap_or(file.run.test_id),
        };

        let webhook_url = env_string("WARDEN_WEBHOOK_URL").or(file.report.webhook_url);
        let webhook_token = env_string("WARDEN_WEBHOOK_TOKEN").unwrap_or(file.report.token);
        let post_send_delay = Duration::from_secs(
            env_parse("WARDEN_POST_SEND_DELAY_SECS")?.unwrap_or(file.report.post_send_delay_secs),
        );

        let log_sink_url = env_string("WARDEN_LOG_SINK_URL").or(file.logs.sink_url);
        let log_sink_token = env_string("WARDEN_LOG_SINK_TOKEN").unwrap_or(file.logs.token);
        let flush_interval_ms =
            env_parse("WARDEN_LOG_FLUSH_INTERVAL_MS")?.unwrap_or(file.logs.flush_interval_ms);
        if flush_interval_ms == 0 {
            bail!("logs.flush_interval_ms must be greater than zero");
        }
        let pipeline = PipelineConfig {
            queue_capacity: env_parse("WARDEN_LOG_QUEUE_CAPACITY")?
                .unwrap_or(file.logs.queue_capacity),
            batch_size: env_parse("WARDEN_LOG_BATCH_SIZE")?.unwrap_or(file.logs.batch_size),
            flush_interval: Duration::from_millis(flush_interval_ms),
        };

        Ok(Self {
            bind,
            port,
            identity,
            webhook_url,
            webhook_token,
            post_send_delay,
            log_sink_url,
            log_sink_token,
            pipeline,
            tests: cli.tests.or_else(|| env_string("WARDEN_TESTS")),
            command: cli.command.or_else(|| env_string("WARDEN_COMMAND")),
        })
    }
}

/// Non-empty value of `key`.
fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    env_string(key)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("{key} has an invalid value: {raw:?}"))
        })
        .transpose()
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const ENV_KEYS: &[&str] = &[
        "WARDEN_BIND",
        "WARDEN_PORT",
        "WARDEN_POD_ID",
        "WARDEN_TEST_ID",
        "WARDEN_WEBHOOK_URL",
        "WARDEN_WEBHOOK_TOKEN",
        "WARDEN_POST_SEND_DELAY_SECS",
        "WARDEN_LOG_SINK_URL",
        "WARDEN_LOG_SINK_TOKEN",
        "WARDEN_LOG_BATCH_SIZE",
        "WARDEN_LOG_FLUSH_INTERVAL_MS",
        "WARDEN_LOG_QUEUE_CAPACITY",
        "WARDEN_TESTS",
        "WARDEN_COMMAND",
    ];

    /// Holds the env lock and points `XDG_CONFIG_HOME` at a temp dir for
    /// the lifetime of the guard.
    struct EnvGuard {
        _lock: std::sync::MutexGuard<'static, ()>,
        tmp: tempfile::TempDir,
        orig_xdg: Option<String>,
    }

    impl EnvGuard {
        fn new() -> Self {
            let lock = crate::test_util::lock_env();
            let tmp = tempfile::TempDir::new().unwrap();
            let orig_xdg = std::env::var("XDG_CONFIG_HOME").ok();
            unsafe { std::env::set_var("XDG_CONFIG_HOME", tmp.path()) };
            for key in ENV_KEYS {
                unsafe { std::env::remove_var(key) };
            }
            Self {
                _lock: lock,
                tmp,
                orig_xdg,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for key in ENV_KEYS {
                unsafe { std::env::remove_var(key) };
            }
            match self.orig_xdg.take() {
                Some(x) => unsafe { std::env::set_var("XDG_CONFIG_HOME", x) },
                None => unsafe { std::env::remove_var("XDG_CONFIG_HOME") },
            }
        }
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let _env = EnvGuard::new();

        let config = WardenConfig::resolve(Overrides::default()).unwrap();
        assert_eq!(config.bind, DEFAULT_BIND);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.post_send_delay, Duration::from_secs(30));
        assert_eq!(config.pipeline.batch_size, 16);
        assert_eq!(config.pipeline.queue_capacity, 16);
        assert_eq!(config.pipeline.flush_interval, Duration::from_secs(3));
        assert!(config.webhook_url.is_none());
        assert!(config.log_sink_url.is_none());
        assert!(config.tests.is_none());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let env = EnvGuard::new();

        let mut file = ConfigFile::default();
        file.run.pod_id = "pod-7".to_string();
        file.report.webhook_url = Some("https://hooks.test/results".to_string());
        file.logs.batch_size = 32;
        save_config(&file).unwrap();

        assert!(config_path().starts_with(env.tmp.path()));
        let loaded = load_config().unwrap().expect("config file should exist");
        assert_eq!(loaded.run.pod_id, "pod-7");
        assert_eq!(
            loaded.report.webhook_url.as_deref(),
            Some("https://hooks.test/results")
        );
        assert_eq!(loaded.logs.batch_size, 32);
        assert_eq!(loaded.server.port, DEFAULT_PORT);
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _env = EnvGuard::new();
        save_config(&ConfigFile::default()).unwrap();

        let meta = std::fs::metadata(config_path()).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn env_var_overrides_config_file() {
        let _env = EnvGuard::new();

        let mut file = ConfigFile::default();
        file.server.port = 8000;
        file.run.pod_id = "from-file".to_string();
        save_config(&file).unwrap();

        unsafe { std::env::set_var("WARDEN_PORT", "9000") };
        unsafe { std::env::set_var("WARDEN_POD_ID", "from-env") };

        let config = WardenConfig::resolve(Overrides::default()).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.identity.pod_id, "from-env");
    }

    #[test]
    fn cli_flag_overrides_env_var() {
        let _env = EnvGuard::new();

        unsafe { std::env::set_var("WARDEN_PORT", "9000") };
        unsafe { std::env::set_var("WARDEN_TESTS", "[]") };

        let config = WardenConfig::resolve(Overrides {
            port: Some(7000),
            tests: Some("URL:http://catalog.test".to_string()),
            ..Overrides::default()
        })
        .unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.tests.as_deref(), Some("URL:http://catalog.test"));
    }

    #[test]
    fn invalid_env_port_is_an_error() {
        let _env = EnvGuard::new();

        unsafe { std::env::set_var("WARDEN_PORT", "not-a-port") };

        let err = WardenConfig::resolve(Overrides::default()).unwrap_err();
        assert!(
            err.to_string().contains("WARDEN_PORT"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn log_batching_reads_env_over_file() {
        let _env = EnvGuard::new();

        let mut file = ConfigFile::default();
        file.logs.batch_size = 32;
        file.logs.flush_interval_ms = 5000;
        save_config(&file).unwrap();

        unsafe { std::env::set_var("WARDEN_LOG_BATCH_SIZE", "8") };
        unsafe { std::env::set_var("WARDEN_LOG_QUEUE_CAPACITY", "64") };

        let config = WardenConfig::resolve(Overrides::default()).unwrap();
        assert_eq!(config.pipeline.batch_size, 8);
        assert_eq!(config.pipeline.queue_capacity, 64);
        assert_eq!(config.pipeline.flush_interval, Duration::from_millis(5000));

        unsafe { std::env::set_var("WARDEN_LOG_FLUSH_INTERVAL_MS", "250") };
        let config = WardenConfig::resolve(Overrides::default()).unwrap();
        assert_eq!(config.pipeline.flush_interval, Duration::from_millis(250));
    }

    #[test]
    fn zero_flush_interval_is_rejected() {
        let _env = EnvGuard::new();

        let mut file = ConfigFile::default();
        file.logs.flush_interval_ms = 0;
        save_config(&file).unwrap();

        let err = WardenConfig::resolve(Overrides::default()).unwrap_err();
        assert!(
            err.to_string().contains("flush_interval_ms"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let path = config_path();
        assert!(
            path.ends_with("warden/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
