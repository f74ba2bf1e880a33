//! Runtime configuration
//!
//! Loaded from a TOML file; every key is optional.
//!
//! ```toml
//! unit = "picoclaw"
//! source = "journald"
//! default_lines = 100
//! metrics_interval_secs = 5
//!
//! [shell]
//! query = "docker logs --tail {lines} {unit}"
//! follow = "docker logs -f --tail 0 {unit}"
//! units = "docker ps --format '{{.Names}}'"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use logtide_hub::HubConfig;
use logtide_logs::{AdapterConfig, FileSource, JournaldSource, LogSource, ShellSource};

/// File read when `--config` is not given, if it exists
pub const DEFAULT_CONFIG_FILE: &str = "logtide.toml";

/// Where log text comes from
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// systemd journal (default)
    #[default]
    Journald,
    /// `<log_dir>/<unit>.log` files
    File,
    /// User-supplied shell templates
    Shell,
}

/// Command templates for the shell source
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellTemplates {
    pub query: String,
    pub follow: String,
    pub units: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Unit used when a command is not given one
    pub unit: String,

    pub source: SourceKind,

    /// Directory searched by the file source
    pub log_dir: PathBuf,

    pub shell: ShellTemplates,

    pub metrics_interval_secs: u64,
    pub fetch_timeout_secs: u64,
    pub units_timeout_secs: u64,

    /// Line cap for a query that does not name one
    pub default_lines: usize,

    pub control_capacity: usize,
    pub outbox_capacity: usize,
    pub idle_flush_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        let hub = HubConfig::default();
        let adapter = AdapterConfig::default();
        Self {
            unit: "picoclaw".to_string(),
            source: SourceKind::default(),
            log_dir: PathBuf::from("/var/log"),
            shell: ShellTemplates::default(),
            metrics_interval_secs: 5,
            fetch_timeout_secs: adapter.fetch_timeout.as_secs(),
            units_timeout_secs: adapter.units_timeout.as_secs(),
            default_lines: 100,
            control_capacity: hub.control_capacity,
            outbox_capacity: hub.outbox_capacity,
            idle_flush_ms: adapter.idle_flush.as_millis() as u64,
        }
    }
}

impl Config {
    /// Load from `path`, or from `logtide.toml` if present, or use defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => {
                let fallback = Path::new(DEFAULT_CONFIG_FILE);
                if fallback.is_file() {
                    Self::from_file(fallback)
                } else {
                    Ok(Self::default())
                }
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.control_capacity == 0 || self.outbox_capacity == 0 {
            bail!("hub capacities must be at least 1");
        }
        for (key, value) in [
            ("metrics_interval_secs", self.metrics_interval_secs),
            ("fetch_timeout_secs", self.fetch_timeout_secs),
            ("units_timeout_secs", self.units_timeout_secs),
            ("idle_flush_ms", self.idle_flush_ms),
        ] {
            if value == 0 {
                bail!("{key} must be at least 1");
            }
        }
        if self.source == SourceKind::Shell {
            let ShellTemplates { query, follow, units } = &self.shell;
            if query.is_empty() || follow.is_empty() || units.is_empty() {
                bail!("shell source needs [shell] query, follow and units templates");
            }
        }
        Ok(())
    }

    pub fn hub_config(&self) -> HubConfig {
        HubConfig {
            control_capacity: self.control_capacity,
            outbox_capacity: self.outbox_capacity,
        }
    }

    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            units_timeout: Duration::from_secs(self.units_timeout_secs),
            idle_flush: Duration::from_millis(self.idle_flush_ms),
            ..AdapterConfig::default()
        }
    }

    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval_secs)
    }

    /// Build the configured log source
    pub fn log_source(&self) -> Arc<dyn LogSource> {
        match self.source {
            SourceKind::Journald => Arc::new(JournaldSource::new()),
            SourceKind::File => Arc::new(FileSource::new(&self.log_dir)),
            SourceKind::Shell => Arc::new(ShellSource::new(
                &self.shell.query,
                &self.shell.follow,
                &self.shell.units,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.unit, "picoclaw");
        assert_eq!(config.default_lines, 100);
        assert_eq!(config.adapter_config(), AdapterConfig::default());
        assert_eq!(config.hub_config().outbox_capacity, 256);
        assert_eq!(config.metrics_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_file_source() {
        let config = Config::parse(
            r#"
            unit = "api"
            source = "file"
            log_dir = "/srv/logs"
            fetch_timeout_secs = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.source, SourceKind::File);
        assert_eq!(config.log_source().name(), "file");
        assert_eq!(config.adapter_config().fetch_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_shell_source_requires_templates() {
        let err = Config::parse(r#"source = "shell""#).unwrap_err();
        assert!(err.to_string().contains("templates"), "{err}");

        let config = Config::parse(
            r#"
            source = "shell"
            [shell]
            query = "cat {unit}.log"
            follow = "tail -f {unit}.log"
            units = "ls"
            "#,
        )
        .unwrap();
        assert_eq!(config.log_source().name(), "shell");
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(Config::parse("outbox_capacity = 0").is_err());
        for key in [
            "metrics_interval_secs",
            "fetch_timeout_secs",
            "units_timeout_secs",
            "idle_flush_ms",
        ] {
            let err = Config::parse(&format!("{key} = 0")).unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
        assert!(Config::parse(r#"source = "syslog""#).is_err());
        assert!(Config::parse("no_such_key = 1").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "default_lines = 20").unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.default_lines, 20);

        let err = Config::load(Some(Path::new("/nonexistent/logtide.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("failed to read config"));
    }
}
