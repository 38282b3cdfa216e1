use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::log_source::ReopenPolicy;
use crate::watch::WatcherKind;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.as_ref().display()))?;

        Ok(config)
    }

    /// Load config from default locations or fall back to defaults
    pub fn load_or_default() -> Result<Self> {
        let paths = [
            PathBuf::from("/etc/hostwarden/config.toml"),
            dirs_next::config_dir()
                .map(|p| p.join("hostwarden/config.toml"))
                .unwrap_or_default(),
            PathBuf::from("config.toml"),
        ];

        for path in &paths {
            if path.is_file() {
                return Self::load(path);
            }
        }

        Ok(Self::default())
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)
            .with_context(|| format!("Failed to write config file: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Get the PID file path
    pub fn pid_path(&self) -> PathBuf {
        PathBuf::from(&self.general.pid_file)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Path to PID file
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Send diagnostics to syslog when running detached
    #[serde(default = "default_true")]
    pub syslog: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_level: default_log_level(),
            syslog: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Authentication log to follow
    #[serde(default = "default_auth_log")]
    pub auth_log: PathBuf,

    /// Deny list blocked hosts are appended to (must exist)
    #[serde(default = "default_deny_file")]
    pub deny_file: PathBuf,

    /// Reopen attempts after the log is rotated away
    #[serde(default = "default_rotate_attempts")]
    pub rotate_attempts: u32,

    /// Seconds between reopen attempts
    #[serde(default = "default_one")]
    pub rotate_interval_secs: u64,

    /// File watcher backend: "native" or "poll"
    #[serde(default = "default_watcher")]
    pub watcher: String,

    /// Poll period for the "poll" watcher (seconds)
    #[serde(default = "default_one")]
    pub poll_interval_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            auth_log: default_auth_log(),
            deny_file: default_deny_file(),
            rotate_attempts: default_rotate_attempts(),
            rotate_interval_secs: default_one(),
            watcher: default_watcher(),
            poll_interval_secs: default_one(),
        }
    }
}

impl MonitorConfig {
    pub fn reopen_policy(&self) -> ReopenPolicy {
        ReopenPolicy {
            attempts: self.rotate_attempts.max(1),
            interval: Duration::from_secs(self.rotate_interval_secs),
        }
    }

    pub fn watcher_kind(&self) -> Result<WatcherKind> {
        match self.watcher.as_str() {
            "native" | "inotify" => Ok(WatcherKind::Native),
            "poll" => Ok(WatcherKind::Poll(Duration::from_secs(
                self.poll_interval_secs.max(1),
            ))),
            other => anyhow::bail!("Unknown watcher backend: {}", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Mail the operator when a host is blocked or the daemon crashes
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Mail transport: "sendmail", "smtp" or "none"
    #[serde(default = "default_transport")]
    pub transport: String,

    /// Recipient mailbox
    #[serde(default = "default_recipient")]
    pub recipient: String,

    /// Sender mailbox
    #[serde(default = "default_sender")]
    pub from: String,

    /// Reverse-resolve blocked addresses for the report
    #[serde(default = "default_true")]
    pub resolve_names: bool,

    #[serde(default)]
    pub smtp: SmtpConfig,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            transport: default_transport(),
            recipient: default_recipient(),
            from: default_sender(),
            resolve_names: true,
            smtp: SmtpConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    #[serde(default = "default_smtp_host")]
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// "none", "starttls" or "tls"
    #[serde(default = "default_smtp_tls")]
    pub tls: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            host: default_smtp_host(),
            port: default_smtp_port(),
            username: None,
            password: None,
            tls: default_smtp_tls(),
        }
    }
}

// Default value functions
fn default_pid_file() -> String {
    "/var/run/hostwarden.pid".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_auth_log() -> PathBuf {
    PathBuf::from("/var/log/auth.log")
}

fn default_deny_file() -> PathBuf {
    PathBuf::from("/etc/hosts.deny")
}

fn default_rotate_attempts() -> u32 {
    3600
}

fn default_one() -> u64 {
    1
}

fn default_watcher() -> String {
    "native".to_string()
}

fn default_transport() -> String {
    "sendmail".to_string()
}

fn default_recipient() -> String {
    "root@localhost".to_string()
}

fn default_sender() -> String {
    "hostwarden@localhost".to_string()
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    25
}

fn default_smtp_tls() -> String {
    "none".to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.monitor.auth_log, PathBuf::from("/var/log/auth.log"));
        assert_eq!(config.monitor.deny_file, PathBuf::from("/etc/hosts.deny"));
        assert_eq!(config.monitor.reopen_policy(), ReopenPolicy::default());
        assert_eq!(config.monitor.watcher_kind().unwrap(), WatcherKind::Native);
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.monitor.auth_log, config.monitor.auth_log);
        assert_eq!(parsed.notify.transport, config.notify.transport);
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let parsed: Config = toml::from_str(
            r#"
            [monitor]
            auth_log = "/var/log/secure"
            watcher = "poll"
            poll_interval_secs = 0

            [notify]
            transport = "none"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.monitor.auth_log, PathBuf::from("/var/log/secure"));
        assert_eq!(parsed.monitor.rotate_attempts, 3600);
        assert_eq!(
            parsed.monitor.watcher_kind().unwrap(),
            WatcherKind::Poll(Duration::from_secs(1))
        );
        assert_eq!(parsed.notify.transport, "none");
        assert_eq!(parsed.general.pid_file, "/var/run/hostwarden.pid");
    }

    #[test]
    fn test_unknown_watcher_rejected() {
        let config = MonitorConfig {
            watcher: "fanotify".to_string(),
            ..MonitorConfig::default()
        };
        assert!(config.watcher_kind().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.monitor.deny_file = PathBuf::from("/tmp/deny");
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.monitor.deny_file, PathBuf::from("/tmp/deny"));
    }
}
