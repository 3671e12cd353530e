//! Transport Configuration
//!
//! Configuration types for spawning subprocess transports and for the
//! process-wide defaults shared by every transport.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::flow_control::WriteLimits;
use super::traits::TransportError;

/// Terminal dimensions in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub rows: u16,
    pub cols: u16,
}

impl WindowSize {
    pub fn new(rows: u16, cols: u16) -> Self {
        Self { rows, cols }
    }
}

/// Where the child's stderr goes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrMode {
    /// Redirect to `/dev/null`
    Discard,
    /// Share the parent's stderr
    #[default]
    Inherit,
    /// Capture into a Spooler, readable through `stderr()`
    Capture,
}

/// How child exit is detected.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatcherStrategy {
    /// pidfd when the kernel supports it, SIGCHLD otherwise
    #[default]
    Auto,
    /// Readiness on a process descriptor (Linux 5.3+)
    #[serde(rename = "pidfd")]
    PidFd,
    /// SIGCHLD notifications plus non-blocking reaping
    Signal,
}

impl FromStr for WatcherStrategy {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "pidfd" => Ok(Self::PidFd),
            "signal" | "sigchld" => Ok(Self::Signal),
            other => Err(TransportError::InvalidConfig(format!(
                "unknown exit watcher '{other}' (expected auto, pidfd or signal)"
            ))),
        }
    }
}

/// Process-wide transport defaults
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Write backlog watermarks for new transports
    pub write_limits: WriteLimits,

    /// Exit-watching strategy for new subprocess transports
    pub watcher: WatcherStrategy,
}

impl TransportConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `BRIDGE_WRITE_HIGH_WATER`: high watermark in bytes
    /// - `BRIDGE_WRITE_LOW_WATER`: low watermark in bytes
    /// - `BRIDGE_EXIT_WATCHER`: "auto", "pidfd" or "signal"
    ///
    /// Unparseable or inconsistent values fall back to the defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let high = lookup("BRIDGE_WRITE_HIGH_WATER").and_then(|v| v.parse().ok());
        let low = lookup("BRIDGE_WRITE_LOW_WATER").and_then(|v| v.parse().ok());
        let write_limits = WriteLimits::new(high, low).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring write watermarks from environment");
            WriteLimits::default()
        });

        let watcher = lookup("BRIDGE_EXIT_WATCHER")
            .and_then(|v| match v.parse() {
                Ok(strategy) => Some(strategy),
                Err(err) => {
                    tracing::warn!(error = %err, "ignoring BRIDGE_EXIT_WATCHER");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            write_limits,
            watcher,
        }
    }
}

/// Everything needed to start a subprocess transport
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubprocessConfig {
    /// Program followed by its arguments; looked up in `PATH`
    pub args: Vec<String>,

    /// Variables added to (or, with `env_clear`, replacing) the inherited
    /// environment
    pub env: HashMap<String, String>,

    /// Start from an empty environment instead of the parent's
    pub env_clear: bool,

    /// Working directory for the child
    pub cwd: Option<PathBuf>,

    /// Attach the child to a new pseudo-terminal instead of pipes
    pub pty: bool,

    /// Initial terminal size (PTY mode only)
    pub window: Option<WindowSize>,

    pub stderr: StderrMode,

    pub watcher: WatcherStrategy,

    pub write_limits: WriteLimits,
}

impl SubprocessConfig {
    /// Configuration running `args` over pipes with default settings
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Apply process-wide defaults (watermarks, exit watcher)
    pub fn with_transport_config(mut self, config: &TransportConfig) -> Self {
        self.write_limits = config.write_limits;
        self.watcher = config.watcher;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_env_clear(mut self, clear: bool) -> Self {
        self.env_clear = clear;
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_pty(mut self, pty: bool) -> Self {
        self.pty = pty;
        self
    }

    pub fn with_window(mut self, window: WindowSize) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_stderr(mut self, stderr: StderrMode) -> Self {
        self.stderr = stderr;
        self
    }

    pub fn with_watcher(mut self, watcher: WatcherStrategy) -> Self {
        self.watcher = watcher;
        self
    }

    pub fn with_write_limits(mut self, limits: WriteLimits) -> Self {
        self.write_limits = limits;
        self
    }

    /// Check the configuration before anything is spawned
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.args.is_empty() {
            return Err(TransportError::InvalidConfig(
                "argument vector must not be empty".into(),
            ));
        }
        if self.window.is_some() && !self.pty {
            return Err(TransportError::InvalidConfig(
                "a window size requires pty mode".into(),
            ));
        }
        self.write_limits.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_watcher_strategy_parse() {
        assert_eq!("auto".parse::<WatcherStrategy>().unwrap(), WatcherStrategy::Auto);
        assert_eq!("PidFd".parse::<WatcherStrategy>().unwrap(), WatcherStrategy::PidFd);
        assert_eq!("sigchld".parse::<WatcherStrategy>().unwrap(), WatcherStrategy::Signal);
        assert!("fork".parse::<WatcherStrategy>().is_err());
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config = TransportConfig::from_lookup(|_| None);
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn test_from_lookup_values() {
        let config = TransportConfig::from_lookup(|key| match key {
            "BRIDGE_WRITE_HIGH_WATER" => Some("4096".into()),
            "BRIDGE_EXIT_WATCHER" => Some("signal".into()),
            _ => None,
        });
        assert_eq!(config.write_limits, WriteLimits { high: 4096, low: 1024 });
        assert_eq!(config.watcher, WatcherStrategy::Signal);
    }

    #[test]
    fn test_from_lookup_inconsistent_limits_fall_back() {
        let config = TransportConfig::from_lookup(|key| match key {
            "BRIDGE_WRITE_HIGH_WATER" => Some("10".into()),
            "BRIDGE_WRITE_LOW_WATER" => Some("20".into()),
            "BRIDGE_EXIT_WATCHER" => Some("bogus".into()),
            _ => None,
        });
        assert_eq!(config, TransportConfig::default());
    }

    #[test]
    fn test_subprocess_config_builder() {
        let config = SubprocessConfig::new(["sh", "-c", "true"])
            .with_env("A", "1")
            .with_pty(true)
            .with_window(WindowSize::new(24, 80))
            .with_stderr(StderrMode::Capture);

        assert_eq!(config.args, vec!["sh", "-c", "true"]);
        assert_eq!(config.env.get("A").map(String::as_str), Some("1"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_configs() {
        assert!(SubprocessConfig::default().validate().is_err());
        assert!(SubprocessConfig::new(["cat"])
            .with_window(WindowSize::new(24, 80))
            .validate()
            .is_err());
        assert!(SubprocessConfig::new(["cat"])
            .with_write_limits(WriteLimits { high: 1, low: 2 })
            .validate()
            .is_err());
    }

    #[test]
    fn test_subprocess_config_deserialize() {
        let json = r#"{
            "args": ["cat"],
            "pty": true,
            "window": {"rows": 22, "cols": 33},
            "stderr": "capture",
            "watcher": "pidfd"
        }"#;
        let config: SubprocessConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.window, Some(WindowSize::new(22, 33)));
        assert_eq!(config.stderr, StderrMode::Capture);
        assert_eq!(config.watcher, WatcherStrategy::PidFd);
        assert_eq!(config.write_limits, WriteLimits::default());
        assert!(!config.env_clear);
    }
}
