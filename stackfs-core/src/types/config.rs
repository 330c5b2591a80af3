//! Configuration types for stackfs.

use std::path::{Path, PathBuf};
use serde::{Deserialize, Serialize};
use crate::error::{Result, StackError};
use super::mount::MountOptions;

/// Log level for the stackfs daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only log errors
    Error,
    /// Log errors and warnings
    Warn,
    /// Log errors, warnings, and informational messages
    Info,
    /// Log errors, warnings, info, and debug messages
    Debug,
    /// Log everything including trace-level details
    Trace,
}

impl LogLevel {
    /// Returns the string representation of the log level.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(format!("Unknown log level: {}", s)),
        }
    }
}

/// Daemon configuration, usually read from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    /// Logging level
    pub log_level: LogLevel,

    /// Optional log file path (logs to stderr if None)
    pub log_file: Option<PathBuf>,

    /// Options applied to every mount
    pub mount: MountOptions,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            log_file: None,
            mount: MountOptions::default(),
        }
    }
}

impl StackConfig {
    /// Creates a new StackConfig with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a configuration file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| StackError::from_io(e, path.as_os_str()))?;
        let config: StackConfig = serde_json::from_str(&raw).map_err(|e| {
            StackError::invalid(format!("{}: {}", path.display(), e))
        })?;
        if let Err(errors) = config.validate() {
            return Err(StackError::invalid(errors.join("; ")));
        }
        Ok(config)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let name = &self.mount.adapter_name;
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            errors.push(format!("Invalid adapter name: {:?}", name));
        }

        if self.mount.workdir_mode & !0o7777 != 0 {
            errors.push(format!(
                "workdir_mode {:o} carries file type bits",
                self.mount.workdir_mode
            ));
        }

        if let Some(log_file) = &self.log_file {
            if let Some(parent) = log_file.parent() {
                if !parent.as_os_str().is_empty() && !parent.exists() {
                    errors.push(format!("Log file directory does not exist: {:?}", parent));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_level_ordering() {
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
        assert!(LogLevel::Info < LogLevel::Debug);
        assert!(LogLevel::Debug < LogLevel::Trace);
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("trace".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert!("loud".parse::<LogLevel>().is_err());
        assert_eq!(LogLevel::Debug.to_string(), "debug");
    }

    #[test]
    fn test_config_validate() {
        assert!(StackConfig::default().validate().is_ok());

        let mut config = StackConfig::default();
        config.mount.adapter_name = "a/b".to_string();
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("Invalid adapter name"));

        let mut config = StackConfig::default();
        config.mount.workdir_mode = 0o40700;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"log_level":"debug","mount":{{"require_overlay":true,"adapter_name":"adapter"}}}}"#
        )
        .unwrap();

        let config = StackConfig::load(file.path()).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);
        assert!(config.mount.require_overlay);
        assert_eq!(config.mount.base_dir_name(), "._adapter");
        assert_eq!(config.mount.workdir_mode, 0o700);
    }

    #[test]
    fn test_config_load_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        let err = StackConfig::load(file.path()).unwrap_err();
        assert!(matches!(err, StackError::InvalidArgument { .. }));
    }
}
