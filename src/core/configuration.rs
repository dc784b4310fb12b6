//! Runtime options for the supervisor.
//!
//! Options are read from YAML. Every field has a default, so an empty
//! document is a valid configuration:
//!
//! ```yaml
//! max_guest_threads: 4096
//! control_plane_cpu: 2
//! dispatch_spin_iterations: 64
//! log_level: info
//! ```

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Upper bound for `max_guest_threads`. Each slot reserves a window of the
/// stub's address space, so the value has to stay well below what fits there.
pub const MAX_GUEST_THREADS_LIMIT: u32 = 65536;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SystrapConfig {
    /// Number of stack slots per subprocess, i.e. the maximum number of stub
    /// threads a single subprocess can host.
    #[serde(default = "default_max_guest_threads")]
    pub max_guest_threads: u32,

    /// CPU to pin each subprocess' control-plane worker to. When unset the
    /// worker is not pinned, but its thread identity is still fixed.
    #[serde(default)]
    pub control_plane_cpu: Option<u32>,

    /// Busy-wait iterations before sleeping on the message futex while
    /// waiting for a stub to yield.
    #[serde(default = "default_dispatch_spin_iterations")]
    pub dispatch_spin_iterations: u32,

    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
}

fn default_max_guest_threads() -> u32 {
    4096
}

fn default_dispatch_spin_iterations() -> u32 {
    64
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for SystrapConfig {
    fn default() -> Self {
        Self {
            max_guest_threads: default_max_guest_threads(),
            control_plane_cpu: None,
            dispatch_spin_iterations: default_dispatch_spin_iterations(),
            log_level: default_log_level(),
        }
    }
}

impl SystrapConfig {
    pub fn from_yaml_str(s: &str) -> anyhow::Result<Self> {
        let config: Self = serde_yaml::from_str(s).context("Failed to parse systrap options")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_GUEST_THREADS_LIMIT).contains(&self.max_guest_threads) {
            anyhow::bail!(
                "max_guest_threads must be in 1..={MAX_GUEST_THREADS_LIMIT}, got {}",
                self.max_guest_threads
            );
        }
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
    Debug,
    Trace,
}

impl FromStr for LogLevel {
    type Err = serde_yaml::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_yaml::from_str(s)
    }
}

impl From<LogLevel> for log::LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = SystrapConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, SystrapConfig::default());
        assert_eq!(config.max_guest_threads, 4096);
        assert_eq!(config.control_plane_cpu, None);
        assert_eq!(log::LevelFilter::from(config.log_level), log::LevelFilter::Info);
    }

    #[test]
    fn test_parse_all_fields() {
        let config = SystrapConfig::from_yaml_str(
            "max_guest_threads: 16\ncontrol_plane_cpu: 3\ndispatch_spin_iterations: 0\nlog_level: trace\n",
        )
        .unwrap();
        assert_eq!(config.max_guest_threads, 16);
        assert_eq!(config.control_plane_cpu, Some(3));
        assert_eq!(config.dispatch_spin_iterations, 0);
        assert_eq!(config.log_level, LogLevel::Trace);
    }

    #[test]
    fn test_rejects_unknown_fields() {
        assert!(SystrapConfig::from_yaml_str("max_threads: 3\n").is_err());
    }

    #[test]
    fn test_max_guest_threads_bounds() {
        assert!(SystrapConfig::from_yaml_str("max_guest_threads: 0\n").is_err());
        assert!(SystrapConfig::from_yaml_str("max_guest_threads: 65536\n").is_ok());
        assert!(SystrapConfig::from_yaml_str("max_guest_threads: 65537\n").is_err());
    }

    #[test]
    fn test_log_level_from_str() {
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warning);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_from_path() {
        let path = std::env::temp_dir().join(format!("systrap-config-{}.yaml", std::process::id()));
        std::fs::write(&path, "dispatch_spin_iterations: 5\n").unwrap();
        let config = SystrapConfig::from_path(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.dispatch_spin_iterations, 5);

        let err = SystrapConfig::from_path(&path).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config file"));
    }
}
