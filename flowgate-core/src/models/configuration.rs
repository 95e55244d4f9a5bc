//! Configuration data structures

use super::definition::MAX_DURATION_SECONDS;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Logging level configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum LogLevel {
    #[serde(rename = "error")]
    Error,
    #[serde(rename = "warn")]
    Warn,
    #[serde(rename = "info")]
    #[default]
    Info,
    #[serde(rename = "debug")]
    Debug,
    #[serde(rename = "trace")]
    Trace,
}

/// SLA monitor settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SlaConfiguration {
    /// Deadline applied to runs started without an explicit one
    pub default_deadline_seconds: u64,
    /// Window before the deadline in which a run is `at_risk`
    pub at_risk_window_seconds: u64,
    /// Role that receives SLA escalations
    pub escalation_role: String,
}

impl Default for SlaConfiguration {
    fn default() -> Self {
        Self {
            default_deadline_seconds: 86_400, // 24 hours
            at_risk_window_seconds: 3_600,
            escalation_role: "supervisor".to_string(),
        }
    }
}

/// Interpreter settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfiguration {
    /// Cap on a single retry backoff delay
    pub max_backoff_seconds: u64,
    /// Spawn timers that resume waiting cursors without an external tick
    pub auto_wake: bool,
}

impl Default for EngineConfiguration {
    fn default() -> Self {
        Self {
            max_backoff_seconds: 600,
            auto_wake: false,
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    /// Logging verbosity level
    pub log_level: LogLevel,
    /// JSON store file (defaults to ~/.flowgate/store.json)
    pub store_path: Option<PathBuf>,
    /// Server bind address
    pub server_host: String,
    /// Server port number
    pub server_port: u16,
    /// SLA monitor settings
    pub sla: SlaConfiguration,
    /// Interpreter settings
    pub engine: EngineConfiguration,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            store_path: None,
            server_host: "127.0.0.1".to_string(),
            server_port: 8080,
            sla: SlaConfiguration::default(),
            engine: EngineConfiguration::default(),
        }
    }
}

impl Configuration {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Configuration = toml::from_str(&content)?;
            Ok(config)
        } else {
            // Return default configuration if file doesn't exist
            Ok(Configuration::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the XDG config directory path
    pub fn default_config_path() -> Result<PathBuf, Box<dyn std::error::Error>> {
        let config_dir = dirs::config_dir().ok_or("Could not determine config directory")?;
        Ok(config_dir.join("flowgate").join("config.toml"))
    }

    /// Store path, falling back to ~/.flowgate/store.json
    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home.join(".flowgate").join("store.json")
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server_port < 1024 {
            errors.push(
                "server_port must be at least 1024 (privileged ports not allowed)".to_string(),
            );
        }

        if self.sla.default_deadline_seconds == 0 {
            errors.push("sla.default_deadline_seconds must be greater than 0".to_string());
        }

        if self.sla.at_risk_window_seconds > self.sla.default_deadline_seconds {
            errors.push(
                "sla.at_risk_window_seconds cannot exceed sla.default_deadline_seconds"
                    .to_string(),
            );
        }

        if self.sla.escalation_role.trim().is_empty() {
            errors.push("sla.escalation_role cannot be empty".to_string());
        }

        if self.engine.max_backoff_seconds == 0 {
            errors.push("engine.max_backoff_seconds must be greater than 0".to_string());
        }

        for (field, value) in [
            ("sla.default_deadline_seconds", self.sla.default_deadline_seconds),
            ("sla.at_risk_window_seconds", self.sla.at_risk_window_seconds),
            ("engine.max_backoff_seconds", self.engine.max_backoff_seconds),
        ] {
            if value > MAX_DURATION_SECONDS {
                errors.push(format!("{} cannot exceed {}", field, MAX_DURATION_SECONDS));
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
    use tempfile::tempdir;

    #[test]
    fn test_default_configuration() {
        let config = Configuration::default();
        assert_eq!(config.server_port, 8080);
        assert_eq!(config.sla.escalation_role, "supervisor");
        assert_eq!(config.engine.max_backoff_seconds, 600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_configuration_validation() {
        let config = Configuration {
            server_port: 80,
            sla: SlaConfiguration {
                default_deadline_seconds: 60,
                at_risk_window_seconds: 120,
                escalation_role: " ".to_string(),
            },
            ..Configuration::default()
        };

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
        assert!(errors.iter().any(|e| e.contains("server_port")));
        assert!(errors.iter().any(|e| e.contains("at_risk_window_seconds")));
        assert!(errors.iter().any(|e| e.contains("escalation_role")));
    }

    #[test]
    fn test_oversized_durations_are_rejected() {
        let mut config = Configuration::default();
        config.sla.default_deadline_seconds = u64::MAX;
        config.sla.at_risk_window_seconds = 100_000_000;
        config.engine.max_backoff_seconds = 100_000_000;

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.starts_with("sla.default_deadline_seconds cannot exceed")));
        assert!(errors.iter().any(|e| e.starts_with("sla.at_risk_window_seconds cannot exceed")));
        assert!(errors.iter().any(|e| e.starts_with("engine.max_backoff_seconds cannot exceed")));

        config.sla.default_deadline_seconds = MAX_DURATION_SECONDS;
        config.sla.at_risk_window_seconds = 3_600;
        config.engine.max_backoff_seconds = MAX_DURATION_SECONDS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Configuration = toml::from_str(
            r#"
log_level = "debug"

[sla]
escalation_role = "director"
"#,
        )
        .unwrap();

        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.sla.escalation_role, "director");
        assert_eq!(config.sla.at_risk_window_seconds, 3_600);
        assert!(!config.engine.auto_wake);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("test_config.toml");

        let config = Configuration {
            server_port: 9090,
            ..Configuration::default()
        };

        config.save_to_file(&config_path).unwrap();
        assert!(config_path.exists());

        let loaded_config = Configuration::load_from_file(&config_path).unwrap();
        assert_eq!(loaded_config.server_port, 9090);
        assert_eq!(loaded_config.sla, SlaConfiguration::default());
    }
}
