//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::MeshConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<MeshConfig, ConfigError> {
    let mut config: MeshConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
    config.apply_env();
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

/// Load, apply environment overrides and validate a TOML file.
pub fn load_config(path: &Path) -> Result<MeshConfig, ConfigError> {
    let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid() {
        let config = parse_config("[directory]\nroot = \"/svc\"\n").unwrap();
        assert_eq!(config.directory.root, "/svc");
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(parse_config("requests = 5"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validation_error_display() {
        let err = parse_config("[requests]\ntimeout_ms = 0\n").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: requests.timeout_ms: must be greater than 0"
        );
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/mesh.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
