//! Command-line configuration.
//!
//! # Environment Variables
//!
//! - `KVSTORE_DIRECTORY`: Directory holding the stores (default: `./data`)
//! - `KVSTORE_KEY_BYTES`: Key width of a newly created tree (default: `16`)
//! - `KVSTORE_VALUE_BYTES`: Value width of a newly created tree (default: `16`)

use std::path::PathBuf;

use crate::storage::TreeOptions;

/// Configuration of the `kvstore` binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvstoreConfig {
    /// Parent directory; the log lives in `log/` and the tree in `tree/`.
    pub directory: PathBuf,
    pub key_bytes: usize,
    pub value_bytes: usize,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl KvstoreConfig {
    pub const DEFAULT_DIRECTORY: &'static str = "./data";
    pub const DEFAULT_WIDTH: usize = 16;

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let directory = std::env::var("KVSTORE_DIRECTORY")
            .map_or_else(|_| PathBuf::from(Self::DEFAULT_DIRECTORY), PathBuf::from);
        let key_bytes = parse_width("KVSTORE_KEY_BYTES", std::env::var("KVSTORE_KEY_BYTES").ok())?;
        let value_bytes =
            parse_width("KVSTORE_VALUE_BYTES", std::env::var("KVSTORE_VALUE_BYTES").ok())?;

        Ok(Self {
            directory,
            key_bytes,
            value_bytes,
        })
    }

    #[must_use]
    pub fn log_directory(&self) -> PathBuf {
        self.directory.join("log")
    }

    #[must_use]
    pub fn tree_directory(&self) -> PathBuf {
        self.directory.join("tree")
    }

    /// Tree options creating a tree with the configured widths.
    #[must_use]
    pub fn tree_options(&self) -> TreeOptions {
        TreeOptions::new()
            .key_bytes(self.key_bytes)
            .value_bytes(self.value_bytes)
    }
}

/// Parse a positive width, defaulting when unset.
fn parse_width(name: &str, value: Option<String>) -> Result<usize, ConfigError> {
    let Some(value) = value else {
        return Ok(KvstoreConfig::DEFAULT_WIDTH);
    };
    match value.parse::<usize>() {
        Ok(width) if width > 0 => Ok(width),
        _ => Err(ConfigError::InvalidValue {
            name: name.to_string(),
            message: format!("'{value}' is not a positive integer"),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(KvstoreConfig::DEFAULT_DIRECTORY, "./data");
        assert_eq!(parse_width("W", None), Ok(16));
    }

    #[test]
    fn test_parse_width() {
        assert_eq!(parse_width("W", Some("32".to_string())), Ok(32));
        assert!(parse_width("W", Some("0".to_string())).is_err());
        assert!(parse_width("W", Some("-4".to_string())).is_err());
        assert!(parse_width("W", Some("wide".to_string())).is_err());
    }

    #[test]
    fn test_store_directories() {
        let config = KvstoreConfig {
            directory: PathBuf::from("/srv/kv"),
            key_bytes: 8,
            value_bytes: 24,
        };
        assert_eq!(config.log_directory(), PathBuf::from("/srv/kv/log"));
        assert_eq!(config.tree_directory(), PathBuf::from("/srv/kv/tree"));
        let options = config.tree_options();
        assert_eq!((options.key_bytes, options.value_bytes), (Some(8), Some(24)));
    }

    #[test]
    fn test_config_error_display_invalid() {
        let error = ConfigError::InvalidValue {
            name: "TEST_VAR".to_string(),
            message: "bad value".to_string(),
        };
        assert_eq!(error.to_string(), "invalid value for TEST_VAR: bad value");
    }
}
