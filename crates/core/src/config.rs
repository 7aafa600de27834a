//! TOML-based configuration for the conflict resolver.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Resolver config
// ---------------------------------------------------------------------------

/// Settings for one folder's conflict resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolverConfig {
    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// How many `name (N).ext` candidates a unique copy tries (default 100).
    #[serde(default = "default_max_unique_name_attempts")]
    pub max_unique_name_attempts: usize,

    /// Reserved key prefix for merged-side renames while collapsing actions.
    #[serde(default = "default_merged_prefix")]
    pub merged_prefix: String,

    /// Infix used by the default conflict renamer (default `conflict`).
    #[serde(default = "default_conflict_separator")]
    pub conflict_separator: String,

    /// Consecutive superseded attempts before the resolver warns that the
    /// branch looks stuck (default 500).
    #[serde(default = "default_canceled_threshold")]
    pub canceled_threshold: u64,

    /// Consecutive failed attempts after which the branch is reported stuck
    /// and further attempts are refused until the record is cleared
    /// (default 10).
    #[serde(default = "default_max_resolution_attempts")]
    pub max_resolution_attempts: u64,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_max_unique_name_attempts() -> usize {
    100
}
fn default_merged_prefix() -> String {
    ".merged_".into()
}
fn default_conflict_separator() -> String {
    "conflict".into()
}
fn default_canceled_threshold() -> u64 {
    500
}
fn default_max_resolution_attempts() -> u64 {
    10
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            max_unique_name_attempts: default_max_unique_name_attempts(),
            merged_prefix: default_merged_prefix(),
            conflict_separator: default_conflict_separator(),
            canceled_threshold: default_canceled_threshold(),
            max_resolution_attempts: default_max_resolution_attempts(),
        }
    }
}

// ---------------------------------------------------------------------------
// Loading & validation
// ---------------------------------------------------------------------------

impl ResolverConfig {
    /// Load a [`ResolverConfig`] from a TOML file at the given path.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&contents)?;
        debug!("configuration parsed successfully");
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate that all fields are sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_unique_name_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_unique_name_attempts".into(),
                detail: "must be > 0".into(),
            });
        }
        if self.merged_prefix.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "merged_prefix".into(),
                detail: "merged prefix must not be empty".into(),
            });
        }
        if self.conflict_separator.is_empty() || self.conflict_separator.contains('/') {
            return Err(ConfigError::InvalidValue {
                field: "conflict_separator".into(),
                detail: "separator must be a non-empty name component".into(),
            });
        }
        if self.canceled_threshold == 0 {
            return Err(ConfigError::InvalidValue {
                field: "canceled_threshold".into(),
                detail: "threshold must be > 0".into(),
            });
        }
        if self.max_resolution_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_resolution_attempts".into(),
                detail: "must be > 0".into(),
            });
        }
        Ok(())
    }

    /// Convenience: load and validate in one call.
    pub fn load_and_validate<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load_from_file(path)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
log_level = "debug"
max_unique_name_attempts = 20
merged_prefix = ".m_"
conflict_separator = "clash"
canceled_threshold = 50
max_resolution_attempts = 3
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config = ResolverConfig::from_toml(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_unique_name_attempts, 20);
        assert_eq!(config.merged_prefix, ".m_");
        assert_eq!(config.conflict_separator, "clash");
        assert_eq!(config.canceled_threshold, 50);
        assert_eq!(config.max_resolution_attempts, 3);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resolver.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = ResolverConfig::load_and_validate(&path).expect("load failed");
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = ResolverConfig::load_from_file("/nonexistent/resolver.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_parse_error() {
        let result = ResolverConfig::from_toml("max_unique_name_attempts = \"many\"");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_bad_separator() {
        let mut config = ResolverConfig::default();
        config.conflict_separator = "a/b".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "conflict_separator"
        ));
    }

    #[test]
    fn test_defaults() {
        let config = ResolverConfig::from_toml("").unwrap();
        assert_eq!(config.log_level, "info");
        assert_eq!(config.max_unique_name_attempts, 100);
        assert_eq!(config.merged_prefix, ".merged_");
        assert_eq!(config.conflict_separator, "conflict");
        assert_eq!(config.canceled_threshold, 500);
        assert_eq!(config.max_resolution_attempts, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_attempts() {
        let mut config = ResolverConfig::default();
        config.max_resolution_attempts = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "max_resolution_attempts"
        ));
    }
}
