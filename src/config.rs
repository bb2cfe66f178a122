// src/config.rs
//! Bridge configuration

use crate::marshal::DEFAULT_MAX_DEPTH;
use crate::InitError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const ENV_MAX_DEPTH: &str = "POLYCALL_MAX_DEPTH";
const ENV_STRICT_RESOLUTION: &str = "POLYCALL_STRICT_RESOLUTION";
const ENV_DEFAULT_TIMEOUT_MS: &str = "POLYCALL_DEFAULT_TIMEOUT_MS";

/// Upper bound accepted for `max_marshal_depth`
const MAX_DEPTH_LIMIT: usize = 4096;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Container nesting allowed during conversion before a value is treated as cyclic
    pub max_marshal_depth: usize,

    /// Timeout applied to awaits that do not pass one
    pub default_timeout_ms: Option<u64>,

    /// Fail resolution when a name is exported by more than one module
    pub strict_resolution: bool,

    /// Register the `script` and `mock` backends on initialize
    pub register_builtin_backends: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_marshal_depth: DEFAULT_MAX_DEPTH,
            default_timeout_ms: None,
            strict_resolution: false,
            register_builtin_backends: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_json_str(json: &str) -> Result<Self, InitError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| InitError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InitError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| InitError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json_str(&text)
    }

    /// Defaults overridden by `POLYCALL_*` environment variables
    pub fn from_env() -> Result<Self, InitError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(self) -> Result<Self, InitError> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, InitError> {
        if let Some(raw) = lookup(ENV_MAX_DEPTH) {
            self.max_marshal_depth = parse_env(ENV_MAX_DEPTH, &raw)?;
        }
        if let Some(raw) = lookup(ENV_STRICT_RESOLUTION) {
            self.strict_resolution = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(InitError::Config(format!(
                        "{} must be a boolean, got '{}'",
                        ENV_STRICT_RESOLUTION, raw
                    )))
                }
            };
        }
        if let Some(raw) = lookup(ENV_DEFAULT_TIMEOUT_MS) {
            self.default_timeout_ms = if raw.trim().is_empty() {
                None
            } else {
                Some(parse_env(ENV_DEFAULT_TIMEOUT_MS, &raw)?)
            };
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), InitError> {
        if self.max_marshal_depth == 0 || self.max_marshal_depth > MAX_DEPTH_LIMIT {
            return Err(InitError::Config(format!(
                "max_marshal_depth must be between 1 and {}, got {}",
                MAX_DEPTH_LIMIT, self.max_marshal_depth
            )));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(InitError::Config(
                "default_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, InitError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| InitError::Config(format!("{} = '{}': {}", key, raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.max_marshal_depth, 64);
        assert_eq!(config.default_timeout(), None);
        assert!(!config.strict_resolution);
        assert!(config.register_builtin_backends);
    }

    #[test]
    fn test_partial_json() {
        let config = BridgeConfig::from_json_str(r#"{"strict_resolution": true, "default_timeout_ms": 250}"#)
            .unwrap();
        assert!(config.strict_resolution);
        assert_eq!(config.default_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.max_marshal_depth, 64);
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            BridgeConfig::from_json_str(r#"{"max_marshal_depth": 0}"#),
            Err(InitError::Config(_))
        ));
        assert!(matches!(
            BridgeConfig::from_json_str("not json"),
            Err(InitError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let env = |key: &str| match key {
            "POLYCALL_MAX_DEPTH" => Some("16".to_string()),
            "POLYCALL_STRICT_RESOLUTION" => Some("yes".to_string()),
            _ => None,
        };
        let config = BridgeConfig::default().with_overrides(env).unwrap();
        assert_eq!(config.max_marshal_depth, 16);
        assert!(config.strict_resolution);

        let bad = |key: &str| (key == "POLYCALL_DEFAULT_TIMEOUT_MS").then(|| "soon".to_string());
        assert!(matches!(
            BridgeConfig::default().with_overrides(bad),
            Err(InitError::Config(_))
        ));
    }
}
