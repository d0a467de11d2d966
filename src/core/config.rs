//! Combined configuration, loadable from a JSON file.
//!
//! Every field is optional in the file; missing values fall back to the
//! per-component defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interaction::PressConfig;
use crate::neighbours::ResolverConfig;
use crate::selection::ControllerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NavConfig {
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub press: PressConfig,
}

impl NavConfig {
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json_str(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::MovePolicy;

    #[test]
    fn partial_file_keeps_other_defaults() {
        let cfg = NavConfig::from_json_str(
            r#"{
                "resolver": {"max_distance": 1.5},
                "controller": {"move_policy": {"mode": "retry", "retries": 1}}
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.resolver.max_distance, 1.5);
        assert_eq!(cfg.resolver.num_steps, 20);
        assert_eq!(cfg.controller.move_policy, MovePolicy::Retry { retries: 1 });
        assert_eq!(cfg.controller.turn_on_timeout_ms, 5000);
        assert_eq!(cfg.press, PressConfig::default());
    }

    #[test]
    fn bad_json_is_reported() {
        assert!(matches!(
            NavConfig::from_json_str("{"),
            Err(ConfigError::Json(_))
        ));
        assert!(matches!(
            NavConfig::load(Path::new("/definitely/not/here.json")),
            Err(ConfigError::Io(_))
        ));
    }
}
