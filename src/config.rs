//! Configuration types.
//!
//! Everything is read from environment variables with defaults; invalid
//! numbers fall back to the default, an invalid inference order is an error.

use std::path::PathBuf;

use crate::board::DragSensorConfig;
use crate::error::ConfigError;
use crate::pipeline::events::DEFAULT_EVENT_CAPACITY;
use crate::pipeline::ledger::{DEFAULT_UNDO_DEPTH, HIGH_CONFIDENCE_THRESHOLD};
use crate::pipeline::rules::InferenceRules;

/// Board session configuration.
#[derive(Debug, Clone)]
pub struct BoardConfig {
    /// Label-marker rules and their precedence.
    pub inference: InferenceRules,
    /// Minimum confidence for `auto_apply`.
    pub auto_apply_threshold: u8,
    /// Label batches kept for undo.
    pub undo_depth: usize,
    pub drag: DragSensorConfig,
    /// Capacity of the board notification channel.
    pub event_capacity: usize,
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            inference: InferenceRules::default(),
            auto_apply_threshold: HIGH_CONFIDENCE_THRESHOLD,
            undo_depth: DEFAULT_UNDO_DEPTH,
            drag: DragSensorConfig::default(),
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl BoardConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let inference = match lookup("PIPELINE_INFERENCE_ORDER") {
            Some(order) => InferenceRules::parse_order(&order)?,
            None => defaults.inference,
        };

        let auto_apply_threshold: u8 = lookup("PIPELINE_AUTO_APPLY_THRESHOLD")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n <= 100)
            .unwrap_or(defaults.auto_apply_threshold);

        let undo_depth: usize = lookup("PIPELINE_UNDO_DEPTH")
            .and_then(|s| s.parse().ok())
            .filter(|n| *n > 0)
            .unwrap_or(defaults.undo_depth);

        let activation_distance_px: f64 = lookup("PIPELINE_DRAG_DISTANCE_PX")
            .and_then(|s| s.parse().ok())
            .filter(|n: &f64| n.is_finite() && *n >= 0.0)
            .unwrap_or(defaults.drag.activation_distance_px);

        Ok(Self {
            inference,
            auto_apply_threshold,
            undo_depth,
            drag: DragSensorConfig {
                activation_distance_px,
                ..defaults.drag
            },
            event_capacity: defaults.event_capacity,
        })
    }
}

/// HTTP server configuration for the store binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub db_path: PathBuf,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/pipeline.db"),
            port: 8080,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            db_path: lookup("PIPELINE_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            port: lookup("PIPELINE_PORT")
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::pipeline::types::Stage;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn board_defaults() {
        let config = BoardConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.auto_apply_threshold, 85);
        assert_eq!(config.undo_depth, 1);
        assert_eq!(config.drag.activation_distance_px, 8.0);
        assert_eq!(
            config.inference.infer(&["Venter på svar", "I kalender"]),
            Stage::AwaitingReply
        );
    }

    #[test]
    fn board_overrides() {
        let config = BoardConfig::from_lookup(lookup(&[
            ("PIPELINE_INFERENCE_ORDER", "scheduled,awaiting_reply,billing,done"),
            ("PIPELINE_AUTO_APPLY_THRESHOLD", "90"),
            ("PIPELINE_UNDO_DEPTH", "3"),
            ("PIPELINE_DRAG_DISTANCE_PX", "12.5"),
        ]))
        .unwrap();
        assert_eq!(
            config.inference.infer(&["Venter på svar", "I kalender"]),
            Stage::Scheduled
        );
        assert_eq!(config.auto_apply_threshold, 90);
        assert_eq!(config.undo_depth, 3);
        assert_eq!(config.drag.activation_distance_px, 12.5);
    }

    #[test]
    fn bad_numbers_fall_back() {
        let config = BoardConfig::from_lookup(lookup(&[
            ("PIPELINE_AUTO_APPLY_THRESHOLD", "250"),
            ("PIPELINE_UNDO_DEPTH", "0"),
            ("PIPELINE_DRAG_DISTANCE_PX", "far"),
        ]))
        .unwrap();
        assert_eq!(config.auto_apply_threshold, 85);
        assert_eq!(config.undo_depth, 1);
        assert_eq!(config.drag.activation_distance_px, 8.0);
    }

    #[test]
    fn bad_inference_order_is_an_error() {
        let err = BoardConfig::from_lookup(lookup(&[("PIPELINE_INFERENCE_ORDER", "done,nope")]));
        assert!(matches!(err, Err(ConfigError::InvalidValue { .. })));
    }

    #[test]
    fn server_config() {
        assert_eq!(ServerConfig::from_lookup(lookup(&[])), ServerConfig::default());
        let config = ServerConfig::from_lookup(lookup(&[
            ("PIPELINE_DB_PATH", "/tmp/p.db"),
            ("PIPELINE_PORT", "9000"),
        ]));
        assert_eq!(config.db_path, PathBuf::from("/tmp/p.db"));
        assert_eq!(config.port, 9000);
    }
}
