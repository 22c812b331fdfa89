//! Participant configuration document: a `serde` +
//! `serde_yaml` document read once at startup. Unknown top-level keys are a
//! hard configuration error; unknown controller-level keys are logged and
//! dropped rather than rejected, since controller kinds are a plugin point.

use std::collections::HashMap;
use std::path::Path;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::{VasioError, VasioResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ParticipantConfiguration {
  pub participant_name: String,
  #[serde(default)]
  pub logging: LoggingConfig,
  #[serde(default)]
  pub health_check: HealthCheckConfig,
  #[serde(default)]
  pub controllers: ControllersConfig,
  #[serde(default)]
  pub middleware: MiddlewareConfig,
  #[serde(default)]
  pub experimental: ExperimentalConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
  #[serde(default)]
  pub sinks: Vec<LogSinkConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSinkConfig {
  pub kind: LogSinkKind,
  #[serde(default)]
  pub level: Option<String>,
  #[serde(default)]
  pub log_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSinkKind {
  Stdout,
  File,
  Remote,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HealthCheckConfig {
  #[serde(default)]
  pub soft_response_timeout_ms: Option<u64>,
  #[serde(default)]
  pub hard_response_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllersConfig {
  #[serde(default)]
  pub by_kind: HashMap<String, Vec<ControllerConfig>>,
}

/// Deliberately permissive at this level: a controller kind this
/// build doesn't know about should not fail the whole document, only lose
/// its own unrecognized fields with a warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
  pub name: String,
  #[serde(default)]
  pub network: Option<String>,
  #[serde(flatten)]
  pub extra: HashMap<String, serde_yaml::Value>,
}

impl ControllerConfig {
  /// Logs and discards any fields this build doesn't recognize, rather than
  /// silently ignoring them or failing the whole document over them.
  pub fn warn_on_unknown_fields(&self) {
    for key in self.extra.keys() {
      warn!("controller '{}': ignoring unrecognized configuration field '{key}'", self.name);
    }
  }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareConfig {
  #[serde(default)]
  pub enable_message_aggregation: MessageAggregation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageAggregation {
  Off,
  On,
  #[default]
  Auto,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExperimentalConfig {
  #[serde(default)]
  pub time_synchronization: TimeSynchronizationExperimental,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeSynchronizationExperimental {
  #[serde(default)]
  pub animation_factor: Option<f64>,
}

impl ParticipantConfiguration {
  pub fn from_yaml_str(text: &str) -> VasioResult<Self> {
    let config: ParticipantConfiguration =
      serde_yaml::from_str(text).map_err(|e| VasioError::Configuration(format!("invalid participant configuration: {e}")))?;
    config.warn_on_unrecognized_controller_fields();
    Ok(config)
  }

  pub fn from_file(path: impl AsRef<Path>) -> VasioResult<Self> {
    let text = std::fs::read_to_string(path)?;
    Self::from_yaml_str(&text)
  }

  fn warn_on_unrecognized_controller_fields(&self) {
    for controllers in self.controllers.by_kind.values() {
      for controller in controllers {
        controller.warn_on_unknown_fields();
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_minimal_document_with_defaults() {
    let config = ParticipantConfiguration::from_yaml_str("participant_name: Driver\n").unwrap();
    assert_eq!(config.participant_name, "Driver");
    assert_eq!(config.middleware.enable_message_aggregation, MessageAggregation::Auto);
    assert!(config.logging.sinks.is_empty());
  }

  #[test]
  fn rejects_unknown_top_level_key() {
    let err = ParticipantConfiguration::from_yaml_str("participant_name: Driver\nbogus: 1\n");
    assert!(err.is_err());
  }

  #[test]
  fn parses_full_document() {
    let yaml = r#"
participant_name: Driver
logging:
  sinks:
    - kind: stdout
      level: info
    - kind: file
      log_name: driver.log
health_check:
  soft_response_timeout_ms: 500
  hard_response_timeout_ms: 5000
controllers:
  by_kind:
    CAN:
      - name: Can1
        network: CAN1
middleware:
  enable_message_aggregation: on
experimental:
  time_synchronization:
    animation_factor: 2.5
"#;
    let config = ParticipantConfiguration::from_yaml_str(yaml).unwrap();
    assert_eq!(config.logging.sinks.len(), 2);
    assert_eq!(config.logging.sinks[0].kind, LogSinkKind::Stdout);
    assert_eq!(config.health_check.soft_response_timeout_ms, Some(500));
    assert_eq!(config.controllers.by_kind["CAN"][0].name, "Can1");
    assert_eq!(config.middleware.enable_message_aggregation, MessageAggregation::On);
    assert_eq!(config.experimental.time_synchronization.animation_factor, Some(2.5));
  }

  #[test]
  fn unknown_controller_field_is_tolerated_and_captured_in_extra() {
    let yaml = "participant_name: D\ncontrollers:\n  by_kind:\n    CAN:\n      - name: C1\n        weird_field: 42\n";
    let config = ParticipantConfiguration::from_yaml_str(yaml).unwrap();
    let controller = &config.controllers.by_kind["CAN"][0];
    assert!(controller.extra.contains_key("weird_field"));
  }
}
