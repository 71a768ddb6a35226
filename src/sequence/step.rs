//! Sequence step definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DEFAULT_STEP_TIMEOUT: f64 = 30.0;

/// Kind of work one step performs. Serialized as a snake_case tag so saved
/// sequences with an unrecognized step type fail to load instead of being
/// silently skipped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Measurement,
    Delay,
    Condition,
    SetParameter,
    TriggerSetup,
    DataAcquisition,
    Analysis,
    Export,
}

/// One step of a measurement sequence.
///
/// `retry_count` is persisted for forward compatibility with saved sequences
/// but is not acted on: a failing step fails the sequence on its first
/// attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeasurementStep {
    pub step_id: String,
    pub step_type: StepType,
    pub name: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub conditions: Map<String, Value>,
    /// Per-step timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub description: String,
}

fn default_timeout() -> f64 {
    DEFAULT_STEP_TIMEOUT
}

fn default_enabled() -> bool {
    true
}

impl MeasurementStep {
    pub fn new(step_id: &str, step_type: StepType, name: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            step_type,
            name: name.to_string(),
            parameters: Map::new(),
            conditions: Map::new(),
            timeout: DEFAULT_STEP_TIMEOUT,
            retry_count: 0,
            enabled: true,
            description: String::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn with_timeout(mut self, timeout: f64) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn parameter_str(&self, key: &str) -> Option<&str> {
        self.parameters.get(key).and_then(|v| v.as_str())
    }

    pub fn parameter_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(|v| v.as_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_apply_when_fields_are_absent() {
        let step: MeasurementStep = serde_json::from_value(json!({
            "step_id": "meas_1",
            "step_type": "measurement",
            "name": "Amplitude",
        }))
        .unwrap();
        assert!(step.enabled);
        assert_eq!(step.retry_count, 0);
        assert!((step.timeout - DEFAULT_STEP_TIMEOUT).abs() < f64::EPSILON);
    }

    #[test]
    fn unknown_step_type_fails_to_deserialize() {
        let result: Result<MeasurementStep, _> = serde_json::from_value(json!({
            "step_id": "x_1",
            "step_type": "teleport",
            "name": "X",
        }));
        assert!(result.is_err());
    }

    #[test]
    fn step_type_tags_are_snake_case() {
        let text = serde_json::to_string(&StepType::DataAcquisition).unwrap();
        assert_eq!(text, "\"data_acquisition\"");
    }
}
