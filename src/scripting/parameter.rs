//! Script parameter definitions and pre-execution validation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Declared type of a script parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    Int,
    Float,
    Str,
    Bool,
    List,
}

/// One declared parameter of a script or template.
///
/// `default_value` is what editors prefill; it is not applied implicitly at
/// execution time; a required parameter must be bound explicitly before the
/// script can run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScriptParameter {
    pub name: String,
    pub param_type: ParameterType,
    pub default_value: Value,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub choices: Option<Vec<Value>>,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ScriptParameter {
    pub fn new(name: &str, param_type: ParameterType, default_value: Value) -> Self {
        Self {
            name: name.to_string(),
            param_type,
            default_value,
            description: String::new(),
            min_value: None,
            max_value: None,
            choices: None,
            required: true,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_value = min;
        self.max_value = max;
        self
    }

    pub fn choices(mut self, choices: Vec<Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    /// Whether a bound value matches the declared type. Numeric strings are
    /// accepted for int/float, mirroring values typed into a GUI field.
    fn type_matches(&self, value: &Value) -> bool {
        match self.param_type {
            ParameterType::Int => {
                value.as_i64().is_some()
                    || value
                        .as_str()
                        .is_some_and(|s| s.parse::<i64>().is_ok())
            }
            ParameterType::Float => {
                value.as_f64().is_some()
                    || value
                        .as_str()
                        .is_some_and(|s| s.parse::<f64>().is_ok())
            }
            ParameterType::Str => value.is_string(),
            ParameterType::Bool => value.is_boolean(),
            ParameterType::List => value.is_array(),
        }
    }

    /// Check one bound value, appending a message per failing constraint.
    fn check_value(&self, value: &Value, errors: &mut Vec<String>) {
        if !self.type_matches(value) {
            errors.push(format!(
                "Parameter '{}' must be of type {:?}",
                self.name, self.param_type
            ));
        }

        if let Some(v) = value.as_f64() {
            if let Some(min) = self.min_value {
                if v < min {
                    errors.push(format!("Parameter '{}' must be >= {}", self.name, min));
                }
            }
            if let Some(max) = self.max_value {
                if v > max {
                    errors.push(format!("Parameter '{}' must be <= {}", self.name, max));
                }
            }
        }

        if let Some(choices) = &self.choices {
            if !choices.contains(value) {
                errors.push(format!(
                    "Parameter '{}' must be one of {:?}",
                    self.name, choices
                ));
            }
        }
    }
}

/// Validate bindings against declared parameters.
///
/// Collects every failure instead of stopping at the first one: a required
/// parameter that is unset, plus type/range/choice violations for every bound
/// value. Returns `Ok(())` when nothing failed.
pub fn validate_bindings(
    parameters: &[ScriptParameter],
    bindings: &HashMap<String, Value>,
) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    for param in parameters {
        match bindings.get(&param.name) {
            None | Some(Value::Null) => {
                if param.required {
                    errors.push(format!("Required parameter '{}' is not set", param.name));
                }
            }
            Some(value) => param.check_value(value, &mut errors),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
