//! Built-in script templates and the template library.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::scripting::parameter::{ParameterType, ScriptParameter};
use crate::scripting::script::{AutomationScript, ScriptType};

/// A reusable blueprint a concrete script is instantiated from.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptTemplate {
    pub template_id: String,
    pub name: String,
    pub description: String,
    pub script_type: ScriptType,
    pub code: String,
    pub parameters: Vec<ScriptParameter>,
    #[serde(default)]
    pub tags: Vec<String>,
}

pub struct TemplateLibrary {
    templates: HashMap<String, ScriptTemplate>,
}

impl TemplateLibrary {
    /// Library preloaded with the built-in templates.
    pub fn new() -> Self {
        let mut library = Self {
            templates: HashMap::new(),
        };
        library.add_template(basic_measurement_template());
        library.add_template(frequency_sweep_template());
        library.add_template(waveform_analysis_template());
        library
    }

    pub fn add_template(&mut self, template: ScriptTemplate) {
        self.templates
            .insert(template.template_id.clone(), template);
    }

    pub fn template(&self, template_id: &str) -> Option<&ScriptTemplate> {
        self.templates.get(template_id)
    }

    pub fn template_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.templates.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn templates_of_type(&self, script_type: ScriptType) -> Vec<&ScriptTemplate> {
        let mut found: Vec<&ScriptTemplate> = self
            .templates
            .values()
            .filter(|t| t.script_type == script_type)
            .collect();
        found.sort_by(|a, b| a.template_id.cmp(&b.template_id));
        found
    }

    /// Instantiate a fresh script from a template. Parameter declarations are
    /// cloned so edits on the instance never touch the template. Unknown
    /// template ids yield `None`.
    pub fn create_script(
        &self,
        template_id: &str,
        script_id: &str,
        name: &str,
    ) -> Option<AutomationScript> {
        let template = self.templates.get(template_id)?;
        let mut script =
            AutomationScript::new(script_id, name, template.script_type, &template.code)
                .with_parameters(template.parameters.clone());
        script.description = template.description.clone();
        script.tags = template.tags.clone();
        Some(script)
    }
}

impl Default for TemplateLibrary {
    fn default() -> Self {
        Self::new()
    }
}

// ==================== built-in templates ====================

fn basic_measurement_template() -> ScriptTemplate {
    ScriptTemplate {
        template_id: "basic_measurement".to_string(),
        name: "Basic Measurement".to_string(),
        description: "Take a single measurement on one channel".to_string(),
        script_type: ScriptType::Measurement,
        code: r#"
let channel = get_string("channel", "CH1");
let measurement_type = get_string("measurement_type", "amplitude");

log("Starting " + measurement_type + " measurement on " + channel);

let value = measure(measurement_type, channel);

log("Measurement result: " + value);

let result = #{
    measurement: measurement_type,
    channel: channel,
    value: value,
};
"#
        .to_string(),
        parameters: vec![
            ScriptParameter::new("channel", ParameterType::Str, json!("CH1")).choices(vec![
                json!("CH1"),
                json!("CH2"),
                json!("CH3"),
                json!("CH4"),
            ]),
            ScriptParameter::new("measurement_type", ParameterType::Str, json!("amplitude"))
                .choices(vec![json!("amplitude"), json!("frequency"), json!("period")]),
        ],
        tags: vec!["measurement".to_string(), "basic".to_string()],
    }
}

fn frequency_sweep_template() -> ScriptTemplate {
    ScriptTemplate {
        template_id: "frequency_sweep".to_string(),
        name: "Frequency Sweep".to_string(),
        description: "Measure amplitude at evenly spaced frequencies".to_string(),
        script_type: ScriptType::Automation,
        code: r#"
let start_freq = get_float("start_frequency", 100.0);
let stop_freq = get_float("stop_frequency", 10000.0);
let num_points = get_int("num_points", 10);
let channel = get_string("channel", "CH1");

log("Frequency sweep: " + start_freq + " Hz to " + stop_freq + " Hz, " + num_points + " points");

let frequencies = linspace(start_freq, stop_freq, num_points);
let amplitudes = [];

for (freq, i) in frequencies {
    check_stop();
    log("Measuring at " + freq + " Hz");
    wait(0.1);
    let amplitude = measure("amplitude", channel);
    amplitudes.push(amplitude);
    set_progress((i + 1).to_float() / num_points.to_float());
}

log("Frequency sweep completed");

let result = #{
    frequencies: frequencies,
    amplitudes: amplitudes,
    channel: channel,
};
"#
        .to_string(),
        parameters: vec![
            ScriptParameter::new("start_frequency", ParameterType::Float, json!(100.0))
                .range(Some(0.1), None),
            ScriptParameter::new("stop_frequency", ParameterType::Float, json!(10_000.0))
                .range(Some(0.1), None),
            ScriptParameter::new("num_points", ParameterType::Int, json!(10))
                .range(Some(2.0), Some(10_000.0)),
            ScriptParameter::new("channel", ParameterType::Str, json!("CH1")).choices(vec![
                json!("CH1"),
                json!("CH2"),
                json!("CH3"),
                json!("CH4"),
            ]),
        ],
        tags: vec!["sweep".to_string(), "automation".to_string()],
    }
}

fn waveform_analysis_template() -> ScriptTemplate {
    ScriptTemplate {
        template_id: "waveform_analysis".to_string(),
        name: "Waveform Analysis".to_string(),
        description: "Acquire a waveform and compute time/frequency statistics".to_string(),
        script_type: ScriptType::Analysis,
        code: r#"
let channel = get_string("channel", "CH1");
let window_function = get_string("window_function", "hanning");

log("Acquiring waveform from " + channel);

let wave = acquire_waveform(channel);
let voltage = wave.voltage;

log("Acquired " + voltage.len() + " samples");

let mean_value = mean(voltage);
let rms_value = rms(voltage);
let p2p = peak_to_peak(voltage);

log("Mean: " + mean_value + " V");
log("RMS: " + rms_value + " V");
log("Peak-to-peak: " + p2p + " V");

let dt = wave.time[1] - wave.time[0];
let dominant = dominant_frequency(voltage, dt, window_function);

log("Dominant frequency: " + dominant + " Hz");

let result = #{
    mean: mean_value,
    rms: rms_value,
    peak_to_peak: p2p,
    dominant_frequency: dominant,
    channel: channel,
};
"#
        .to_string(),
        parameters: vec![
            ScriptParameter::new("channel", ParameterType::Str, json!("CH1")).choices(vec![
                json!("CH1"),
                json!("CH2"),
                json!("CH3"),
                json!("CH4"),
            ]),
            ScriptParameter::new("window_function", ParameterType::Str, json!("hanning"))
                .choices(vec![json!("hanning"), json!("blackman"), json!("none")])
                .optional(),
        ],
        tags: vec!["analysis".to_string(), "fft".to_string()],
    }
}
