//! Script registry and execution front end.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::{AppResult, AutomationError};
use crate::instrument::{MeasurementSource, Oscilloscope};
use crate::scripting::context::ScriptContext;
use crate::scripting::script::{AutomationScript, ScriptDocument, ScriptEvent, ScriptStatus};
use crate::scripting::templates::TemplateLibrary;

const EVENT_CAPACITY: usize = 256;

/// Owns registered scripts, the template library and the collaborator ports
/// handed to every execution context.
pub struct ScriptingEngine {
    scripts: HashMap<String, AutomationScript>,
    templates: TemplateLibrary,
    oscilloscope: Option<Arc<dyn Oscilloscope>>,
    measurements: Option<Arc<dyn MeasurementSource>>,
    events: broadcast::Sender<ScriptEvent>,
}

impl ScriptingEngine {
    pub fn new() -> Self {
        Self::with_collaborators(None, None)
    }

    pub fn with_collaborators(
        oscilloscope: Option<Arc<dyn Oscilloscope>>,
        measurements: Option<Arc<dyn MeasurementSource>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            scripts: HashMap::new(),
            templates: TemplateLibrary::new(),
            oscilloscope,
            measurements,
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ScriptEvent> {
        self.events.subscribe()
    }

    pub fn templates(&self) -> &TemplateLibrary {
        &self.templates
    }

    pub fn templates_mut(&mut self) -> &mut TemplateLibrary {
        &mut self.templates
    }

    pub fn register_script(&mut self, script: AutomationScript) -> AppResult<()> {
        if self.scripts.contains_key(&script.id) {
            return Err(AutomationError::duplicate("script", &script.id));
        }
        log::debug!("registered script '{}'", script.id);
        let _ = self.events.send(ScriptEvent::Registered {
            script_id: script.id.clone(),
        });
        self.scripts.insert(script.id.clone(), script);
        Ok(())
    }

    /// Instantiate a template and register the result in one step.
    pub fn instantiate_template(
        &mut self,
        template_id: &str,
        script_id: &str,
        name: &str,
    ) -> AppResult<()> {
        let script = self
            .templates
            .create_script(template_id, script_id, name)
            .ok_or_else(|| AutomationError::not_found("template", template_id))?;
        self.register_script(script)
    }

    /// Bind `parameters` and start the script. Validation happens before
    /// anything runs; a validation failure leaves the script untouched.
    pub fn execute_script(
        &mut self,
        script_id: &str,
        parameters: HashMap<String, Value>,
    ) -> AppResult<()> {
        let events = self.events.clone();
        let context = Arc::new(ScriptContext::with_collaborators(
            self.oscilloscope.clone(),
            self.measurements.clone(),
        ));
        let script = self
            .scripts
            .get_mut(script_id)
            .ok_or_else(|| AutomationError::not_found("script", script_id))?;
        script.set_parameter_values(parameters);
        script.execute(context, events)
    }

    /// Returns `true` when a running script was told to stop.
    pub fn cancel_script(&self, script_id: &str) -> AppResult<bool> {
        let script = self
            .scripts
            .get(script_id)
            .ok_or_else(|| AutomationError::not_found("script", script_id))?;
        Ok(script.cancel())
    }

    pub fn script(&self, script_id: &str) -> Option<&AutomationScript> {
        self.scripts.get(script_id)
    }

    pub fn script_mut(&mut self, script_id: &str) -> Option<&mut AutomationScript> {
        self.scripts.get_mut(script_id)
    }

    pub fn script_status(&self, script_id: &str) -> Option<ScriptStatus> {
        self.scripts.get(script_id).map(|s| s.status())
    }

    pub fn script_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.scripts.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn remove_script(&mut self, script_id: &str) -> AppResult<()> {
        match self.scripts.get(script_id) {
            None => return Err(AutomationError::not_found("script", script_id)),
            Some(script) if script.status() == ScriptStatus::Running => {
                return Err(AutomationError::Busy(format!(
                    "script '{script_id}' is running"
                )));
            }
            Some(_) => {}
        }
        self.scripts.remove(script_id);
        Ok(())
    }

    // ==================== persistence ====================

    pub fn save_script(&self, script_id: &str, path: &Path) -> AppResult<()> {
        let script = self
            .scripts
            .get(script_id)
            .ok_or_else(|| AutomationError::not_found("script", script_id))?;
        let text = serde_json::to_string_pretty(&script.to_document())?;
        std::fs::write(path, text)?;
        log::info!("saved script '{script_id}' to {}", path.display());
        Ok(())
    }

    /// Load a script document from disk and register it. Returns the id.
    pub fn load_script(&mut self, path: &Path) -> AppResult<String> {
        let text = std::fs::read_to_string(path)?;
        let doc: ScriptDocument = serde_json::from_str(&text)?;
        let id = doc.script_id.clone();
        self.register_script(AutomationScript::from_document(doc))?;
        log::info!("loaded script '{id}' from {}", path.display());
        Ok(id)
    }
}

impl Default for ScriptingEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::script::ScriptType;

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut engine = ScriptingEngine::new();
        let make = || AutomationScript::new("s1", "One", ScriptType::Testing, "let result = 1;");
        engine.register_script(make()).unwrap();
        let err = engine.register_script(make()).unwrap_err();
        assert!(matches!(err, AutomationError::Duplicate { .. }));
    }

    #[test]
    fn unknown_template_is_a_not_found_error() {
        let mut engine = ScriptingEngine::new();
        let err = engine
            .instantiate_template("nope", "s1", "One")
            .unwrap_err();
        assert!(matches!(err, AutomationError::NotFound { .. }));
        assert!(engine.script_ids().is_empty());
    }

    #[tokio::test]
    async fn executing_unknown_script_fails() {
        let mut engine = ScriptingEngine::new();
        let err = engine
            .execute_script("ghost", HashMap::new())
            .unwrap_err();
        assert!(matches!(err, AutomationError::NotFound { .. }));
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.json");

        let mut engine = ScriptingEngine::new();
        engine
            .instantiate_template("basic_measurement", "m1", "Meas")
            .unwrap();
        engine.save_script("m1", &path).unwrap();

        let mut fresh = ScriptingEngine::new();
        let id = fresh.load_script(&path).unwrap();
        assert_eq!(id, "m1");
        let script = fresh.script("m1").unwrap();
        assert_eq!(script.parameters.len(), 2);
    }

    #[test]
    fn corrupt_document_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let mut engine = ScriptingEngine::new();
        assert!(engine.load_script(&path).is_err());
    }
}
