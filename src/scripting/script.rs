//! Automation script record, lifecycle state machine and execution worker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rhai::{Dynamic, Scope};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AppResult, AutomationError};
use crate::scripting::context::{build_engine, ScriptContext};
use crate::scripting::parameter::{validate_bindings, ScriptParameter};

/// Broad category a script belongs to, used for browsing and filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptType {
    Measurement,
    Analysis,
    Automation,
    Calibration,
    Testing,
    Custom,
}

/// Lifecycle of one script. `Completed`, `Failed` and `Cancelled` are
/// terminal; a terminal script must be `reset` before it can run again.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptStatus {
    Idle,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScriptStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of one script run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptResult {
    /// Unique id of this run.
    pub run_id: Uuid,
    pub script_id: String,
    pub status: ScriptStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub output: String,
    pub error: String,
    pub return_value: Option<Value>,
    /// Wall-clock duration in seconds.
    pub execution_time: f64,
}

/// Events emitted while scripts register and run.
#[derive(Clone, Debug)]
pub enum ScriptEvent {
    Registered { script_id: String },
    Started { script_id: String },
    Progress { script_id: String, progress: f64 },
    Output { script_id: String, line: String },
    Completed { script_id: String, result: ScriptResult },
    Failed { script_id: String, error: String },
    Cancelled { script_id: String },
}

/// Serializable form of a script, used for save/load.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScriptDocument {
    pub script_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub script_type: ScriptType,
    pub code: String,
    #[serde(default)]
    pub parameters: Vec<ScriptParameter>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub version: String,
    pub created: DateTime<Utc>,
}

// ============================================================
// AutomationScript
// ============================================================

pub struct AutomationScript {
    pub id: String,
    pub name: String,
    pub description: String,
    pub script_type: ScriptType,
    pub code: String,
    pub parameters: Vec<ScriptParameter>,
    pub tags: Vec<String>,
    pub author: String,
    pub version: String,
    pub created: DateTime<Utc>,
    bindings: HashMap<String, Value>,
    status: Arc<Mutex<ScriptStatus>>,
    last_result: Arc<Mutex<Option<ScriptResult>>>,
    active_context: Arc<Mutex<Option<Arc<ScriptContext>>>>,
}

impl AutomationScript {
    pub fn new(id: &str, name: &str, script_type: ScriptType, code: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            script_type,
            code: code.to_string(),
            parameters: Vec::new(),
            tags: Vec::new(),
            author: String::new(),
            version: "1.0".to_string(),
            created: Utc::now(),
            bindings: HashMap::new(),
            status: Arc::new(Mutex::new(ScriptStatus::Idle)),
            last_result: Arc::new(Mutex::new(None)),
            active_context: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_parameters(mut self, parameters: Vec<ScriptParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn status(&self) -> ScriptStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(ScriptStatus::Failed)
    }

    pub fn last_result(&self) -> Option<ScriptResult> {
        self.last_result.lock().ok().and_then(|r| r.clone())
    }

    pub fn set_parameter_value(&mut self, name: &str, value: Value) {
        self.bindings.insert(name.to_string(), value);
    }

    pub fn set_parameter_values(&mut self, bindings: HashMap<String, Value>) {
        self.bindings.extend(bindings);
    }

    pub fn parameter_value(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Return a terminal script to `Idle` so it can run again.
    pub fn reset(&self) -> AppResult<()> {
        let mut status = self
            .status
            .lock()
            .map_err(|_| AutomationError::Script("status lock poisoned".to_string()))?;
        if *status == ScriptStatus::Running {
            return Err(AutomationError::Busy(format!(
                "script '{}' is running",
                self.id
            )));
        }
        *status = ScriptStatus::Idle;
        Ok(())
    }

    /// Request cancellation of a running script. Returns `true` when a run
    /// was actually interrupted.
    pub fn cancel(&self) -> bool {
        let running = self.status() == ScriptStatus::Running;
        if !running {
            return false;
        }
        if let Ok(guard) = self.active_context.lock() {
            if let Some(ctx) = guard.as_ref() {
                ctx.request_stop();
            }
        }
        true
    }

    /// Validate bindings and start execution on a blocking worker.
    ///
    /// Validation failure is reported before anything observable happens: no
    /// status change and no events. The call returns once the worker is
    /// spawned; completion is reported through `events`.
    pub fn execute(
        &mut self,
        context: Arc<ScriptContext>,
        events: broadcast::Sender<ScriptEvent>,
    ) -> AppResult<()> {
        {
            let mut status = self
                .status
                .lock()
                .map_err(|_| AutomationError::Script("status lock poisoned".to_string()))?;
            if *status != ScriptStatus::Idle {
                return Err(AutomationError::Busy(format!(
                    "script '{}' is not idle ({:?})",
                    self.id, *status
                )));
            }
            validate_bindings(&self.parameters, &self.bindings)
                .map_err(AutomationError::Validation)?;
            *status = ScriptStatus::Running;
        }

        context.set_parameters(self.bindings.clone());
        {
            let tx = events.clone();
            let script_id = self.id.clone();
            context.set_progress_hook(Box::new(move |progress| {
                let _ = tx.send(ScriptEvent::Progress {
                    script_id: script_id.clone(),
                    progress,
                });
            }));
        }
        {
            let tx = events.clone();
            let script_id = self.id.clone();
            context.set_output_hook(Box::new(move |line| {
                let _ = tx.send(ScriptEvent::Output {
                    script_id: script_id.clone(),
                    line: line.to_string(),
                });
            }));
        }

        if let Ok(mut guard) = self.active_context.lock() {
            *guard = Some(context.clone());
        }

        let _ = events.send(ScriptEvent::Started {
            script_id: self.id.clone(),
        });

        let script_id = self.id.clone();
        let code = self.code.clone();
        let status = self.status.clone();
        let last_result = self.last_result.clone();
        let active_context = self.active_context.clone();

        tokio::task::spawn_blocking(move || {
            let result = run_script(&script_id, &code, &context);

            if let Ok(mut guard) = status.lock() {
                *guard = result.status;
            }
            if let Ok(mut guard) = active_context.lock() {
                *guard = None;
            }

            match result.status {
                ScriptStatus::Completed => {
                    log::info!("script '{script_id}' completed in {:.3}s", result.execution_time);
                    let _ = events.send(ScriptEvent::Completed {
                        script_id: script_id.clone(),
                        result: result.clone(),
                    });
                }
                ScriptStatus::Cancelled => {
                    log::info!("script '{script_id}' cancelled");
                    let _ = events.send(ScriptEvent::Cancelled {
                        script_id: script_id.clone(),
                    });
                }
                _ => {
                    log::warn!("script '{script_id}' failed: {}", result.error);
                    let _ = events.send(ScriptEvent::Failed {
                        script_id: script_id.clone(),
                        error: result.error.clone(),
                    });
                }
            }

            if let Ok(mut guard) = last_result.lock() {
                *guard = Some(result);
            }
        });

        Ok(())
    }

    pub fn to_document(&self) -> ScriptDocument {
        ScriptDocument {
            script_id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            script_type: self.script_type,
            code: self.code.clone(),
            parameters: self.parameters.clone(),
            tags: self.tags.clone(),
            author: self.author.clone(),
            version: self.version.clone(),
            created: self.created,
        }
    }

    pub fn from_document(doc: ScriptDocument) -> Self {
        let mut script = Self::new(&doc.script_id, &doc.name, doc.script_type, &doc.code);
        script.description = doc.description;
        script.parameters = doc.parameters;
        script.tags = doc.tags;
        script.author = doc.author;
        script.version = doc.version;
        script.created = doc.created;
        script
    }
}

/// Run one evaluation to completion on the calling (blocking) thread.
///
/// A script's return value is whatever it left in a top-level `result`
/// variable, converted to JSON. Cancellation wins over any other outcome:
/// if a stop was requested the run reports `Cancelled` even when the
/// evaluation happened to finish.
fn run_script(script_id: &str, code: &str, context: &Arc<ScriptContext>) -> ScriptResult {
    let start_time = Utc::now();
    let engine = build_engine(context.clone());
    let mut scope = Scope::new();
    let eval = engine.eval_with_scope::<Dynamic>(&mut scope, code);

    let end_time = Utc::now();
    let execution_time = (end_time - start_time).num_milliseconds() as f64 / 1000.0;
    let output = context.take_output();

    let (status, error, return_value) = if context.is_stopped() {
        (ScriptStatus::Cancelled, "script cancelled".to_string(), None)
    } else {
        match eval {
            Ok(_) => {
                let return_value = scope
                    .get_value::<Dynamic>("result")
                    .and_then(|d| rhai::serde::from_dynamic::<Value>(&d).ok());
                (ScriptStatus::Completed, String::new(), return_value)
            }
            Err(e) => (ScriptStatus::Failed, e.to_string(), None),
        }
    };

    ScriptResult {
        run_id: Uuid::new_v4(),
        script_id: script_id.to_string(),
        status,
        start_time,
        end_time: Some(end_time),
        output,
        error,
        return_value,
        execution_time,
    }
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::parameter::ParameterType;
    use serde_json::json;

    fn demo_script() -> AutomationScript {
        AutomationScript::new(
            "demo",
            "Demo",
            ScriptType::Testing,
            r#"
                let x = get_int("count", 0);
                log("counting to " + x);
                let result = x * 2;
            "#,
        )
        .with_parameters(vec![ScriptParameter::new(
            "count",
            ParameterType::Int,
            json!(1),
        )])
    }

    #[tokio::test]
    async fn validation_failure_emits_no_events() {
        let mut script = demo_script();
        let (tx, mut rx) = broadcast::channel(16);
        let err = script
            .execute(Arc::new(ScriptContext::new()), tx)
            .unwrap_err();
        assert!(matches!(err, AutomationError::Validation(_)));
        assert_eq!(script.status(), ScriptStatus::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn completed_run_reports_return_value() {
        let mut script = demo_script();
        script.set_parameter_value("count", json!(21));
        let (tx, mut rx) = broadcast::channel(64);
        script.execute(Arc::new(ScriptContext::new()), tx).unwrap();

        let result = loop {
            match rx.recv().await.unwrap() {
                ScriptEvent::Completed { result, .. } => break result,
                ScriptEvent::Failed { error, .. } => panic!("failed: {error}"),
                _ => {}
            }
        };
        assert_eq!(result.status, ScriptStatus::Completed);
        assert_eq!(result.return_value, Some(json!(42)));
        assert!(result.output.contains("counting to 21"));
    }

    #[tokio::test]
    async fn runtime_error_marks_script_failed() {
        let mut script = AutomationScript::new(
            "broken",
            "Broken",
            ScriptType::Testing,
            "this_function_does_not_exist()",
        );
        let (tx, mut rx) = broadcast::channel(16);
        script.execute(Arc::new(ScriptContext::new()), tx).unwrap();

        loop {
            match rx.recv().await.unwrap() {
                ScriptEvent::Failed { .. } => break,
                ScriptEvent::Completed { .. } => panic!("should not complete"),
                _ => {}
            }
        }
        assert_eq!(script.status(), ScriptStatus::Failed);
    }

    #[tokio::test]
    async fn cancel_suppresses_completion_and_failure() {
        let mut script = AutomationScript::new(
            "long",
            "Long",
            ScriptType::Testing,
            r#"
                loop {
                    wait(0.05);
                }
            "#,
        );
        let (tx, mut rx) = broadcast::channel(64);
        script.execute(Arc::new(ScriptContext::new()), tx).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(script.cancel());

        loop {
            match rx.recv().await.unwrap() {
                ScriptEvent::Cancelled { .. } => break,
                ScriptEvent::Completed { .. } => panic!("completion not suppressed"),
                ScriptEvent::Failed { .. } => panic!("failure not suppressed"),
                _ => {}
            }
        }
        assert_eq!(script.status(), ScriptStatus::Cancelled);
        assert!(!script.cancel());
    }

    #[tokio::test]
    async fn terminal_script_requires_reset_before_rerun() {
        let mut script = demo_script();
        script.set_parameter_value("count", json!(1));
        let (tx, mut rx) = broadcast::channel(64);
        script.execute(Arc::new(ScriptContext::new()), tx.clone()).unwrap();
        loop {
            if let ScriptEvent::Completed { .. } = rx.recv().await.unwrap() {
                break;
            }
        }

        let err = script
            .execute(Arc::new(ScriptContext::new()), tx.clone())
            .unwrap_err();
        assert!(matches!(err, AutomationError::Busy(_)));

        script.reset().unwrap();
        script.execute(Arc::new(ScriptContext::new()), tx).unwrap();
    }

    #[test]
    fn document_roundtrip_preserves_script() {
        let script = demo_script();
        let text = serde_json::to_string_pretty(&script.to_document()).unwrap();
        let restored = AutomationScript::from_document(serde_json::from_str(&text).unwrap());
        assert_eq!(restored.id, script.id);
        assert_eq!(restored.code, script.code);
        assert_eq!(restored.parameters, script.parameters);
        assert_eq!(restored.script_type, ScriptType::Testing);
    }
}
