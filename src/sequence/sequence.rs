//! Measurement sequences and their asynchronous runner.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::{AppResult, AutomationError};
use crate::instrument::{simulated_measurement, MeasurementSource, Oscilloscope};
use crate::sequence::step::{MeasurementStep, StepType};

const PAUSE_POLL: Duration = Duration::from_millis(100);
const ACQUISITION_POLL: Duration = Duration::from_millis(10);
const DELAY_SLICE: Duration = Duration::from_millis(10);

pub const DEFAULT_GLOBAL_TIMEOUT: f64 = 300.0;

/// Lifecycle of one sequence. `Paused` is only reachable from `Running` and
/// always returns there (or to `Cancelled`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SequenceStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl SequenceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Outcome of one sequence run. `step_results` holds one entry per step that
/// completed; a failed run therefore carries the results of everything that
/// succeeded before the failing step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceResult {
    /// Unique id of this run.
    pub run_id: Uuid,
    pub sequence_id: String,
    pub status: SequenceStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub step_results: HashMap<String, Value>,
    pub errors: Vec<String>,
}

#[derive(Clone, Debug)]
pub enum SequenceEvent {
    Registered { sequence_id: String },
    Started { sequence_id: String },
    StepStarted { sequence_id: String, step_id: String },
    StepCompleted { sequence_id: String, step_id: String, result: Value },
    Paused { sequence_id: String },
    Resumed { sequence_id: String },
    Completed { sequence_id: String, result: SequenceResult },
    Failed { sequence_id: String, errors: Vec<String> },
    Cancelled { sequence_id: String },
}

/// Collaborator ports handed to the runner. Both are optional; missing ports
/// degrade to simulated behavior so sequences stay runnable offline.
#[derive(Clone, Default)]
pub struct SequencePorts {
    pub oscilloscope: Option<Arc<dyn Oscilloscope>>,
    pub measurements: Option<Arc<dyn MeasurementSource>>,
}

/// Serializable form of a sequence.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceDocument {
    pub sequence_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<MeasurementStep>,
    #[serde(default)]
    pub variables: HashMap<String, Value>,
    #[serde(default = "default_global_timeout")]
    pub global_timeout: f64,
    pub created: DateTime<Utc>,
}

fn default_global_timeout() -> f64 {
    DEFAULT_GLOBAL_TIMEOUT
}

struct Control {
    status: Mutex<SequenceStatus>,
    cancel: AtomicBool,
    pause: AtomicBool,
}

impl Control {
    fn new() -> Self {
        Self {
            status: Mutex::new(SequenceStatus::Idle),
            cancel: AtomicBool::new(false),
            pause: AtomicBool::new(false),
        }
    }

    fn status(&self) -> SequenceStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(SequenceStatus::Failed)
    }

    fn set_status(&self, status: SequenceStatus) {
        if let Ok(mut guard) = self.status.lock() {
            *guard = status;
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn paused(&self) -> bool {
        self.pause.load(Ordering::SeqCst)
    }
}

// ============================================================
// MeasurementSequence
// ============================================================

pub struct MeasurementSequence {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<MeasurementStep>,
    /// Initial variable bindings visible to condition expressions.
    pub variables: HashMap<String, Value>,
    /// Whole-run timeout in seconds.
    pub global_timeout: f64,
    pub created: DateTime<Utc>,
    control: Arc<Control>,
    completed_steps: Arc<AtomicUsize>,
    last_result: Arc<Mutex<Option<SequenceResult>>>,
}

impl MeasurementSequence {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            steps: Vec::new(),
            variables: HashMap::new(),
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            created: Utc::now(),
            control: Arc::new(Control::new()),
            completed_steps: Arc::new(AtomicUsize::new(0)),
            last_result: Arc::new(Mutex::new(None)),
        }
    }

    fn next_step_id(&self, prefix: &str) -> String {
        format!("{}_{}", prefix, self.steps.len())
    }

    pub fn add_step(&mut self, step: MeasurementStep) -> String {
        let id = step.step_id.clone();
        self.steps.push(step);
        id
    }

    /// Append a measurement step; returns its generated id (`meas_N`).
    pub fn add_measurement_step(
        &mut self,
        name: &str,
        measurement_type: &str,
        channel: &str,
    ) -> String {
        let id = self.next_step_id("meas");
        self.add_step(
            MeasurementStep::new(&id, StepType::Measurement, name)
                .with_parameter("measurement_type", json!(measurement_type))
                .with_parameter("channel", json!(channel)),
        )
    }

    /// Append a delay step; returns its generated id (`delay_N`).
    pub fn add_delay_step(&mut self, name: &str, duration: f64) -> String {
        let id = self.next_step_id("delay");
        self.add_step(
            MeasurementStep::new(&id, StepType::Delay, name)
                .with_parameter("duration", json!(duration)),
        )
    }

    /// Append a condition step; returns its generated id (`cond_N`).
    /// `on_false` is one of `continue`, `skip_next` or `abort`.
    pub fn add_condition_step(&mut self, name: &str, expression: &str, on_false: &str) -> String {
        let id = self.next_step_id("cond");
        self.add_step(
            MeasurementStep::new(&id, StepType::Condition, name)
                .with_parameter("expression", json!(expression))
                .with_parameter("on_false", json!(on_false)),
        )
    }

    /// Append a set-parameter step; returns its generated id (`param_N`).
    pub fn add_parameter_step(
        &mut self,
        name: &str,
        channel: &str,
        parameter: &str,
        value: Value,
    ) -> String {
        let id = self.next_step_id("param");
        self.add_step(
            MeasurementStep::new(&id, StepType::SetParameter, name)
                .with_parameter("channel", json!(channel))
                .with_parameter("parameter", json!(parameter))
                .with_parameter("value", value),
        )
    }

    pub fn status(&self) -> SequenceStatus {
        self.control.status()
    }

    pub fn last_result(&self) -> Option<SequenceResult> {
        self.last_result.lock().ok().and_then(|r| r.clone())
    }

    /// Fraction of steps finished, in `[0, 1]`. Disabled and skipped steps
    /// count as finished once the runner passes them.
    pub fn progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        self.completed_steps.load(Ordering::SeqCst) as f64 / self.steps.len() as f64
    }

    /// Pause after the current step. Returns `false` unless the sequence was
    /// running.
    pub fn pause(&self) -> bool {
        let mut status = match self.control.status.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if *status != SequenceStatus::Running {
            return false;
        }
        self.control.pause.store(true, Ordering::SeqCst);
        *status = SequenceStatus::Paused;
        true
    }

    /// Resume a paused sequence. Returns `false` unless it was paused.
    pub fn resume(&self) -> bool {
        let mut status = match self.control.status.lock() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if *status != SequenceStatus::Paused {
            return false;
        }
        self.control.pause.store(false, Ordering::SeqCst);
        *status = SequenceStatus::Running;
        true
    }

    /// Request cancellation. Effective while running or paused; the runner
    /// reports `Cancelled` once it observes the flag.
    pub fn cancel(&self) -> bool {
        let status = self.status();
        if status != SequenceStatus::Running && status != SequenceStatus::Paused {
            return false;
        }
        self.control.cancel.store(true, Ordering::SeqCst);
        true
    }

    /// Return a terminal sequence to `Idle` for another run.
    pub fn reset(&self) -> AppResult<()> {
        let mut status = self
            .control
            .status
            .lock()
            .map_err(|_| AutomationError::Busy("status lock poisoned".to_string()))?;
        if matches!(*status, SequenceStatus::Running | SequenceStatus::Paused) {
            return Err(AutomationError::Busy(format!(
                "sequence '{}' is active",
                self.id
            )));
        }
        *status = SequenceStatus::Idle;
        self.control.cancel.store(false, Ordering::SeqCst);
        self.control.pause.store(false, Ordering::SeqCst);
        self.completed_steps.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Start the sequence on a background task. Requires `Idle` status and at
    /// least one step. Completion is reported through `events`.
    pub fn start(
        &self,
        ports: SequencePorts,
        events: broadcast::Sender<SequenceEvent>,
    ) -> AppResult<()> {
        {
            let mut status = self
                .control
                .status
                .lock()
                .map_err(|_| AutomationError::Busy("status lock poisoned".to_string()))?;
            if *status != SequenceStatus::Idle {
                return Err(AutomationError::Busy(format!(
                    "sequence '{}' is not idle ({:?})",
                    self.id, *status
                )));
            }
            if self.steps.is_empty() {
                return Err(AutomationError::Validation(vec![format!(
                    "sequence '{}' has no steps",
                    self.id
                )]));
            }
            *status = SequenceStatus::Running;
        }
        self.completed_steps.store(0, Ordering::SeqCst);

        let _ = events.send(SequenceEvent::Started {
            sequence_id: self.id.clone(),
        });

        let worker = Runner {
            sequence_id: self.id.clone(),
            steps: self.steps.clone(),
            variables: self.variables.clone(),
            global_timeout: self.global_timeout,
            control: self.control.clone(),
            completed_steps: self.completed_steps.clone(),
            last_result: self.last_result.clone(),
            ports,
            events,
        };
        tokio::spawn(worker.run());
        Ok(())
    }

    pub fn to_document(&self) -> SequenceDocument {
        SequenceDocument {
            sequence_id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
            steps: self.steps.clone(),
            variables: self.variables.clone(),
            global_timeout: self.global_timeout,
            created: self.created,
        }
    }

    pub fn from_document(doc: SequenceDocument) -> Self {
        let mut sequence = Self::new(&doc.sequence_id, &doc.name);
        sequence.description = doc.description;
        sequence.steps = doc.steps;
        sequence.variables = doc.variables;
        sequence.global_timeout = doc.global_timeout;
        sequence.created = doc.created;
        sequence
    }
}

// ============================================================
// Runner
// ============================================================

enum StepOutcome {
    Done(Value),
    SkipNext(Value),
    Abort(String),
}

struct Runner {
    sequence_id: String,
    steps: Vec<MeasurementStep>,
    variables: HashMap<String, Value>,
    global_timeout: f64,
    control: Arc<Control>,
    completed_steps: Arc<AtomicUsize>,
    last_result: Arc<Mutex<Option<SequenceResult>>>,
    ports: SequencePorts,
    events: broadcast::Sender<SequenceEvent>,
}

impl Runner {
    async fn run(mut self) {
        let start_time = Utc::now();
        let started = std::time::Instant::now();
        let mut step_results: HashMap<String, Value> = HashMap::new();
        let mut errors: Vec<String> = Vec::new();
        let mut outcome = SequenceStatus::Completed;
        let mut skip_next = false;

        let steps = std::mem::take(&mut self.steps);
        'steps: for step in &steps {
            // Hold here while paused; cancellation still wins.
            loop {
                if self.control.cancelled() {
                    outcome = SequenceStatus::Cancelled;
                    break 'steps;
                }
                if !self.control.paused() {
                    break;
                }
                tokio::time::sleep(PAUSE_POLL).await;
            }

            if started.elapsed().as_secs_f64() > self.global_timeout {
                errors.push(format!(
                    "sequence timed out after {:.1}s",
                    self.global_timeout
                ));
                outcome = SequenceStatus::Failed;
                break;
            }

            if !step.enabled || skip_next {
                skip_next = false;
                self.completed_steps.fetch_add(1, Ordering::SeqCst);
                continue;
            }

            let _ = self.events.send(SequenceEvent::StepStarted {
                sequence_id: self.sequence_id.clone(),
                step_id: step.step_id.clone(),
            });
            log::debug!("sequence '{}': step '{}'", self.sequence_id, step.step_id);

            let budget = step_timeout(step.timeout);
            let executed = tokio::time::timeout(
                budget,
                execute_step(step, &self.ports, &mut self.variables, &self.control),
            )
            .await;

            match executed {
                Err(_elapsed) => {
                    errors.push(format!(
                        "Step '{}' timed out after {:.1}s",
                        step.step_id, step.timeout
                    ));
                    outcome = SequenceStatus::Failed;
                    break;
                }
                Ok(Err(e)) => {
                    errors.push(format!("Step '{}' failed: {e:#}", step.step_id));
                    outcome = SequenceStatus::Failed;
                    break;
                }
                Ok(Ok(StepOutcome::Abort(reason))) => {
                    errors.push(format!("Step '{}' aborted: {reason}", step.step_id));
                    outcome = SequenceStatus::Failed;
                    break;
                }
                Ok(Ok(StepOutcome::SkipNext(value))) => {
                    skip_next = true;
                    step_results.insert(step.step_id.clone(), value.clone());
                    self.completed_steps.fetch_add(1, Ordering::SeqCst);
                    let _ = self.events.send(SequenceEvent::StepCompleted {
                        sequence_id: self.sequence_id.clone(),
                        step_id: step.step_id.clone(),
                        result: value,
                    });
                }
                Ok(Ok(StepOutcome::Done(value))) => {
                    step_results.insert(step.step_id.clone(), value.clone());
                    self.completed_steps.fetch_add(1, Ordering::SeqCst);
                    let _ = self.events.send(SequenceEvent::StepCompleted {
                        sequence_id: self.sequence_id.clone(),
                        step_id: step.step_id.clone(),
                        result: value,
                    });
                }
            }

            if self.control.cancelled() {
                outcome = SequenceStatus::Cancelled;
                break;
            }
        }

        // A cancel that raced the final step still reports Cancelled.
        if self.control.cancelled() {
            outcome = SequenceStatus::Cancelled;
        }

        self.control.set_status(outcome);

        let result = SequenceResult {
            run_id: Uuid::new_v4(),
            sequence_id: self.sequence_id.clone(),
            status: outcome,
            start_time,
            end_time: Some(Utc::now()),
            step_results,
            errors: errors.clone(),
        };
        if let Ok(mut guard) = self.last_result.lock() {
            *guard = Some(result.clone());
        }

        match outcome {
            SequenceStatus::Completed => {
                log::info!("sequence '{}' completed", self.sequence_id);
                let _ = self.events.send(SequenceEvent::Completed {
                    sequence_id: self.sequence_id.clone(),
                    result,
                });
            }
            SequenceStatus::Cancelled => {
                log::info!("sequence '{}' cancelled", self.sequence_id);
                let _ = self.events.send(SequenceEvent::Cancelled {
                    sequence_id: self.sequence_id.clone(),
                });
            }
            _ => {
                log::warn!("sequence '{}' failed: {errors:?}", self.sequence_id);
                let _ = self.events.send(SequenceEvent::Failed {
                    sequence_id: self.sequence_id.clone(),
                    errors,
                });
            }
        }
    }
}

fn step_timeout(timeout: f64) -> Duration {
    // Zero, negative, non-finite and Duration-overflowing timeouts all fall
    // back to the default rather than panicking inside the runner task.
    match Duration::try_from_secs_f64(timeout) {
        Ok(limit) if !limit.is_zero() => limit,
        _ => Duration::from_secs_f64(crate::sequence::step::DEFAULT_STEP_TIMEOUT),
    }
}

async fn execute_step(
    step: &MeasurementStep,
    ports: &SequencePorts,
    variables: &mut HashMap<String, Value>,
    control: &Control,
) -> anyhow::Result<StepOutcome> {
    match step.step_type {
        StepType::Measurement => {
            let measurement_type = step.parameter_str("measurement_type").unwrap_or("amplitude");
            let channel = step.parameter_str("channel").unwrap_or("CH1");
            let value = match &ports.measurements {
                Some(source) => source
                    .measure(measurement_type, channel)
                    .with_context(|| format!("measuring {measurement_type} on {channel}"))?,
                None => simulated_measurement(measurement_type),
            };
            variables.insert(step.step_id.clone(), json!(value));
            variables.insert("last_value".to_string(), json!(value));
            Ok(StepOutcome::Done(json!({
                "measurement_type": measurement_type,
                "channel": channel,
                "value": value,
                "unit": "V",
                "timestamp": Utc::now().to_rfc3339(),
            })))
        }

        StepType::Delay => {
            let duration = step
                .parameter_f64("duration")
                .ok_or_else(|| anyhow!("delay step requires a 'duration' parameter"))?;
            let deadline = Duration::try_from_secs_f64(duration)
                .ok()
                .and_then(|total| std::time::Instant::now().checked_add(total))
                .ok_or_else(|| anyhow!("invalid delay duration: {duration}"))?;
            loop {
                if control.cancelled() {
                    break;
                }
                let remaining = deadline.saturating_duration_since(std::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                tokio::time::sleep(DELAY_SLICE.min(remaining)).await;
            }
            Ok(StepOutcome::Done(json!({ "waited": duration })))
        }

        StepType::Condition => {
            let expression = step
                .parameter_str("expression")
                .ok_or_else(|| anyhow!("condition step requires an 'expression' parameter"))?;
            let on_false = step.parameter_str("on_false").unwrap_or("continue");
            let holds = evaluate_condition(expression, variables)?;
            let summary = json!({ "expression": expression, "result": holds });
            if holds {
                return Ok(StepOutcome::Done(summary));
            }
            match on_false {
                "continue" => Ok(StepOutcome::Done(summary)),
                "skip_next" => Ok(StepOutcome::SkipNext(summary)),
                "abort" => Ok(StepOutcome::Abort(format!(
                    "condition '{expression}' was false"
                ))),
                other => Err(anyhow!("unknown on_false action '{other}'")),
            }
        }

        StepType::SetParameter => {
            let channel = step.parameter_str("channel").unwrap_or("CH1").to_string();
            let parameter = step
                .parameter_str("parameter")
                .ok_or_else(|| anyhow!("set_parameter step requires a 'parameter' parameter"))?
                .to_string();
            let value = step
                .parameters
                .get("value")
                .cloned()
                .ok_or_else(|| anyhow!("set_parameter step requires a 'value' parameter"))?;
            if let Some(scope) = &ports.oscilloscope {
                scope
                    .set_parameter(&channel, &parameter, &value)
                    .with_context(|| format!("setting {parameter} on {channel}"))?;
            }
            Ok(StepOutcome::Done(json!({
                "channel": channel,
                "parameter": parameter,
                "value": value,
            })))
        }

        StepType::TriggerSetup => {
            let source = step
                .parameter_str("source")
                .ok_or_else(|| anyhow!("trigger_setup step requires a 'source' parameter"))?;
            if let Some(scope) = &ports.oscilloscope {
                scope
                    .set_trigger_source(source)
                    .with_context(|| format!("routing trigger to {source}"))?;
            }
            Ok(StepOutcome::Done(json!({ "source": source })))
        }

        StepType::DataAcquisition => {
            let channel = step.parameter_str("channel").unwrap_or("CH1");
            let samples = match &ports.oscilloscope {
                Some(scope) => {
                    scope.trigger_single().context("arming acquisition")?;
                    loop {
                        if control.cancelled() {
                            return Ok(StepOutcome::Done(json!({
                                "channel": channel,
                                "samples": 0,
                            })));
                        }
                        if scope
                            .is_acquisition_complete()
                            .context("polling acquisition")?
                        {
                            break;
                        }
                        tokio::time::sleep(ACQUISITION_POLL).await;
                    }
                    scope
                        .waveform(channel)
                        .with_context(|| format!("reading waveform from {channel}"))?
                        .map(|w| w.len())
                        .unwrap_or(0)
                }
                None => {
                    tokio::time::sleep(ACQUISITION_POLL).await;
                    1000
                }
            };
            Ok(StepOutcome::Done(json!({
                "channel": channel,
                "samples": samples,
            })))
        }

        StepType::Analysis => Err(anyhow!(
            "analysis steps are not executed by the sequence engine; use an analysis script"
        )),

        StepType::Export => Err(anyhow!(
            "export steps are not executed by the sequence engine; export results externally"
        )),
    }
}

/// Evaluate a boolean condition expression against the sequence variables.
/// Only expressions are accepted; statements are rejected by the parser.
fn evaluate_condition(
    expression: &str,
    variables: &HashMap<String, Value>,
) -> anyhow::Result<bool> {
    let engine = rhai::Engine::new();
    let mut scope = rhai::Scope::new();
    for (name, value) in variables {
        let dynamic = rhai::serde::to_dynamic(value)
            .map_err(|e| anyhow!("variable '{name}' is not scriptable: {e}"))?;
        scope.push_dynamic(name.as_str(), dynamic);
    }
    engine
        .eval_expression_with_scope::<bool>(&mut scope, expression)
        .map_err(|e| anyhow!("condition '{expression}' failed to evaluate: {e}"))
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe() -> (
        broadcast::Sender<SequenceEvent>,
        broadcast::Receiver<SequenceEvent>,
    ) {
        broadcast::channel(256)
    }

    async fn wait_terminal(
        rx: &mut broadcast::Receiver<SequenceEvent>,
    ) -> SequenceEvent {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("sequence did not finish in time")
                .unwrap();
            match event {
                SequenceEvent::Completed { .. }
                | SequenceEvent::Failed { .. }
                | SequenceEvent::Cancelled { .. } => return event,
                _ => {}
            }
        }
    }

    #[test]
    fn builder_helpers_number_steps_sequentially() {
        let mut seq = MeasurementSequence::new("s1", "Demo");
        assert_eq!(seq.add_measurement_step("Amp", "amplitude", "CH1"), "meas_0");
        assert_eq!(seq.add_delay_step("Settle", 0.01), "delay_1");
        assert_eq!(seq.add_condition_step("Check", "last_value > 0.0", "abort"), "cond_2");
        assert_eq!(
            seq.add_parameter_step("Scale", "CH1", "vertical_scale", json!(0.5)),
            "param_3"
        );
    }

    #[tokio::test]
    async fn empty_sequence_cannot_start() {
        let seq = MeasurementSequence::new("s1", "Empty");
        let (tx, _rx) = subscribe();
        let err = seq.start(SequencePorts::default(), tx).unwrap_err();
        assert!(matches!(err, AutomationError::Validation(_)));
        assert_eq!(seq.status(), SequenceStatus::Idle);
    }

    #[tokio::test]
    async fn sequence_runs_all_steps_to_completion() {
        let mut seq = MeasurementSequence::new("s1", "Demo");
        seq.add_measurement_step("Amp", "amplitude", "CH1");
        seq.add_delay_step("Settle", 0.01);
        seq.add_measurement_step("Freq", "frequency", "CH1");

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        match wait_terminal(&mut rx).await {
            SequenceEvent::Completed { result, .. } => {
                assert_eq!(result.step_results.len(), 3);
                assert!(result.errors.is_empty());
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
        assert_eq!(seq.status(), SequenceStatus::Completed);
        assert!((seq.progress() - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn first_failure_stops_the_run() {
        let mut seq = MeasurementSequence::new("s1", "Failing");
        seq.add_measurement_step("Amp", "amplitude", "CH1");
        // Delay without a duration parameter fails.
        seq.add_step(MeasurementStep::new("delay_2", StepType::Delay, "Broken"));
        seq.add_measurement_step("Freq", "frequency", "CH1");

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        match wait_terminal(&mut rx).await {
            SequenceEvent::Failed { errors, .. } => {
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("delay_2"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
        let result = seq.last_result().unwrap();
        assert_eq!(result.status, SequenceStatus::Failed);
        assert_eq!(result.step_results.len(), 1, "only the first step ran");
    }

    #[tokio::test]
    async fn disabled_steps_are_skipped() {
        let mut seq = MeasurementSequence::new("s1", "Skipping");
        seq.add_measurement_step("Amp", "amplitude", "CH1");
        seq.add_step(
            MeasurementStep::new("delay_2", StepType::Delay, "Off")
                .with_parameter("duration", json!(5.0))
                .disabled(),
        );

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        match wait_terminal(&mut rx).await {
            SequenceEvent::Completed { result, .. } => {
                assert!(!result.step_results.contains_key("delay_2"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancel_during_pause_reports_cancelled() {
        let mut seq = MeasurementSequence::new("s1", "Pausing");
        seq.add_delay_step("A", 0.05);
        seq.add_delay_step("B", 0.05);
        seq.add_measurement_step("Amp", "amplitude", "CH1");

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        assert!(seq.pause());
        assert_eq!(seq.status(), SequenceStatus::Paused);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(seq.cancel());

        match wait_terminal(&mut rx).await {
            SequenceEvent::Cancelled { .. } => {}
            other => panic!("unexpected terminal event: {other:?}"),
        }
        assert_eq!(seq.status(), SequenceStatus::Cancelled);
        let result = seq.last_result().unwrap();
        assert!(result.step_results.len() < 3, "sequence ran to completion");
    }

    #[tokio::test]
    async fn condition_abort_fails_the_sequence() {
        let mut seq = MeasurementSequence::new("s1", "Guarded");
        seq.variables.insert("threshold".to_string(), json!(2.0));
        seq.add_condition_step("Guard", "threshold > 5.0", "abort");
        seq.add_measurement_step("Amp", "amplitude", "CH1");

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        match wait_terminal(&mut rx).await {
            SequenceEvent::Failed { errors, .. } => {
                assert!(errors[0].contains("cond_0"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn condition_skip_next_bypasses_one_step() {
        let mut seq = MeasurementSequence::new("s1", "Branching");
        seq.variables.insert("run_extra".to_string(), json!(false));
        seq.add_condition_step("Branch", "run_extra", "skip_next");
        seq.add_step(
            MeasurementStep::new("delay_2", StepType::Delay, "Skipped")
                .with_parameter("duration", json!(5.0)),
        );
        seq.add_measurement_step("Amp", "amplitude", "CH1");

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        match wait_terminal(&mut rx).await {
            SequenceEvent::Completed { result, .. } => {
                assert!(!result.step_results.contains_key("delay_2"));
                assert!(result.step_results.contains_key("meas_2"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[test]
    fn unusable_step_timeouts_fall_back_to_default() {
        let default = Duration::from_secs_f64(crate::sequence::step::DEFAULT_STEP_TIMEOUT);
        assert_eq!(step_timeout(0.0), default);
        assert_eq!(step_timeout(-1.0), default);
        assert_eq!(step_timeout(f64::NAN), default);
        // Finite but too large for a Duration
        assert_eq!(step_timeout(1e30), default);
        assert_eq!(step_timeout(0.5), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn oversized_delay_fails_instead_of_wedging() {
        let mut seq = MeasurementSequence::new("s1", "Huge delay");
        seq.add_delay_step("Forever", 1e30);

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        match wait_terminal(&mut rx).await {
            SequenceEvent::Failed { errors, .. } => {
                assert!(
                    errors[0].contains("invalid delay duration"),
                    "got: {}",
                    errors[0]
                );
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
        // The runner reached a terminal state, so the sequence can be reset.
        assert_eq!(seq.status(), SequenceStatus::Failed);
        seq.reset().unwrap();
    }

    #[tokio::test]
    async fn per_step_timeout_fails_the_step() {
        let mut seq = MeasurementSequence::new("s1", "Slow");
        seq.add_step(
            MeasurementStep::new("delay_1", StepType::Delay, "Too long")
                .with_parameter("duration", json!(10.0))
                .with_timeout(0.05),
        );

        let (tx, mut rx) = subscribe();
        seq.start(SequencePorts::default(), tx).unwrap();

        match wait_terminal(&mut rx).await {
            SequenceEvent::Failed { errors, .. } => {
                assert!(errors[0].contains("timed out"));
            }
            other => panic!("unexpected terminal event: {other:?}"),
        }
    }

    #[test]
    fn document_roundtrip_preserves_steps_and_variables() {
        let mut seq = MeasurementSequence::new("s1", "Persisted");
        seq.variables.insert("threshold".to_string(), json!(1.5));
        seq.add_measurement_step("Amp", "amplitude", "CH2");
        seq.add_condition_step("Guard", "last_value > threshold", "abort");

        let text = serde_json::to_string_pretty(&seq.to_document()).unwrap();
        let restored =
            MeasurementSequence::from_document(serde_json::from_str(&text).unwrap());
        assert_eq!(restored.id, "s1");
        assert_eq!(restored.steps.len(), 2);
        assert_eq!(restored.steps[1].step_type, StepType::Condition);
        assert_eq!(restored.variables.get("threshold"), Some(&json!(1.5)));
        assert_eq!(restored.status(), SequenceStatus::Idle);
    }

    #[test]
    fn condition_statements_are_rejected() {
        let vars = HashMap::from([("x".to_string(), json!(1.0))]);
        assert!(evaluate_condition("x > 0.5", &vars).unwrap());
        assert!(!evaluate_condition("x > 2.0", &vars).unwrap());
        assert!(evaluate_condition("let y = 1; y > 0", &vars).is_err());
    }
}
