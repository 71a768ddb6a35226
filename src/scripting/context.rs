//! Execution context shared with a running script.
//!
//! Scripts never address the instrument directly. Every capability a script
//! may use is a host function registered on the rhai engine, backed by a
//! `ScriptContext`: anything not registered here is simply not callable from
//! script code. Collaborator ports are optional; when absent the context
//! synthesizes plausible data so scripts remain runnable offline.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rhai::{Dynamic, Engine, EvalAltResult, Position};
use serde_json::Value;

use crate::analysis::{self, Window};
use crate::instrument::{MeasurementSource, Oscilloscope, Waveform};

/// Operation budget for a single evaluation. Generous for measurement
/// automation, tight enough to stop a runaway loop within a second or two.
const MAX_OPERATIONS: u64 = 5_000_000;

const WAIT_SLICE: Duration = Duration::from_millis(10);

type ProgressHook = Box<dyn Fn(f64) + Send + Sync>;
type OutputHook = Box<dyn Fn(&str) + Send + Sync>;

pub struct ScriptContext {
    oscilloscope: Option<Arc<dyn Oscilloscope>>,
    measurements: Option<Arc<dyn MeasurementSource>>,
    parameters: Mutex<HashMap<String, Value>>,
    output: Mutex<Vec<String>>,
    should_stop: AtomicBool,
    progress_hook: Mutex<Option<ProgressHook>>,
    output_hook: Mutex<Option<OutputHook>>,
}

impl ScriptContext {
    pub fn new() -> Self {
        Self::with_collaborators(None, None)
    }

    pub fn with_collaborators(
        oscilloscope: Option<Arc<dyn Oscilloscope>>,
        measurements: Option<Arc<dyn MeasurementSource>>,
    ) -> Self {
        Self {
            oscilloscope,
            measurements,
            parameters: Mutex::new(HashMap::new()),
            output: Mutex::new(Vec::new()),
            should_stop: AtomicBool::new(false),
            progress_hook: Mutex::new(None),
            output_hook: Mutex::new(None),
        }
    }

    pub fn set_parameters(&self, parameters: HashMap<String, Value>) {
        if let Ok(mut guard) = self.parameters.lock() {
            *guard = parameters;
        }
    }

    pub fn set_progress_hook(&self, hook: ProgressHook) {
        if let Ok(mut guard) = self.progress_hook.lock() {
            *guard = Some(hook);
        }
    }

    pub fn set_output_hook(&self, hook: OutputHook) {
        if let Ok(mut guard) = self.output_hook.lock() {
            *guard = Some(hook);
        }
    }

    pub fn request_stop(&self) {
        self.should_stop.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.should_stop.load(Ordering::SeqCst)
    }

    pub fn parameter(&self, name: &str) -> Option<Value> {
        self.parameters
            .lock()
            .ok()
            .and_then(|guard| guard.get(name).cloned())
    }

    /// Append a timestamped line to the output buffer and stream it out.
    pub fn log(&self, message: &str, level: &str) {
        let line = format!(
            "[{}] {}: {}",
            chrono::Utc::now().format("%H:%M:%S"),
            level.to_uppercase(),
            message
        );
        if let Ok(mut buffer) = self.output.lock() {
            buffer.push(line.clone());
        }
        if let Ok(hook) = self.output_hook.lock() {
            if let Some(hook) = hook.as_ref() {
                hook(&line);
            }
        }
    }

    pub fn set_progress(&self, progress: f64) {
        let clamped = progress.clamp(0.0, 1.0);
        if let Ok(hook) = self.progress_hook.lock() {
            if let Some(hook) = hook.as_ref() {
                hook(clamped);
            }
        }
    }

    /// Drain the output buffer into a single newline-joined string.
    pub fn take_output(&self) -> String {
        self.output
            .lock()
            .map(|mut buffer| {
                let lines: Vec<String> = buffer.drain(..).collect();
                lines.join("\n")
            })
            .unwrap_or_default()
    }

    /// One scalar measurement. Falls back to simulated values in plausible
    /// per-type ranges when no measurement source is attached.
    pub fn measure(&self, measurement_type: &str, channel: &str) -> Result<f64, String> {
        if let Some(source) = &self.measurements {
            return source
                .measure(measurement_type, channel)
                .map_err(|e| e.to_string());
        }

        let value = crate::instrument::simulated_measurement(measurement_type);
        self.log(
            &format!("Simulated {measurement_type} on {channel}: {value:.6}"),
            "debug",
        );
        Ok(value)
    }

    /// Capture one waveform. Without an attached oscilloscope, or when the
    /// instrument reports no waveform capability, a sine is synthesized from
    /// the `signal_frequency` / `signal_amplitude` parameters.
    pub fn acquire_waveform(&self, channel: &str) -> Result<Waveform, String> {
        if let Some(scope) = &self.oscilloscope {
            match scope.waveform(channel) {
                Ok(Some(waveform)) => return Ok(waveform),
                Ok(None) => {}
                Err(e) => return Err(e.to_string()),
            }
        }

        let frequency = self
            .parameter("signal_frequency")
            .and_then(|v| v.as_f64())
            .unwrap_or(1000.0);
        let amplitude = self
            .parameter("signal_amplitude")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);

        let n = 1000;
        let span = 1e-3;
        let time: Vec<f64> = (0..n).map(|i| i as f64 * span / n as f64).collect();
        let voltage: Vec<f64> = time
            .iter()
            .map(|&t| amplitude * (2.0 * std::f64::consts::PI * frequency * t).sin())
            .collect();
        Ok(Waveform { time, voltage })
    }

    /// Sleep in short slices so a cancellation request interrupts the wait.
    pub fn wait(&self, seconds: f64) -> Result<(), String> {
        // try_from_secs_f64 rejects NaN, infinities, negatives and values
        // that do not fit in a Duration; checked_add catches deadline overflow.
        let deadline = Duration::try_from_secs_f64(seconds)
            .ok()
            .and_then(|total| std::time::Instant::now().checked_add(total))
            .ok_or_else(|| format!("invalid wait duration: {seconds}"))?;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            if self.is_stopped() {
                return Err("script cancelled".to_string());
            }
            std::thread::sleep(WAIT_SLICE.min(remaining));
        }
        Ok(())
    }
}

impl Default for ScriptContext {
    fn default() -> Self {
        Self::new()
    }
}

fn runtime_error(message: String) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        Dynamic::from(message),
        Position::NONE,
    ))
}

fn cancelled_error() -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorTerminated(
        Dynamic::from("script cancelled"),
        Position::NONE,
    ))
}

fn to_f64_vec(array: &rhai::Array) -> Vec<f64> {
    array
        .iter()
        .filter_map(|d| d.as_float().ok().or_else(|| d.as_int().ok().map(|i| i as f64)))
        .collect()
}

fn waveform_to_map(waveform: Waveform) -> rhai::Map {
    let mut map = rhai::Map::new();
    map.insert("time".into(), waveform.time.into());
    map.insert("voltage".into(), waveform.voltage.into());
    map
}

/// Evenly spaced points over `[start, stop]`, endpoints included.
fn linspace(start: f64, stop: f64, count: i64) -> rhai::Array {
    if count <= 0 {
        return rhai::Array::new();
    }
    if count == 1 {
        return vec![Dynamic::from(start)];
    }
    let step = (stop - start) / (count - 1) as f64;
    (0..count)
        .map(|i| Dynamic::from(start + step * i as f64))
        .collect()
}

/// Build a sandboxed rhai engine bound to `ctx`.
///
/// The registered functions below are the complete capability surface of a
/// script; the progress callback enforces both the operation budget and
/// cooperative cancellation so even a script that never calls `check_stop()`
/// terminates promptly after a cancel request.
pub fn build_engine(ctx: Arc<ScriptContext>) -> Engine {
    let mut engine = Engine::new();

    {
        let ctx = ctx.clone();
        engine.on_progress(move |operations| {
            if ctx.is_stopped() {
                return Some(Dynamic::from("script cancelled"));
            }
            if operations > MAX_OPERATIONS {
                return Some(Dynamic::from("operation budget exceeded"));
            }
            None
        });
    }

    // ==================== logging / progress ====================

    {
        let ctx = ctx.clone();
        engine.register_fn("log", move |message: String| ctx.log(&message, "info"));
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("log", move |message: String, level: String| {
            ctx.log(&message, &level)
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("set_progress", move |progress: f64| {
            ctx.set_progress(progress)
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("set_progress", move |progress: i64| {
            ctx.set_progress(progress as f64)
        });
    }

    // ==================== control flow ====================

    {
        let ctx = ctx.clone();
        engine.register_fn("check_stop", move || -> Result<(), Box<EvalAltResult>> {
            if ctx.is_stopped() {
                Err(cancelled_error())
            } else {
                Ok(())
            }
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "wait",
            move |seconds: f64| -> Result<(), Box<EvalAltResult>> {
                ctx.wait(seconds).map_err(|e| {
                    if ctx.is_stopped() {
                        cancelled_error()
                    } else {
                        runtime_error(e)
                    }
                })
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "wait",
            move |seconds: i64| -> Result<(), Box<EvalAltResult>> {
                ctx.wait(seconds as f64).map_err(|e| {
                    if ctx.is_stopped() {
                        cancelled_error()
                    } else {
                        runtime_error(e)
                    }
                })
            },
        );
    }

    // ==================== parameters ====================

    {
        let ctx = ctx.clone();
        engine.register_fn("get_parameter", move |name: String| -> Dynamic {
            ctx.parameter(&name)
                .and_then(|v| rhai::serde::to_dynamic(v).ok())
                .unwrap_or(Dynamic::UNIT)
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "get_parameter",
            move |name: String, default: Dynamic| -> Dynamic {
                ctx.parameter(&name)
                    .and_then(|v| rhai::serde::to_dynamic(v).ok())
                    .unwrap_or(default)
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("get_float", move |name: String, default: f64| -> f64 {
            ctx.parameter(&name)
                .and_then(|v| match v {
                    Value::String(s) => s.parse().ok(),
                    other => other.as_f64(),
                })
                .unwrap_or(default)
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("get_int", move |name: String, default: i64| -> i64 {
            ctx.parameter(&name)
                .and_then(|v| match v {
                    Value::String(s) => s.parse().ok(),
                    other => other.as_i64(),
                })
                .unwrap_or(default)
        });
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "get_string",
            move |name: String, default: String| -> String {
                match ctx.parameter(&name) {
                    Some(Value::String(s)) => s,
                    Some(other) => other.to_string(),
                    None => default,
                }
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn("get_bool", move |name: String, default: bool| -> bool {
            ctx.parameter(&name)
                .and_then(|v| v.as_bool())
                .unwrap_or(default)
        });
    }

    // ==================== instrument access ====================

    {
        let ctx = ctx.clone();
        engine.register_fn(
            "measure",
            move |measurement_type: String, channel: String| -> Result<f64, Box<EvalAltResult>> {
                ctx.measure(&measurement_type, &channel)
                    .map_err(runtime_error)
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "measure",
            move |measurement_type: String| -> Result<f64, Box<EvalAltResult>> {
                ctx.measure(&measurement_type, "CH1").map_err(runtime_error)
            },
        );
    }
    {
        let ctx = ctx.clone();
        engine.register_fn(
            "acquire_waveform",
            move |channel: String| -> Result<rhai::Map, Box<EvalAltResult>> {
                ctx.acquire_waveform(&channel)
                    .map(waveform_to_map)
                    .map_err(runtime_error)
            },
        );
    }

    // ==================== numeric helpers ====================

    engine.register_fn("linspace", linspace);
    engine.register_fn("linspace", |start: i64, stop: i64, count: i64| {
        linspace(start as f64, stop as f64, count)
    });
    engine.register_fn("mean", |samples: rhai::Array| {
        analysis::mean(&to_f64_vec(&samples))
    });
    engine.register_fn("rms", |samples: rhai::Array| {
        analysis::rms(&to_f64_vec(&samples))
    });
    engine.register_fn("peak_to_peak", |samples: rhai::Array| {
        analysis::peak_to_peak(&to_f64_vec(&samples))
    });
    engine.register_fn(
        "dominant_frequency",
        |samples: rhai::Array, sample_interval: f64, window: String| {
            analysis::dominant_frequency(
                &to_f64_vec(&samples),
                sample_interval,
                Window::from_name(&window),
            )
        },
    );

    engine
}

// ============================================================
// Tests
// ============================================================
