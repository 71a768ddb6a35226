//! Sandboxed script execution.
//!
//! Scripts are written in rhai and run on blocking worker threads. The host
//! exposes a fixed set of functions (logging, parameter access, measurement,
//! waveform capture, numeric helpers); everything else is unavailable to
//! script code. Execution is cooperative-cancellable and budgeted so a
//! misbehaving script cannot wedge the application.

pub mod context;
pub mod engine;
pub mod parameter;
pub mod script;
pub mod templates;

pub use context::ScriptContext;
pub use engine::ScriptingEngine;
pub use parameter::{ParameterType, ScriptParameter};
pub use script::{
    AutomationScript, ScriptDocument, ScriptEvent, ScriptResult, ScriptStatus, ScriptType,
};
pub use templates::{ScriptTemplate, TemplateLibrary};
