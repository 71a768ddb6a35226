//! Automation core for RTB2000-class oscilloscope control.
//!
//! Four engines built on a shared instrument abstraction:
//!
//! - [`scripting`]: sandboxed rhai scripts with parameter validation,
//!   cooperative cancellation and a template library.
//! - [`sequence`]: step-based measurement sequences with pause, resume and
//!   cancel.
//! - [`multichannel`]: synchronized multi-channel acquisition with
//!   correlation-based sync quality scoring.
//! - [`triggers`]: declarative advanced trigger definitions, SCPI command
//!   composition and firing notification.
//!
//! Engines talk to hardware only through the [`instrument`] traits, injected
//! at construction. Every long-running operation executes on a background
//! task and reports through a `tokio::sync::broadcast` channel, so a UI can
//! observe progress without polling.

pub mod analysis;
pub mod error;
pub mod instrument;
pub mod multichannel;
pub mod scripting;
pub mod sequence;
pub mod triggers;

pub use error::{AppResult, AutomationError};
pub use instrument::{MeasurementSource, Oscilloscope, Waveform};
pub use multichannel::{ChannelConfig, ChannelGroup, MultiChannelController, SyncConfig};
pub use scripting::{AutomationScript, ScriptingEngine};
pub use sequence::{AutomationEngine, MeasurementSequence};
pub use triggers::{AdvancedTrigger, TriggerManager};
