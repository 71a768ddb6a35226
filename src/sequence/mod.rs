//! Step-based measurement sequences with pause, resume and cancel.
//!
//! A sequence is an ordered list of typed steps executed on a background
//! task. Execution is fail-fast: the first step that errors or times out
//! terminates the run, preserving the results of everything that completed
//! before it.

pub mod engine;
#[allow(clippy::module_inception)]
pub mod sequence;
pub mod step;

pub use engine::AutomationEngine;
pub use sequence::{
    MeasurementSequence, SequenceDocument, SequenceEvent, SequencePorts, SequenceResult,
    SequenceStatus,
};
pub use step::{MeasurementStep, StepType};
