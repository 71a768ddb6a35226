//! Sequence registry and lifecycle front end.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::error::{AppResult, AutomationError};
use crate::instrument::{MeasurementSource, Oscilloscope};
use crate::sequence::sequence::{
    MeasurementSequence, SequenceDocument, SequenceEvent, SequencePorts, SequenceResult,
    SequenceStatus,
};

const EVENT_CAPACITY: usize = 256;

/// Owns registered sequences and drives their lifecycle.
pub struct AutomationEngine {
    sequences: HashMap<String, MeasurementSequence>,
    ports: SequencePorts,
    events: broadcast::Sender<SequenceEvent>,
}

impl AutomationEngine {
    pub fn new() -> Self {
        Self::with_collaborators(None, None)
    }

    pub fn with_collaborators(
        oscilloscope: Option<Arc<dyn Oscilloscope>>,
        measurements: Option<Arc<dyn MeasurementSource>>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            sequences: HashMap::new(),
            ports: SequencePorts {
                oscilloscope,
                measurements,
            },
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SequenceEvent> {
        self.events.subscribe()
    }

    pub fn register_sequence(&mut self, sequence: MeasurementSequence) -> AppResult<()> {
        if self.sequences.contains_key(&sequence.id) {
            return Err(AutomationError::duplicate("sequence", &sequence.id));
        }
        log::debug!("registered sequence '{}'", sequence.id);
        let _ = self.events.send(SequenceEvent::Registered {
            sequence_id: sequence.id.clone(),
        });
        self.sequences.insert(sequence.id.clone(), sequence);
        Ok(())
    }

    /// Create and register an empty sequence, returning it for step building.
    pub fn create_sequence(&mut self, id: &str, name: &str) -> AppResult<&mut MeasurementSequence> {
        self.register_sequence(MeasurementSequence::new(id, name))?;
        self.sequences
            .get_mut(id)
            .ok_or_else(|| AutomationError::not_found("sequence", id))
    }

    pub fn sequence(&self, id: &str) -> Option<&MeasurementSequence> {
        self.sequences.get(id)
    }

    pub fn sequence_mut(&mut self, id: &str) -> Option<&mut MeasurementSequence> {
        self.sequences.get_mut(id)
    }

    pub fn sequence_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sequences.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn start_sequence(&self, id: &str) -> AppResult<()> {
        let sequence = self.require(id)?;
        sequence.start(self.ports.clone(), self.events.clone())
    }

    /// Pause a running sequence. Returns `true` when it was actually paused.
    pub fn pause_sequence(&self, id: &str) -> AppResult<bool> {
        let paused = self.require(id)?.pause();
        if paused {
            let _ = self.events.send(SequenceEvent::Paused {
                sequence_id: id.to_string(),
            });
        }
        Ok(paused)
    }

    /// Resume a paused sequence. Returns `true` when it was actually resumed.
    pub fn resume_sequence(&self, id: &str) -> AppResult<bool> {
        let resumed = self.require(id)?.resume();
        if resumed {
            let _ = self.events.send(SequenceEvent::Resumed {
                sequence_id: id.to_string(),
            });
        }
        Ok(resumed)
    }

    /// Request cancellation. Returns `true` when an active run was told to
    /// stop.
    pub fn cancel_sequence(&self, id: &str) -> AppResult<bool> {
        Ok(self.require(id)?.cancel())
    }

    pub fn sequence_status(&self, id: &str) -> Option<SequenceStatus> {
        self.sequences.get(id).map(|s| s.status())
    }

    pub fn sequence_progress(&self, id: &str) -> Option<f64> {
        self.sequences.get(id).map(|s| s.progress())
    }

    pub fn sequence_result(&self, id: &str) -> Option<SequenceResult> {
        self.sequences.get(id).and_then(|s| s.last_result())
    }

    pub fn remove_sequence(&mut self, id: &str) -> AppResult<()> {
        match self.sequences.get(id) {
            None => return Err(AutomationError::not_found("sequence", id)),
            Some(sequence)
                if matches!(
                    sequence.status(),
                    SequenceStatus::Running | SequenceStatus::Paused
                ) =>
            {
                return Err(AutomationError::Busy(format!("sequence '{id}' is active")));
            }
            Some(_) => {}
        }
        self.sequences.remove(id);
        Ok(())
    }

    // ==================== persistence ====================

    pub fn save_sequence(&self, id: &str, path: &Path) -> AppResult<()> {
        let sequence = self.require(id)?;
        let text = serde_json::to_string_pretty(&sequence.to_document())?;
        std::fs::write(path, text)?;
        log::info!("saved sequence '{id}' to {}", path.display());
        Ok(())
    }

    /// Load a sequence document from disk and register it. Returns the id.
    pub fn load_sequence(&mut self, path: &Path) -> AppResult<String> {
        let text = std::fs::read_to_string(path)?;
        let doc: SequenceDocument = serde_json::from_str(&text)?;
        let id = doc.sequence_id.clone();
        self.register_sequence(MeasurementSequence::from_document(doc))?;
        log::info!("loaded sequence '{id}' from {}", path.display());
        Ok(id)
    }

    fn require(&self, id: &str) -> AppResult<&MeasurementSequence> {
        self.sequences
            .get(id)
            .ok_or_else(|| AutomationError::not_found("sequence", id))
    }
}

impl Default for AutomationEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut engine = AutomationEngine::new();
        engine.create_sequence("s1", "One").unwrap();
        let err = engine
            .register_sequence(MeasurementSequence::new("s1", "Again"))
            .unwrap_err();
        assert!(matches!(err, AutomationError::Duplicate { .. }));
    }

    #[test]
    fn lifecycle_calls_on_unknown_sequence_fail() {
        let engine = AutomationEngine::new();
        assert!(engine.start_sequence("ghost").is_err());
        assert!(engine.pause_sequence("ghost").is_err());
        assert!(engine.cancel_sequence("ghost").is_err());
        assert!(engine.sequence_status("ghost").is_none());
    }

    #[test]
    fn pause_on_idle_sequence_is_a_no_op() {
        let mut engine = AutomationEngine::new();
        let seq = engine.create_sequence("s1", "One").unwrap();
        seq.add_delay_step("Settle", 0.01);
        assert!(!engine.pause_sequence("s1").unwrap());
        assert!(!engine.resume_sequence("s1").unwrap());
        assert!(!engine.cancel_sequence("s1").unwrap());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sequence.json");

        let mut engine = AutomationEngine::new();
        let seq = engine.create_sequence("s1", "Persisted").unwrap();
        seq.add_measurement_step("Amp", "amplitude", "CH1");
        seq.add_delay_step("Settle", 0.5);
        engine.save_sequence("s1", &path).unwrap();

        let mut fresh = AutomationEngine::new();
        let id = fresh.load_sequence(&path).unwrap();
        assert_eq!(id, "s1");
        assert_eq!(fresh.sequence("s1").unwrap().steps.len(), 2);
    }

    #[test]
    fn unknown_step_type_fails_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(
            &path,
            r#"{
                "sequence_id": "s1",
                "name": "Bad",
                "steps": [{"step_id": "x_1", "step_type": "teleport", "name": "X"}],
                "created": "2026-01-01T00:00:00Z"
            }"#,
        )
        .unwrap();
        let mut engine = AutomationEngine::new();
        assert!(engine.load_sequence(&path).is_err());
    }
}
