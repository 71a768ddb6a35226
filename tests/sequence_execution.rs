//! End-to-end sequence execution through the automation engine.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;

use rtb_automation::instrument::{SimulatedMeter, SimulatedScope};
use rtb_automation::sequence::{
    AutomationEngine, MeasurementStep, SequenceEvent, SequenceStatus, StepType,
};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn wait_terminal(rx: &mut broadcast::Receiver<SequenceEvent>) -> SequenceEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), rx.recv())
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

#[tokio::test]
async fn full_sequence_against_simulated_instruments() {
    init_logging();
    let scope = Arc::new(SimulatedScope::new());
    let meter = Arc::new(SimulatedMeter::new());
    let mut engine =
        AutomationEngine::with_collaborators(Some(scope.clone()), Some(meter.clone()));

    let seq = engine.create_sequence("s1", "Full run").unwrap();
    seq.add_parameter_step("Scale", "CH1", "vertical_scale", json!(0.5));
    seq.add_step(
        MeasurementStep::new("trig_2", StepType::TriggerSetup, "Trigger on CH1")
            .with_parameter("source", json!("CH1")),
    );
    seq.add_step(
        MeasurementStep::new("acq_3", StepType::DataAcquisition, "Capture")
            .with_parameter("channel", json!("CH1")),
    );
    seq.add_measurement_step("Amplitude", "amplitude", "CH1");
    seq.add_delay_step("Settle", 0.02);

    let mut rx = engine.subscribe();
    engine.start_sequence("s1").unwrap();

    let result = match wait_terminal(&mut rx).await {
        SequenceEvent::Completed { result, .. } => result,
        other => panic!("unexpected terminal event: {other:?}"),
    };

    assert_eq!(result.status, SequenceStatus::Completed);
    assert_eq!(result.step_results.len(), 5);
    assert_eq!(result.step_results["acq_3"]["samples"], json!(1000));
    assert_eq!(result.step_results["meas_3"]["unit"], json!("V"));
    assert_eq!(meter.call_count(), 1);
    assert!(scope.capture_count() >= 1);
    assert_eq!(engine.sequence_progress("s1"), Some(1.0));
}

#[tokio::test]
async fn failing_step_preserves_earlier_results() {
    init_logging();
    let mut engine = AutomationEngine::new();
    let seq = engine.create_sequence("s1", "Fail fast").unwrap();
    seq.add_measurement_step("Amp", "amplitude", "CH1");
    // Condition referencing an unknown variable fails to evaluate.
    seq.add_condition_step("Broken", "no_such_variable > 1.0", "continue");
    seq.add_measurement_step("Freq", "frequency", "CH1");

    let mut rx = engine.subscribe();
    engine.start_sequence("s1").unwrap();

    match wait_terminal(&mut rx).await {
        SequenceEvent::Failed { errors, .. } => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("cond_1"), "got: {}", errors[0]);
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }

    let result = engine.sequence_result("s1").unwrap();
    assert_eq!(result.status, SequenceStatus::Failed);
    assert_eq!(result.step_results.len(), 1);
    assert!(result.step_results.contains_key("meas_0"));
}

#[tokio::test]
async fn pause_resume_round_trip_completes() {
    init_logging();
    let mut engine = AutomationEngine::new();
    let seq = engine.create_sequence("s1", "Pausable").unwrap();
    seq.add_delay_step("A", 0.05);
    seq.add_measurement_step("Amp", "amplitude", "CH1");
    seq.add_measurement_step("Freq", "frequency", "CH1");

    let mut rx = engine.subscribe();
    engine.start_sequence("s1").unwrap();

    assert!(engine.pause_sequence("s1").unwrap());
    assert_eq!(engine.sequence_status("s1"), Some(SequenceStatus::Paused));
    // Pausing twice is a no-op.
    assert!(!engine.pause_sequence("s1").unwrap());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(engine.resume_sequence("s1").unwrap());

    match wait_terminal(&mut rx).await {
        SequenceEvent::Completed { result, .. } => {
            assert_eq!(result.step_results.len(), 3);
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn condition_gates_on_measured_values() {
    init_logging();
    let meter = Arc::new(SimulatedMeter::new());
    let mut engine = AutomationEngine::with_collaborators(None, Some(meter));
    let seq = engine.create_sequence("s1", "Gated").unwrap();
    seq.add_measurement_step("Amp", "amplitude", "CH1");
    // Simulated amplitude is always in 0.1..5.0, so this never aborts.
    seq.add_condition_step("Sanity", "last_value > 0.0 && last_value < 10.0", "abort");
    seq.add_measurement_step("Freq", "frequency", "CH1");

    let mut rx = engine.subscribe();
    engine.start_sequence("s1").unwrap();

    match wait_terminal(&mut rx).await {
        SequenceEvent::Completed { result, .. } => {
            assert_eq!(result.step_results["cond_1"]["result"], json!(true));
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn saved_sequence_reruns_after_load() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sequence.json");

    {
        let mut engine = AutomationEngine::new();
        let seq = engine.create_sequence("s1", "Persisted").unwrap();
        seq.add_measurement_step("Amp", "amplitude", "CH1");
        seq.add_delay_step("Settle", 0.01);
        engine.save_sequence("s1", &path).unwrap();
    }

    let mut engine = AutomationEngine::new();
    let id = engine.load_sequence(&path).unwrap();
    let mut rx = engine.subscribe();
    engine.start_sequence(&id).unwrap();

    match wait_terminal(&mut rx).await {
        SequenceEvent::Completed { result, .. } => {
            assert_eq!(result.sequence_id, "s1");
            assert_eq!(result.step_results.len(), 2);
        }
        other => panic!("unexpected terminal event: {other:?}"),
    }
}

#[tokio::test]
async fn restart_requires_reset_after_terminal_state() {
    init_logging();
    let mut engine = AutomationEngine::new();
    let seq = engine.create_sequence("s1", "Repeatable").unwrap();
    seq.add_delay_step("Settle", 0.01);

    let mut rx = engine.subscribe();
    engine.start_sequence("s1").unwrap();
    wait_terminal(&mut rx).await;

    assert!(engine.start_sequence("s1").is_err());
    engine.sequence("s1").unwrap().reset().unwrap();
    engine.start_sequence("s1").unwrap();
    match wait_terminal(&mut rx).await {
        SequenceEvent::Completed { .. } => {}
        other => panic!("unexpected terminal event: {other:?}"),
    }
}
