//! Simulated instruments that generate synthetic data.
//!
//! Used by the test suite and by demo setups that run without hardware.
//! `SimulatedScope` answers every capability with plausible data; the
//! engines exercise exactly the same code paths as with a real driver.

use super::{MeasurementSource, Oscilloscope, Waveform};
use anyhow::Result;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// An oscilloscope stand-in that synthesizes sine waveforms.
pub struct SimulatedScope {
    /// Signal frequency in Hz for generated waveforms.
    pub signal_frequency: f64,
    /// Signal amplitude in volts for generated waveforms.
    pub signal_amplitude: f64,
    /// Number of samples per generated waveform.
    pub record_length: usize,
    /// Capture window in seconds.
    pub capture_window: f64,
    armed: AtomicBool,
    trigger_fires: AtomicBool,
    captures: AtomicUsize,
}

impl Default for SimulatedScope {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedScope {
    pub fn new() -> Self {
        Self {
            signal_frequency: 1_000.0,
            signal_amplitude: 1.0,
            record_length: 1_000,
            capture_window: 1e-3,
            armed: AtomicBool::new(false),
            trigger_fires: AtomicBool::new(false),
            captures: AtomicUsize::new(0),
        }
    }

    /// Make subsequent `poll_trigger` calls report a fired trigger.
    pub fn set_trigger_fires(&self, fires: bool) {
        self.trigger_fires.store(fires, Ordering::SeqCst);
    }

    /// Number of single captures triggered so far.
    pub fn capture_count(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    /// Generate one sine waveform with the configured frequency/amplitude.
    pub fn sine_waveform(&self) -> Waveform {
        let n = self.record_length.max(2);
        let dt = self.capture_window / (n - 1) as f64;
        let mut time = Vec::with_capacity(n);
        let mut voltage = Vec::with_capacity(n);
        for i in 0..n {
            let t = i as f64 * dt;
            time.push(t);
            voltage.push(
                self.signal_amplitude
                    * (2.0 * std::f64::consts::PI * self.signal_frequency * t).sin(),
            );
        }
        Waveform { time, voltage }
    }
}

impl Oscilloscope for SimulatedScope {
    fn trigger_single(&self) -> Result<()> {
        self.armed.store(true, Ordering::SeqCst);
        self.captures.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_acquisition_complete(&self) -> Result<bool> {
        // One-shot: a triggered capture completes immediately.
        self.armed.store(false, Ordering::SeqCst);
        Ok(true)
    }

    fn waveform(&self, _channel: &str) -> Result<Option<Waveform>> {
        Ok(Some(self.sine_waveform()))
    }

    fn poll_trigger(&self) -> Result<bool> {
        Ok(self.trigger_fires.load(Ordering::SeqCst))
    }
}

/// A measurement collaborator returning randomized but range-plausible values.
///
/// Ranges match the reference simulation: amplitude 0.1–5.0 V, frequency
/// 100–10000 Hz, period 1 µs–1 ms, anything else −1.0–1.0.
#[derive(Default)]
pub struct SimulatedMeter {
    calls: AtomicUsize,
}

impl SimulatedMeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of measurements performed so far.
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MeasurementSource for SimulatedMeter {
    fn measure(&self, measurement_type: &str, _channel: &str) -> Result<f64> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(simulated_measurement(measurement_type))
    }
}

/// One randomized measurement value in the plausible range for its type.
pub fn simulated_measurement(measurement_type: &str) -> f64 {
    let mut rng = rand::thread_rng();
    match measurement_type.to_ascii_lowercase().as_str() {
        "amplitude" => rng.gen_range(0.1..5.0),
        "frequency" => rng.gen_range(100.0..10_000.0),
        "period" => rng.gen_range(1e-6..1e-3),
        _ => rng.gen_range(-1.0..1.0),
    }
}
