//! Collaborator traits consumed by the automation engines.
//!
//! The engines in this crate never perform SCPI I/O themselves. They are
//! constructed with handles to an [`Oscilloscope`] (acquisition/instrument
//! capability) and a [`MeasurementSource`] (scalar measurement capability),
//! both injected by the application composition root.
//!
//! Every `Oscilloscope` method has a default implementation so that a driver
//! lacking a capability degrades gracefully (no-op, or `None` for waveform
//! data, which makes the callers fall back to simulated data) instead of
//! crashing. This fallback is a deliberate seam used by the test suite.
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync`: handles are shared as `Arc<dyn ...>`
//! between the controlling context and the private worker tasks.

use anyhow::Result;

pub mod mock;

pub use mock::{simulated_measurement, SimulatedMeter, SimulatedScope};

/// One captured waveform: sample times in seconds and voltages in volts.
///
/// `time` and `voltage` always have the same length.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Waveform {
    pub time: Vec<f64>,
    pub voltage: Vec<f64>,
}

impl Waveform {
    pub fn len(&self) -> usize {
        self.voltage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.voltage.is_empty()
    }

    /// Sample interval in seconds, if the waveform has at least two points.
    pub fn sample_interval(&self) -> Option<f64> {
        if self.time.len() >= 2 {
            Some(self.time[1] - self.time[0])
        } else {
            None
        }
    }
}

/// Acquisition/instrument capability set.
///
/// All methods are optional for implementors: the defaults are no-ops (or
/// "capability absent" answers) so partial drivers still work.
pub trait Oscilloscope: Send + Sync {
    /// Configure horizontal timebase, sample rate and record length.
    fn configure_timebase(
        &self,
        _timebase: f64,
        _sample_rate: f64,
        _record_length: usize,
    ) -> Result<()> {
        Ok(())
    }

    /// Configure one vertical channel.
    fn configure_channel(
        &self,
        _channel: &str,
        _scale: f64,
        _offset: f64,
        _coupling: &str,
        _probe_attenuation: f64,
    ) -> Result<()> {
        Ok(())
    }

    /// Enable or disable a channel for acquisition.
    fn enable_channel(&self, _channel: &str, _enabled: bool) -> Result<()> {
        Ok(())
    }

    /// Select the trigger source channel.
    fn set_trigger_source(&self, _channel: &str) -> Result<()> {
        Ok(())
    }

    /// Dispatch a composed trigger command set (SCPI-style strings).
    fn apply_trigger_commands(&self, _commands: &[String]) -> Result<()> {
        Ok(())
    }

    /// Arm and fire a single capture.
    fn trigger_single(&self) -> Result<()> {
        Ok(())
    }

    /// Whether the last armed capture has completed.
    ///
    /// The default reports completion immediately so capability-less drivers
    /// never hang the acquisition poll loop.
    fn is_acquisition_complete(&self) -> Result<bool> {
        Ok(true)
    }

    /// Pull the captured waveform for a channel.
    ///
    /// Returns `Ok(None)` when the driver cannot provide waveform data; the
    /// caller then synthesizes placeholder data.
    fn waveform(&self, _channel: &str) -> Result<Option<Waveform>> {
        Ok(None)
    }

    /// Push a named, channel-scoped instrument parameter.
    fn set_parameter(
        &self,
        _channel: &str,
        _parameter: &str,
        _value: &serde_json::Value,
    ) -> Result<()> {
        Ok(())
    }

    /// Poll whether the armed trigger condition has been met.
    ///
    /// Firing determination is delegated to the driver/hardware; the trigger
    /// manager only polls. Defaults to "not fired".
    fn poll_trigger(&self) -> Result<bool> {
        Ok(false)
    }
}

/// Scalar measurement capability.
pub trait MeasurementSource: Send + Sync {
    /// Perform one measurement of the given type on a channel, in base units.
    fn measure(&self, measurement_type: &str, channel: &str) -> Result<f64>;
}
