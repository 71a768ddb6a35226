//! Channel, synchronization and timing configuration.

use serde::{Deserialize, Serialize};

/// How channels in a group are kept in lockstep.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Independent,
    TriggerSync,
    SampleSync,
    TimeSync,
    PhaseSync,
}

/// Role a channel plays within its group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelRole {
    Master,
    Slave,
    Reference,
    Trigger,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AcquisitionMode {
    Sample,
    PeakDetect,
    HighRes,
    Average,
    Envelope,
}

/// Per-channel vertical settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel_id: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_role")]
    pub role: ChannelRole,
    #[serde(default = "default_scale")]
    pub vertical_scale: f64,
    #[serde(default)]
    pub vertical_offset: f64,
    #[serde(default = "default_coupling")]
    pub coupling: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bandwidth_limit: Option<f64>,
    #[serde(default = "default_attenuation")]
    pub probe_attenuation: f64,
    #[serde(default)]
    pub invert: bool,
    #[serde(default)]
    pub label: String,
}

fn default_true() -> bool {
    true
}

fn default_role() -> ChannelRole {
    ChannelRole::Slave
}

fn default_scale() -> f64 {
    1.0
}

fn default_coupling() -> String {
    "DC".to_string()
}

fn default_attenuation() -> f64 {
    1.0
}

impl ChannelConfig {
    pub fn new(channel_id: &str) -> Self {
        Self {
            channel_id: channel_id.to_string(),
            enabled: true,
            role: ChannelRole::Slave,
            vertical_scale: 1.0,
            vertical_offset: 0.0,
            coupling: "DC".to_string(),
            bandwidth_limit: None,
            probe_attenuation: 1.0,
            invert: false,
            label: String::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_scale(mut self, vertical_scale: f64) -> Self {
        self.vertical_scale = vertical_scale;
        self
    }

    pub fn with_role(mut self, role: ChannelRole) -> Self {
        self.role = role;
        self
    }
}

/// Group-wide synchronization settings.
///
/// `master_channel` starts empty; the first enabled channel added to a group
/// is promoted automatically.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SyncConfig {
    pub sync_mode: SyncMode,
    #[serde(default)]
    pub master_channel: String,
    /// Acceptable inter-channel lag in seconds.
    #[serde(default = "default_tolerance")]
    pub timing_tolerance: f64,
    #[serde(default)]
    pub phase_alignment: bool,
    #[serde(default = "default_true")]
    pub trigger_coupling: bool,
    #[serde(default)]
    pub auto_skew_correction: bool,
}

fn default_tolerance() -> f64 {
    1e-9
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_mode: SyncMode::TriggerSync,
            master_channel: String::new(),
            timing_tolerance: 1e-9,
            phase_alignment: false,
            trigger_coupling: true,
            auto_skew_correction: false,
        }
    }
}

/// Group-wide horizontal settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Seconds per division.
    pub timebase: f64,
    /// Samples per second.
    pub sample_rate: f64,
    pub record_length: usize,
    #[serde(default)]
    pub delay: f64,
    /// Pre-trigger portion of the record, in percent.
    #[serde(default = "default_pretrigger")]
    pub pretrigger: f64,
    #[serde(default = "default_acquisition_mode")]
    pub acquisition_mode: AcquisitionMode,
}

fn default_pretrigger() -> f64 {
    10.0
}

fn default_acquisition_mode() -> AcquisitionMode {
    AcquisitionMode::Sample
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            timebase: 1e-3,
            sample_rate: 1e6,
            record_length: 1000,
            delay: 0.0,
            pretrigger: 10.0,
            acquisition_mode: AcquisitionMode::Sample,
        }
    }
}
