//! Captured multi-channel records and their synchronization scores.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::instrument::Waveform;

/// Synchronization quality of one channel relative to the group master,
/// both components in `[0, 1]`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SyncScore {
    /// `1 / (1 + |lag| / tolerance)`: 1.0 means no measurable lag.
    pub timing: f64,
    /// Absolute Pearson correlation against the master waveform.
    pub amplitude: f64,
}

impl SyncScore {
    pub const PERFECT: Self = Self {
        timing: 1.0,
        amplitude: 1.0,
    };
}

/// One channel's slice of a synchronized capture.
#[derive(Clone, Debug)]
pub struct ChannelData {
    pub channel_id: String,
    pub waveform: Waveform,
    /// Whether the samples came from the instrument or were synthesized.
    pub simulated: bool,
}

/// One synchronized capture across every enabled channel of a group.
#[derive(Clone, Debug)]
pub struct MultiChannelData {
    /// Unique id of this capture.
    pub capture_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub sample_rate: f64,
    pub channels: HashMap<String, ChannelData>,
    pub sync_quality: HashMap<String, SyncScore>,
}

impl MultiChannelData {
    pub fn channel(&self, channel_id: &str) -> Option<&ChannelData> {
        self.channels.get(channel_id)
    }

    pub fn score(&self, channel_id: &str) -> Option<SyncScore> {
        self.sync_quality.get(channel_id).copied()
    }
}
