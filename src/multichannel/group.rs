//! A synchronized group of oscilloscope channels.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::analysis;
use crate::error::{AppResult, AutomationError};
use crate::instrument::{Oscilloscope, Waveform};
use crate::multichannel::config::{ChannelConfig, ChannelRole, SyncConfig, TimingConfig};
use crate::multichannel::data::{ChannelData, MultiChannelData, SyncScore};

const EVENT_CAPACITY: usize = 256;
const BUFFER_CAPACITY: usize = 100;
const ACQUISITION_TIMEOUT: Duration = Duration::from_secs(10);
const ACQUISITION_POLL: Duration = Duration::from_millis(10);
const CONTINUOUS_DELAY: Duration = Duration::from_millis(100);
const CONTINUOUS_ERROR_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub enum GroupEvent {
    ChannelAdded { group_id: String, channel_id: String },
    ChannelRemoved { group_id: String, channel_id: String },
    MasterChanged { group_id: String, master: String },
    AcquisitionComplete { group_id: String, timestamp: DateTime<Utc> },
    AcquisitionError { group_id: String, error: String },
    ContinuousStarted { group_id: String },
    ContinuousStopped { group_id: String },
}

/// Serializable snapshot of a group's full configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GroupConfigDocument {
    pub group_id: String,
    pub channels: Vec<ChannelConfig>,
    pub sync_config: SyncConfig,
    pub timing_config: TimingConfig,
}

struct GroupShared {
    group_id: String,
    oscilloscope: Option<Arc<dyn Oscilloscope>>,
    channels: Mutex<Vec<ChannelConfig>>,
    sync_config: Mutex<SyncConfig>,
    timing_config: Mutex<TimingConfig>,
    buffer: Mutex<VecDeque<MultiChannelData>>,
    acquiring: AtomicBool,
    continuous: AtomicBool,
    events: broadcast::Sender<GroupEvent>,
}

/// A named set of channels captured together and scored against a master.
///
/// Channel order is insertion order; the first enabled channel added becomes
/// the master automatically when none is configured.
pub struct ChannelGroup {
    shared: Arc<GroupShared>,
}

impl ChannelGroup {
    pub fn new(group_id: &str, oscilloscope: Option<Arc<dyn Oscilloscope>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(GroupShared {
                group_id: group_id.to_string(),
                oscilloscope,
                channels: Mutex::new(Vec::new()),
                sync_config: Mutex::new(SyncConfig::default()),
                timing_config: Mutex::new(TimingConfig::default()),
                buffer: Mutex::new(VecDeque::new()),
                acquiring: AtomicBool::new(false),
                continuous: AtomicBool::new(false),
                events,
            }),
        }
    }

    pub fn group_id(&self) -> &str {
        &self.shared.group_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GroupEvent> {
        self.shared.events.subscribe()
    }

    // ==================== membership ====================

    /// Add a channel. The first enabled channel of a group is promoted to
    /// master when no master is configured yet.
    pub fn add_channel(&self, mut config: ChannelConfig) -> AppResult<()> {
        let mut channels = lock(&self.shared.channels)?;
        if channels.iter().any(|c| c.channel_id == config.channel_id) {
            return Err(AutomationError::duplicate("channel", &config.channel_id));
        }

        let mut sync = lock(&self.shared.sync_config)?;
        if sync.master_channel.is_empty() && config.enabled {
            sync.master_channel = config.channel_id.clone();
            config.role = ChannelRole::Master;
            let _ = self.shared.events.send(GroupEvent::MasterChanged {
                group_id: self.shared.group_id.clone(),
                master: config.channel_id.clone(),
            });
        }

        let _ = self.shared.events.send(GroupEvent::ChannelAdded {
            group_id: self.shared.group_id.clone(),
            channel_id: config.channel_id.clone(),
        });
        channels.push(config);
        Ok(())
    }

    /// Remove a channel. Removing the master re-elects the first remaining
    /// enabled channel (or clears the master when none qualifies).
    pub fn remove_channel(&self, channel_id: &str) -> AppResult<()> {
        let mut channels = lock(&self.shared.channels)?;
        let index = channels
            .iter()
            .position(|c| c.channel_id == channel_id)
            .ok_or_else(|| AutomationError::not_found("channel", channel_id))?;
        channels.remove(index);

        let mut sync = lock(&self.shared.sync_config)?;
        if sync.master_channel == channel_id {
            sync.master_channel = String::new();
            if let Some(next) = channels.iter_mut().find(|c| c.enabled) {
                next.role = ChannelRole::Master;
                sync.master_channel = next.channel_id.clone();
                let _ = self.shared.events.send(GroupEvent::MasterChanged {
                    group_id: self.shared.group_id.clone(),
                    master: sync.master_channel.clone(),
                });
            }
        }

        let _ = self.shared.events.send(GroupEvent::ChannelRemoved {
            group_id: self.shared.group_id.clone(),
            channel_id: channel_id.to_string(),
        });
        Ok(())
    }

    pub fn channels(&self) -> Vec<ChannelConfig> {
        lock(&self.shared.channels)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn channel(&self, channel_id: &str) -> Option<ChannelConfig> {
        lock(&self.shared.channels)
            .ok()?
            .iter()
            .find(|c| c.channel_id == channel_id)
            .cloned()
    }

    // ==================== configuration ====================

    /// Replace the sync configuration. A non-empty master must be a group
    /// member; roles are recomputed so exactly the master holds the master
    /// role and every other channel is a slave.
    pub fn set_sync_config(&self, config: SyncConfig) -> AppResult<()> {
        let mut channels = lock(&self.shared.channels)?;
        if !config.master_channel.is_empty()
            && !channels
                .iter()
                .any(|c| c.channel_id == config.master_channel)
        {
            return Err(AutomationError::not_found(
                "channel",
                &config.master_channel,
            ));
        }

        for channel in channels.iter_mut() {
            channel.role = if channel.channel_id == config.master_channel {
                ChannelRole::Master
            } else {
                ChannelRole::Slave
            };
        }

        let mut sync = lock(&self.shared.sync_config)?;
        let master_changed = sync.master_channel != config.master_channel;
        *sync = config;
        if master_changed {
            let _ = self.shared.events.send(GroupEvent::MasterChanged {
                group_id: self.shared.group_id.clone(),
                master: sync.master_channel.clone(),
            });
        }
        Ok(())
    }

    pub fn sync_config(&self) -> SyncConfig {
        lock(&self.shared.sync_config)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn set_timing_config(&self, config: TimingConfig) -> AppResult<()> {
        let mut errors = Vec::new();
        if !config.sample_rate.is_finite() || config.sample_rate <= 0.0 {
            errors.push(format!("sample_rate must be positive: {}", config.sample_rate));
        }
        if config.record_length == 0 {
            errors.push("record_length must be positive".to_string());
        }
        if !config.timebase.is_finite() || config.timebase <= 0.0 {
            errors.push(format!("timebase must be positive: {}", config.timebase));
        }
        if !errors.is_empty() {
            return Err(AutomationError::Validation(errors));
        }
        *lock(&self.shared.timing_config)? = config;
        Ok(())
    }

    pub fn timing_config(&self) -> TimingConfig {
        lock(&self.shared.timing_config)
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    pub fn master_channel(&self) -> String {
        self.sync_config().master_channel
    }

    pub fn export_config(&self) -> AppResult<GroupConfigDocument> {
        Ok(GroupConfigDocument {
            group_id: self.shared.group_id.clone(),
            channels: lock(&self.shared.channels)?.clone(),
            sync_config: lock(&self.shared.sync_config)?.clone(),
            timing_config: lock(&self.shared.timing_config)?.clone(),
        })
    }

    // ==================== acquisition ====================

    pub fn is_acquiring(&self) -> bool {
        self.shared.acquiring.load(Ordering::SeqCst)
    }

    pub fn is_continuous(&self) -> bool {
        self.shared.continuous.load(Ordering::SeqCst)
    }

    /// Capture one synchronized record across every enabled channel.
    ///
    /// Rejected while another acquisition is in flight, without touching the
    /// capture buffer.
    pub async fn acquire_single(&self) -> AppResult<MultiChannelData> {
        self.shared.acquire_single().await
    }

    /// Start continuous acquisition on a background task.
    pub fn start_acquisition(&self) -> AppResult<()> {
        if self
            .shared
            .continuous
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AutomationError::Busy(format!(
                "group '{}' is already acquiring continuously",
                self.shared.group_id
            )));
        }

        let _ = self.shared.events.send(GroupEvent::ContinuousStarted {
            group_id: self.shared.group_id.clone(),
        });

        let shared = self.shared.clone();
        tokio::spawn(async move {
            log::info!("group '{}': continuous acquisition started", shared.group_id);
            while shared.continuous.load(Ordering::SeqCst) {
                match shared.acquire_single().await {
                    Ok(_) => tokio::time::sleep(CONTINUOUS_DELAY).await,
                    Err(e) => {
                        log::warn!("group '{}': acquisition error: {e}", shared.group_id);
                        tokio::time::sleep(CONTINUOUS_ERROR_BACKOFF).await;
                    }
                }
            }
            log::info!("group '{}': continuous acquisition stopped", shared.group_id);
            let _ = shared.events.send(GroupEvent::ContinuousStopped {
                group_id: shared.group_id.clone(),
            });
        });
        Ok(())
    }

    /// Ask the continuous acquisition task to stop after its current capture.
    pub fn stop_acquisition(&self) {
        self.shared.continuous.store(false, Ordering::SeqCst);
    }

    /// Most recent capture, if any.
    pub fn latest(&self) -> Option<MultiChannelData> {
        lock(&self.shared.buffer).ok()?.back().cloned()
    }

    /// Up to `count` most recent captures, oldest first.
    pub fn history(&self, count: usize) -> Vec<MultiChannelData> {
        lock(&self.shared.buffer)
            .map(|buffer| {
                let skip = buffer.len().saturating_sub(count);
                buffer.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub fn buffer_len(&self) -> usize {
        lock(&self.shared.buffer).map(|b| b.len()).unwrap_or(0)
    }

    /// Sync scores of the most recent capture.
    pub fn sync_quality(&self) -> std::collections::HashMap<String, SyncScore> {
        self.latest().map(|d| d.sync_quality).unwrap_or_default()
    }
}

impl GroupShared {
    async fn acquire_single(&self) -> AppResult<MultiChannelData> {
        if self
            .acquiring
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(AutomationError::Busy(format!(
                "group '{}' acquisition already in progress",
                self.group_id
            )));
        }

        let result = self.acquire_inner().await;
        self.acquiring.store(false, Ordering::SeqCst);

        match &result {
            Ok(data) => {
                let _ = self.events.send(GroupEvent::AcquisitionComplete {
                    group_id: self.group_id.clone(),
                    timestamp: data.timestamp,
                });
            }
            Err(e) => {
                let _ = self.events.send(GroupEvent::AcquisitionError {
                    group_id: self.group_id.clone(),
                    error: e.to_string(),
                });
            }
        }
        result
    }

    async fn acquire_inner(&self) -> AppResult<MultiChannelData> {
        // Snapshot configuration so no lock is held across an await.
        let enabled: Vec<ChannelConfig> = lock(&self.channels)?
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect();
        let sync = lock(&self.sync_config)?.clone();
        let timing = lock(&self.timing_config)?.clone();

        if enabled.is_empty() {
            return Err(AutomationError::Validation(vec![format!(
                "group '{}' has no enabled channels",
                self.group_id
            )]));
        }
        if !enabled.iter().any(|c| c.channel_id == sync.master_channel) {
            return Err(AutomationError::Validation(vec![format!(
                "group '{}' has no enabled master channel",
                self.group_id
            )]));
        }

        if let Some(scope) = &self.oscilloscope {
            scope
                .configure_timebase(timing.timebase, timing.sample_rate, timing.record_length)
                .map_err(|e| AutomationError::Instrument(e.to_string()))?;
            for channel in &enabled {
                scope
                    .configure_channel(
                        &channel.channel_id,
                        channel.vertical_scale,
                        channel.vertical_offset,
                        &channel.coupling,
                        channel.probe_attenuation,
                    )
                    .map_err(|e| AutomationError::Instrument(e.to_string()))?;
                scope
                    .enable_channel(&channel.channel_id, true)
                    .map_err(|e| AutomationError::Instrument(e.to_string()))?;
            }
            scope
                .set_trigger_source(&sync.master_channel)
                .map_err(|e| AutomationError::Instrument(e.to_string()))?;
            scope
                .trigger_single()
                .map_err(|e| AutomationError::Instrument(e.to_string()))?;

            let deadline = std::time::Instant::now() + ACQUISITION_TIMEOUT;
            loop {
                if scope
                    .is_acquisition_complete()
                    .map_err(|e| AutomationError::Instrument(e.to_string()))?
                {
                    break;
                }
                if std::time::Instant::now() >= deadline {
                    return Err(AutomationError::Timeout(format!(
                        "group '{}' acquisition did not complete within {:?}",
                        self.group_id, ACQUISITION_TIMEOUT
                    )));
                }
                tokio::time::sleep(ACQUISITION_POLL).await;
            }
        }

        let timestamp = Utc::now();
        let mut channels = std::collections::HashMap::new();
        for channel in &enabled {
            let pulled = match &self.oscilloscope {
                Some(scope) => scope
                    .waveform(&channel.channel_id)
                    .map_err(|e| AutomationError::Instrument(e.to_string()))?,
                None => None,
            };
            let (waveform, simulated) = match pulled {
                Some(waveform) => (waveform, false),
                None => (placeholder_waveform(channel, &timing), true),
            };
            channels.insert(
                channel.channel_id.clone(),
                ChannelData {
                    channel_id: channel.channel_id.clone(),
                    waveform,
                    simulated,
                },
            );
        }

        let sync_quality = score_sync_quality(&channels, &sync.master_channel, &sync, &timing);

        let data = MultiChannelData {
            capture_id: uuid::Uuid::new_v4(),
            timestamp,
            sample_rate: timing.sample_rate,
            channels,
            sync_quality,
        };

        let mut buffer = lock(&self.buffer)?;
        buffer.push_back(data.clone());
        while buffer.len() > BUFFER_CAPACITY {
            buffer.pop_front();
        }

        Ok(data)
    }
}

/// Synthesized stand-in when the driver provides no waveform: a 1 kHz sine
/// with a little noise, scaled to the channel's vertical scale.
fn placeholder_waveform(channel: &ChannelConfig, timing: &TimingConfig) -> Waveform {
    let mut rng = rand::thread_rng();
    let dt = 1.0 / timing.sample_rate;
    let n = timing.record_length;
    let time: Vec<f64> = (0..n).map(|i| i as f64 * dt).collect();
    let voltage: Vec<f64> = time
        .iter()
        .map(|&t| {
            channel.vertical_scale
                * ((2.0 * std::f64::consts::PI * 1000.0 * t).sin()
                    + rng.gen_range(-0.05..0.05))
        })
        .collect();
    Waveform { time, voltage }
}

/// Score every channel against the master.
///
/// The master scores 1.0/1.0 by definition. A slave's timing score is
/// `1 / (1 + |lag| / tolerance)` where the lag comes from cross-correlation
/// against the master; the amplitude score is the absolute Pearson
/// correlation of the two waveforms.
fn score_sync_quality(
    channels: &std::collections::HashMap<String, ChannelData>,
    master_channel: &str,
    sync: &SyncConfig,
    timing: &TimingConfig,
) -> std::collections::HashMap<String, SyncScore> {
    let mut scores = std::collections::HashMap::new();
    let Some(master) = channels.get(master_channel) else {
        return scores;
    };

    for (channel_id, data) in channels {
        if channel_id == master_channel {
            scores.insert(channel_id.clone(), SyncScore::PERFECT);
            continue;
        }

        let lag_samples =
            analysis::cross_correlation_lag(&master.waveform.voltage, &data.waveform.voltage);
        // A driver may capture at a different effective rate than configured,
        // so the captured data's own sample spacing wins when it is usable.
        let dt = data
            .waveform
            .sample_interval()
            .filter(|dt| dt.is_finite() && *dt > 0.0)
            .unwrap_or(1.0 / timing.sample_rate);
        let lag_time = lag_samples as f64 * dt;
        let tolerance = if sync.timing_tolerance > 0.0 {
            sync.timing_tolerance
        } else {
            1e-9
        };
        let timing_score = 1.0 / (1.0 + lag_time.abs() / tolerance);
        let amplitude_score =
            analysis::pearson_correlation(&master.waveform.voltage, &data.waveform.voltage).abs();

        scores.insert(
            channel_id.clone(),
            SyncScore {
                timing: timing_score,
                amplitude: amplitude_score,
            },
        );
    }
    scores
}

fn lock<T>(mutex: &Mutex<T>) -> AppResult<std::sync::MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| AutomationError::Busy("group state lock poisoned".to_string()))
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instrument::SimulatedScope;

    fn group_with(channels: &[&str]) -> ChannelGroup {
        let group = ChannelGroup::new("g1", Some(Arc::new(SimulatedScope::new())));
        for id in channels {
            group.add_channel(ChannelConfig::new(id)).unwrap();
        }
        group
    }

    #[test]
    fn first_enabled_channel_becomes_master() {
        let group = ChannelGroup::new("g1", None);
        group
            .add_channel(ChannelConfig::new("CH1").disabled())
            .unwrap();
        assert!(group.master_channel().is_empty());

        group.add_channel(ChannelConfig::new("CH2")).unwrap();
        assert_eq!(group.master_channel(), "CH2");
        assert_eq!(group.channel("CH2").unwrap().role, ChannelRole::Master);
        assert_eq!(group.channel("CH1").unwrap().role, ChannelRole::Slave);
    }

    #[test]
    fn duplicate_channel_is_rejected() {
        let group = group_with(&["CH1"]);
        let err = group.add_channel(ChannelConfig::new("CH1")).unwrap_err();
        assert!(matches!(err, AutomationError::Duplicate { .. }));
    }

    #[test]
    fn removing_master_re_elects_first_enabled_channel() {
        let group = group_with(&["CH1", "CH2", "CH3"]);
        assert_eq!(group.master_channel(), "CH1");

        group.remove_channel("CH1").unwrap();
        assert_eq!(group.master_channel(), "CH2");
        assert_eq!(group.channel("CH2").unwrap().role, ChannelRole::Master);

        group.remove_channel("CH2").unwrap();
        group.remove_channel("CH3").unwrap();
        assert!(group.master_channel().is_empty());
    }

    #[test]
    fn sync_config_demotes_non_master_roles() {
        let group = group_with(&["CH1", "CH2"]);
        let mut channels = lock(&group.shared.channels).unwrap();
        channels[1].role = ChannelRole::Reference;
        drop(channels);

        let config = SyncConfig {
            master_channel: "CH1".to_string(),
            ..SyncConfig::default()
        };
        group.set_sync_config(config).unwrap();
        assert_eq!(group.channel("CH1").unwrap().role, ChannelRole::Master);
        assert_eq!(group.channel("CH2").unwrap().role, ChannelRole::Slave);
    }

    #[test]
    fn sync_config_with_unknown_master_is_rejected() {
        let group = group_with(&["CH1"]);
        let config = SyncConfig {
            master_channel: "CH9".to_string(),
            ..SyncConfig::default()
        };
        assert!(group.set_sync_config(config).is_err());
    }

    #[test]
    fn invalid_timing_config_is_rejected() {
        let group = group_with(&["CH1"]);
        let config = TimingConfig {
            sample_rate: 0.0,
            record_length: 0,
            ..TimingConfig::default()
        };
        let err = group.set_timing_config(config).unwrap_err();
        match err {
            AutomationError::Validation(errors) => assert_eq!(errors.len(), 2),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn identical_waveforms_score_perfect_sync() {
        // SimulatedScope returns the same sine for every channel.
        let group = group_with(&["CH1", "CH2"]);
        let data = group.acquire_single().await.unwrap();

        let master = data.score("CH1").unwrap();
        assert!((master.timing - 1.0).abs() < 1e-9);
        assert!((master.amplitude - 1.0).abs() < 1e-9);

        let slave = data.score("CH2").unwrap();
        assert!((slave.timing - 1.0).abs() < 1e-9);
        assert!((slave.amplitude - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn acquisition_without_master_is_rejected() {
        let group = ChannelGroup::new("g1", None);
        group
            .add_channel(ChannelConfig::new("CH1").disabled())
            .unwrap();
        let err = group.acquire_single().await.unwrap_err();
        assert!(matches!(err, AutomationError::Validation(_)));
        assert!(group.latest().is_none());
    }

    #[tokio::test]
    async fn buffer_is_bounded() {
        let group = group_with(&["CH1"]);
        group
            .set_timing_config(TimingConfig {
                record_length: 16,
                ..TimingConfig::default()
            })
            .unwrap();
        for _ in 0..(BUFFER_CAPACITY + 5) {
            group.acquire_single().await.unwrap();
        }
        assert_eq!(group.buffer_len(), BUFFER_CAPACITY);
    }

    #[tokio::test]
    async fn concurrent_acquisition_is_rejected_without_mutation() {
        let group = group_with(&["CH1"]);
        group.acquire_single().await.unwrap();
        let before = group.buffer_len();

        group.shared.acquiring.store(true, Ordering::SeqCst);
        let err = group.acquire_single().await.unwrap_err();
        assert!(matches!(err, AutomationError::Busy(_)));
        assert_eq!(group.buffer_len(), before);
        group.shared.acquiring.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn continuous_acquisition_fills_the_buffer() {
        let group = group_with(&["CH1"]);
        group
            .set_timing_config(TimingConfig {
                record_length: 16,
                ..TimingConfig::default()
            })
            .unwrap();
        group.start_acquisition().unwrap();
        assert!(group.start_acquisition().is_err());

        tokio::time::sleep(Duration::from_millis(350)).await;
        group.stop_acquisition();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(group.buffer_len() >= 2);
        assert!(!group.is_continuous());
    }

    #[test]
    fn scoring_uses_the_captured_sample_spacing() {
        let n = 64usize;
        let dt = 1e-9;
        let pulse: Vec<f64> = (0..n)
            .map(|i| (-(((i as f64) - 32.0) / 4.0).powi(2)).exp())
            .collect();
        let shifted: Vec<f64> = (0..n)
            .map(|i| if i >= 4 { pulse[i - 4] } else { 0.0 })
            .collect();
        let time: Vec<f64> = (0..n).map(|i| i as f64 * dt).collect();

        let mut channels = std::collections::HashMap::new();
        channels.insert(
            "CH1".to_string(),
            ChannelData {
                channel_id: "CH1".to_string(),
                waveform: Waveform {
                    time: time.clone(),
                    voltage: pulse,
                },
                simulated: false,
            },
        );
        channels.insert(
            "CH2".to_string(),
            ChannelData {
                channel_id: "CH2".to_string(),
                waveform: Waveform {
                    time,
                    voltage: shifted,
                },
                simulated: false,
            },
        );

        // The configured rate is far slower than the captured spacing; using
        // it would turn the 4 ns lag into 4 s and zero out the score.
        let sync = SyncConfig {
            timing_tolerance: 1e-7,
            ..SyncConfig::default()
        };
        let timing = TimingConfig {
            sample_rate: 1.0,
            ..TimingConfig::default()
        };
        let scores = score_sync_quality(&channels, "CH1", &sync, &timing);

        assert_eq!(scores["CH1"], SyncScore::PERFECT);
        // 4 ns against a 100 ns tolerance
        assert!(scores["CH2"].timing > 0.9, "got {}", scores["CH2"].timing);
        assert!(scores["CH2"].amplitude > 0.5);
    }

    #[test]
    fn exported_config_roundtrips() {
        let group = group_with(&["CH1", "CH2"]);
        let doc = group.export_config().unwrap();
        let text = serde_json::to_string_pretty(&doc).unwrap();
        let restored: GroupConfigDocument = serde_json::from_str(&text).unwrap();
        assert_eq!(restored.group_id, "g1");
        assert_eq!(restored.channels.len(), 2);
        assert_eq!(restored.sync_config.master_channel, "CH1");
    }
}
