//! Advanced trigger definitions and the trigger manager.
//!
//! Trigger definitions are declarative: a set of per-channel conditions plus
//! type-specific settings. Activating a trigger composes the SCPI command
//! set for the instrument and starts a poll task that reports firings.
//! Exactly one trigger is active at a time; activating another deactivates
//! the current one first.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::{AppResult, AutomationError};
use crate::instrument::Oscilloscope;

const EVENT_CAPACITY: usize = 256;
const TRIGGER_POLL: Duration = Duration::from_millis(50);

pub const DEFAULT_TRIGGER_TIMEOUT: f64 = 1.0;

// ============================================================
// Definitions
// ============================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Edge,
    PulseWidth,
    Pattern,
    Protocol,
    Sequence,
    MultiChannel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSlope {
    Rising,
    Falling,
    Either,
}

impl TriggerSlope {
    fn scpi(self) -> &'static str {
        match self {
            Self::Rising => "POS",
            Self::Falling => "NEG",
            Self::Either => "EITH",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerCoupling {
    Dc,
    Ac,
    HfReject,
    LfReject,
}

impl TriggerCoupling {
    fn scpi(self) -> &'static str {
        match self {
            Self::Dc => "DC",
            Self::Ac => "AC",
            Self::HfReject => "HFR",
            Self::LfReject => "LFR",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicOperation {
    And,
    Or,
    Xor,
    Nand,
    Nor,
}

impl LogicOperation {
    fn scpi(self) -> &'static str {
        match self {
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Nand => "NAND",
            Self::Nor => "NOR",
        }
    }
}

/// Acquisition gating mode. `Single` triggers deactivate themselves after
/// their first firing.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Auto,
    Normal,
    Single,
    Force,
}

impl TriggerMode {
    fn scpi(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Normal => "NORM",
            Self::Single => "SING",
            Self::Force => "FORC",
        }
    }
}

/// Digital state one channel must hold for a pattern trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PatternState {
    #[serde(rename = "H")]
    High,
    #[serde(rename = "L")]
    Low,
    #[serde(rename = "X")]
    DontCare,
}

impl PatternState {
    fn symbol(self) -> char {
        match self {
            Self::High => 'H',
            Self::Low => 'L',
            Self::DontCare => 'X',
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    I2c,
    Spi,
    Uart,
}

impl ProtocolKind {
    fn scpi(self) -> &'static str {
        match self {
            Self::I2c => "I2C",
            Self::Spi => "SPI",
            Self::Uart => "UART",
        }
    }
}

/// Serial decode settings for a protocol trigger. Fields that do not apply
/// to the chosen protocol are left `None`.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ProtocolSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clock_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_channel: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baud_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_pattern: Option<String>,
}

/// One stage of a sequence trigger: a condition that must occur at least
/// `min_delay` seconds after the previous stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SequenceStage {
    pub condition: TriggerCondition,
    #[serde(default)]
    pub min_delay: f64,
}

/// A per-channel analog condition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub channel: String,
    /// Threshold in volts.
    pub level: f64,
    pub slope: TriggerSlope,
    #[serde(default = "default_coupling")]
    pub coupling: TriggerCoupling,
}

fn default_coupling() -> TriggerCoupling {
    TriggerCoupling::Dc
}

impl TriggerCondition {
    pub fn new(channel: &str, level: f64, slope: TriggerSlope) -> Self {
        Self {
            channel: channel.to_string(),
            level,
            slope,
            coupling: TriggerCoupling::Dc,
        }
    }
}

/// Type-specific trigger settings. The tag doubles as the persisted trigger
/// type, so unknown kinds fail to load.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum TriggerSettings {
    Edge,
    PulseWidth {
        /// Width bounds in seconds.
        min_width: f64,
        max_width: f64,
        polarity: TriggerSlope,
    },
    Pattern {
        /// Required state per channel. Ordered so composed commands are
        /// deterministic.
        pattern: BTreeMap<String, PatternState>,
        operation: LogicOperation,
    },
    Protocol {
        protocol: ProtocolKind,
        settings: ProtocolSettings,
    },
    Sequence {
        stages: Vec<SequenceStage>,
    },
    MultiChannel {
        operation: LogicOperation,
    },
}

impl TriggerSettings {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Edge => TriggerType::Edge,
            Self::PulseWidth { .. } => TriggerType::PulseWidth,
            Self::Pattern { .. } => TriggerType::Pattern,
            Self::Protocol { .. } => TriggerType::Protocol,
            Self::Sequence { .. } => TriggerType::Sequence,
            Self::MultiChannel { .. } => TriggerType::MultiChannel,
        }
    }
}

/// A complete trigger definition.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AdvancedTrigger {
    pub trigger_id: String,
    #[serde(default)]
    pub name: String,
    pub conditions: Vec<TriggerCondition>,
    pub settings: TriggerSettings,
    #[serde(default = "default_mode")]
    pub mode: TriggerMode,
    /// Re-arm suppression after a firing, in seconds.
    #[serde(default)]
    pub holdoff_time: f64,
    /// Wait budget in seconds (informational for `Auto` mode).
    #[serde(default = "default_timeout")]
    pub timeout: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_mode() -> TriggerMode {
    TriggerMode::Normal
}

fn default_timeout() -> f64 {
    DEFAULT_TRIGGER_TIMEOUT
}

fn default_enabled() -> bool {
    true
}

impl AdvancedTrigger {
    pub fn trigger_type(&self) -> TriggerType {
        self.settings.trigger_type()
    }

    pub fn with_mode(mut self, mode: TriggerMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_holdoff(mut self, holdoff_time: f64) -> Self {
        self.holdoff_time = holdoff_time;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    // ==================== builders ====================

    pub fn edge(trigger_id: &str, channel: &str, level: f64, slope: TriggerSlope) -> Self {
        Self::base(
            trigger_id,
            vec![TriggerCondition::new(channel, level, slope)],
            TriggerSettings::Edge,
        )
    }

    pub fn pulse_width(
        trigger_id: &str,
        channel: &str,
        level: f64,
        min_width: f64,
        max_width: f64,
        polarity: TriggerSlope,
    ) -> Self {
        Self::base(
            trigger_id,
            vec![TriggerCondition::new(channel, level, polarity)],
            TriggerSettings::PulseWidth {
                min_width,
                max_width,
                polarity,
            },
        )
    }

    /// Pattern trigger across digital states; `level` is the shared analog
    /// threshold used to digitize each channel.
    pub fn pattern(
        trigger_id: &str,
        pattern: BTreeMap<String, PatternState>,
        operation: LogicOperation,
        level: f64,
    ) -> Self {
        let conditions = pattern
            .keys()
            .map(|channel| TriggerCondition::new(channel, level, TriggerSlope::Either))
            .collect();
        Self::base(
            trigger_id,
            conditions,
            TriggerSettings::Pattern { pattern, operation },
        )
    }

    pub fn protocol(
        trigger_id: &str,
        protocol: ProtocolKind,
        settings: ProtocolSettings,
    ) -> Self {
        let conditions = settings
            .data_channel
            .iter()
            .chain(settings.clock_channel.iter())
            .map(|channel| TriggerCondition::new(channel, 1.5, TriggerSlope::Rising))
            .collect();
        Self::base(
            trigger_id,
            conditions,
            TriggerSettings::Protocol { protocol, settings },
        )
    }

    pub fn sequence(trigger_id: &str, stages: Vec<SequenceStage>) -> Self {
        let conditions = stages.iter().map(|s| s.condition.clone()).collect();
        Self::base(trigger_id, conditions, TriggerSettings::Sequence { stages })
    }

    pub fn multi_channel(
        trigger_id: &str,
        conditions: Vec<TriggerCondition>,
        operation: LogicOperation,
    ) -> Self {
        Self::base(
            trigger_id,
            conditions,
            TriggerSettings::MultiChannel { operation },
        )
    }

    fn base(
        trigger_id: &str,
        conditions: Vec<TriggerCondition>,
        settings: TriggerSettings,
    ) -> Self {
        Self {
            trigger_id: trigger_id.to_string(),
            name: trigger_id.to_string(),
            conditions,
            settings,
            mode: TriggerMode::Normal,
            holdoff_time: 0.0,
            timeout: DEFAULT_TRIGGER_TIMEOUT,
            enabled: true,
        }
    }

    /// Compose the SCPI command set that arms this trigger.
    pub fn compose_commands(&self) -> Vec<String> {
        let mut commands = vec![format!("TRIG:A:MODE {}", self.mode.scpi())];

        if let Some(first) = self.conditions.first() {
            commands.push(format!("TRIG:A:SOUR {}", first.channel));
            commands.push(format!("TRIG:A:LEV {:.6}", first.level));
        }

        match &self.settings {
            TriggerSettings::Edge => {
                commands.push("TRIG:A:TYPE EDGE".to_string());
                if let Some(first) = self.conditions.first() {
                    commands.push(format!("TRIG:A:EDGE:SLOP {}", first.slope.scpi()));
                    commands.push(format!("TRIG:A:EDGE:COUP {}", first.coupling.scpi()));
                }
            }
            TriggerSettings::PulseWidth {
                min_width,
                max_width,
                polarity,
            } => {
                commands.push("TRIG:A:TYPE WIDT".to_string());
                commands.push(format!("TRIG:A:WIDT:POL {}", polarity.scpi()));
                commands.push("TRIG:A:WIDT:RANG WITH".to_string());
                commands.push(format!("TRIG:A:WIDT:MIN {min_width:.9}"));
                commands.push(format!("TRIG:A:WIDT:MAX {max_width:.9}"));
            }
            TriggerSettings::Pattern { pattern, operation } => {
                commands.push("TRIG:A:TYPE PATT".to_string());
                commands.push(format!("TRIG:A:PATT:FUNC {}", operation.scpi()));
                let states: Vec<String> = pattern
                    .iter()
                    .map(|(channel, state)| format!("{channel}={}", state.symbol()))
                    .collect();
                commands.push(format!("TRIG:A:PATT:SOUR {}", states.join(",")));
            }
            TriggerSettings::Protocol { protocol, settings } => {
                commands.push("TRIG:A:TYPE PROT".to_string());
                commands.push(format!("BUS1:TYPE {}", protocol.scpi()));
                if let Some(clock) = &settings.clock_channel {
                    commands.push(format!("BUS1:CLOC:SOUR {clock}"));
                }
                if let Some(data) = &settings.data_channel {
                    commands.push(format!("BUS1:DATA:SOUR {data}"));
                }
                if let Some(baud) = settings.baud_rate {
                    commands.push(format!("BUS1:UART:BAUD {baud}"));
                }
                if let Some(address) = settings.address {
                    commands.push(format!("TRIG:A:PROT:ADDR {address:#04X}"));
                }
                if let Some(pattern) = &settings.data_pattern {
                    commands.push(format!("TRIG:A:PROT:DATA {pattern}"));
                }
            }
            TriggerSettings::Sequence { stages } => {
                commands.push("TRIG:A:TYPE SEQ".to_string());
                for (index, stage) in stages.iter().enumerate() {
                    let n = index + 1;
                    commands.push(format!("TRIG:SEQ{n}:SOUR {}", stage.condition.channel));
                    commands.push(format!("TRIG:SEQ{n}:LEV {:.6}", stage.condition.level));
                    commands.push(format!("TRIG:SEQ{n}:SLOP {}", stage.condition.slope.scpi()));
                    if stage.min_delay > 0.0 {
                        commands.push(format!("TRIG:SEQ{n}:DEL {:.9}", stage.min_delay));
                    }
                }
            }
            TriggerSettings::MultiChannel { operation } => {
                commands.push("TRIG:A:TYPE PATT".to_string());
                commands.push(format!("TRIG:A:PATT:FUNC {}", operation.scpi()));
                for condition in &self.conditions {
                    commands.push(format!(
                        "TRIG:A:QUAL:{}:LEV {:.6}",
                        condition.channel, condition.level
                    ));
                }
            }
        }

        if self.holdoff_time > 0.0 {
            commands.push(format!("TRIG:A:HOLD:TIME {:.9}", self.holdoff_time));
        }
        commands
    }

    fn condition_channels(&self) -> Vec<String> {
        self.conditions.iter().map(|c| c.channel.clone()).collect()
    }
}

// ============================================================
// Manager
// ============================================================

#[derive(Clone, Debug)]
pub enum TriggerEvent {
    Registered { trigger_id: String },
    Activated { trigger_id: String },
    Deactivated { trigger_id: String },
    Fired {
        trigger_id: String,
        timestamp: DateTime<Utc>,
        channels: Vec<String>,
    },
}

/// Serializable snapshot of every registered trigger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TriggerConfigDocument {
    pub triggers: Vec<AdvancedTrigger>,
}

struct ActiveTrigger {
    trigger_id: String,
    stop: Arc<AtomicBool>,
}

/// Owns trigger definitions, activation state and the firing poll task.
pub struct TriggerManager {
    triggers: HashMap<String, AdvancedTrigger>,
    oscilloscope: Option<Arc<dyn Oscilloscope>>,
    active: Arc<Mutex<Option<ActiveTrigger>>>,
    events: broadcast::Sender<TriggerEvent>,
}

impl TriggerManager {
    pub fn new(oscilloscope: Option<Arc<dyn Oscilloscope>>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            triggers: HashMap::new(),
            oscilloscope,
            active: Arc::new(Mutex::new(None)),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TriggerEvent> {
        self.events.subscribe()
    }

    pub fn register_trigger(&mut self, trigger: AdvancedTrigger) -> AppResult<()> {
        if self.triggers.contains_key(&trigger.trigger_id) {
            return Err(AutomationError::duplicate("trigger", &trigger.trigger_id));
        }
        let _ = self.events.send(TriggerEvent::Registered {
            trigger_id: trigger.trigger_id.clone(),
        });
        self.triggers.insert(trigger.trigger_id.clone(), trigger);
        Ok(())
    }

    pub fn trigger_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.triggers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn trigger_info(&self, trigger_id: &str) -> Option<&AdvancedTrigger> {
        self.triggers.get(trigger_id)
    }

    pub fn active_trigger(&self) -> Option<String> {
        self.active
            .lock()
            .ok()?
            .as_ref()
            .map(|a| a.trigger_id.clone())
    }

    pub fn set_enabled(&mut self, trigger_id: &str, enabled: bool) -> AppResult<()> {
        let trigger = self
            .triggers
            .get_mut(trigger_id)
            .ok_or_else(|| AutomationError::not_found("trigger", trigger_id))?;
        trigger.enabled = enabled;
        Ok(())
    }

    pub fn remove_trigger(&mut self, trigger_id: &str) -> AppResult<()> {
        if !self.triggers.contains_key(trigger_id) {
            return Err(AutomationError::not_found("trigger", trigger_id));
        }
        if self.active_trigger().as_deref() == Some(trigger_id) {
            return Err(AutomationError::Busy(format!(
                "trigger '{trigger_id}' is active"
            )));
        }
        self.triggers.remove(trigger_id);
        Ok(())
    }

    /// Activate a trigger: compose and dispatch its command set, then start
    /// polling for firings. Any previously active trigger is deactivated
    /// first.
    pub fn activate_trigger(&self, trigger_id: &str) -> AppResult<()> {
        let trigger = self
            .triggers
            .get(trigger_id)
            .ok_or_else(|| AutomationError::not_found("trigger", trigger_id))?;
        if !trigger.enabled {
            return Err(AutomationError::Validation(vec![format!(
                "trigger '{trigger_id}' is disabled"
            )]));
        }

        self.deactivate_trigger();

        let commands = trigger.compose_commands();
        log::debug!("activating trigger '{trigger_id}': {commands:?}");
        if let Some(scope) = &self.oscilloscope {
            scope
                .apply_trigger_commands(&commands)
                .map_err(|e| AutomationError::Instrument(e.to_string()))?;
        }

        let stop = Arc::new(AtomicBool::new(false));
        {
            let mut active = self
                .active
                .lock()
                .map_err(|_| AutomationError::Busy("trigger state lock poisoned".to_string()))?;
            *active = Some(ActiveTrigger {
                trigger_id: trigger_id.to_string(),
                stop: stop.clone(),
            });
        }
        let _ = self.events.send(TriggerEvent::Activated {
            trigger_id: trigger_id.to_string(),
        });

        let scope = self.oscilloscope.clone();
        let events = self.events.clone();
        let active = self.active.clone();
        let trigger_id = trigger_id.to_string();
        let channels = trigger.condition_channels();
        let mode = trigger.mode;
        let holdoff = trigger.holdoff_time.max(0.0);

        tokio::spawn(async move {
            while !stop.load(Ordering::SeqCst) {
                let fired = match &scope {
                    Some(scope) => match scope.poll_trigger() {
                        Ok(fired) => fired,
                        Err(e) => {
                            log::warn!("trigger '{trigger_id}': poll failed: {e}");
                            false
                        }
                    },
                    None => false,
                };

                if fired {
                    let _ = events.send(TriggerEvent::Fired {
                        trigger_id: trigger_id.clone(),
                        timestamp: Utc::now(),
                        channels: channels.clone(),
                    });

                    if mode == TriggerMode::Single {
                        // One-shot: disarm after the first firing.
                        stop.store(true, Ordering::SeqCst);
                        if let Ok(mut guard) = active.lock() {
                            let still_ours = guard
                                .as_ref()
                                .map(|a| a.trigger_id == trigger_id)
                                .unwrap_or(false);
                            if still_ours {
                                *guard = None;
                            }
                        }
                        let _ = events.send(TriggerEvent::Deactivated {
                            trigger_id: trigger_id.clone(),
                        });
                        return;
                    }

                    // Oversized holdoffs are capped by the tokio timer rather
                    // than panicking the poll task; invalid values are skipped.
                    if let Ok(pause) = Duration::try_from_secs_f64(holdoff) {
                        if !pause.is_zero() {
                            tokio::time::sleep(pause).await;
                        }
                    }
                }

                tokio::time::sleep(TRIGGER_POLL).await;
            }
        });

        Ok(())
    }

    /// Stop polling and clear the active trigger. Returns the id that was
    /// active, if any.
    pub fn deactivate_trigger(&self) -> Option<String> {
        let previous = match self.active.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        }?;
        previous.stop.store(true, Ordering::SeqCst);
        let _ = self.events.send(TriggerEvent::Deactivated {
            trigger_id: previous.trigger_id.clone(),
        });
        Some(previous.trigger_id)
    }

    pub fn export_config(&self) -> TriggerConfigDocument {
        let mut triggers: Vec<AdvancedTrigger> = self.triggers.values().cloned().collect();
        triggers.sort_by(|a, b| a.trigger_id.cmp(&b.trigger_id));
        TriggerConfigDocument { triggers }
    }

    /// Register every trigger from a document. Stops at the first duplicate.
    pub fn import_config(&mut self, document: TriggerConfigDocument) -> AppResult<usize> {
        let count = document.triggers.len();
        for trigger in document.triggers {
            self.register_trigger(trigger)?;
        }
        Ok(count)
    }
}

// ============================================================
// Tests
// ============================================================
