//! Registry of channel groups.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{AppResult, AutomationError};
use crate::instrument::Oscilloscope;
use crate::multichannel::data::SyncScore;
use crate::multichannel::group::ChannelGroup;

/// Owns every channel group and fans lifecycle operations out to them.
pub struct MultiChannelController {
    groups: HashMap<String, ChannelGroup>,
    oscilloscope: Option<Arc<dyn Oscilloscope>>,
}

impl MultiChannelController {
    pub fn new(oscilloscope: Option<Arc<dyn Oscilloscope>>) -> Self {
        Self {
            groups: HashMap::new(),
            oscilloscope,
        }
    }

    /// Create and register an empty group sharing the controller's
    /// oscilloscope handle.
    pub fn create_group(&mut self, group_id: &str) -> AppResult<&ChannelGroup> {
        if self.groups.contains_key(group_id) {
            return Err(AutomationError::duplicate("group", group_id));
        }
        let group = ChannelGroup::new(group_id, self.oscilloscope.clone());
        self.groups.insert(group_id.to_string(), group);
        log::debug!("created channel group '{group_id}'");
        self.groups
            .get(group_id)
            .ok_or_else(|| AutomationError::not_found("group", group_id))
    }

    pub fn group(&self, group_id: &str) -> Option<&ChannelGroup> {
        self.groups.get(group_id)
    }

    pub fn group_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.groups.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Remove a group. Rejected while the group is acquiring.
    pub fn remove_group(&mut self, group_id: &str) -> AppResult<()> {
        match self.groups.get(group_id) {
            None => return Err(AutomationError::not_found("group", group_id)),
            Some(group) if group.is_acquiring() || group.is_continuous() => {
                return Err(AutomationError::Busy(format!(
                    "group '{group_id}' is acquiring"
                )));
            }
            Some(_) => {}
        }
        self.groups.remove(group_id);
        Ok(())
    }

    /// Start continuous acquisition on every group. Groups already running
    /// are left alone.
    pub fn start_all(&self) {
        for group in self.groups.values() {
            if !group.is_continuous() {
                if let Err(e) = group.start_acquisition() {
                    log::warn!("group '{}': start failed: {e}", group.group_id());
                }
            }
        }
    }

    /// Ask every group to stop continuous acquisition.
    pub fn stop_all(&self) {
        for group in self.groups.values() {
            group.stop_acquisition();
        }
    }

    /// Latest sync scores of every group, keyed by group then channel.
    pub fn all_sync_quality(&self) -> HashMap<String, HashMap<String, SyncScore>> {
        self.groups
            .iter()
            .map(|(id, group)| (id.clone(), group.sync_quality()))
            .collect()
    }
}
