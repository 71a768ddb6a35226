//! Multi-channel synchronized acquisition.
//!
//! Channels are organized into groups. Each group has a master channel that
//! serves as the timing and trigger reference; every capture is scored per
//! channel against the master (cross-correlation lag for timing, Pearson
//! correlation for amplitude). Captures are kept in a bounded per-group
//! buffer.

pub mod config;
pub mod controller;
pub mod data;
pub mod group;

pub use config::{AcquisitionMode, ChannelConfig, ChannelRole, SyncConfig, SyncMode, TimingConfig};
pub use controller::MultiChannelController;
pub use data::{ChannelData, MultiChannelData, SyncScore};
pub use group::{ChannelGroup, GroupConfigDocument, GroupEvent};
