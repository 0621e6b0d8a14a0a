//! Bridge core
//!
//! Everything between the RS485 bus and the MQTT broker: the register
//! cache, the duplicate/staleness policy, the speed command debouncer,
//! discovery announcements and the scheduled refresh. The [`dispatcher`]
//! owns all of it and is the only place state changes.

pub mod announcer;
pub mod cache;
pub mod debouncer;
pub mod dispatcher;
pub mod policy;
pub mod refresh;

#[cfg(test)]
pub mod testing;

use crate::config::{Config, TimingConfig};
use crate::mqtt::discovery::DeviceInfo;
use crate::mqtt::topics::{ProtocolVariant, RegisterMap, Topics};

/// Inbound broker traffic, already parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSignal {
    SpeedCommand(u8),
    /// Payload of the automation platform's status topic
    PlatformStatus(String),
}

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Bus event stream closed")]
    BusClosed,
}

#[derive(Clone, Debug)]
pub struct DispatcherSettings {
    pub topics: Topics,
    pub register_map: RegisterMap,
    pub device: DeviceInfo,
    pub raw_enabled: bool,
    pub timing: TimingConfig,
}

impl DispatcherSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            topics: Topics::new(config.device_id.clone(), config.discovery_prefix.clone()),
            register_map: RegisterMap::new(ProtocolVariant::from_flag(config.new_protocol)),
            device: DeviceInfo {
                name: config.device_name.clone(),
                speed_min: config.speed_min,
                object_id: config.object_id,
            },
            raw_enabled: config.enable_raw,
            timing: config.timing.clone(),
        }
    }
}
