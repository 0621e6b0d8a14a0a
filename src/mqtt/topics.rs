//! Topic naming and the register to topic mapping

use crate::bus::{registers, Register};

pub const FAN_SPEED: &str = "fan/speed";
pub const FAN_SPEED_SET: &str = "fan/set";
pub const TEMP_INCOMING_INSIDE: &str = "temp/incoming/inside";
pub const TEMP_INCOMING_OUTSIDE: &str = "temp/incoming/outside";
pub const TEMP_OUTGOING_INSIDE: &str = "temp/outgoing/inside";
pub const TEMP_OUTGOING_OUTSIDE: &str = "temp/outgoing/outside";

/// Which register block the unit reports temperatures on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ProtocolVariant {
    #[default]
    Legacy,
    New,
}

impl ProtocolVariant {
    pub fn from_flag(new_protocol: bool) -> Self {
        if new_protocol {
            Self::New
        } else {
            Self::Legacy
        }
    }
}

/// Fixed mapping from well-known registers to state topic suffixes
#[derive(Clone, Debug)]
pub struct RegisterMap {
    entries: [(Register, &'static str); 5],
}

impl RegisterMap {
    pub fn new(variant: ProtocolVariant) -> Self {
        let entries = match variant {
            ProtocolVariant::Legacy => [
                (registers::FAN_SPEED, FAN_SPEED),
                (registers::TEMP_INCOMING_INSIDE, TEMP_INCOMING_INSIDE),
                (registers::TEMP_INCOMING_OUTSIDE, TEMP_INCOMING_OUTSIDE),
                (registers::TEMP_OUTGOING_INSIDE, TEMP_OUTGOING_INSIDE),
                (registers::TEMP_OUTGOING_OUTSIDE, TEMP_OUTGOING_OUTSIDE),
            ],
            ProtocolVariant::New => [
                (registers::FAN_SPEED, FAN_SPEED),
                (registers::TEMP_INCOMING_INSIDE_NEW, TEMP_INCOMING_INSIDE),
                (registers::TEMP_INCOMING_OUTSIDE_NEW, TEMP_INCOMING_OUTSIDE),
                (registers::TEMP_OUTGOING_INSIDE_NEW, TEMP_OUTGOING_INSIDE),
                (registers::TEMP_OUTGOING_OUTSIDE_NEW, TEMP_OUTGOING_OUTSIDE),
            ],
        };
        Self { entries }
    }

    pub fn topic(&self, register: Register) -> Option<&'static str> {
        self.entries
            .iter()
            .find(|(r, _)| *r == register)
            .map(|(_, topic)| *topic)
    }

    pub fn registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.entries.iter().map(|(r, _)| *r)
    }
}

/// Builds full topic names for one device namespace
#[derive(Clone, Debug)]
pub struct Topics {
    device_id: String,
    discovery_prefix: String,
}

impl Topics {
    pub fn new(device_id: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            discovery_prefix: discovery_prefix.into(),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// `{device_id}/{suffix}`
    pub fn device_topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.device_id, suffix)
    }

    pub fn speed_command(&self) -> String {
        self.device_topic(FAN_SPEED_SET)
    }

    pub fn raw_suffix(register: Register) -> String {
        format!("raw/{:x}", register)
    }

    pub fn raw(&self, register: Register) -> String {
        self.device_topic(&Self::raw_suffix(register))
    }

    /// Topic the automation platform announces online/offline on
    pub fn platform_status(&self) -> String {
        format!("{}/status", self.discovery_prefix)
    }

    pub fn unique_id(&self, uid: &str) -> String {
        format!("{}_{}", self.device_id, uid)
    }

    pub fn discovery(&self, component: &str, uid: &str) -> String {
        format!(
            "{}/{}/{}/config",
            self.discovery_prefix,
            component,
            self.unique_id(uid)
        )
    }
}
