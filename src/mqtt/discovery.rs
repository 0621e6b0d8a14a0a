//! Home Assistant discovery descriptors
//!
//! One JSON message per entity, published under
//! `{prefix}/{component}/{unique_id}/config`.

use serde::Serialize;

use super::topics::{self, Topics};
use crate::bus::{Register, MAX_SPEED};

const MANUFACTURER: &str = "Vallox";
const MODEL: &str = "Digit SE";
const FAN_ICON: &str = "mdi:fan";
const EXPIRE_AFTER_SECS: u32 = 1800;

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("Failed to serialize descriptor for {uid}: {source}")]
    Serialize {
        uid: String,
        source: serde_json::Error,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntityKind {
    SpeedSensor,
    SpeedSelect,
    Temperature,
    Raw,
}

impl EntityKind {
    pub fn component(&self) -> &'static str {
        match self {
            EntityKind::SpeedSelect => "select",
            _ => "sensor",
        }
    }
}

/// An entity the bridge exposes to the automation platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entity {
    pub uid: String,
    pub name: String,
    pub kind: EntityKind,
    pub state_topic: String,
    pub command_topic: Option<String>,
}

impl Entity {
    fn sensor(uid: &str, name: &str, kind: EntityKind, state_topic: &str) -> Self {
        Self {
            uid: uid.to_string(),
            name: name.to_string(),
            kind,
            state_topic: state_topic.to_string(),
            command_topic: None,
        }
    }

    pub fn raw(register: Register) -> Self {
        Self {
            uid: format!("raw_{:x}", register),
            name: format!("raw {:x}", register),
            kind: EntityKind::Raw,
            state_topic: Topics::raw_suffix(register),
            command_topic: None,
        }
    }
}

/// Entities announced on every full pass, independent of what the bus reported
pub fn well_known_entities() -> Vec<Entity> {
    vec![
        Entity::sensor("fan_speed", "speed", EntityKind::SpeedSensor, topics::FAN_SPEED),
        Entity {
            uid: "fan_select".to_string(),
            name: "speed select".to_string(),
            kind: EntityKind::SpeedSelect,
            state_topic: topics::FAN_SPEED.to_string(),
            command_topic: Some(topics::FAN_SPEED_SET.to_string()),
        },
        Entity::sensor(
            "temp_incoming_outside",
            "outdoor temperature",
            EntityKind::Temperature,
            topics::TEMP_INCOMING_OUTSIDE,
        ),
        // Misspelt id kept so existing installs keep their entity
        Entity::sensor(
            "temp_incoming_insise",
            "incoming temperature",
            EntityKind::Temperature,
            topics::TEMP_INCOMING_INSIDE,
        ),
        Entity::sensor(
            "temp_outgoing_inside",
            "interior temperature",
            EntityKind::Temperature,
            topics::TEMP_OUTGOING_INSIDE,
        ),
        Entity::sensor(
            "temp_outgoing_outside",
            "exhaust temperature",
            EntityKind::Temperature,
            topics::TEMP_OUTGOING_OUTSIDE,
        ),
    ]
}

/// Device level settings shared by every descriptor
#[derive(Clone, Debug)]
pub struct DeviceInfo {
    pub name: String,
    pub speed_min: u8,
    pub object_id: bool,
}

#[derive(Serialize, Debug)]
struct DeviceBlock<'a> {
    identifiers: &'a str,
    manufacturer: &'static str,
    name: &'a str,
    model: &'static str,
}

#[derive(Serialize, Debug)]
struct DiscoveryMessage<'a> {
    unique_id: String,
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    object_id: Option<String>,
    device: DeviceBlock<'a>,
    state_topic: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    command_topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    icon: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    unit_of_measurement: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expire_after: Option<u32>,
}

/// Builds the discovery topic and JSON payload for `entity`
pub fn descriptor(
    topics: &Topics,
    device: &DeviceInfo,
    entity: &Entity,
) -> Result<(String, Vec<u8>), DiscoveryError> {
    let unique_id = topics.unique_id(&entity.uid);

    let mut msg = DiscoveryMessage {
        object_id: device.object_id.then(|| unique_id.clone()),
        unique_id,
        name: &entity.name,
        device: DeviceBlock {
            identifiers: topics.device_id(),
            manufacturer: MANUFACTURER,
            name: &device.name,
            model: MODEL,
        },
        state_topic: topics.device_topic(&entity.state_topic),
        command_topic: entity
            .command_topic
            .as_deref()
            .map(|t| topics.device_topic(t)),
        options: None,
        icon: None,
        unit_of_measurement: None,
        device_class: None,
        state_class: None,
        expire_after: None,
    };

    match entity.kind {
        EntityKind::SpeedSelect => {
            msg.options = Some(
                (device.speed_min..=MAX_SPEED)
                    .map(|speed| speed.to_string())
                    .collect(),
            );
            msg.icon = Some(FAN_ICON);
        }
        EntityKind::SpeedSensor => {
            msg.icon = Some(FAN_ICON);
            msg.state_class = Some("measurement");
            msg.expire_after = Some(EXPIRE_AFTER_SECS);
        }
        EntityKind::Temperature => {
            msg.unit_of_measurement = Some("°C");
            msg.device_class = Some("temperature");
            msg.state_class = Some("measurement");
            msg.expire_after = Some(EXPIRE_AFTER_SECS);
        }
        EntityKind::Raw => {}
    }

    let payload = serde_json::to_vec(&msg).map_err(|source| DiscoveryError::Serialize {
        uid: entity.uid.clone(),
        source,
    })?;

    Ok((topics.discovery(entity.kind.component(), &entity.uid), payload))
}
