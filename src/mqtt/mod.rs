//! # MQTT Integration Module
//!
//! Everything that faces the broker: topic naming, discovery descriptors
//! and the `rumqttc` connection task.
//!
//! ```text
//! mqtt/
//! ├── config.rs        - Broker settings derived from the bridge config
//! ├── discovery.rs     - Home Assistant discovery descriptors
//! ├── mqtt_handler.rs  - Connection task, inbound routing, fire-and-forget publisher
//! └── topics.rs        - Topic names and the register to topic map
//! ```
//!
//! The dispatcher never touches `rumqttc` directly. It publishes through
//! [`mqtt_handler::MessageSink`] and receives commands as
//! [`crate::bridge::BridgeSignal`]s.

pub mod config;
pub mod discovery;
pub mod mqtt_handler;
pub mod topics;
