use std::time::Duration;

use crate::config::{Config, ConfigError};

pub const KEEP_ALIVE: Duration = Duration::from_secs(150);

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub user: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    /// Topics (re)subscribed on every connect
    pub subbed_topics: Vec<String>,
    pub command_topic: String,
    pub status_topic: String,
}

impl MqttConfig {
    pub fn from_config(
        config: &Config,
        command_topic: String,
        status_topic: String,
    ) -> Result<Self, ConfigError> {
        let broker = config.broker_address()?;
        Ok(Self {
            host: broker.host,
            port: broker.port,
            client_id: config.client_id().to_string(),
            user: config.mqtt_user.clone().filter(|u| !u.is_empty()),
            password: config.mqtt_password.clone().filter(|p| !p.is_empty()),
            keep_alive: KEEP_ALIVE,
            subbed_topics: vec![status_topic.clone(), command_topic.clone()],
            command_topic,
            status_topic,
        })
    }
}
