use std::collections::HashSet;
use tracing::{debug, error, info};

use crate::bus::Register;
use crate::mqtt::discovery::{descriptor, well_known_entities, DeviceInfo, Entity};
use crate::mqtt::mqtt_handler::MessageSink;
use crate::mqtt::topics::Topics;

/// Gates discovery descriptors so each entity is announced once per session
#[derive(Debug)]
pub struct Announcer {
    topics: Topics,
    device: DeviceInfo,
    raw_enabled: bool,
    announced: HashSet<String>,
}

impl Announcer {
    pub fn new(topics: Topics, device: DeviceInfo, raw_enabled: bool) -> Self {
        Self {
            topics,
            device,
            raw_enabled,
            announced: HashSet::new(),
        }
    }

    pub fn is_announced(&self, uid: &str) -> bool {
        self.announced.contains(uid)
    }

    /// Publishes the descriptor unless `entity` was already announced.
    /// Returns whether a descriptor went out.
    pub fn announce_if_new(&mut self, entity: &Entity, sink: &dyn MessageSink) -> bool {
        if self.announced.contains(&entity.uid) {
            debug!("{} already announced", entity.uid);
            return false;
        }

        match descriptor(&self.topics, &self.device, entity) {
            Ok((topic, payload)) => {
                self.announced.insert(entity.uid.clone());
                sink.publish(topic, payload);
                true
            }
            Err(e) => {
                error!("Cannot announce {}: {}", entity.uid, e);
                false
            }
        }
    }

    /// Announces the raw passthrough sensor of a register, if enabled
    pub fn announce_register(&mut self, register: Register, sink: &dyn MessageSink) -> bool {
        if !self.raw_enabled {
            return false;
        }
        self.announce_if_new(&Entity::raw(register), sink)
    }

    /// Starts a new session: forgets what was announced and announces every
    /// well-known entity plus each register in `cached`
    pub fn announce_all(
        &mut self,
        cached: impl IntoIterator<Item = Register>,
        sink: &dyn MessageSink,
    ) -> usize {
        self.announced.clear();

        let mut count = 0;
        for entity in well_known_entities() {
            if self.announce_if_new(&entity, sink) {
                count += 1;
            }
        }
        for register in cached {
            if self.announce_register(register, sink) {
                count += 1;
            }
        }

        info!("Announced {} entities to discovery", count);
        count
    }
}
