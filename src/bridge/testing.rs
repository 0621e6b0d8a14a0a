//! Recording fakes for the bus and broker seams

use std::sync::{Arc, Mutex};

use crate::bus::{BusError, Register, RegisterValue, ValloxBus};
use crate::mqtt::mqtt_handler::MessageSink;

#[derive(Clone, Default)]
pub struct RecordingSink {
    published: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<(String, String)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .map(|(t, p)| (t.clone(), String::from_utf8_lossy(p).into_owned()))
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        self.messages().into_iter().map(|(t, _)| t).collect()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<String> {
        self.messages()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p)
            .collect()
    }

    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }
}

impl MessageSink for RecordingSink {
    fn publish(&self, topic: String, payload: Vec<u8>) {
        self.published.lock().unwrap().push((topic, payload));
    }
}

#[derive(Clone, Default)]
pub struct RecordingBus {
    queries: Arc<Mutex<Vec<Register>>>,
    writes: Arc<Mutex<Vec<u8>>>,
    fail_writes: bool,
    /// Receiver address treated as someone else's
    foreign_receiver: Option<u8>,
}

impl RecordingBus {
    pub fn failing_writes() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn ignoring(receiver: u8) -> Self {
        Self {
            foreign_receiver: Some(receiver),
            ..Self::default()
        }
    }

    pub fn queries(&self) -> Vec<Register> {
        self.queries.lock().unwrap().clone()
    }

    pub fn writes(&self) -> Vec<u8> {
        self.writes.lock().unwrap().clone()
    }
}

impl ValloxBus for RecordingBus {
    fn is_for_me(&self, event: &RegisterValue) -> bool {
        self.foreign_receiver != Some(event.receiver)
    }

    fn query(&self, register: Register) -> Result<(), BusError> {
        self.queries.lock().unwrap().push(register);
        Ok(())
    }

    fn write_speed(&self, speed: u8) -> Result<(), BusError> {
        if self.fail_writes {
            return Err(BusError::WriteDisabled);
        }
        self.writes.lock().unwrap().push(speed);
        Ok(())
    }
}
