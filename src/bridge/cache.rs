use std::collections::HashMap;
use tokio::time::Instant;

use crate::bus::{Register, RegisterValue};

/// Last accepted value of a register
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub value: RegisterValue,
    pub accepted_at: Instant,
}

impl CacheEntry {
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.accepted_at)
    }
}

/// Register → last accepted value. Entries are never evicted; the key space
/// is bounded by the one-byte register address.
#[derive(Debug, Default)]
pub struct RegisterCache {
    entries: HashMap<Register, CacheEntry>,
}

impl RegisterCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, register: Register) -> Option<&CacheEntry> {
        self.entries.get(&register)
    }

    pub fn store(&mut self, value: RegisterValue, accepted_at: Instant) {
        self.entries.insert(
            value.register,
            CacheEntry {
                value,
                accepted_at,
            },
        );
    }

    pub fn registers(&self) -> impl Iterator<Item = Register> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
