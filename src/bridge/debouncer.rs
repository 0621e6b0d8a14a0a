//! Speed command debouncer
//!
//! Coalesces bursts of speed commands into a single bus write.
//!
//! ```text
//!            command(v) [v not confirmed recently]
//!   Idle ──────────────────────────────────────────► PendingWrite(v, t)
//!    ▲                                                  │   ▲
//!    │ attempt: satisfied / write issued                │   │ command(v'): overwrite (v', t')
//!    │ command(v) with v confirmed recently: cancel     │   │
//!    └──────────────────────────────────────────────────┘   │ attempt inside cool-down: retry later
//!                                                           └──┘
//! ```
//!
//! The debouncer never sleeps or touches the bus itself. It answers with an
//! outcome and the dispatcher schedules the retry timer, issues the write and
//! the confirming query.

use std::time::Duration;
use tokio::time::Instant;

use crate::bus::MAX_SPEED;
use crate::config::TimingConfig;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("cannot parse speed from {0:?}")]
    NotANumber(String),

    #[error("speed {0} out of range 1-8")]
    OutOfRange(i64),
}

/// Parses an inbound speed payload. Accepts decimal or `0x` prefixed hex.
pub fn parse_speed_command(body: &str) -> Result<u8, CommandError> {
    let body = body.trim();
    let parsed = match body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => body.parse::<i64>(),
    }
    .map_err(|_| CommandError::NotANumber(body.to_string()))?;

    if !(1..=MAX_SPEED as i64).contains(&parsed) {
        return Err(CommandError::OutOfRange(parsed));
    }
    Ok(parsed as u8)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingSpeedCommand {
    pub speed: u8,
    pub requested_at: Instant,
}

/// What the bridge believes the unit is running at
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConfirmedSpeed {
    pub speed: u8,
    pub at: Instant,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DebounceState {
    #[default]
    Idle,
    PendingWrite(PendingSpeedCommand),
}

#[derive(Clone, Copy, Debug)]
pub struct DebounceSettings {
    pub cooldown: Duration,
    pub retry_delay: Duration,
    pub grace: Duration,
}

impl From<&TimingConfig> for DebounceSettings {
    fn from(timing: &TimingConfig) -> Self {
        Self {
            cooldown: timing.speed_cooldown(),
            retry_delay: timing.speed_retry_delay(),
            grace: timing.speed_grace(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// Unit already runs at the requested speed
    AlreadyAtSpeed,
    /// Went from idle to pending; an attempt must be scheduled now
    Scheduled,
    /// Replaced a pending request; the running attempt chain picks it up
    Coalesced,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptOutcome {
    NothingPending,
    /// Still inside the cool-down, try again after the delay
    Retry(Duration),
    /// Confirmed speed already matches, no write needed
    Satisfied(u8),
    /// Write this speed now, then confirm with a query
    Write(u8),
}

#[derive(Debug)]
pub struct SpeedDebouncer {
    state: DebounceState,
    confirmed: Option<ConfirmedSpeed>,
    settings: DebounceSettings,
}

impl SpeedDebouncer {
    pub fn new(settings: DebounceSettings) -> Self {
        Self {
            state: DebounceState::Idle,
            confirmed: None,
            settings,
        }
    }

    pub fn state(&self) -> DebounceState {
        self.state
    }

    pub fn confirmed(&self) -> Option<ConfirmedSpeed> {
        self.confirmed
    }

    /// The unit echoed a speed on the bus
    pub fn confirm(&mut self, speed: u8, now: Instant) {
        self.confirmed = Some(ConfirmedSpeed { speed, at: now });
    }

    fn recently_confirmed(&self, speed: u8, now: Instant) -> bool {
        self.confirmed.is_some_and(|c| {
            c.speed == speed && now.saturating_duration_since(c.at) < self.settings.grace
        })
    }

    /// Last request wins. Going back to the confirmed speed while a write is
    /// pending cancels that write.
    pub fn request(&mut self, speed: u8, now: Instant) -> CommandOutcome {
        if self.recently_confirmed(speed, now) {
            self.state = DebounceState::Idle;
            return CommandOutcome::AlreadyAtSpeed;
        }

        let pending = PendingSpeedCommand {
            speed,
            requested_at: now,
        };
        let outcome = match self.state {
            DebounceState::Idle => CommandOutcome::Scheduled,
            DebounceState::PendingWrite(_) => CommandOutcome::Coalesced,
        };
        self.state = DebounceState::PendingWrite(pending);
        outcome
    }

    pub fn attempt(&mut self, now: Instant) -> AttemptOutcome {
        let DebounceState::PendingWrite(pending) = self.state else {
            return AttemptOutcome::NothingPending;
        };

        if now.saturating_duration_since(pending.requested_at) < self.settings.cooldown {
            return AttemptOutcome::Retry(self.settings.retry_delay);
        }

        self.state = DebounceState::Idle;

        if self.recently_confirmed(pending.speed, now) {
            return AttemptOutcome::Satisfied(pending.speed);
        }

        // Optimistic until the unit echoes the value back
        self.confirmed = Some(ConfirmedSpeed {
            speed: pending.speed,
            at: now,
        });
        AttemptOutcome::Write(pending.speed)
    }
}
