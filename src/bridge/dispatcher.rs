//! Dispatcher with statum lifecycle
//!
//! The single owner of all bridge state. Bus events, broker signals, timer
//! fires and the refresh interval are multiplexed in one `select!`; every
//! handler runs to completion on this task, so the cache, the debouncer and
//! the announced set need no locking.
//!
//! # State Machine
//!
//! ```text
//! Starting ──(start: full discovery pass)──► Running ──(run)──► loop
//! ```
//!
//! # Event Sources
//!
//! ```text
//! bus events ───────┐
//! broker signals ───┤
//! timer signals ────┼──► Dispatcher ──► MessageSink (publish / announce)
//! refresh interval ─┘         │
//!                             └──────► ValloxBus (query / write_speed)
//! ```

use statum::{machine, state};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::announcer::Announcer;
use super::cache::RegisterCache;
use super::debouncer::{AttemptOutcome, CommandOutcome, DebounceSettings, SpeedDebouncer};
use super::policy::{Decision, StalenessPolicy};
use super::refresh::{due_registers, OutstandingQueries, RefreshSchedule};
use super::{BridgeError, BridgeSignal, DispatcherSettings};
use crate::bus::{registers, Register, RegisterValue, ValloxBus};
use crate::mqtt::mqtt_handler::MessageSink;
use crate::mqtt::topics::{RegisterMap, Topics};

const TIMER_CAPACITY: usize = 16;

/// Fired by detached timer tasks back into the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerSignal {
    SpeedAttempt,
    /// Bus turnaround after a speed write has passed
    Settled,
}

#[state]
#[derive(Debug, Clone)]
pub enum DispatcherState {
    Starting,
    Running,
}

#[machine]
pub struct Dispatcher<S: DispatcherState> {
    bus: Box<dyn ValloxBus>,
    sink: Box<dyn MessageSink>,
    topics: Topics,
    register_map: RegisterMap,
    raw_enabled: bool,
    cache: RegisterCache,
    policy: StalenessPolicy,
    debouncer: SpeedDebouncer,
    announcer: Announcer,
    outstanding: OutstandingQueries,
    refresh: RefreshSchedule,
    settle: Duration,
    timer_tx: mpsc::Sender<TimerSignal>,
    timer_rx: mpsc::Receiver<TimerSignal>,
}

impl Dispatcher<Starting> {
    pub fn create(
        settings: DispatcherSettings,
        bus: Box<dyn ValloxBus>,
        sink: Box<dyn MessageSink>,
    ) -> Self {
        info!(
            "Creating dispatcher for {} (raw passthrough: {})",
            settings.topics.device_id(),
            settings.raw_enabled
        );
        let timing = &settings.timing;
        let (timer_tx, timer_rx) = mpsc::channel(TIMER_CAPACITY);

        Self::new(
            bus,
            sink,
            settings.topics.clone(),
            settings.register_map.clone(),
            settings.raw_enabled,
            RegisterCache::new(),
            StalenessPolicy::new(timing.freshness_threshold()),
            SpeedDebouncer::new(DebounceSettings::from(timing)),
            Announcer::new(settings.topics, settings.device, settings.raw_enabled),
            OutstandingQueries::new(timing.query_timeout()),
            RefreshSchedule::from(timing),
            timing.bus_settle(),
            timer_tx,
            timer_rx,
        )
    }

    /// Runs the startup discovery pass and transitions to Running
    pub fn start(mut self) -> Dispatcher<Running> {
        self.announcer
            .announce_all(self.cache.registers(), self.sink.as_ref());
        info!("Dispatcher started");
        self.transition()
    }
}

impl Dispatcher<Running> {
    /// Main loop. Only returns when the bus event stream ends.
    pub async fn run(
        mut self,
        mut bus_events: mpsc::Receiver<RegisterValue>,
        mut signals: mpsc::Receiver<BridgeSignal>,
    ) -> Result<(), BridgeError> {
        let mut refresh_timer = self.refresh.timer();
        info!(
            "Dispatcher running, refresh every {:?}",
            self.refresh.interval
        );

        loop {
            tokio::select! {
                event = bus_events.recv() => match event {
                    Some(event) => self.handle_bus_event(event, Instant::now()),
                    None => {
                        error!("Bus event stream ended");
                        return Err(BridgeError::BusClosed);
                    }
                },
                Some(signal) = signals.recv() => self.handle_signal(signal, Instant::now()),
                Some(timer) = self.timer_rx.recv() => self.handle_timer(timer, Instant::now()),
                _ = refresh_timer.tick() => self.refresh_registers(Instant::now()),
            }
        }
    }

    pub fn handle_bus_event(&mut self, event: RegisterValue, now: Instant) {
        if !self.bus.is_for_me(&event) {
            return;
        }

        let solicited = self.outstanding.is_outstanding(event.register, now);
        let decision =
            self.policy
                .decide(&event, self.cache.lookup(event.register), now, solicited);
        debug!(
            "Register {:#04x} value {} raw {:#04x}: {:?}",
            event.register, event.value, event.raw, decision
        );

        match decision {
            Decision::DuplicateFresh => {}
            Decision::DuplicateStale => self.refresh_fan_speed(now),
            Decision::FirstSeen | Decision::Changed | Decision::Refreshed => {
                self.accept(event, decision, now)
            }
        }
    }

    fn accept(&mut self, event: RegisterValue, decision: Decision, now: Instant) {
        self.cache.store(event, now);
        self.outstanding.clear(event.register);

        if decision == Decision::FirstSeen {
            self.announcer
                .announce_register(event.register, self.sink.as_ref());
        }

        if event.register == registers::FAN_SPEED {
            match u8::try_from(event.value) {
                Ok(speed) => self.debouncer.confirm(speed, now),
                Err(_) => warn!("Fan speed {} out of range", event.value),
            }
        }

        self.publish_value(&event);
    }

    fn publish_value(&self, event: &RegisterValue) {
        if let Some(topic) = self.register_map.topic(event.register) {
            self.sink.publish(
                self.topics.device_topic(topic),
                event.value.to_string().into_bytes(),
            );
        }

        if self.raw_enabled {
            self.sink.publish(
                self.topics.raw(event.register),
                event.raw.to_string().into_bytes(),
            );
        }
    }

    // Triggered by stale duplicates; one fan speed query in flight at a time
    fn refresh_fan_speed(&mut self, now: Instant) {
        if self.outstanding.is_outstanding(registers::FAN_SPEED, now) {
            return;
        }
        debug!("Stale value seen, refreshing fan speed");
        self.query(registers::FAN_SPEED, now);
    }

    fn query(&mut self, register: Register, now: Instant) {
        match self.bus.query(register) {
            Ok(()) => self.outstanding.mark(register, now),
            Err(e) => warn!("Query for register {:#04x} failed: {}", register, e),
        }
    }

    pub fn handle_signal(&mut self, signal: BridgeSignal, now: Instant) {
        match signal {
            BridgeSignal::SpeedCommand(speed) => self.handle_speed_command(speed, now),
            BridgeSignal::PlatformStatus(status) => self.handle_platform_status(&status),
        }
    }

    pub fn handle_speed_command(&mut self, speed: u8, now: Instant) {
        match self.debouncer.request(speed, now) {
            CommandOutcome::AlreadyAtSpeed => {
                info!("Fan already at speed {}, no write needed", speed)
            }
            CommandOutcome::Scheduled => {
                debug!("Speed {} pending", speed);
                self.schedule(TimerSignal::SpeedAttempt, Duration::ZERO);
            }
            CommandOutcome::Coalesced => debug!("Speed {} replaces pending request", speed),
        }
    }

    pub fn handle_platform_status(&mut self, status: &str) {
        match status {
            "online" => {
                info!("Platform online, sending discovery");
                self.announcer
                    .announce_all(self.cache.registers(), self.sink.as_ref());
            }
            "offline" => debug!("Platform offline"),
            other => info!("Unknown platform status message {}", other),
        }
    }

    pub fn handle_timer(&mut self, timer: TimerSignal, now: Instant) {
        match timer {
            TimerSignal::SpeedAttempt => self.attempt_speed_write(now),
            TimerSignal::Settled => self.query(registers::FAN_SPEED, now),
        }
    }

    fn attempt_speed_write(&mut self, now: Instant) {
        match self.debouncer.attempt(now) {
            AttemptOutcome::NothingPending => {}
            AttemptOutcome::Retry(delay) => self.schedule(TimerSignal::SpeedAttempt, delay),
            AttemptOutcome::Satisfied(speed) => {
                debug!("Fan already reports speed {}, skipping write", speed)
            }
            AttemptOutcome::Write(speed) => {
                match self.bus.write_speed(speed) {
                    Ok(()) => info!("Sent speed update {}", speed),
                    Err(e) => error!("Speed update {} failed: {}", speed, e),
                }
                // Query either way so the belief converges to what the unit reports
                self.schedule(TimerSignal::Settled, self.settle);
            }
        }
    }

    pub fn refresh_registers(&mut self, now: Instant) {
        let due = due_registers(
            self.register_map.registers(),
            &self.cache,
            &self.policy,
            self.raw_enabled,
            now,
        );
        debug!("Scheduled register query for {:02x?}", due);
        for register in due {
            self.query(register, now);
        }
    }

    /// Spawns a detached timer that only signals back into the loop
    fn schedule(&self, signal: TimerSignal, delay: Duration) {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if tx.send(signal).await.is_err() {
                debug!("Dispatcher gone, dropping {:?}", signal);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::testing::{RecordingBus, RecordingSink};
    use crate::bridge::debouncer::DebounceState;
    use crate::config::{Config, TimingConfig};

    const FAN_TOPIC: &str = "vallox/fan/speed";

    fn settings(raw_enabled: bool, freshness_secs: u64) -> DispatcherSettings {
        let config = Config {
            enable_raw: raw_enabled,
            timing: TimingConfig {
                freshness_threshold_secs: freshness_secs,
                ..TimingConfig::default()
            },
            ..Config::default()
        };
        DispatcherSettings::from_config(&config)
    }

    fn dispatcher(
        raw_enabled: bool,
        bus: RecordingBus,
    ) -> (Dispatcher<Running>, RecordingSink) {
        let sink = RecordingSink::default();
        let dispatcher = Dispatcher::create(
            settings(raw_enabled, 15 * 60),
            Box::new(bus),
            Box::new(sink.clone()),
        )
        .start();
        sink.clear();
        (dispatcher, sink)
    }

    fn fan(raw: u8) -> RegisterValue {
        RegisterValue::new(registers::FAN_SPEED, raw.count_ones() as i32, raw)
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    fn announcements(sink: &RecordingSink) -> Vec<String> {
        sink.topics()
            .into_iter()
            .filter(|t| t.starts_with("homeassistant/"))
            .collect()
    }

    #[tokio::test]
    async fn start_announces_well_known_entities() {
        let sink = RecordingSink::default();
        let _running = Dispatcher::create(
            settings(false, 600),
            Box::new(RecordingBus::default()),
            Box::new(sink.clone()),
        )
        .start();

        assert_eq!(announcements(&sink).len(), 6);
    }

    #[tokio::test]
    async fn first_event_is_cached_announced_and_published() {
        let (mut d, sink) = dispatcher(true, RecordingBus::default());
        let t0 = Instant::now();

        d.handle_bus_event(fan(0x07), t0);

        assert_eq!(d.cache.lookup(registers::FAN_SPEED).unwrap().value.raw, 0x07);
        assert_eq!(
            announcements(&sink),
            vec!["homeassistant/sensor/vallox_raw_29/config"]
        );
        assert_eq!(sink.on_topic(FAN_TOPIC), vec!["3"]);
        assert_eq!(sink.on_topic("vallox/raw/29"), vec!["7"]);
    }

    #[tokio::test]
    async fn duplicate_within_window_publishes_once() {
        let (mut d, sink) = dispatcher(false, RecordingBus::default());
        let t0 = Instant::now();

        d.handle_bus_event(fan(0x07), t0);
        d.handle_bus_event(fan(0x07), t0 + secs(30));

        assert_eq!(sink.on_topic(FAN_TOPIC), vec!["3"]);
        assert_eq!(
            d.cache.lookup(registers::FAN_SPEED).unwrap().accepted_at,
            t0
        );
    }

    #[tokio::test]
    async fn changed_value_is_republished_without_reannounce() {
        let (mut d, sink) = dispatcher(true, RecordingBus::default());
        let t0 = Instant::now();

        d.handle_bus_event(fan(0x07), t0);
        d.handle_bus_event(fan(0x0f), t0 + secs(1));

        assert_eq!(sink.on_topic(FAN_TOPIC), vec!["3", "4"]);
        assert_eq!(announcements(&sink).len(), 1);
    }

    #[tokio::test]
    async fn events_for_other_receivers_are_ignored() {
        let (mut d, sink) = dispatcher(true, RecordingBus::ignoring(0x21));

        d.handle_bus_event(fan(0x07).addressed_to(0x21), Instant::now());

        assert!(sink.messages().is_empty());
        assert!(d.cache.is_empty());
    }

    #[tokio::test]
    async fn stale_duplicate_queries_fan_speed_and_accepts_the_reply() {
        let bus = RecordingBus::default();
        let (mut d, sink) = dispatcher(false, bus.clone());
        let t0 = Instant::now();
        let stale = t0 + secs(15 * 60);

        d.handle_bus_event(fan(0x07), t0);
        d.handle_bus_event(fan(0x07), stale);
        // a second stale duplicate while the query is in flight
        d.handle_bus_event(fan(0x07), stale + secs(1));

        assert_eq!(bus.queries(), vec![registers::FAN_SPEED]);
        assert_eq!(sink.on_topic(FAN_TOPIC), vec!["3"]);

        // the unit answers our query with the same value
        d.handle_bus_event(fan(0x07), stale + secs(2));

        assert_eq!(sink.on_topic(FAN_TOPIC), vec!["3", "3"]);
        assert_eq!(
            d.cache.lookup(registers::FAN_SPEED).unwrap().accepted_at,
            stale + secs(2)
        );
    }

    #[tokio::test]
    async fn refresh_queries_missing_and_stale_registers() {
        let bus = RecordingBus::default();
        let (mut d, _sink) = dispatcher(false, bus.clone());
        let t0 = Instant::now();

        d.refresh_registers(t0);
        assert_eq!(bus.queries().len(), 5);
        assert!(bus.queries().contains(&registers::FAN_SPEED));

        for register in d.register_map.registers().collect::<Vec<_>>() {
            d.handle_bus_event(RegisterValue::new(register, 1, 1), t0);
        }
        let before = bus.queries().len();

        d.refresh_registers(t0 + secs(60));
        assert_eq!(bus.queries().len(), before);

        // no fan speed event for longer than the refresh interval
        d.refresh_registers(t0 + secs(16 * 60));
        let queries = bus.queries();
        assert!(queries[before..].contains(&registers::FAN_SPEED));
    }

    #[tokio::test]
    async fn rapid_commands_write_last_value_once() {
        let bus = RecordingBus::default();
        let (mut d, _sink) = dispatcher(false, bus.clone());
        let t0 = Instant::now();

        d.handle_speed_command(2, t0);
        d.handle_speed_command(4, t0 + Duration::from_millis(300));
        d.handle_speed_command(6, t0 + Duration::from_millis(600));

        let mut now = t0;
        for _ in 0..10 {
            d.handle_timer(TimerSignal::SpeedAttempt, now);
            now += secs(1);
        }

        assert_eq!(bus.writes(), vec![6]);
        assert_eq!(d.debouncer.state(), DebounceState::Idle);
    }

    #[tokio::test]
    async fn command_matching_confirmed_speed_writes_nothing() {
        let bus = RecordingBus::default();
        let (mut d, _sink) = dispatcher(false, bus.clone());
        let t0 = Instant::now();

        // unit reports speed 5
        d.handle_bus_event(fan(0x1f), t0);
        d.handle_speed_command(5, t0 + secs(3));
        d.handle_timer(TimerSignal::SpeedAttempt, t0 + secs(9));

        assert!(bus.writes().is_empty());
        assert_eq!(d.debouncer.state(), DebounceState::Idle);
    }

    #[tokio::test]
    async fn write_is_followed_by_confirming_query() {
        let bus = RecordingBus::default();
        let (mut d, _sink) = dispatcher(false, bus.clone());
        let t0 = Instant::now();

        d.handle_speed_command(3, t0);
        d.handle_timer(TimerSignal::SpeedAttempt, t0 + secs(5));
        assert_eq!(bus.writes(), vec![3]);

        // the immediate attempt from the command is still queued ahead of it
        let settled = tokio::time::timeout(secs(1), async {
            loop {
                match d.timer_rx.recv().await {
                    Some(TimerSignal::Settled) => break TimerSignal::Settled,
                    Some(_) => continue,
                    None => panic!("timer channel closed"),
                }
            }
        })
        .await
        .unwrap();

        d.handle_timer(settled, t0 + secs(5));
        assert_eq!(bus.queries(), vec![registers::FAN_SPEED]);
    }

    #[tokio::test]
    async fn failed_write_is_logged_and_still_confirmed() {
        let bus = RecordingBus::failing_writes();
        let (mut d, _sink) = dispatcher(false, bus.clone());
        let t0 = Instant::now();

        d.handle_speed_command(3, t0);
        d.handle_timer(TimerSignal::SpeedAttempt, t0 + secs(5));
        d.handle_timer(TimerSignal::Settled, t0 + secs(5));

        assert!(bus.writes().is_empty());
        assert_eq!(bus.queries(), vec![registers::FAN_SPEED]);
    }

    #[tokio::test]
    async fn platform_online_reannounces_everything() {
        let (mut d, sink) = dispatcher(true, RecordingBus::default());
        let t0 = Instant::now();

        d.handle_bus_event(RegisterValue::new(0x2a, 16, 16), t0);
        d.handle_bus_event(fan(0x07), t0);
        sink.clear();

        d.handle_platform_status("online");

        let announced = announcements(&sink);
        assert_eq!(announced.len(), 8);
        assert!(announced.contains(&"homeassistant/sensor/vallox_raw_2a/config".to_string()));
        assert!(announced.contains(&"homeassistant/select/vallox_fan_select/config".to_string()));
    }

    #[tokio::test]
    async fn offline_and_unknown_status_change_nothing() {
        let (mut d, sink) = dispatcher(false, RecordingBus::default());

        d.handle_platform_status("offline");
        d.handle_platform_status("restarting");

        assert!(sink.messages().is_empty());
    }

    #[tokio::test]
    async fn run_processes_bus_events_until_stream_ends() {
        let (d, sink) = dispatcher(false, RecordingBus::default());
        let (bus_tx, bus_rx) = mpsc::channel(8);
        let (_signal_tx, signal_rx) = mpsc::channel(8);

        bus_tx.send(fan(0x07)).await.unwrap();
        bus_tx.send(fan(0x07)).await.unwrap();
        drop(bus_tx);

        let result = d.run(bus_rx, signal_rx).await;

        assert!(matches!(result, Err(BridgeError::BusClosed)));
        assert_eq!(sink.on_topic(FAN_TOPIC), vec!["3"]);
    }

    #[tokio::test]
    async fn going_back_to_current_speed_cancels_pending_write() {
        let bus = RecordingBus::default();
        let (mut d, _sink) = dispatcher(false, bus.clone());
        let t0 = Instant::now();

        // unit reports speed 3
        d.handle_bus_event(fan(0x07), t0);
        d.handle_speed_command(5, t0 + Duration::from_millis(500));
        d.handle_speed_command(3, t0 + Duration::from_millis(900));

        let mut now = t0;
        for _ in 0..10 {
            d.handle_timer(TimerSignal::SpeedAttempt, now);
            now += secs(1);
        }

        assert!(bus.writes().is_empty());
        assert_eq!(d.debouncer.state(), DebounceState::Idle);
    }

    fn spawn_running(
        bus: RecordingBus,
    ) -> (
        mpsc::Sender<RegisterValue>,
        mpsc::Sender<BridgeSignal>,
        tokio::task::JoinHandle<Result<(), BridgeError>>,
    ) {
        let (d, _sink) = dispatcher(false, bus);
        let (bus_tx, bus_rx) = mpsc::channel(8);
        let (signal_tx, signal_rx) = mpsc::channel(8);
        let handle = tokio::spawn(d.run(bus_rx, signal_rx));
        (bus_tx, signal_tx, handle)
    }

    #[tokio::test(start_paused = true)]
    async fn run_queries_registers_after_startup_delay_and_on_interval() {
        let bus = RecordingBus::default();
        let (_bus_tx, _signal_tx, handle) = spawn_running(bus.clone());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(bus.queries().is_empty());

        tokio::time::sleep(secs(1)).await;
        assert_eq!(bus.queries().len(), 5);
        assert!(bus.queries().contains(&registers::FAN_SPEED));

        // nothing answered, so the next interval asks again
        tokio::time::sleep(secs(15 * 60)).await;
        assert_eq!(bus.queries().len(), 10);

        handle.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn run_writes_last_command_of_a_burst_once() {
        let bus = RecordingBus::default();
        let (_bus_tx, signal_tx, handle) = spawn_running(bus.clone());

        for speed in [2, 4, 6] {
            signal_tx.send(BridgeSignal::SpeedCommand(speed)).await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(bus.writes().is_empty());

        tokio::time::sleep(secs(10)).await;

        assert_eq!(bus.writes(), vec![6]);
        let fan_queries = bus
            .queries()
            .into_iter()
            .filter(|r| *r == registers::FAN_SPEED)
            .count();
        // one from the startup refresh, one confirming the write
        assert_eq!(fan_queries, 2);

        handle.abort();
    }
}
