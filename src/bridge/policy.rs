//! Duplicate suppression and staleness decisions
//!
//! Many units report the same value every bus cycle. Republishing each of
//! those would flood the broker, while never republishing lets downstream
//! consumers mark the entity unavailable. The policy separates the two cases
//! by the age of the cached value:
//!
//! | cache                          | decision          |
//! |--------------------------------|-------------------|
//! | no entry                       | `FirstSeen`       |
//! | different raw byte             | `Changed`         |
//! | same raw, younger than window  | `DuplicateFresh`  |
//! | same raw, older, unsolicited   | `DuplicateStale`  |
//! | same raw, older, reply to us   | `Refreshed`       |
//!
//! A stale duplicate is never republished on its own. It makes the
//! dispatcher query the fan speed register; a reply to a query we sent is
//! then accepted even if unchanged.

use std::time::Duration;
use tokio::time::Instant;

use super::cache::CacheEntry;
use crate::bus::RegisterValue;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    FirstSeen,
    Changed,
    DuplicateFresh,
    DuplicateStale,
    Refreshed,
}

impl Decision {
    /// Whether the event is stored and published
    pub fn accepts(&self) -> bool {
        matches!(
            self,
            Decision::FirstSeen | Decision::Changed | Decision::Refreshed
        )
    }
}

#[derive(Clone, Copy, Debug)]
pub struct StalenessPolicy {
    pub freshness_threshold: Duration,
}

impl StalenessPolicy {
    pub fn new(freshness_threshold: Duration) -> Self {
        Self {
            freshness_threshold,
        }
    }

    /// `solicited` is true when the bridge has an outstanding query for the
    /// event's register
    pub fn decide(
        &self,
        event: &RegisterValue,
        cached: Option<&CacheEntry>,
        now: Instant,
        solicited: bool,
    ) -> Decision {
        let Some(entry) = cached else {
            return Decision::FirstSeen;
        };

        if entry.value.raw != event.raw {
            return Decision::Changed;
        }

        if entry.age(now) < self.freshness_threshold {
            Decision::DuplicateFresh
        } else if solicited {
            Decision::Refreshed
        } else {
            Decision::DuplicateStale
        }
    }

    pub fn is_stale(&self, entry: Option<&CacheEntry>, now: Instant) -> bool {
        entry.map_or(true, |e| e.age(now) >= self.freshness_threshold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(15 * 60);

    fn entry(raw: u8, at: Instant) -> CacheEntry {
        CacheEntry {
            value: RegisterValue::new(0x29, raw.count_ones() as i32, raw),
            accepted_at: at,
        }
    }

    #[test]
    fn first_event_is_first_seen() {
        let policy = StalenessPolicy::new(WINDOW);
        let event = RegisterValue::new(0x29, 3, 0x07);
        assert_eq!(
            policy.decide(&event, None, Instant::now(), false),
            Decision::FirstSeen
        );
    }

    #[test]
    fn changed_raw_is_accepted_regardless_of_age() {
        let policy = StalenessPolicy::new(WINDOW);
        let t0 = Instant::now();
        let cached = entry(0x07, t0);
        let event = RegisterValue::new(0x29, 4, 0x0f);

        let decision = policy.decide(&event, Some(&cached), t0 + Duration::from_secs(1), false);
        assert_eq!(decision, Decision::Changed);
        assert!(decision.accepts());
    }

    #[test]
    fn duplicate_inside_window_is_ignored() {
        let policy = StalenessPolicy::new(WINDOW);
        let t0 = Instant::now();
        let cached = entry(0x07, t0);
        let event = RegisterValue::new(0x29, 3, 0x07);

        let decision = policy.decide(&event, Some(&cached), t0 + Duration::from_secs(30), true);
        assert_eq!(decision, Decision::DuplicateFresh);
        assert!(!decision.accepts());
    }

    #[test]
    fn stale_duplicate_depends_on_solicitation() {
        let policy = StalenessPolicy::new(WINDOW);
        let t0 = Instant::now();
        let cached = entry(0x07, t0);
        let event = RegisterValue::new(0x29, 3, 0x07);
        let later = t0 + WINDOW;

        assert_eq!(
            policy.decide(&event, Some(&cached), later, false),
            Decision::DuplicateStale
        );
        assert_eq!(
            policy.decide(&event, Some(&cached), later, true),
            Decision::Refreshed
        );
    }

    #[test]
    fn missing_entry_counts_as_stale() {
        let policy = StalenessPolicy::new(WINDOW);
        let t0 = Instant::now();
        let cached = entry(0x07, t0);

        assert!(policy.is_stale(None, t0));
        assert!(!policy.is_stale(Some(&cached), t0 + Duration::from_secs(60)));
        assert!(policy.is_stale(Some(&cached), t0 + WINDOW));
    }
}
