//! Usage Tracker.
//!
//! Per-`(upstream_key_id, model_id)` counters: a 60-second sliding window for
//! RPM and TPM-input, and calendar-day totals for RPD and TPD-input that
//! reset at the configured quota timezone's midnight boundary.
//!
//! One `Mutex` guards the whole counter table, mirroring the teacher's
//! `count_tokens::CountTokensCache` (`Mutex<HashMap<String, UserCache>>`)
//! single-lock-per-subsystem style.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;

use crate::model_limits::ModelLimit;

const WINDOW_SECONDS: i64 = 60;

#[derive(Debug, Clone, Copy, Default)]
pub struct UsageSnapshot {
    pub rpm_used: u32,
    pub rpd_used: u32,
    pub tpm_input_used: u64,
    pub tpd_input_used: u64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Which limit dimensions would be breached by one more call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Breach {
    pub rpm: bool,
    pub rpd: bool,
    pub tpm: bool,
    pub tpd: bool,
}

impl Breach {
    pub fn any(&self) -> bool {
        self.rpm || self.rpd || self.tpm || self.tpd
    }
}

#[derive(Debug, Clone, Default)]
struct CounterSet {
    rpm_window: VecDeque<DateTime<Utc>>,
    tpm_input_window: VecDeque<(DateTime<Utc>, u64)>,
    rpd_count: u32,
    tpd_input_count: u64,
    last_reset_day: Option<NaiveDate>,
    last_used: Option<DateTime<Utc>>,
}

impl CounterSet {
    /// Drop sliding-window entries strictly older than 60s from `now`.
    fn evict_expired(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(WINDOW_SECONDS);
        while matches!(self.rpm_window.front(), Some(ts) if *ts <= cutoff) {
            self.rpm_window.pop_front();
        }
        while matches!(self.tpm_input_window.front(), Some((ts, _)) if *ts <= cutoff) {
            self.tpm_input_window.pop_front();
        }
    }

    fn rpm_used(&self) -> u32 {
        self.rpm_window.len() as u32
    }

    fn tpm_used(&self) -> u64 {
        self.tpm_input_window.iter().map(|(_, t)| *t).sum()
    }
}

/// Per-(key, model) usage counters, with sliding-window and calendar-day
/// tracking.
pub struct UsageTracker {
    counters: Mutex<HashMap<(String, String), CounterSet>>,
    quota_timezone: Tz,
}

impl UsageTracker {
    pub fn new(quota_timezone: Tz) -> Self {
        Self {
            counters: Mutex::new(HashMap::new()),
            quota_timezone,
        }
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&self.quota_timezone).date_naive()
    }

    /// Reset the calendar counters for a single counter set if the quota
    /// day has rolled over since it was last touched. Called on every
    /// read/write so a counter that hasn't been touched since midnight
    /// still reports a fresh day without waiting for the scheduler.
    fn roll_day_if_needed(&self, counters: &mut CounterSet, now: DateTime<Utc>) {
        let today = self.today(now);
        match counters.last_reset_day {
            Some(day) if day == today => {}
            _ => {
                counters.rpd_count = 0;
                counters.tpd_input_count = 0;
                counters.last_reset_day = Some(today);
            }
        }
    }

    /// Append to the RPM/TPM windows and increment RPD/TPD counters.
    /// Counters never go negative — this method only ever increments.
    pub fn record_request(
        &self,
        key_id: &str,
        model_id: &str,
        input_tokens: u64,
        when: DateTime<Utc>,
    ) {
        let mut table = self.counters.lock().expect("usage tracker mutex poisoned");
        let counters = table
            .entry((key_id.to_string(), model_id.to_string()))
            .or_default();

        self.roll_day_if_needed(counters, when);
        counters.evict_expired(when);

        counters.rpm_window.push_back(when);
        counters.tpm_input_window.push_back((when, input_tokens));
        counters.rpd_count += 1;
        counters.tpd_input_count += input_tokens;
        counters.last_used = Some(when);
    }

    /// Read-consistent sample; evicts expired window entries as a side
    /// effect.
    pub fn snapshot(&self, key_id: &str, model_id: &str, now: DateTime<Utc>) -> UsageSnapshot {
        let mut table = self.counters.lock().expect("usage tracker mutex poisoned");
        let counters = table
            .entry((key_id.to_string(), model_id.to_string()))
            .or_default();

        self.roll_day_if_needed(counters, now);
        counters.evict_expired(now);

        UsageSnapshot {
            rpm_used: counters.rpm_used(),
            rpd_used: counters.rpd_count,
            tpm_input_used: counters.tpm_used(),
            tpd_input_used: counters.tpd_input_count,
            last_used: counters.last_used,
        }
    }

    /// Would one more call of `additional_input_tokens` breach any tracked
    /// limit dimension for which a limit is configured? A missing limit
    /// field is treated as unlimited for that dimension.
    pub fn would_exceed(
        &self,
        key_id: &str,
        model_id: &str,
        additional_input_tokens: u64,
        limit: &ModelLimit,
        now: DateTime<Utc>,
    ) -> Breach {
        let snap = self.snapshot(key_id, model_id, now);
        Breach {
            rpm: snap.rpm_used + 1 > limit.rpm,
            rpd: snap.rpd_used + 1 > limit.rpd,
            tpm: snap.tpm_input_used + additional_input_tokens > limit.tpm_input as u64,
            tpd: snap.tpd_input_used + additional_input_tokens > limit.tpd_input as u64,
        }
    }

    /// Idempotent daily reset across all tracked (key, model) pairs, called
    /// by the scheduler at the calendar-day boundary. Also safe to call
    /// redundantly — `roll_day_if_needed` already applies this lazily on any
    /// read/write, so this just forces it eagerly for counters that haven't
    /// been touched recently.
    pub fn daily_reset(&self, now: DateTime<Utc>) {
        let mut table = self.counters.lock().expect("usage tracker mutex poisoned");
        let today = self.today(now);
        for counters in table.values_mut() {
            counters.rpd_count = 0;
            counters.tpd_input_count = 0;
            counters.last_reset_day = Some(today);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limit() -> ModelLimit {
        ModelLimit {
            rpm: 2,
            rpd: 3,
            tpm_input: 1_000,
            tpd_input: 2_000,
            input_token_limit: 100_000,
            output_token_limit: 8_000,
        }
    }

    #[test]
    fn rpd_monotonic_without_reset() {
        let tracker = UsageTracker::new(chrono_tz::America::Los_Angeles);
        let t0 = Utc::now();
        tracker.record_request("k1", "m", 10, t0);
        let s1 = tracker.snapshot("k1", "m", t0);
        tracker.record_request("k1", "m", 10, t0 + chrono::Duration::seconds(1));
        let s2 = tracker.snapshot("k1", "m", t0 + chrono::Duration::seconds(1));
        assert!(s2.rpd_used >= s1.rpd_used);
    }

    #[test]
    fn sliding_window_evicts_old_entries() {
        let tracker = UsageTracker::new(chrono_tz::America::Los_Angeles);
        let t0 = Utc::now();
        tracker.record_request("k1", "m", 10, t0);
        let later = t0 + chrono::Duration::seconds(61);
        let snap = tracker.snapshot("k1", "m", later);
        assert_eq!(snap.rpm_used, 0);
        assert_eq!(snap.tpm_input_used, 0);
        // RPD/TPD are calendar, not sliding - unaffected by the 61s gap.
        assert_eq!(snap.rpd_used, 1);
    }

    #[test]
    fn would_exceed_flags_breached_dimensions_only() {
        let tracker = UsageTracker::new(chrono_tz::America::Los_Angeles);
        let lim = limit();
        let t0 = Utc::now();
        tracker.record_request("k1", "m", 900, t0);
        tracker.record_request("k1", "m", 50, t0);
        // rpm now at 2 (== limit), one more would exceed
        let breach = tracker.would_exceed("k1", "m", 10, &lim, t0);
        assert!(breach.rpm);
        assert!(!breach.rpd);
    }

    #[test]
    fn exact_boundary_is_accepted_one_more_rejected() {
        let tracker = UsageTracker::new(chrono_tz::America::Los_Angeles);
        let lim = limit();
        let t0 = Utc::now();
        // tpm_input limit is 1000; consume exactly up to the limit.
        tracker.record_request("k1", "m", 1_000, t0);
        let at_limit = tracker.would_exceed("k1", "m", 0, &lim, t0);
        assert!(!at_limit.tpm);
        let over_limit = tracker.would_exceed("k1", "m", 1, &lim, t0);
        assert!(over_limit.tpm);
    }

    #[test]
    fn daily_reset_zeroes_calendar_counters() {
        let tracker = UsageTracker::new(chrono_tz::America::Los_Angeles);
        let t0 = Utc::now();
        tracker.record_request("k1", "m", 500, t0);
        tracker.daily_reset(t0);
        let snap = tracker.snapshot("k1", "m", t0);
        assert_eq!(snap.rpd_used, 0);
        assert_eq!(snap.tpd_input_used, 0);
    }

    #[test]
    fn day_rollover_resets_lazily_on_next_touch() {
        let tracker = UsageTracker::new(chrono_tz::America::Los_Angeles);
        let t0 = Utc::now();
        tracker.record_request("k1", "m", 500, t0);
        let next_day = t0 + chrono::Duration::days(1);
        let snap = tracker.snapshot("k1", "m", next_day);
        assert_eq!(snap.rpd_used, 0);
    }
}
