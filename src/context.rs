//! Per-user conversation state with idle expiry.
//!
//! The store is the only owner of [`ConversationContext`] values. Everything
//! else works on snapshots and hands a [`ContextPatch`] back for merging.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;

use crate::intent::Intent;
use crate::stage::Stage;

pub const DEFAULT_IDLE_TIMEOUT_SECS: i64 = 30 * 60;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10 * 60;
pub const DEFAULT_HISTORY_LIMIT: usize = 20;

// --- Data Structures ---

/// Closed travel interval. Both ends are always present and `start <= end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDateRange")]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

#[derive(Deserialize)]
struct RawDateRange {
    start: NaiveDate,
    end: NaiveDate,
}

impl TryFrom<RawDateRange> for DateRange {
    type Error = String;

    fn try_from(raw: RawDateRange) -> Result<Self, Self::Error> {
        DateRange::new(raw.start, raw.end)
            .ok_or_else(|| format!("travel range ends ({}) before it starts ({})", raw.end, raw.start))
    }
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Option<Self> {
        (start <= end).then_some(Self { start, end })
    }

    /// Inclusive number of days covered by the range.
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    pub budget: Option<f64>,
    pub travel_style: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub role: Role,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationContext {
    pub destination: Option<String>,
    pub travel_dates: Option<DateRange>,
    pub partial_date_info: Option<String>,
    pub activities: Vec<String>,
    pub preferences: Preferences,
    pub conversation_history: Vec<HistoryEntry>,
    pub extracted_info: Option<ContextPatch>,
    pub last_intent: Option<Intent>,
    pub last_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationContext {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            destination: None,
            travel_dates: None,
            partial_date_info: None,
            activities: Vec::new(),
            preferences: Preferences::default(),
            conversation_history: Vec::new(),
            extracted_info: None,
            last_intent: None,
            last_response: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_destination(&self) -> bool {
        self.destination.is_some()
    }

    pub fn has_dates(&self) -> bool {
        self.travel_dates.is_some()
    }

    pub fn has_activities(&self) -> bool {
        !self.activities.is_empty()
    }

    pub fn is_complete(&self) -> bool {
        self.has_destination() && self.has_dates() && self.has_activities()
    }

    /// Shallow merge. Nested values are replaced wholesale.
    pub fn apply(&mut self, patch: &ContextPatch) {
        if let Some(destination) = &patch.destination {
            self.destination = destination.clone();
        }
        if let Some(partial) = &patch.partial_date_info {
            self.partial_date_info = partial.clone();
        }
        if let Some(range) = patch.travel_dates {
            self.travel_dates = range;
            // A complete range supersedes a staged month.
            if range.is_some() {
                self.partial_date_info = None;
            }
        }
        if let Some(activities) = &patch.activities {
            self.activities = activities.clone();
        }
        if let Some(preferences) = &patch.preferences {
            self.preferences = preferences.clone();
        }
        if let Some(history) = &patch.conversation_history {
            self.conversation_history = history.clone();
        }
        if let Some(extracted) = &patch.extracted_info {
            self.extracted_info = extracted.as_deref().cloned();
        }
        if let Some(intent) = patch.last_intent {
            self.last_intent = Some(intent);
        }
        if let Some(response) = &patch.last_response {
            self.last_response = Some(response.clone());
        }
    }

    /// Snapshot with `patch` applied; `self` is left untouched.
    pub fn merged(&self, patch: &ContextPatch) -> Self {
        let mut next = self.clone();
        next.apply(patch);
        next
    }

    pub fn recent_history(&self, n: usize) -> &[HistoryEntry] {
        let len = self.conversation_history.len();
        &self.conversation_history[len.saturating_sub(n)..]
    }

    /// History with `entries` appended, trimmed to the newest `limit` entries.
    pub fn history_with(&self, entries: Vec<HistoryEntry>, limit: usize) -> Vec<HistoryEntry> {
        let mut history = self.conversation_history.clone();
        history.extend(entries);
        if history.len() > limit {
            history.drain(..history.len() - limit);
        }
        history
    }
}

/// Proposed delta for a [`ConversationContext`].
///
/// Nullable fields use `Option<Option<T>>`: `None` leaves the field alone,
/// `Some(None)` clears it (JSON `null`), `Some(Some(v))` sets it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPatch {
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub destination: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub travel_dates: Option<Option<DateRange>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub partial_date_info: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activities: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<Preferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<HistoryEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none", deserialize_with = "nullable")]
    pub extracted_info: Option<Option<Box<ContextPatch>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_intent: Option<Intent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_response: Option<String>,
}

fn nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

impl ContextPatch {
    pub fn is_empty(&self) -> bool {
        *self == ContextPatch::default()
    }

    /// Layers `other` on top of `self`; fields set in `other` win.
    pub fn extend(&mut self, other: ContextPatch) {
        if other.destination.is_some() {
            self.destination = other.destination;
        }
        if other.travel_dates.is_some() {
            self.travel_dates = other.travel_dates;
        }
        if other.partial_date_info.is_some() {
            self.partial_date_info = other.partial_date_info;
        }
        if other.activities.is_some() {
            self.activities = other.activities;
        }
        if other.preferences.is_some() {
            self.preferences = other.preferences;
        }
        if other.conversation_history.is_some() {
            self.conversation_history = other.conversation_history;
        }
        if other.extracted_info.is_some() {
            self.extracted_info = other.extracted_info;
        }
        if other.last_intent.is_some() {
            self.last_intent = other.last_intent;
        }
        if other.last_response.is_some() {
            self.last_response = other.last_response;
        }
    }

    /// Only the slot fields, for echoing back what a turn extracted.
    pub fn slots(&self) -> ContextPatch {
        ContextPatch {
            destination: self.destination.clone(),
            travel_dates: self.travel_dates,
            partial_date_info: self.partial_date_info.clone(),
            activities: self.activities.clone(),
            ..ContextPatch::default()
        }
    }
}

// --- Clock ---

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

// --- Store ---

#[derive(Debug, Clone)]
pub struct ContextWrapper {
    pub data: ConversationContext,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl ContextWrapper {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            data: ConversationContext::new(now),
            created_at: now,
            last_accessed: now,
        }
    }
}

pub struct ContextStore {
    contexts: DashMap<String, ContextWrapper>,
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    sweep_interval: std::time::Duration,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ContextStore {
    pub fn new(
        clock: Arc<dyn Clock>,
        idle_timeout: Duration,
        sweep_interval: std::time::Duration,
    ) -> Self {
        Self {
            contexts: DashMap::new(),
            clock,
            idle_timeout,
            sweep_interval,
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::new(
            clock,
            Duration::seconds(DEFAULT_IDLE_TIMEOUT_SECS),
            std::time::Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn is_expired(&self, wrapper: &ContextWrapper, now: DateTime<Utc>) -> bool {
        now - wrapper.last_accessed > self.idle_timeout
    }

    fn drop_if_expired(&self, user_id: &str, now: DateTime<Utc>) {
        if self
            .contexts
            .remove_if(user_id, |_, wrapper| self.is_expired(wrapper, now))
            .is_some()
        {
            log::debug!("Context for '{}' expired, starting fresh", user_id);
        }
    }

    /// Returns the live context for `user_id`, creating a default one if needed.
    pub fn get_context(&self, user_id: &str) -> ConversationContext {
        let now = self.clock.now();
        self.drop_if_expired(user_id, now);
        let mut wrapper = self
            .contexts
            .entry(user_id.to_string())
            .or_insert_with(|| ContextWrapper::new(now));
        wrapper.last_accessed = now;
        wrapper.data.clone()
    }

    /// Read-merge-write. Concurrent updates for one user are last-write-wins.
    pub fn update_context(&self, user_id: &str, patch: &ContextPatch) -> ConversationContext {
        let now = self.clock.now();
        self.drop_if_expired(user_id, now);
        let mut wrapper = self
            .contexts
            .entry(user_id.to_string())
            .or_insert_with(|| ContextWrapper::new(now));
        wrapper.data.apply(patch);
        wrapper.data.updated_at = now;
        wrapper.last_accessed = now;
        wrapper.data.clone()
    }

    pub fn clear_context(&self, user_id: &str) {
        self.contexts.remove(user_id);
    }

    /// Removes every expired wrapper. Locks one shard at a time.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut removed = 0;
        self.contexts.retain(|_, wrapper| {
            let keep = !self.is_expired(wrapper, now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Spawns the periodic sweep on the current tokio runtime.
    pub fn start(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return;
        }
        let store: Weak<Self> = Arc::downgrade(self);
        let period = self.sweep_interval;
        *sweeper = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick fires immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let removed = store.sweep_expired();
                if removed > 0 {
                    log::info!("Swept {} idle conversation(s)", removed);
                }
            }
        }));
        log::info!("Context sweep running every {:?}", period);
    }

    pub fn stop(&self) {
        if let Some(handle) = self.sweeper.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.sweeper.lock().is_some()
    }
}

impl Drop for ContextStore {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()))
    }

    fn store(clock: &Arc<ManualClock>) -> ContextStore {
        ContextStore::with_clock(clock.clone())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn unseen_user_gets_default_context() {
        let clock = clock();
        let store = store(&clock);
        let ctx = store.get_context("alice");
        assert!(ctx.destination.is_none());
        assert!(ctx.travel_dates.is_none());
        assert!(ctx.activities.is_empty());
        assert_eq!(ctx.created_at, clock.now());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn update_is_idempotent() {
        let clock = clock();
        let store = store(&clock);
        let patch = ContextPatch {
            destination: Some(Some("Paris".into())),
            ..Default::default()
        };
        let once = store.update_context("bob", &patch);
        let twice = store.update_context("bob", &patch);
        assert_eq!(once, twice);
        assert_eq!(twice.destination.as_deref(), Some("Paris"));
    }

    #[test]
    fn travel_dates_are_replaced_wholesale() {
        let clock = clock();
        let store = store(&clock);
        let first = DateRange::new(date(2026, 4, 10), date(2026, 4, 20)).unwrap();
        let second = DateRange::new(date(2026, 5, 1), date(2026, 5, 3)).unwrap();
        store.update_context(
            "u",
            &ContextPatch {
                travel_dates: Some(Some(first)),
                ..Default::default()
            },
        );
        let ctx = store.update_context(
            "u",
            &ContextPatch {
                travel_dates: Some(Some(second)),
                ..Default::default()
            },
        );
        assert_eq!(ctx.travel_dates, Some(second));
    }

    #[test]
    fn range_supersedes_partial_month() {
        let mut ctx = ConversationContext::new(Utc::now());
        ctx.apply(&ContextPatch {
            partial_date_info: Some(Some("April".into())),
            ..Default::default()
        });
        assert_eq!(ctx.partial_date_info.as_deref(), Some("April"));
        ctx.apply(&ContextPatch {
            travel_dates: Some(DateRange::new(date(2026, 4, 10), date(2026, 4, 12))),
            ..Default::default()
        });
        assert!(ctx.partial_date_info.is_none());
        assert!(ctx.has_dates());
    }

    #[test]
    fn expired_context_is_replaced() {
        let clock = clock();
        let store = store(&clock);
        store.update_context(
            "carol",
            &ContextPatch {
                destination: Some(Some("Goa".into())),
                ..Default::default()
            },
        );
        clock.advance(Duration::minutes(31));
        let ctx = store.get_context("carol");
        assert!(ctx.destination.is_none());
        assert_eq!(ctx.created_at, clock.now());
    }

    #[test]
    fn reads_keep_context_alive() {
        let clock = clock();
        let store = store(&clock);
        store.update_context(
            "dave",
            &ContextPatch {
                destination: Some(Some("Goa".into())),
                ..Default::default()
            },
        );
        clock.advance(Duration::minutes(20));
        store.get_context("dave");
        clock.advance(Duration::minutes(20));
        assert_eq!(store.get_context("dave").destination.as_deref(), Some("Goa"));
    }

    #[test]
    fn sweep_removes_only_idle_wrappers() {
        let clock = clock();
        let store = store(&clock);
        store.get_context("old");
        clock.advance(Duration::minutes(25));
        store.get_context("fresh");
        clock.advance(Duration::minutes(10));
        assert_eq!(store.sweep_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_deletes_wrapper() {
        let clock = clock();
        let store = store(&clock);
        store.get_context("erin");
        store.clear_context("erin");
        assert!(store.is_empty());
    }

    #[test]
    fn patch_null_clears_and_absent_leaves() {
        let mut ctx = ConversationContext::new(Utc::now());
        ctx.destination = Some("Tokyo".into());
        ctx.activities = vec!["Food".into()];
        let patch: ContextPatch = serde_json::from_str(r#"{"destination": null}"#).unwrap();
        assert_eq!(patch.destination, Some(None));
        ctx.apply(&patch);
        assert!(ctx.destination.is_none());
        assert_eq!(ctx.activities, vec!["Food".to_string()]);
    }

    #[test]
    fn reversed_range_is_rejected_on_the_wire() {
        let parsed = serde_json::from_str::<ContextPatch>(
            r#"{"travelDates": {"start": "2026-04-20", "end": "2026-04-10"}}"#,
        );
        assert!(parsed.is_err());
    }

    #[test]
    fn history_is_bounded() {
        let mut ctx = ConversationContext::new(Utc::now());
        let entries = (0..25)
            .map(|i| HistoryEntry {
                role: Role::User,
                message: format!("m{}", i),
                timestamp: Utc::now(),
                stage: None,
            })
            .collect();
        ctx.conversation_history = ctx.history_with(entries, DEFAULT_HISTORY_LIMIT);
        assert_eq!(ctx.conversation_history.len(), 20);
        assert_eq!(ctx.conversation_history[0].message, "m5");
        assert_eq!(ctx.recent_history(3).len(), 3);
    }

    #[tokio::test]
    async fn sweep_loop_starts_and_stops() {
        let clock = clock();
        let store = Arc::new(store(&clock));
        store.start();
        assert!(store.is_running());
        store.start();
        store.stop();
        assert!(!store.is_running());
    }
}
