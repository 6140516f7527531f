//! Per-target daily quotas with a rolling reset boundary.
//!
//! Every entry carries the timestamp of its last write. An entry only counts
//! ("is current") when that timestamp is at or after the most recent reset
//! anchor, so quotas roll over on their own without a cleanup job: stale
//! entries stay on disk, ignored, until the next write replaces them.
//!
//! # File format
//! ```text
//! { "<target>": { "<task>": { "timestamp": "2026-10-19T00:30:00",
//!                             "completed": true | "count": 2,
//!                             "metadata": { ... },
//!                             "<flag>": true } } }
//! ```
//! Tasks with a daily limit of exactly 1 store `completed`; the rest store
//! `count`. Older files that stored a bare timestamp string per task are
//! upgraded on load.

use crate::io::atomic_write;
use chrono::{Local, NaiveDateTime, NaiveTime, TimeDelta};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f";
const RESERVED_KEYS: [&str; 4] = ["timestamp", "completed", "count", "metadata"];

pub type Clock = Box<dyn Fn() -> NaiveDateTime + Send + Sync>;

/// The most recent instant at which daily quotas rolled over.
pub fn reset_anchor(now: NaiveDateTime, reset_hour: u32) -> NaiveDateTime {
    let time = NaiveTime::from_hms_opt(reset_hour.min(23), 0, 0).unwrap_or(NaiveTime::MIN);
    let anchor = now.date().and_time(time);
    if now < anchor {
        anchor - TimeDelta::days(1)
    } else {
        anchor
    }
}

pub fn format_timestamp(ts: NaiveDateTime) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(raw: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FORMAT)
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.naive_local())
        })
}

// ---------------------------------------------------------------------------
// QuotaEntry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    Completed(bool),
    Count(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuotaEntry {
    pub timestamp: NaiveDateTime,
    pub progress: Progress,
    pub metadata: Map<String, Value>,
    pub flags: BTreeMap<String, bool>,
}

impl QuotaEntry {
    fn fresh(now: NaiveDateTime, boolean: bool) -> Self {
        Self {
            timestamp: now,
            progress: if boolean {
                Progress::Completed(false)
            } else {
                Progress::Count(0)
            },
            metadata: Map::new(),
            flags: BTreeMap::new(),
        }
    }

    pub fn completed(&self) -> bool {
        match self.progress {
            Progress::Completed(done) => done,
            Progress::Count(n) => n > 0,
        }
    }

    pub fn count(&self) -> u32 {
        match self.progress {
            Progress::Completed(done) => u32::from(done),
            Progress::Count(n) => n,
        }
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "timestamp".into(),
            Value::String(format_timestamp(self.timestamp)),
        );
        match self.progress {
            Progress::Completed(done) => obj.insert("completed".into(), Value::Bool(done)),
            Progress::Count(n) => obj.insert("count".into(), Value::from(n)),
        };
        if !self.metadata.is_empty() {
            obj.insert("metadata".into(), Value::Object(self.metadata.clone()));
        }
        for (flag, set) in &self.flags {
            obj.insert(flag.clone(), Value::Bool(*set));
        }
        Value::Object(obj)
    }

    /// Parse one persisted entry. `boolean` selects the shape for the task's limit.
    fn from_json(raw: &Value, boolean: bool) -> Option<Self> {
        match raw {
            Value::String(ts) => Some(Self {
                timestamp: parse_timestamp(ts)?,
                progress: if boolean {
                    Progress::Completed(true)
                } else {
                    Progress::Count(1)
                },
                metadata: Map::new(),
                flags: BTreeMap::new(),
            }),
            Value::Object(obj) => {
                let timestamp = parse_timestamp(obj.get("timestamp")?.as_str()?)?;
                let count = obj
                    .get("count")
                    .and_then(Value::as_u64)
                    .map(|n| n.min(u64::from(u32::MAX)) as u32)
                    .unwrap_or(0);
                let progress = if boolean {
                    let done = obj
                        .get("completed")
                        .and_then(Value::as_bool)
                        .unwrap_or(false);
                    Progress::Completed(done || count > 0)
                } else {
                    Progress::Count(count)
                };
                let metadata = obj
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let flags = obj
                    .iter()
                    .filter(|(k, _)| !RESERVED_KEYS.contains(&k.as_str()))
                    .filter_map(|(k, v)| v.as_bool().map(|b| (k.clone(), b)))
                    .collect();
                Some(Self {
                    timestamp,
                    progress,
                    metadata,
                    flags,
                })
            }
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// QuotaStore
// ---------------------------------------------------------------------------

type TargetEntries = BTreeMap<String, QuotaEntry>;

/// Write-through store of daily task progress, one JSON document on disk.
pub struct QuotaStore {
    path: PathBuf,
    reset_hour: u32,
    limits: BTreeMap<String, u32>,
    state: BTreeMap<String, TargetEntries>,
    clock: Clock,
}

impl QuotaStore {
    /// Load the store from `path`. A missing or unreadable file starts empty.
    pub fn open(path: &Path, reset_hour: u32, limits: &BTreeMap<String, u32>) -> Self {
        let limits: BTreeMap<String, u32> = limits
            .iter()
            .filter(|(name, _)| !name.trim().is_empty())
            .map(|(name, limit)| (name.trim().to_string(), (*limit).max(1)))
            .collect();
        let mut store = Self {
            path: path.to_path_buf(),
            reset_hour: reset_hour.min(23),
            limits,
            state: BTreeMap::new(),
            clock: Box::new(|| Local::now().naive_local()),
        };
        store.state = store.load();
        store
    }

    /// Replace the wall clock, e.g. to pin "now" in tests.
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_tracked(&self, task: &str) -> bool {
        self.limits.contains_key(task)
    }

    pub fn limit(&self, task: &str) -> Option<u32> {
        self.limits.get(task).copied()
    }

    pub fn now(&self) -> NaiveDateTime {
        (self.clock)()
    }

    pub fn reset_anchor(&self) -> NaiveDateTime {
        reset_anchor(self.now(), self.reset_hour)
    }

    pub fn is_current(&self, entry: &QuotaEntry) -> bool {
        entry.timestamp >= self.reset_anchor()
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// True when the task already reached its daily limit for this target.
    pub fn should_skip(&self, target: &str, task: &str) -> bool {
        let Some(limit) = self.limit(task) else {
            return false;
        };
        let Some(entry) = self.current_entry(target, task) else {
            return false;
        };
        if limit == 1 {
            entry.completed()
        } else {
            entry.count() >= limit
        }
    }

    pub fn current_count(&self, target: &str, task: &str) -> u32 {
        let Some(entry) = self.current_entry(target, task) else {
            return 0;
        };
        if self.uses_boolean(task) {
            u32::from(entry.completed())
        } else {
            entry.count()
        }
    }

    pub fn last_timestamp(&self, target: &str, task: &str) -> Option<NaiveDateTime> {
        self.current_entry(target, task).map(|e| e.timestamp)
    }

    pub fn get_metadata(&self, target: &str, task: &str, key: &str) -> Option<&Value> {
        if key.is_empty() {
            return None;
        }
        self.current_entry(target, task)?.metadata.get(key)
    }

    pub fn is_flag_set(&self, target: &str, task: &str, flag: &str) -> bool {
        self.current_entry(target, task)
            .and_then(|e| e.flags.get(flag).copied())
            .unwrap_or(false)
    }

    pub fn targets(&self) -> impl Iterator<Item = &str> {
        self.state.keys().map(String::as_str)
    }

    /// All stored entries for a target, current or stale.
    pub fn entries(&self, target: &str) -> Option<&TargetEntries> {
        self.state.get(target)
    }

    // -----------------------------------------------------------------------
    // Mutations (each one persists immediately)
    // -----------------------------------------------------------------------

    pub fn mark_done(&mut self, target: &str, task: &str) {
        self.record_progress(target, task, 1);
    }

    /// Count `amount` more completions. Counters are not clamped to the limit.
    pub fn record_progress(&mut self, target: &str, task: &str, amount: i64) {
        if !self.is_tracked(task) || amount <= 0 {
            return;
        }
        let amount = amount.min(i64::from(u32::MAX)) as u32;
        let entry = self.touch_entry(target, task);
        entry.progress = match entry.progress {
            Progress::Completed(_) => Progress::Completed(true),
            Progress::Count(n) => Progress::Count(n.saturating_add(amount)),
        };
        self.save();
    }

    /// Overwrite the counter. For limit-1 tasks any positive count means done.
    pub fn set_count(&mut self, target: &str, task: &str, count: i64) {
        if !self.is_tracked(task) {
            return;
        }
        let count = count.clamp(0, i64::from(u32::MAX)) as u32;
        let entry = self.touch_entry(target, task);
        entry.progress = match entry.progress {
            Progress::Completed(_) => Progress::Completed(count > 0),
            Progress::Count(_) => Progress::Count(count),
        };
        self.save();
    }

    /// Store a metadata value. This also marks the entry current for today.
    pub fn set_metadata(&mut self, target: &str, task: &str, key: &str, value: Value) {
        if !self.is_tracked(task) || key.is_empty() {
            return;
        }
        let entry = self.touch_entry(target, task);
        entry.metadata.insert(key.to_string(), value);
        self.save();
    }

    /// Set a boolean flag. This also marks the entry current for today.
    pub fn set_flag(&mut self, target: &str, task: &str, flag: &str, value: bool) {
        if !self.is_tracked(task) || flag.is_empty() {
            return;
        }
        if RESERVED_KEYS.contains(&flag) {
            warn!(flag, task, "refusing to store a flag under a reserved quota key");
            return;
        }
        let entry = self.touch_entry(target, task);
        entry.flags.insert(flag.to_string(), value);
        self.save();
    }

    /// Wipe every stored entry, on disk too.
    pub fn clear(&mut self) {
        self.state.clear();
        self.save();
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn snapshot(&self) -> Value {
        let doc: Map<String, Value> = self
            .state
            .iter()
            .map(|(target, tasks)| {
                let tasks: Map<String, Value> = tasks
                    .iter()
                    .map(|(task, entry)| (task.clone(), entry.to_json()))
                    .collect();
                (target.clone(), Value::Object(tasks))
            })
            .collect();
        Value::Object(doc)
    }

    fn save(&self) {
        let data = match serde_json::to_string_pretty(&self.snapshot()) {
            Ok(d) => d,
            Err(e) => {
                warn!(error = %e, "could not serialize daily quota state");
                return;
            }
        };
        if let Err(e) = atomic_write(&self.path, data.as_bytes()) {
            warn!(path = %self.path.display(), error = %e, "could not save daily quota state");
        }
    }

    fn load(&self) -> BTreeMap<String, TargetEntries> {
        if !self.path.exists() {
            return BTreeMap::new();
        }
        let raw: Value = match std::fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|s| serde_json::from_str(&s).map_err(|e| e.to_string()))
        {
            Ok(v) => v,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "could not read daily quota state; starting empty");
                return BTreeMap::new();
            }
        };
        let Value::Object(targets) = raw else {
            warn!(path = %self.path.display(), "daily quota state is not an object; starting empty");
            return BTreeMap::new();
        };

        let mut state = BTreeMap::new();
        for (target, tasks) in targets {
            let Value::Object(tasks) = tasks else {
                continue;
            };
            let mut cleaned = TargetEntries::new();
            for (task, raw_entry) in tasks {
                match QuotaEntry::from_json(&raw_entry, self.uses_boolean(&task)) {
                    Some(entry) => {
                        cleaned.insert(task, entry);
                    }
                    None => debug!(target_name = %target, task = %task, "dropping unreadable quota entry"),
                }
            }
            if !cleaned.is_empty() {
                state.insert(target, cleaned);
            }
        }
        state
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn uses_boolean(&self, task: &str) -> bool {
        self.limit(task) == Some(1)
    }

    fn current_entry(&self, target: &str, task: &str) -> Option<&QuotaEntry> {
        let entry = self.state.get(target)?.get(task)?;
        self.is_current(entry).then_some(entry)
    }

    /// The current entry with its timestamp refreshed, or a fresh one
    /// replacing whatever stale entry was stored.
    fn touch_entry(&mut self, target: &str, task: &str) -> &mut QuotaEntry {
        let now = self.now();
        let anchor = reset_anchor(now, self.reset_hour);
        let boolean = self.uses_boolean(task);
        let entry = self
            .state
            .entry(target.to_string())
            .or_default()
            .entry(task.to_string())
            .or_insert_with(|| QuotaEntry::fresh(now, boolean));
        if entry.timestamp < anchor {
            *entry = QuotaEntry::fresh(now, boolean);
        }
        entry.timestamp = now;
        entry
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 10, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn limits() -> BTreeMap<String, u32> {
        BTreeMap::from([
            ("mail".to_string(), 1),
            ("gather".to_string(), 3),
        ])
    }

    struct Fixture {
        _dir: TempDir,
        path: PathBuf,
        now: Arc<Mutex<NaiveDateTime>>,
    }

    impl Fixture {
        fn new(now: NaiveDateTime) -> Self {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("state/daily_tasks.json");
            Self {
                _dir: dir,
                path,
                now: Arc::new(Mutex::new(now)),
            }
        }

        fn store(&self, reset_hour: u32) -> QuotaStore {
            let now = self.now.clone();
            QuotaStore::open(&self.path, reset_hour, &limits())
                .with_clock(Box::new(move || *now.lock().unwrap()))
        }

        fn set_now(&self, t: NaiveDateTime) {
            *self.now.lock().unwrap() = t;
        }
    }

    #[test]
    fn anchor_before_and_after_reset_hour() {
        assert_eq!(reset_anchor(at(19, 22, 0), 23), at(18, 23, 0));
        assert_eq!(reset_anchor(at(19, 23, 0), 23), at(19, 23, 0));
        assert_eq!(reset_anchor(at(19, 23, 30), 23), at(19, 23, 0));
        assert_eq!(reset_anchor(at(19, 0, 10), 0), at(19, 0, 0));
    }

    #[test]
    fn untracked_task_never_creates_entry() {
        let fx = Fixture::new(at(19, 12, 0));
        let mut store = fx.store(23);
        store.record_progress("farm1", "arena", 1);
        store.set_metadata("farm1", "arena", "k", json!(1));
        assert!(!store.should_skip("farm1", "arena"));
        assert!(store.entries("farm1").is_none());
    }

    #[test]
    fn boolean_task_does_not_overflow() {
        let fx = Fixture::new(at(19, 12, 0));
        let mut store = fx.store(23);
        assert!(!store.should_skip("farm1", "mail"));
        store.record_progress("farm1", "mail", 1);
        store.record_progress("farm1", "mail", 1);
        assert!(store.should_skip("farm1", "mail"));
        assert_eq!(store.current_count("farm1", "mail"), 1);
        let entry = &store.entries("farm1").unwrap()["mail"];
        assert_eq!(entry.progress, Progress::Completed(true));
    }

    #[test]
    fn counter_task_increments_by_amount_unclamped() {
        let fx = Fixture::new(at(19, 12, 0));
        let mut store = fx.store(23);
        store.record_progress("farm1", "gather", 1);
        assert_eq!(store.current_count("farm1", "gather"), 1);
        assert!(!store.should_skip("farm1", "gather"));
        store.record_progress("farm1", "gather", 2);
        assert_eq!(store.current_count("farm1", "gather"), 3);
        assert!(store.should_skip("farm1", "gather"));
        store.record_progress("farm1", "gather", 2);
        assert_eq!(store.current_count("farm1", "gather"), 5);
        store.record_progress("farm1", "gather", 0);
        store.record_progress("farm1", "gather", -4);
        assert_eq!(store.current_count("farm1", "gather"), 5);
    }

    #[test]
    fn stale_entries_are_ignored_not_deleted() {
        let fx = Fixture::new(at(19, 12, 0));
        let mut store = fx.store(23);
        store.record_progress("farm1", "gather", 3);
        store.mark_done("farm1", "mail");
        assert!(store.should_skip("farm1", "gather"));

        // Past the 23:00 reset.
        fx.set_now(at(19, 23, 5));
        assert!(!store.should_skip("farm1", "gather"));
        assert!(!store.should_skip("farm1", "mail"));
        assert_eq!(store.current_count("farm1", "gather"), 0);
        assert_eq!(store.last_timestamp("farm1", "gather"), None);
        assert!(store.entries("farm1").unwrap().contains_key("gather"));

        store.record_progress("farm1", "gather", 1);
        assert_eq!(store.current_count("farm1", "gather"), 1);
    }

    #[test]
    fn reset_hour_23_example() {
        // Now 22:00: anchor is yesterday 23:00.
        let fx = Fixture::new(at(19, 0, 30));
        let mut store = fx.store(23);
        store.mark_done("farm1", "mail");

        fx.set_now(at(19, 22, 0));
        assert!(store.should_skip("farm1", "mail"));

        // An entry written two days ago is stale.
        fx.set_now(at(17, 10, 0));
        store.mark_done("farm2", "mail");
        fx.set_now(at(19, 22, 0));
        assert!(!store.should_skip("farm2", "mail"));
    }

    #[test]
    fn metadata_write_refreshes_entry() {
        let fx = Fixture::new(at(18, 10, 0));
        let mut store = fx.store(23);
        store.set_metadata("farm1", "gather", "next_ready_at", json!("2026-10-18T12:00:00"));
        store.record_progress("farm1", "gather", 2);

        fx.set_now(at(19, 10, 0));
        assert_eq!(store.get_metadata("farm1", "gather", "next_ready_at"), None);

        store.set_metadata("farm1", "gather", "next_ready_at", json!("2026-10-19T12:00:00"));
        // Fresh entry: old count discarded, new metadata current.
        assert_eq!(store.current_count("farm1", "gather"), 0);
        assert_eq!(
            store.get_metadata("farm1", "gather", "next_ready_at"),
            Some(&json!("2026-10-19T12:00:00"))
        );
        assert_eq!(store.last_timestamp("farm1", "gather"), Some(at(19, 10, 0)));
    }

    #[test]
    fn flags_and_set_count() {
        let fx = Fixture::new(at(19, 10, 0));
        let mut store = fx.store(23);
        assert!(!store.is_flag_set("farm1", "mail", "reward_claimed"));
        store.set_flag("farm1", "mail", "reward_claimed", true);
        assert!(store.is_flag_set("farm1", "mail", "reward_claimed"));
        assert!(!store.should_skip("farm1", "mail"));

        store.set_flag("farm1", "mail", "count", true);
        assert!(!store.is_flag_set("farm1", "mail", "count"));

        store.set_count("farm1", "mail", 4);
        assert!(store.should_skip("farm1", "mail"));
        store.set_count("farm1", "mail", 0);
        assert!(!store.should_skip("farm1", "mail"));

        store.set_count("farm1", "gather", -2);
        assert_eq!(store.current_count("farm1", "gather"), 0);
        store.set_count("farm1", "gather", 3);
        assert!(store.should_skip("farm1", "gather"));
    }

    #[test]
    fn persists_and_reloads() {
        let fx = Fixture::new(at(19, 10, 0));
        {
            let mut store = fx.store(23);
            store.record_progress("farm1", "gather", 2);
            store.set_flag("farm1", "gather", "boosted", true);
            store.set_metadata("farm1", "gather", "slot", json!("a"));
            store.mark_done("farm1", "mail");
        }
        let raw: Value =
            serde_json::from_str(&std::fs::read_to_string(&fx.path).unwrap()).unwrap();
        assert_eq!(raw["farm1"]["gather"]["count"], json!(2));
        assert_eq!(raw["farm1"]["gather"]["boosted"], json!(true));
        assert_eq!(raw["farm1"]["gather"]["metadata"]["slot"], json!("a"));
        assert_eq!(raw["farm1"]["mail"]["completed"], json!(true));
        assert_eq!(raw["farm1"]["mail"]["timestamp"], json!("2026-10-19T10:00:00"));

        let store = fx.store(23);
        assert_eq!(store.current_count("farm1", "gather"), 2);
        assert!(store.is_flag_set("farm1", "gather", "boosted"));
        assert!(store.should_skip("farm1", "mail"));
    }

    #[test]
    fn legacy_string_entries_upgrade_on_load() {
        let fx = Fixture::new(at(19, 10, 0));
        std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
        std::fs::write(
            &fx.path,
            r#"{"farm1": {"mail": "2026-10-19T09:00:00.250000",
                          "gather": "2026-10-19T09:00:00",
                          "bounty": {"timestamp": "2026-10-19T09:00:00", "count": 2, "completed": false}},
                "farm2": {"mail": {"timestamp": 5}}}"#,
        )
        .unwrap();
        let mut limits = limits();
        limits.insert("bounty".into(), 1);
        let now = fx.now.clone();
        let store = QuotaStore::open(&fx.path, 23, &limits)
            .with_clock(Box::new(move || *now.lock().unwrap()));

        assert!(store.should_skip("farm1", "mail"));
        assert_eq!(store.current_count("farm1", "gather"), 1);
        // Structured boolean entries with a positive count load as completed.
        assert!(store.should_skip("farm1", "bounty"));
        assert!(store.entries("farm2").is_none());
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let fx = Fixture::new(at(19, 10, 0));
        std::fs::create_dir_all(fx.path.parent().unwrap()).unwrap();
        std::fs::write(&fx.path, "{not json").unwrap();
        let mut store = fx.store(23);
        assert!(store.targets().next().is_none());
        store.mark_done("farm1", "mail");
        assert!(store.should_skip("farm1", "mail"));
    }

    #[test]
    fn failed_write_keeps_memory_state() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"file, not a dir").unwrap();
        let path = blocker.join("daily_tasks.json");
        let mut store = QuotaStore::open(&path, 23, &limits())
            .with_clock(Box::new(|| at(19, 10, 0)));
        store.mark_done("farm1", "mail");
        assert!(store.should_skip("farm1", "mail"));
        assert!(!path.exists());
    }

    #[test]
    fn clear_wipes_disk_state() {
        let fx = Fixture::new(at(19, 10, 0));
        let mut store = fx.store(23);
        store.mark_done("farm1", "mail");
        store.clear();
        assert!(!store.should_skip("farm1", "mail"));
        let reloaded = fx.store(23);
        assert!(reloaded.targets().next().is_none());
    }
}
