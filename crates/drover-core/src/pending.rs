use crate::quota::{parse_timestamp, Progress, QuotaStore};
use chrono::NaiveDateTime;
use serde::Serialize;

/// A limit-1 task that has an entry today but is not completed yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingTask {
    pub target: String,
    pub task: String,
    pub next_ready_at: Option<NaiveDateTime>,
    pub updated_at: NaiveDateTime,
}

/// Pending tasks across all targets, soonest `next_ready_at` first.
///
/// Entries without a `next_ready_at` hint sort after the ones that have one,
/// then by the time they were last written.
pub fn pending_tasks(store: &QuotaStore) -> Vec<PendingTask> {
    let mut out = Vec::new();
    for target in store.targets() {
        let Some(entries) = store.entries(target) else {
            continue;
        };
        for (task, entry) in entries {
            if entry.progress != Progress::Completed(false) || !store.is_current(entry) {
                continue;
            }
            let next_ready_at = entry
                .metadata
                .get("next_ready_at")
                .and_then(|v| v.as_str())
                .and_then(parse_timestamp);
            out.push(PendingTask {
                target: target.to_string(),
                task: task.clone(),
                next_ready_at,
                updated_at: entry.timestamp,
            });
        }
    }
    out.sort_by(|a, b| {
        let key = |p: &PendingTask| (p.next_ready_at.is_none(), p.next_ready_at, p.updated_at);
        key(a).cmp(&key(b))
    });
    out
}
