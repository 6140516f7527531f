use crate::cmd::load_config;
use crate::output::{or_dash, print_json, print_table};
use clap::Subcommand;
use drover_core::config::Config;
use drover_core::pending::pending_tasks;
use drover_core::quota::{Progress, QuotaStore};
use serde_json::Value;
use std::path::Path;

#[derive(Subcommand)]
pub enum QuotaSubcommand {
    /// Show stored progress per target and task
    Show {
        /// Only this target
        #[arg(long)]
        target: Option<String>,
    },

    /// List tasks started today but not finished, soonest ready first
    Pending,

    /// Forget all stored progress
    Clear,
}

pub fn run(config_path: &Path, subcmd: QuotaSubcommand, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let mut store = open_store(&config)?;
    match subcmd {
        QuotaSubcommand::Show { target } => show(&store, target.as_deref(), json),
        QuotaSubcommand::Pending => pending(&store, json),
        QuotaSubcommand::Clear => {
            store.clear();
            if json {
                print_json(&serde_json::json!({ "cleared": store.path() }))
            } else {
                println!("Cleared daily progress in {}", store.path().display());
                Ok(())
            }
        }
    }
}

fn open_store(config: &Config) -> anyhow::Result<QuotaStore> {
    let Some(tracking) = config.active_tracking() else {
        anyhow::bail!("daily tracking is not enabled in this config");
    };
    Ok(QuotaStore::open(
        &tracking.storage_path,
        tracking.reset_hour_local,
        &tracking.tracked_tasks,
    ))
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(store: &QuotaStore, only: Option<&str>, json: bool) -> anyhow::Result<()> {
    if json {
        let mut snapshot = store.snapshot();
        if let (Some(target), Value::Object(map)) = (only, &mut snapshot) {
            map.retain(|k, _| k == target);
        }
        return print_json(&snapshot);
    }

    let mut rows = Vec::new();
    for target in store.targets().filter(|t| only.map_or(true, |o| o == *t)) {
        let Some(entries) = store.entries(target) else {
            continue;
        };
        for (task, entry) in entries {
            let progress = match entry.progress {
                Progress::Completed(true) => "done".to_string(),
                Progress::Completed(false) => "started".to_string(),
                Progress::Count(n) => match store.limit(task) {
                    Some(limit) => format!("{n}/{limit}"),
                    None => n.to_string(),
                },
            };
            rows.push(vec![
                target.to_string(),
                task.clone(),
                progress,
                if store.is_current(entry) { "today" } else { "stale" }.to_string(),
                entry.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]);
        }
    }
    if rows.is_empty() {
        println!("No progress recorded.");
        return Ok(());
    }
    print_table(&["TARGET", "TASK", "PROGRESS", "STATE", "UPDATED"], rows);
    Ok(())
}

// ---------------------------------------------------------------------------
// pending
// ---------------------------------------------------------------------------

fn pending(store: &QuotaStore, json: bool) -> anyhow::Result<()> {
    let pending = pending_tasks(store);
    if json {
        return print_json(&pending);
    }
    if pending.is_empty() {
        println!("Nothing pending.");
        return Ok(());
    }
    let rows = pending
        .iter()
        .map(|p| {
            vec![
                p.target.clone(),
                p.task.clone(),
                or_dash(p.next_ready_at.map(|t| t.format("%H:%M:%S"))),
                p.updated_at.format("%H:%M:%S").to_string(),
            ]
        })
        .collect();
    print_table(&["TARGET", "TASK", "NEXT READY", "UPDATED"], rows);
    Ok(())
}
