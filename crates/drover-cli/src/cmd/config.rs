use crate::cmd::load_config;
use crate::output::print_json;
use clap::Subcommand;
use drover_core::config::WarnLevel;
use drover_core::task::TaskRegistry;
use std::path::Path;

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Validate the config for common mistakes
    Validate,
}

pub fn run(config_path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Validate => validate(config_path, json),
    }
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(config_path: &Path, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    let mut warnings = config.validate();

    // Task names are only known to the binary, so check them here.
    let registry = TaskRegistry::with_builtins()?;
    let mut unknown: Vec<String> = config
        .routines
        .iter()
        .flat_map(|(id, r)| r.tasks.iter().map(move |s| (id, &s.task)))
        .filter(|(_, task)| !registry.contains(task))
        .map(|(id, task)| format!("routine '{id}' uses unregistered task '{task}'"))
        .collect();
    unknown.extend(
        config
            .interrupts
            .iter()
            .filter(|i| !registry.contains(&i.task))
            .map(|i| format!("interrupt uses unregistered task '{}'", i.task)),
    );

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
            "unregistered_tasks": unknown,
        });
        print_json(&value)?;
    } else if warnings.is_empty() && unknown.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
        for message in &unknown {
            println!("[error] {message}");
        }
    }

    warnings.retain(|w| w.level == WarnLevel::Error);
    if !warnings.is_empty() || !unknown.is_empty() {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}
