use crate::cmd::load_config;
use crate::output::{or_dash, print_json, print_table};
use anyhow::Context;
use clap::Args;
use drover_core::orchestrator::{
    resolve_target_tokens, Orchestrator, PassStatus, RunOptions, RunReport, StopHandle,
};
use drover_core::task::TaskRegistry;
use std::path::Path;
use tracing::{info, warn};

#[derive(Args)]
pub struct RunArgs {
    /// Run this routine on every selected target instead of each target's own
    #[arg(long, conflicts_with = "task")]
    routine: Option<String>,

    /// Run a single task once on every selected target
    #[arg(long)]
    task: Option<String>,

    /// 0-based position of the first target in the batch
    #[arg(long, default_value_t = 0)]
    batch_start: usize,

    /// Number of targets in the batch (default: all remaining)
    #[arg(long)]
    batch_size: Option<usize>,

    /// Comma-separated target names or 1-based indexes; overrides the batch
    #[arg(long, value_delimiter = ',')]
    targets: Vec<String>,

    /// Log device commands instead of sending them
    #[arg(long)]
    simulate: bool,

    /// Keep cycling over the selected targets until interrupted
    #[arg(long = "loop")]
    loop_mode: bool,

    /// 1-based position the first loop iteration starts from
    #[arg(long, default_value_t = 1)]
    loop_start: usize,
}

pub fn run(config_path: &Path, args: RunArgs, json: bool) -> anyhow::Result<()> {
    let config = load_config(config_path)?;

    let target_names = resolve_target_tokens(&config.targets, &args.targets);
    if !args.targets.is_empty() && target_names.is_empty() {
        anyhow::bail!("none of the requested targets ({}) exist", args.targets.join(","));
    }
    let options = RunOptions {
        routine_override: args.routine,
        single_task: args.task,
        target_names,
        batch_start: args.batch_start,
        batch_size: args.batch_size,
        simulate: args.simulate,
        loop_mode: args.loop_mode,
        loop_start_index: args.loop_start,
    };

    let registry = TaskRegistry::with_builtins()?;
    let mut orchestrator =
        Orchestrator::new(&config, options, registry).context("cannot start the run")?;
    watch_ctrl_c(orchestrator.stop_handle());

    let report = orchestrator.run();
    if json {
        print_json(&report)?;
    } else {
        print_report(&report);
    }

    let failed = report
        .outcomes
        .iter()
        .filter(|o| matches!(o.status, PassStatus::Failed | PassStatus::RestartsExhausted))
        .count();
    if failed > 0 {
        anyhow::bail!(
            "{failed} of {} target passes did not complete",
            report.outcomes.len()
        );
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    if report.outcomes.is_empty() {
        println!("No targets selected.");
        return;
    }
    let rows = report
        .outcomes
        .iter()
        .map(|o| {
            vec![
                o.target.clone(),
                o.routine.clone(),
                o.iteration.to_string(),
                status_label(o.status).to_string(),
                format!("{}/{}", o.tasks_completed, o.total_tasks),
                o.restarts.to_string(),
                or_dash(o.error.as_deref()),
            ]
        })
        .collect();
    print_table(
        &["TARGET", "ROUTINE", "ITER", "STATUS", "TASKS", "RESTARTS", "ERROR"],
        rows,
    );
}

fn status_label(status: PassStatus) -> &'static str {
    match status {
        PassStatus::Completed => "completed",
        PassStatus::Incomplete => "stopped",
        PassStatus::RestartsExhausted => "gave up",
        PassStatus::Failed => "failed",
    }
}

/// First Ctrl-C asks the run to stop after the current target; a second one
/// exits immediately.
fn watch_ctrl_c(stop: StopHandle) {
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "cannot watch for Ctrl-C");
                return;
            }
        };
        rt.block_on(async {
            if tokio::signal::ctrl_c().await.is_err() {
                return;
            }
            info!("stop requested; finishing the current target (Ctrl-C again to quit now)");
            stop.stop();
            if tokio::signal::ctrl_c().await.is_ok() {
                std::process::exit(130);
            }
        });
    });
}
