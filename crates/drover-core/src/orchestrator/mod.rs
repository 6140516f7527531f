//! Routine scheduler: picks targets, runs each target's routine step by step,
//! and restarts a pass from where it stopped when the device drops out.
//!
//! One [`Orchestrator::run`] call walks the selected targets once (or keeps
//! cycling in loop mode until the [`StopHandle`] fires). Per target the flow
//! is emulator, channel, game launch, start-up popups, home check, then the
//! routine steps from the [`RunCursor`]. Recoverable errors restart the pass
//! at the same step; anything else ends the target and the run moves on.

mod housekeeping;
pub mod options;

pub use options::{apply_loop_rotation, resolve_target_tokens, select_targets, RunOptions};

use crate::channel::adb::AdbTransport;
use crate::channel::{ControlChannel, Transport};
use crate::config::{secs, Config, Routine, TargetConfig};
use crate::diagnostics::{DiagnosticsSink, TargetLog};
use crate::emulator::EmulatorSession;
use crate::error::Result;
use crate::perception::{BlindPerception, CommandPerception, Perception};
use crate::quota::QuotaStore;
use crate::task::{TaskContext, TaskRegistry};
use housekeeping::{ensure_home, run_interrupts, InterruptState};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Run state
// ---------------------------------------------------------------------------

/// Cooperative stop flag shared with whoever wants to end a run early.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Where a target pass resumes after a restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCursor {
    pub next_task_index: usize,
    pub restart_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PassStatus {
    Completed,
    /// Stopped on request before the routine finished.
    Incomplete,
    RestartsExhausted,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetOutcome {
    pub target: String,
    pub routine: String,
    pub iteration: u32,
    pub status: PassStatus,
    pub tasks_completed: usize,
    pub total_tasks: usize,
    /// Restarts actually performed, not counting the first pass.
    pub restarts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Last diagnostics folder written for this target, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub iterations: u32,
    pub outcomes: Vec<TargetOutcome>,
}

impl RunReport {
    pub fn all_completed(&self) -> bool {
        self.outcomes
            .iter()
            .all(|o| o.status == PassStatus::Completed)
    }
}

/// Builds the device transport for a target.
pub type TransportFactory = Box<dyn Fn(&TargetConfig) -> Box<dyn Transport>>;

/// Builds the perception backend for a target pass.
pub type PerceptionFactory =
    Box<dyn Fn(Arc<ControlChannel>, &Config) -> Result<Box<dyn Perception>>>;

fn default_transport(config: &Config) -> TransportFactory {
    let executable = config.adb.executable.clone();
    Box::new(move |_: &TargetConfig| {
        Box::new(AdbTransport::new(&executable)) as Box<dyn Transport>
    })
}

fn default_perception(channel: Arc<ControlChannel>, config: &Config) -> Result<Box<dyn Perception>> {
    if channel.is_simulated() {
        return Ok(Box::new(BlindPerception));
    }
    if config.perception.command.is_some() {
        return Ok(Box::new(CommandPerception::new(channel, &config.perception)?));
    }
    channel
        .log()
        .warn("perception.command is not configured; templates will never match");
    Ok(Box::new(BlindPerception))
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<'c> {
    config: &'c Config,
    options: RunOptions,
    registry: TaskRegistry,
    quota: Option<QuotaStore>,
    diagnostics: Arc<DiagnosticsSink>,
    stop: StopHandle,
    transport_factory: TransportFactory,
    perception_factory: PerceptionFactory,
    interrupt_state: InterruptState,
}

impl<'c> Orchestrator<'c> {
    /// Check that everything the selected targets will need exists before any
    /// device is touched.
    pub fn new(config: &'c Config, options: RunOptions, registry: TaskRegistry) -> Result<Self> {
        if let Some(task) = &options.single_task {
            registry.get(task)?;
        }
        for target in select_targets(&config.targets, &options) {
            if options.single_task.is_none() {
                let routine = config.routine_for(options.routine_id(target))?;
                for step in &routine.tasks {
                    registry.get(&step.task)?;
                }
            }
            config.layout_for(target)?;
        }
        for interrupt in &config.interrupts {
            registry.get(&interrupt.task)?;
        }

        let quota = config.active_tracking().map(|tracking| {
            QuotaStore::open(
                &tracking.storage_path,
                tracking.reset_hour_local,
                &tracking.tracked_tasks,
            )
        });

        Ok(Self {
            config,
            transport_factory: default_transport(config),
            perception_factory: Box::new(default_perception),
            diagnostics: Arc::new(DiagnosticsSink::new(&config.diagnostics_dir)),
            options,
            registry,
            quota,
            stop: StopHandle::new(),
            interrupt_state: InterruptState::default(),
        })
    }

    pub fn with_stop_handle(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn with_transport(mut self, factory: TransportFactory) -> Self {
        self.transport_factory = factory;
        self
    }

    pub fn with_perception(mut self, factory: PerceptionFactory) -> Self {
        self.perception_factory = factory;
        self
    }

    /// Replace the quota store opened from `daily_tracking` (or set one).
    pub fn with_quota(mut self, quota: Option<QuotaStore>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn quota(&self) -> Option<&QuotaStore> {
        self.quota.as_ref()
    }

    /// Run the selected targets once, or keep cycling in loop mode until stopped.
    pub fn run(&mut self) -> RunReport {
        let config = self.config;
        let selected = apply_loop_rotation(select_targets(&config.targets, &self.options), &self.options);
        let mut report = RunReport::default();
        if selected.is_empty() {
            warn!("no targets selected");
            return report;
        }
        let names: Vec<&str> = selected.iter().map(|t| t.name.as_str()).collect();
        info!(
            targets = %names.join(", "),
            simulate = self.options.simulate,
            loop_mode = self.options.loop_mode,
            "starting run"
        );

        'run: loop {
            report.iterations += 1;
            if self.options.loop_mode {
                info!(iteration = report.iterations, "starting loop iteration");
            }
            for &target in &selected {
                let outcome = self.run_target(target, report.iterations);
                report.outcomes.push(outcome);
                if self.stop.is_stopped() {
                    info!("stop requested; ending run");
                    break 'run;
                }
            }
            if !self.options.loop_mode || self.stop.is_stopped() {
                break;
            }
        }
        report
    }

    fn routine_for(&self, target: &TargetConfig) -> Result<Routine> {
        match &self.options.single_task {
            Some(task) => Ok(Routine::single(task)),
            None => self
                .config
                .routine_for(self.options.routine_id(target))
                .cloned(),
        }
    }

    fn run_target(&mut self, target: &'c TargetConfig, iteration: u32) -> TargetOutcome {
        let label = self.options.routine_label(target);
        let log = TargetLog::new(target.name.clone(), Some(self.diagnostics.clone()));
        let mut outcome = TargetOutcome {
            target: target.name.clone(),
            routine: label.clone(),
            iteration,
            status: PassStatus::Failed,
            tasks_completed: 0,
            total_tasks: 0,
            restarts: 0,
            error: None,
            report_dir: None,
        };
        let routine = match self.routine_for(target) {
            Ok(routine) => routine,
            Err(e) => {
                log.error(format!("cannot run routine '{label}': {e}"));
                outcome.error = Some(e.to_string());
                return outcome;
            }
        };
        outcome.total_tasks = routine.tasks.len();
        let max_restarts = self.config.timing("routine_restart_attempts", 1.0).max(0.0) as u32;
        log.info(format!(
            "starting routine '{label}' ({} tasks)",
            routine.tasks.len()
        ));

        let mut cursor = RunCursor::default();
        loop {
            match self.run_pass(target, &routine, &mut cursor, &log) {
                Ok(()) => {
                    log.info(format!("routine '{label}' complete"));
                    outcome.status = PassStatus::Completed;
                    break;
                }
                Err(e) if e.is_recoverable() => {
                    if let Some(dir) = log.persist_failure(&e.to_string()) {
                        outcome.report_dir = Some(dir);
                    }
                    if cursor.restart_attempts >= max_restarts {
                        log.error(format!(
                            "giving up on {} after {max_restarts} restart(s): {e}",
                            target.name
                        ));
                        outcome.status = PassStatus::RestartsExhausted;
                        outcome.error = Some(e.to_string());
                        break;
                    }
                    if self.stop.is_stopped() {
                        log.warn(format!("stop requested; not restarting after: {e}"));
                        outcome.status = PassStatus::Incomplete;
                        outcome.error = Some(e.to_string());
                        break;
                    }
                    cursor.restart_attempts += 1;
                    log.warn(format!(
                        "restarting routine at task {}/{} (restart {}/{max_restarts}): {e}",
                        cursor.next_task_index + 1,
                        routine.tasks.len(),
                        cursor.restart_attempts
                    ));
                }
                Err(e) => {
                    log.error(format!("routine '{label}' aborted: {e}"));
                    if let Some(dir) = log.persist_failure(&e.to_string()) {
                        outcome.report_dir = Some(dir);
                    }
                    outcome.error = Some(e.to_string());
                    break;
                }
            }
        }
        outcome.tasks_completed = cursor.next_task_index;
        outcome.restarts = cursor.restart_attempts;
        outcome
    }

    /// One attempt at the routine, starting from `cursor.next_task_index`.
    fn run_pass(
        &mut self,
        target: &'c TargetConfig,
        routine: &Routine,
        cursor: &mut RunCursor,
        log: &TargetLog,
    ) -> Result<()> {
        let config = self.config;
        let simulate = self.options.simulate;
        let _emulator =
            EmulatorSession::start(config.emulator.as_ref(), target, simulate, log.clone())?;

        let mut channel = ControlChannel::new(
            (self.transport_factory)(target),
            &config.adb,
            target.device_port,
            log.clone(),
        )
        .simulated(simulate);
        if !simulate {
            channel = channel.with_action_observer(Box::new(record_action_frame));
        }
        let channel = Arc::new(channel);
        channel.wait_for_device(None)?;
        let warmup = config
            .timings
            .get("instance_warmup_seconds")
            .copied()
            .unwrap_or(config.instance_warmup_seconds);
        channel.sleep(secs(warmup));

        let vision = (self.perception_factory)(channel.clone(), config)?;
        let layout = config.layout_for(target)?;
        let registry = &self.registry;
        let state = &mut self.interrupt_state;
        let mut ctx = TaskContext {
            config,
            target,
            layout,
            channel: channel.as_ref(),
            vision: vision.as_ref(),
            quota: self.quota.as_mut(),
            log: log.clone(),
            simulate,
        };

        housekeeping::launch_game(&mut ctx)?;
        housekeeping::dismiss_initial_popups(&mut ctx)?;
        housekeeping::wait_for_ready(&mut ctx, true)?;
        let total = routine.tasks.len();
        if cursor.next_task_index > 0 {
            log.info(format!(
                "resuming at task {}/{total}",
                cursor.next_task_index + 1
            ));
        }
        run_interrupts(&mut ctx, registry, &config.interrupts, state)?;

        while let Some(step) = routine.tasks.get(cursor.next_task_index) {
            let task = registry.get(&step.task)?;
            let position = format!("{}/{total}", cursor.next_task_index + 1);
            if ctx.quota_met(&step.task) && !task.allow_repeat_after_completion() {
                log.info(format!(
                    "skipping '{}' ({position}): already done for today",
                    step.task
                ));
                cursor.next_task_index += 1;
                continue;
            }

            ensure_home(&mut ctx, &format!("before '{}'", step.task), true)?;
            run_interrupts(&mut ctx, registry, &config.interrupts, state)?;

            log.info(format!("running '{}' ({position})", step.task));
            let mut params = config.task_defaults_for(&step.task);
            params.extend(step.params.clone());
            log.set_task(Some(step.task.as_str()));
            let result = task.run(&mut ctx, &params);
            log.set_task(None);
            result?;
            if !task.manual_daily_logging() {
                ctx.record_progress(&step.task, 1);
            }

            ensure_home(&mut ctx, &format!("after '{}'", step.task), true)?;
            run_interrupts(&mut ctx, registry, &config.interrupts, state)?;
            cursor.next_task_index += 1;
        }
        Ok(())
    }
}

/// Keep a frame of the screen right before every tap or swipe.
fn record_action_frame(channel: &ControlChannel, label: &str) {
    match channel.capture() {
        Ok(Some(png)) => channel.log().record_frame(label, &png),
        Ok(None) => {}
        Err(e) => channel
            .log()
            .warn(format!("could not capture a frame before {label}: {e}")),
    }
}

impl std::fmt::Debug for Orchestrator<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("options", &self.options)
            .field("tasks", &self.registry.names().collect::<Vec<_>>())
            .field("quota", &self.quota.as_ref().map(QuotaStore::path))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TransportError;
    use crate::config::Params;
    use crate::error::DroverError;
    use crate::task::{ParamsExt, Task};
    use crate::testing::{FakeTransport, ScriptedPerception};
    use std::collections::BTreeMap;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const YAML: &str = r#"
targets:
  - { name: farm1, instance: i0, device_port: 5555, routine: five }
  - { name: farm2, instance: i1, device_port: 5565, routine: bad }
routines:
  five:
    tasks:
      - { task: step, params: { n: 1 } }
      - { task: step, params: { n: 2 } }
      - { task: step, params: { n: 3 } }
      - { task: step, params: { n: 4 } }
      - { task: step, params: { n: 5 } }
  bad:
    tasks:
      - { task: boom }
  taps:
    tasks:
      - { task: tap_buttons, params: { buttons: [mail], delay: 0 } }
layouts:
  plain:
    buttons:
      mail: [10, 20]
default_layout: plain
instance_warmup_seconds: 0
"#;

    /// Records the `n` param of every run; fails at `fail_at` while failures remain.
    struct Step {
        seen: Arc<Mutex<Vec<u32>>>,
        fail_at: u32,
        failures_left: AtomicU32,
        stop: Option<StopHandle>,
    }

    impl Task for Step {
        fn name(&self) -> &str {
            "step"
        }

        fn run(&self, _: &mut TaskContext<'_>, params: &Params) -> Result<()> {
            let n = params.u32_or("n", 0);
            self.seen.lock().unwrap().push(n);
            if let Some(stop) = &self.stop {
                stop.stop();
            }
            if n == self.fail_at && self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(DroverError::RoutineRestart("screen froze".into()));
            }
            Ok(())
        }
    }

    struct Boom;

    impl Task for Boom {
        fn name(&self) -> &str {
            "boom"
        }

        fn run(&self, _: &mut TaskContext<'_>, _: &Params) -> Result<()> {
            Err(DroverError::task_failed("boom", "always fails"))
        }
    }

    struct Harness {
        config: Config,
        transport: FakeTransport,
        seen: Arc<Mutex<Vec<u32>>>,
        dir: TempDir,
    }

    impl Harness {
        fn new(yaml: &str) -> Self {
            Self {
                config: Config::from_yaml(yaml).unwrap(),
                transport: FakeTransport::new(),
                seen: Arc::new(Mutex::new(Vec::new())),
                dir: TempDir::new().unwrap(),
            }
        }

        fn registry(&self, fail_at: u32, failures: u32, stop: Option<StopHandle>) -> TaskRegistry {
            let mut registry = TaskRegistry::with_builtins().unwrap();
            registry
                .register(Box::new(Step {
                    seen: self.seen.clone(),
                    fail_at,
                    failures_left: AtomicU32::new(failures),
                    stop,
                }))
                .unwrap();
            registry.register(Box::new(Boom)).unwrap();
            registry
        }

        fn orchestrator(&self, options: RunOptions, registry: TaskRegistry) -> Orchestrator<'_> {
            let transport = self.transport.clone();
            let vision = Arc::new(ScriptedPerception::steady(vec![]));
            Orchestrator::new(&self.config, options, registry)
                .unwrap()
                .with_transport(Box::new(move |_: &TargetConfig| {
                    Box::new(transport.clone()) as Box<dyn Transport>
                }))
                .with_perception(Box::new(move |_: Arc<ControlChannel>, _: &Config| {
                    Ok(Box::new(vision.clone()) as Box<dyn Perception>)
                }))
                .with_diagnostics(Arc::new(DiagnosticsSink::new(self.dir.path())))
        }

        fn seen(&self) -> Vec<u32> {
            self.seen.lock().unwrap().clone()
        }
    }

    fn only(target: &str) -> RunOptions {
        RunOptions {
            target_names: vec![target.to_string()],
            ..Default::default()
        }
    }

    #[test]
    fn restart_resumes_at_the_failed_step() {
        let h = Harness::new(YAML);
        let mut orch = h.orchestrator(only("farm1"), h.registry(3, 1, None));
        let report = orch.run();

        assert_eq!(h.seen(), vec![1, 2, 3, 3, 4, 5]);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, PassStatus::Completed);
        assert_eq!(outcome.restarts, 1);
        assert_eq!(outcome.tasks_completed, 5);
        assert!(outcome.report_dir.is_some());
    }

    #[test]
    fn restarts_are_bounded() {
        let h = Harness::new(YAML);
        let mut orch = h.orchestrator(only("farm1"), h.registry(2, u32::MAX, None));
        let report = orch.run();

        // One first try plus one restart, both stuck on step 2.
        assert_eq!(h.seen(), vec![1, 2, 2]);
        let outcome = &report.outcomes[0];
        assert_eq!(outcome.status, PassStatus::RestartsExhausted);
        assert_eq!(outcome.restarts, 1);
        assert_eq!(outcome.tasks_completed, 1);
        assert!(!report.all_completed());
    }

    #[test]
    fn restart_limit_comes_from_timings() {
        let yaml = format!("{YAML}timings:\n  routine_restart_attempts: 3\n");
        let h = Harness::new(&yaml);
        let mut orch = h.orchestrator(only("farm1"), h.registry(2, u32::MAX, None));
        let report = orch.run();
        assert_eq!(h.seen(), vec![1, 2, 2, 2, 2]);
        assert_eq!(report.outcomes[0].restarts, 3);
    }

    #[test]
    fn fatal_failure_moves_on_to_the_next_target() {
        let h = Harness::new(YAML);
        let options = RunOptions {
            target_names: vec!["farm2".into(), "farm1".into()],
            ..Default::default()
        };
        let mut orch = h.orchestrator(options, h.registry(0, 0, None));
        let report = orch.run();

        let statuses: Vec<_> = report.outcomes.iter().map(|o| o.status).collect();
        assert_eq!(statuses, vec![PassStatus::Failed, PassStatus::Completed]);
        assert_eq!(report.outcomes[0].restarts, 0);
        assert!(report.outcomes[0]
            .error
            .as_deref()
            .unwrap()
            .contains("always fails"));
        assert_eq!(h.seen(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn unknown_task_is_rejected_before_running() {
        let h = Harness::new(YAML);
        let err = Orchestrator::new(&h.config, only("farm1"), TaskRegistry::new()).unwrap_err();
        assert!(matches!(err, DroverError::UnknownTask(ref t) if t == "step"));

        let single = RunOptions {
            single_task: Some("arena".into()),
            ..Default::default()
        };
        let err = Orchestrator::new(&h.config, single, h.registry(0, 0, None)).unwrap_err();
        assert!(matches!(err, DroverError::UnknownTask(ref t) if t == "arena"));
        assert!(h.transport.calls().is_empty());
    }

    #[test]
    fn unknown_interrupt_task_is_rejected() {
        let yaml = format!("{YAML}interrupts:\n  - {{ task: trucks, template: truck_alert }}\n");
        let h = Harness::new(&yaml);
        let err = Orchestrator::new(&h.config, only("farm1"), h.registry(0, 0, None)).unwrap_err();
        assert!(matches!(err, DroverError::UnknownTask(ref t) if t == "trucks"));
    }

    #[test]
    fn steps_with_met_quota_are_skipped() {
        let h = Harness::new(YAML);
        let limits = BTreeMap::from([("step".to_string(), 1)]);
        let mut quota = QuotaStore::open(&h.dir.path().join("daily.json"), 0, &limits);
        quota.mark_done("farm1", "step");
        let mut orch = h
            .orchestrator(only("farm1"), h.registry(0, 0, None))
            .with_quota(Some(quota));
        let report = orch.run();
        assert!(h.seen().is_empty());
        assert_eq!(report.outcomes[0].status, PassStatus::Completed);
        assert_eq!(report.outcomes[0].tasks_completed, 5);
    }

    #[test]
    fn progress_is_recorded_for_tracked_tasks() {
        let h = Harness::new(YAML);
        let limits = BTreeMap::from([("step".to_string(), 10)]);
        let quota = QuotaStore::open(&h.dir.path().join("daily.json"), 0, &limits);
        let mut orch = h
            .orchestrator(only("farm1"), h.registry(0, 0, None))
            .with_quota(Some(quota));
        orch.run();
        assert_eq!(orch.quota().unwrap().current_count("farm1", "step"), 5);
    }

    #[test]
    fn channel_loss_restarts_the_pass() {
        let h = Harness::new(YAML);
        h.transport.fail_matching(
            "input tap",
            2,
            TransportError::Exit {
                code: 1,
                stderr: "device offline".into(),
            },
        );
        let options = RunOptions {
            target_names: vec!["farm1".into()],
            routine_override: Some("taps".into()),
            ..Default::default()
        };
        let mut orch = h.orchestrator(options, h.registry(0, 0, None));
        let report = orch.run();

        let outcome = &report.outcomes[0];
        assert_eq!(outcome.routine, "taps");
        assert_eq!(outcome.status, PassStatus::Completed);
        assert_eq!(outcome.restarts, 1);
        assert_eq!(h.transport.count_matching("input tap 10 20"), 3);
    }

    #[test]
    fn simulate_run_sends_nothing_to_the_device() {
        let yaml = format!("{YAML}task_defaults:\n  tap_buttons: {{ buttons: [mail], delay: 0 }}\n");
        let h = Harness::new(&yaml);
        let options = RunOptions {
            single_task: Some("tap_buttons".into()),
            simulate: true,
            ..Default::default()
        };
        let mut orch = h.orchestrator(options, h.registry(0, 0, None));
        let report = orch.run();

        assert!(h.transport.calls().is_empty());
        assert_eq!(report.outcomes.len(), 2);
        assert!(report.all_completed());
        assert_eq!(report.outcomes[0].routine, "task:tap_buttons");
    }

    #[test]
    fn loop_mode_ends_when_stopped() {
        let h = Harness::new(YAML);
        let stop = StopHandle::new();
        let options = RunOptions {
            target_names: vec!["farm1".into()],
            loop_mode: true,
            ..Default::default()
        };
        let mut orch = h
            .orchestrator(options, h.registry(0, 0, Some(stop.clone())))
            .with_stop_handle(stop);
        let report = orch.run();
        assert_eq!(report.iterations, 1);
        assert_eq!(report.outcomes.len(), 1);
        assert!(orch.stop_handle().is_stopped());
    }

    #[test]
    fn empty_selection_runs_nothing() {
        let h = Harness::new(YAML);
        let options = RunOptions {
            batch_start: 10,
            ..Default::default()
        };
        let mut orch = h.orchestrator(options, h.registry(0, 0, None));
        let report = orch.run();
        assert_eq!(report.iterations, 0);
        assert!(report.outcomes.is_empty());
    }
}
