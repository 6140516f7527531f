//! Screen housekeeping around routine steps: launching the game, clearing
//! start-up popups, getting back to the home screen, and firing interrupts.
//!
//! Every wait here is bounded by a `timings` key so a config can tighten or
//! relax it without code changes.

use crate::config::{secs, InterruptConfig};
use crate::error::{DroverError, Result};
use crate::perception::command::describe;
use crate::task::{TaskContext, TaskRegistry};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

/// Templates that mean "the main screen is up". `sede_button` shows in the
/// world view and is tapped to go back home.
const READY_TEMPLATES: [&str; 3] = ["world_button", "sede_button", "game_ready"];
const RETURN_HOME_TEMPLATE: &str = "sede_button";
const READY_THRESHOLD: f32 = 0.7;
const LAUNCH_TEMPLATES: [&str; 2] = ["launch_game_icon", "launch_game"];
const DEFAULT_CLOSE_POPUP: (i32, i32) = (270, 440);

// ---------------------------------------------------------------------------
// Game launch
// ---------------------------------------------------------------------------

/// Open the game from the launcher, by icon template or fixed button, and
/// make sure the launcher icon goes away.
pub fn launch_game(ctx: &mut TaskContext<'_>) -> Result<()> {
    if launch_via_template(ctx)? {
        return ensure_launched(ctx);
    }
    let Ok(coord) = ctx.layout.button("launch_game") else {
        return Ok(());
    };
    ctx.log.info("launching the game from the layout button");
    ctx.tap(coord, "launch-game")?;
    ctx.pause(ctx.config.timing("game_launch_wait_seconds", 0.0));
    ensure_launched(ctx)
}

fn launch_via_template(ctx: &mut TaskContext<'_>) -> Result<bool> {
    let Some(name) = LAUNCH_TEMPLATES
        .iter()
        .find(|name| ctx.layout.has_template(name))
    else {
        return Ok(false);
    };
    let paths = ctx.layout.template_paths(name)?;
    let timeout = ctx.config.timing_duration("launch_game_template_timeout", 20.0);
    let poll = ctx
        .config
        .timing_duration("launch_game_template_poll", 1.0)
        .max(Duration::from_millis(500));
    let threshold = ctx.config.timing("launch_game_template_threshold", 0.85) as f32;

    ctx.log.info("looking for the game icon");
    let Some(found) = ctx.vision.wait_for_any(&paths, threshold, timeout, poll)? else {
        ctx.log
            .warn("game icon not seen; falling back to the layout button");
        return Ok(false);
    };
    ctx.log
        .info(format!("game icon '{}' found; launching", found.template_name()));
    ctx.tap(found.coord, "launch-game-template")?;
    ctx.pause(ctx.config.timing("game_launch_wait_seconds", 0.0));
    Ok(true)
}

fn ensure_launched(ctx: &mut TaskContext<'_>) -> Result<()> {
    if ctx.simulate {
        return Ok(());
    }
    let Ok(icon) = ctx.layout.template_paths("launch_game_icon") else {
        return Ok(());
    };
    let check_delay = ctx.config.timing("game_launch_check_delay", 3.0);
    let retries = (ctx.config.timing("game_launch_retry_attempts", 3.0) as u32).max(1);
    let threshold = ctx.config.timing("launch_game_template_threshold", 0.85) as f32;

    for attempt in 1..=retries {
        ctx.pause(check_delay);
        let Some(found) = ctx.vision.find_any(&icon, threshold)? else {
            return Ok(());
        };
        ctx.log.warn(format!(
            "game icon '{}' still visible after launching (attempt {attempt}/{retries})",
            found.template_name()
        ));
        ctx.tap(found.coord, "launch-game-retry")?;
    }
    Err(DroverError::RoutineRestart(format!(
        "game did not open after {retries} attempts"
    )))
}

// ---------------------------------------------------------------------------
// Start-up popups
// ---------------------------------------------------------------------------

/// Close the stack of popups the game shows right after starting.
///
/// The first wait is long (the game may still be loading); later ones are
/// short. A level-up overlay is tapped away when no close button shows.
pub fn dismiss_initial_popups(ctx: &mut TaskContext<'_>) -> Result<()> {
    if !ctx.layout.has_template("popup_close") {
        return Ok(());
    }
    let close = ctx.layout.template_paths("popup_close")?;
    let level_up = ctx.layout.template_paths_lenient(&["level_up_overlay"]);
    let max_attempts = ctx.config.timing("initial_popup_max_attempts", 5.0).max(1.0) as u32;
    let mut timeout = ctx.config.timing_duration("initial_popup_first_timeout", 60.0);
    let next_timeout = ctx.config.timing_duration("initial_popup_next_timeout", 5.0);
    let delay = ctx.config.timing("initial_popup_delay", 1.0);
    let threshold = ctx.config.timing("initial_popup_threshold", 0.85) as f32;

    let mut attempts = 0u32;
    while attempts < max_attempts {
        let found =
            ctx.vision
                .wait_for_any(&close, threshold, timeout, Duration::from_secs(1))?;
        attempts += 1;
        let Some(found) = found else {
            if !level_up.is_empty() && dismiss_level_up(ctx, &level_up)? {
                continue;
            }
            ctx.log.info(if attempts == 1 {
                "no start-up popups"
            } else {
                "no more start-up popups"
            });
            break;
        };
        ctx.log
            .info(format!("closing start-up popup via '{}'", found.template_name()));
        ctx.tap(found.coord, "initial-popup-close")?;
        ctx.pause(delay);
        timeout = next_timeout;
    }
    Ok(())
}

fn dismiss_level_up(ctx: &mut TaskContext<'_>, templates: &[PathBuf]) -> Result<bool> {
    let threshold = ctx.config.timing("level_up_overlay_threshold", 0.9) as f32;
    let Some(found) = ctx.vision.find_any(templates, threshold)? else {
        return Ok(false);
    };
    let tap = ctx.layout.button("close_popup").unwrap_or(DEFAULT_CLOSE_POPUP);
    ctx.log.info(format!(
        "level-up overlay '{}' up; tapping it away",
        found.template_name()
    ));
    ctx.tap(tap, "level-up-dismiss")?;
    ctx.pause(0.8);
    Ok(true)
}

// ---------------------------------------------------------------------------
// Home screen
// ---------------------------------------------------------------------------

/// Wait for one of the ready templates. Seeing `sede_button` means the world
/// view is up: tap it and keep waiting.
///
/// Layouts without any ready template always pass. On timeout a strict check
/// asks for a routine restart; a lenient one warns and returns `false`.
pub fn wait_for_ready(ctx: &mut TaskContext<'_>, strict: bool) -> Result<bool> {
    if ctx.simulate {
        return Ok(true);
    }
    let mut paths = Vec::new();
    let mut owners = Vec::new();
    for name in READY_TEMPLATES {
        if let Ok(found) = ctx.layout.template_paths(name) {
            owners.extend(std::iter::repeat(name).take(found.len()));
            paths.extend(found);
        }
    }
    if paths.is_empty() {
        return Ok(true);
    }

    let timeout = ctx.config.timing_duration("ready_template_timeout", 30.0);
    let poll = ctx.config.timing_duration("ready_template_poll", 1.0);
    let start = Instant::now();
    loop {
        if let Some(found) = ctx.vision.find_any(&paths, READY_THRESHOLD)? {
            let name = paths
                .iter()
                .position(|p| *p == found.template)
                .map_or("?", |i| owners[i]);
            if name != RETURN_HOME_TEMPLATE {
                ctx.log.info(format!(
                    "'{name}' visible after {:.1}s",
                    start.elapsed().as_secs_f64()
                ));
                return Ok(true);
            }
            ctx.log.info("world view is up; returning home first");
            ctx.tap(found.coord, "return-home")?;
            ctx.pause(ctx.config.timing("return_base_delay", 3.0));
        }
        if start.elapsed() >= timeout {
            break;
        }
        std::thread::sleep(poll);
    }

    let message = format!(
        "ready templates [{}] did not show within {:.1}s",
        describe(&paths),
        timeout.as_secs_f64()
    );
    if strict {
        return Err(DroverError::RoutineRestart(message));
    }
    ctx.log.warn(format!("{message}; carrying on"));
    Ok(false)
}

/// Make sure the home screen is up, pressing back once if it is not.
pub fn ensure_home(ctx: &mut TaskContext<'_>, stage: &str, strict: bool) -> Result<()> {
    if ctx.simulate || !READY_TEMPLATES.iter().any(|n| ctx.layout.has_template(n)) {
        return Ok(());
    }
    ctx.log.info(format!("checking home screen ({stage})"));
    if wait_for_ready(ctx, false)? {
        return Ok(());
    }

    ctx.log.warn("home screen not detected; pressing back");
    let timeout = ctx.config.timing_duration("back_button_detect_timeout", 4.0);
    let threshold = ctx.config.timing("back_button_detect_threshold", 0.83) as f32;
    if ctx.tap_back_button("ensure-home-back", timeout, threshold)? {
        ctx.pause(ctx.config.timing("back_button_recover_delay", 2.0));
        if wait_for_ready(ctx, false)? {
            return Ok(());
        }
    }

    let message = format!("home screen still missing after pressing back ({stage})");
    if strict {
        return Err(DroverError::RoutineRestart(message));
    }
    ctx.log.warn(format!("{message}; carrying on"));
    Ok(())
}

// ---------------------------------------------------------------------------
// Interrupts
// ---------------------------------------------------------------------------

/// Last time each `(target, task)` interrupt fired, on the monotonic clock.
#[derive(Debug, Default)]
pub struct InterruptState {
    last_run: HashMap<(String, String), Instant>,
}

impl InterruptState {
    fn cooling_down(&self, target: &str, task: &str, cooldown: Duration) -> bool {
        self.last_run
            .get(&(target.to_string(), task.to_string()))
            .is_some_and(|at| at.elapsed() < cooldown)
    }

    fn mark(&mut self, target: &str, task: &str) {
        self.last_run
            .insert((target.to_string(), task.to_string()), Instant::now());
    }
}

/// Run every interrupt whose alert is on screen and whose cooldown has passed.
pub fn run_interrupts(
    ctx: &mut TaskContext<'_>,
    registry: &TaskRegistry,
    interrupts: &[InterruptConfig],
    state: &mut InterruptState,
) -> Result<()> {
    for interrupt in interrupts {
        if interrupt.skip_when_quota_met && ctx.quota_met(&interrupt.task) {
            continue;
        }
        let Ok(paths) = ctx.layout.template_paths(&interrupt.template) else {
            continue;
        };
        if state.cooling_down(
            &ctx.target.name,
            &interrupt.task,
            secs(interrupt.cooldown_seconds),
        ) {
            continue;
        }
        if ctx.vision.find_any(&paths, interrupt.threshold)?.is_none() {
            continue;
        }

        let task = registry.get(&interrupt.task)?;
        ctx.log.info(format!(
            "alert '{}' is up; running '{}'",
            interrupt.template, interrupt.task
        ));
        let mut params = ctx.config.task_defaults_for(&interrupt.task);
        params.extend(interrupt.params.clone());

        let previous = ctx.log.current_task();
        ctx.log.set_task(Some(interrupt.task.as_str()));
        let result = task.run(ctx, &params);
        ctx.log.set_task(previous.as_deref());
        result?;

        state.mark(&ctx.target.name, &interrupt.task);
        ensure_home(ctx, &format!("after interrupt '{}'", interrupt.task), false)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Params;
    use crate::perception::BlindPerception;
    use crate::task::Task;
    use crate::testing::{Hit, Rig, ScriptedPerception, FARM_YAML};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Home-screen templates plus timings short enough for tests.
    fn yaml() -> String {
        FARM_YAML.replace(
            "      back_button: back_button.png",
            "      back_button: back_button.png\n      world_button: world.png\n      sede_button: sede.png\n      truck_alert: truck_alert.png\n      launch_game_icon: launcher.png",
        ) + r#"
timings:
  ready_template_timeout: 0
  ready_template_poll: 0
  back_button_detect_timeout: 0
  back_button_recover_delay: 0
  return_base_delay: 0
  game_launch_check_delay: 0
  launch_game_template_timeout: 0
  initial_popup_first_timeout: 0
  initial_popup_next_timeout: 0
  initial_popup_delay: 0
"#
    }

    struct Counting {
        runs: Arc<AtomicUsize>,
    }

    impl Task for Counting {
        fn name(&self) -> &str {
            "trucks"
        }

        fn run(&self, _: &mut TaskContext<'_>, _: &Params) -> Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn interrupt(cooldown: f64) -> InterruptConfig {
        InterruptConfig {
            task: "trucks".into(),
            template: "truck_alert".into(),
            threshold: 0.85,
            cooldown_seconds: cooldown,
            skip_when_quota_met: true,
            params: Params::new(),
        }
    }

    #[test]
    fn ready_check_passes_on_world_button() {
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::steady(vec![Hit::at("world", (10, 10))]);
        let mut ctx = rig.ctx(&vision);
        assert!(wait_for_ready(&mut ctx, true).unwrap());
        assert!(rig.transport.taps().is_empty());
    }

    #[test]
    fn sede_button_is_tapped_before_home_shows() {
        let mut rig = Rig::new(&yaml().replace("ready_template_timeout: 0", "ready_template_timeout: 5"));
        let vision = ScriptedPerception::new(vec![
            vec![Hit::at("sede", (480, 900))],
            vec![Hit::at("world", (10, 10))],
        ]);
        let mut ctx = rig.ctx(&vision);
        assert!(wait_for_ready(&mut ctx, true).unwrap());
        assert_eq!(rig.transport.taps(), vec![(480, 900)]);
    }

    #[test]
    fn strict_ready_check_requests_restart() {
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::steady(vec![]);
        let mut ctx = rig.ctx(&vision);
        let err = wait_for_ready(&mut ctx, true).unwrap_err();
        assert!(err.is_recoverable());
        assert!(!wait_for_ready(&mut ctx, false).unwrap());
    }

    #[test]
    fn ensure_home_presses_back_once() {
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::new(vec![
            vec![Hit::at("back_button", (20, 900))],
            vec![Hit::at("back_button", (20, 900))],
            vec![Hit::at("world", (10, 10))],
        ]);
        let mut ctx = rig.ctx(&vision);
        ensure_home(&mut ctx, "before 'mail'", true).unwrap();
        assert_eq!(rig.transport.taps(), vec![(20, 900)]);
    }

    #[test]
    fn ensure_home_strict_fails_when_back_does_not_help() {
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::steady(vec![]);
        let mut ctx = rig.ctx(&vision);
        let err = ensure_home(&mut ctx, "after 'mail'", true).unwrap_err();
        assert!(matches!(err, DroverError::RoutineRestart(_)));
        ensure_home(&mut ctx, "after 'mail'", false).unwrap();
    }

    #[test]
    fn simulate_skips_home_checks() {
        let mut rig = Rig::new(&yaml());
        let vision = BlindPerception;
        let mut ctx = rig.ctx(&vision);
        ctx.simulate = true;
        ensure_home(&mut ctx, "before 'mail'", true).unwrap();
        assert!(wait_for_ready(&mut ctx, true).unwrap());
    }

    #[test]
    fn launch_retries_then_restarts() {
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::steady(vec![Hit::at("launcher", (60, 70))]);
        let mut ctx = rig.ctx(&vision);
        let err = launch_game(&mut ctx).unwrap_err();
        assert!(matches!(err, DroverError::RoutineRestart(_)));
        // One launch tap plus three retries.
        assert_eq!(rig.transport.taps(), vec![(60, 70); 4]);
    }

    #[test]
    fn launch_succeeds_when_icon_goes_away() {
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::new(vec![vec![Hit::at("launcher", (60, 70))], vec![]]);
        let mut ctx = rig.ctx(&vision);
        launch_game(&mut ctx).unwrap();
        assert_eq!(rig.transport.taps(), vec![(60, 70)]);
    }

    #[test]
    fn initial_popups_are_closed_until_none_show() {
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::new(vec![
            vec![Hit::at("popup_close", (500, 60))],
            vec![Hit::at("popup_close", (500, 80))],
            vec![],
        ]);
        let mut ctx = rig.ctx(&vision);
        dismiss_initial_popups(&mut ctx).unwrap();
        assert_eq!(rig.transport.taps(), vec![(500, 60), (500, 80)]);
    }

    #[test]
    fn interrupt_respects_cooldown() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry
            .register(Box::new(Counting { runs: runs.clone() }))
            .unwrap();
        let mut rig = Rig::new(&yaml());
        let vision = ScriptedPerception::steady(vec![
            Hit::at("truck_alert", (300, 300)),
            Hit::at("world", (10, 10)),
        ]);
        let mut ctx = rig.ctx(&vision);
        let mut state = InterruptState::default();

        let cooled = [interrupt(300.0)];
        run_interrupts(&mut ctx, &registry, &cooled, &mut state).unwrap();
        run_interrupts(&mut ctx, &registry, &cooled, &mut state).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let no_cooldown = [interrupt(0.0)];
        run_interrupts(&mut ctx, &registry, &no_cooldown, &mut state).unwrap();
        run_interrupts(&mut ctx, &registry, &no_cooldown, &mut state).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn interrupt_skipped_when_quota_met() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut registry = TaskRegistry::new();
        registry
            .register(Box::new(Counting { runs: runs.clone() }))
            .unwrap();
        let mut rig = Rig::new(&yaml()).with_quota(&[("trucks", 1)]);
        rig.quota.as_mut().unwrap().mark_done("farm1", "trucks");
        let vision = ScriptedPerception::steady(vec![Hit::at("truck_alert", (300, 300))]);
        let mut ctx = rig.ctx(&vision);
        let mut state = InterruptState::default();
        run_interrupts(&mut ctx, &registry, &[interrupt(0.0)], &mut state).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }
}
