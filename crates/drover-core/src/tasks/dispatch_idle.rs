use crate::config::{secs, Params, Region};
use crate::error::Result;
use crate::quota::{format_timestamp, QuotaStore};
use crate::slots::SlotStatus;
use crate::task::{ParamsExt, Task, TaskContext};
use serde_json::Value;
use std::time::Duration;

/// Sends idle slots out one at a time until the dispatch limit is reached or
/// nothing is left idle.
///
/// Each dispatch taps the idle slot, confirms with a layout button (or a
/// template), then follows the slot that actually departed. Progress is
/// recorded per confirmed departure. When nothing is idle and a timer region
/// is configured, the countdown is stored as `next_ready_at` metadata.
pub struct DispatchIdle;

struct DispatchOptions {
    max_dispatches: u32,
    open_buttons: Vec<String>,
    open_delay: f64,
    idle_wait: Duration,
    idle_poll: Duration,
    preferred_slots: Vec<String>,
    select_delay: f64,
    confirm_button: String,
    confirm_template: Option<String>,
    confirm_threshold: f32,
    post_confirm_delay: f64,
    departure_timeout: Duration,
    departure_poll: Duration,
    return_button: Option<String>,
    timer_region: Option<Region>,
}

impl DispatchOptions {
    fn from_params(params: &Params) -> Self {
        Self {
            max_dispatches: params.u32_or("max_dispatches", 2),
            open_buttons: params.str_list("open_buttons"),
            open_delay: params.f64_or("open_delay", 1.0),
            idle_wait: secs(params.f64_or("idle_wait", 3.0)),
            idle_poll: secs(params.f64_or("idle_poll", 0.5)),
            preferred_slots: params
                .str_list("preferred_slots")
                .into_iter()
                .map(|s| s.to_uppercase())
                .collect(),
            select_delay: params.f64_or("select_delay", 1.5),
            confirm_button: params.str_or("confirm_button", "march").to_string(),
            confirm_template: params.opt_str("confirm_template").map(String::from),
            confirm_threshold: params.f64_or("confirm_threshold", 0.85) as f32,
            post_confirm_delay: params.f64_or("post_confirm_delay", 1.5),
            departure_timeout: secs(params.f64_or("departure_timeout", 10.0)),
            departure_poll: secs(params.f64_or("departure_poll", 1.0)),
            return_button: params.opt_str("return_button").map(String::from),
            timer_region: params.region("timer_region"),
        }
    }
}

impl Task for DispatchIdle {
    fn name(&self) -> &str {
        "dispatch_idle"
    }

    fn manual_daily_logging(&self) -> bool {
        true
    }

    fn run(&self, ctx: &mut TaskContext<'_>, params: &Params) -> Result<()> {
        let opts = DispatchOptions::from_params(params);
        let resolver = ctx.slots();
        let mut dispatched = 0u32;

        while dispatched < opts.max_dispatches {
            if resolver.has_identity() {
                let active = count_active(&resolver.sample_all()?);
                ctx.log.info(format!(
                    "slots out working: {active}/{}",
                    opts.max_dispatches
                ));
                if active.max(dispatched) >= opts.max_dispatches {
                    ctx.log.info("dispatch limit reached");
                    break;
                }
            }

            for button in &opts.open_buttons {
                ctx.tap_button(button, button)?;
                ctx.pause(opts.open_delay);
            }

            let idle = if opts.idle_wait.is_zero() {
                resolver.idle_slots()?
            } else {
                resolver.wait_for_idle(1, opts.idle_wait, opts.idle_poll)?
            };
            let idle = preferred(idle, &opts.preferred_slots);
            let Some(chosen) = idle.first().cloned() else {
                ctx.log.info("no idle slots to dispatch");
                self.note_next_ready(ctx, &opts)?;
                break;
            };

            ctx.log.info(format!(
                "dispatching slot {} (#{})",
                chosen.display_name(),
                dispatched + 1
            ));
            ctx.tap(chosen.tap, "select-idle-slot")?;
            ctx.pause(opts.select_delay);

            let monitored = resolver
                .resolve_slot_for_tap(chosen.tap, Some(idle.as_slice()), Some(&chosen))?
                .unwrap_or_else(|| chosen.clone());
            if monitored.slot_id != chosen.slot_id {
                ctx.log.info(format!(
                    "selected {} but tracking {}",
                    chosen.display_name(),
                    monitored.display_name()
                ));
            }

            if !confirm(ctx, &opts)? {
                ctx.log.warn("dispatch confirmation control not found; stopping");
                break;
            }
            ctx.pause(opts.post_confirm_delay);

            let departed = resolver
                .detect_departing_slot(Some(&monitored), &idle)?
                .unwrap_or(monitored);
            let left =
                resolver.confirm_departure(&departed, opts.departure_timeout, opts.departure_poll)?;
            if !left {
                ctx.log.warn(format!(
                    "slot {} did not leave after confirming; check it manually",
                    departed.display_name()
                ));
                break;
            }
            dispatched += 1;
            ctx.record_progress(self.name(), 1);
        }

        if let Some(button) = &opts.return_button {
            ctx.tap_button(button, "return-home")?;
        }
        Ok(())
    }
}

impl DispatchIdle {
    fn note_next_ready(&self, ctx: &mut TaskContext<'_>, opts: &DispatchOptions) -> Result<()> {
        let Some(region) = &opts.timer_region else {
            return Ok(());
        };
        let Some(now) = ctx.quota.as_deref().map(QuotaStore::now) else {
            return Ok(());
        };
        let Some(remaining) = ctx.vision.read_timer(region)? else {
            ctx.log.warn("could not read the slot timer");
            return Ok(());
        };
        let Ok(remaining) = chrono::Duration::from_std(remaining) else {
            return Ok(());
        };
        let ready_at = now + remaining;
        ctx.log
            .info(format!("next slot frees up at {}", ready_at.format("%H:%M:%S")));
        ctx.set_metadata(
            self.name(),
            "next_ready_at",
            Value::String(format_timestamp(ready_at)),
        );
        Ok(())
    }
}

fn count_active(slots: &[SlotStatus]) -> u32 {
    slots
        .iter()
        .filter(|s| s.activity.is_working())
        .count() as u32
}

fn preferred(slots: Vec<SlotStatus>, names: &[String]) -> Vec<SlotStatus> {
    if names.is_empty() {
        return slots;
    }
    slots
        .into_iter()
        .filter(|s| names.contains(&s.display_name()))
        .collect()
}

fn confirm(ctx: &TaskContext<'_>, opts: &DispatchOptions) -> Result<bool> {
    match &opts.confirm_template {
        Some(template) => ctx.tap_template(
            &[template],
            "confirm-dispatch",
            Duration::from_secs(3),
            opts.confirm_threshold,
        ),
        None => {
            ctx.tap_button(&opts.confirm_button, "confirm-dispatch")?;
            Ok(true)
        }
    }
}
