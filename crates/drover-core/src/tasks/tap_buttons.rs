use crate::config::{secs, Params};
use crate::error::{DroverError, Result};
use crate::task::{ParamsExt, Task, TaskContext};

/// Taps a fixed sequence of layout buttons, optionally backing out afterwards.
pub struct TapButtons;

impl Task for TapButtons {
    fn name(&self) -> &str {
        "tap_buttons"
    }

    fn run(&self, ctx: &mut TaskContext<'_>, params: &Params) -> Result<()> {
        let buttons = params.str_list("buttons");
        if buttons.is_empty() {
            return Err(DroverError::task_failed(self.name(), "no buttons configured"));
        }
        let repeat = params.u32_or("repeat", 1).max(1);
        let delay = params.f64_or("delay", 1.0);

        for round in 0..repeat {
            if repeat > 1 {
                ctx.log.info(format!("button sequence {}/{repeat}", round + 1));
            }
            for button in &buttons {
                ctx.tap_button(button, button)?;
                ctx.pause(delay);
            }
        }

        if params.bool_or("back_after", false) {
            let timeout = secs(params.f64_or("back_timeout", 4.0));
            let threshold = params.f64_or("back_threshold", 0.83) as f32;
            if !ctx.tap_back_button("tap-buttons-exit", timeout, threshold)? {
                ctx.log.warn("could not leave the screen via the back button");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perception::BlindPerception;
    use crate::testing::{Hit, Rig, ScriptedPerception, FARM_YAML};
    use serde_json::json;

    fn params(value: serde_json::Value) -> Params {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn taps_buttons_in_order_per_round() {
        let mut rig = Rig::new(FARM_YAML);
        let vision = BlindPerception;
        let mut ctx = rig.ctx(&vision);
        TapButtons
            .run(
                &mut ctx,
                &params(json!({"buttons": ["mail", "claim"], "repeat": 2, "delay": 0})),
            )
            .unwrap();
        assert_eq!(
            rig.transport.taps(),
            vec![(10, 20), (30, 40), (10, 20), (30, 40)]
        );
    }

    #[test]
    fn empty_button_list_fails_the_task() {
        let mut rig = Rig::new(FARM_YAML);
        let vision = BlindPerception;
        let mut ctx = rig.ctx(&vision);
        let err = TapButtons.run(&mut ctx, &Params::new()).unwrap_err();
        assert!(matches!(err, DroverError::TaskFailed { .. }));
    }

    #[test]
    fn back_after_taps_detected_back_button() {
        let mut rig = Rig::new(FARM_YAML);
        let vision = ScriptedPerception::steady(vec![Hit::at("back_button", (20, 900))]);
        let mut ctx = rig.ctx(&vision);
        TapButtons
            .run(
                &mut ctx,
                &params(json!({"buttons": "mail", "delay": 0, "back_after": true})),
            )
            .unwrap();
        assert_eq!(rig.transport.taps(), vec![(10, 20), (20, 900)]);
    }
}
