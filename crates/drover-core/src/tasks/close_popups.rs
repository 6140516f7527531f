use crate::config::{secs, Params};
use crate::error::Result;
use crate::task::{ParamsExt, Task, TaskContext};

/// Taps the close control of whatever overlay is up, a few times over.
///
/// With `template` set, each round waits for that template and taps where it
/// appears, stopping at the first round where it does not show. Without it
/// the layout button `button` is tapped blindly.
pub struct ClosePopups;

impl Task for ClosePopups {
    fn name(&self) -> &str {
        "close_popups"
    }

    fn run(&self, ctx: &mut TaskContext<'_>, params: &Params) -> Result<()> {
        let attempts = params.u32_or("attempts", 2);
        let button = params.str_or("button", "close_popup");
        let delay = params.f64_or("delay", 0.8);
        let timeout = secs(params.f64_or("template_timeout", 10.0));
        let threshold = params.f64_or("template_threshold", 0.85) as f32;

        let templates = match params.opt_str("template") {
            Some(name) => ctx.templates(&[name]),
            None => Vec::new(),
        };
        let poll = secs(params.f64_or("template_poll_interval", 1.0));

        for idx in 0..attempts {
            ctx.log.info(format!("closing popup #{}", idx + 1));
            let coord = if templates.is_empty() {
                ctx.layout.button(button)?
            } else {
                match ctx.vision.wait_for_any(&templates, threshold, timeout, poll)? {
                    Some(found) => {
                        ctx.log
                            .info(format!("closing popup via '{}'", found.template_name()));
                        found.coord
                    }
                    None => {
                        ctx.log.info(format!(
                            "no popup close control seen (attempt {}); stopping",
                            idx + 1
                        ));
                        break;
                    }
                }
            };
            ctx.tap(coord, "close-popup")?;
            ctx.pause(delay);
        }
        Ok(())
    }
}
