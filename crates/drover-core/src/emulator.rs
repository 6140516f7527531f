//! Emulator instance lifecycle around one target pass.

use crate::config::{secs, EmulatorConfig, TargetConfig};
use crate::diagnostics::TargetLog;
use crate::error::{DroverError, Result};
use crate::process::{run_with_timeout, RunError};
use std::process::{Child, Command, Stdio};

/// Boots the target's emulator instance and quits it again when dropped.
///
/// With no emulator configured the session is inert: the device is assumed
/// to be running already.
pub struct EmulatorSession {
    config: Option<EmulatorConfig>,
    instance: String,
    simulate: bool,
    log: TargetLog,
    player: Option<Child>,
}

impl EmulatorSession {
    pub fn start(
        config: Option<&EmulatorConfig>,
        target: &TargetConfig,
        simulate: bool,
        log: TargetLog,
    ) -> Result<Self> {
        let mut session = Self {
            config: None,
            instance: target.instance.clone(),
            simulate,
            log,
            player: None,
        };
        let Some(cfg) = config.cloned() else {
            return Ok(session);
        };

        session.log.info(format!("starting instance {}", session.instance));
        let args = session.expand(&cfg.start_args);
        if simulate {
            session
                .log
                .info(format!("[simulate] {} {}", cfg.player_path, args.join(" ")));
            session.config = Some(cfg);
            return Ok(session);
        }

        let child = Command::new(&cfg.player_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| DroverError::Emulator(format!("{}: {e}", cfg.player_path)))?;
        session.player = Some(child);
        session.config = Some(cfg.clone());

        let boot = secs(cfg.start_timeout);
        if !boot.is_zero() {
            session.log.info(format!(
                "waiting {:.1}s for the instance to boot",
                boot.as_secs_f64()
            ));
            std::thread::sleep(boot);
        }
        Ok(session)
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    fn expand(&self, template: &[String]) -> Vec<String> {
        template
            .iter()
            .map(|a| a.replace("{instance}", &self.instance))
            .collect()
    }

    fn stop(&mut self) {
        let Some(cfg) = self.config.take() else {
            return;
        };
        self.log.info(format!("closing instance {}", self.instance));
        let args = self.expand(&cfg.stop_args);
        if self.simulate {
            self.log
                .info(format!("[simulate] {} {}", cfg.player_path, args.join(" ")));
            return;
        }

        let mut cmd = Command::new(&cfg.player_path);
        cmd.args(&args);
        match run_with_timeout(&mut cmd, None, false, secs(cfg.shutdown_timeout)) {
            Ok(_) => {}
            Err(RunError::Timeout) => self.log.warn(format!(
                "quit command took longer than {:.1}s",
                cfg.shutdown_timeout
            )),
            Err(RunError::Spawn(e)) => self.log.warn(format!("quit command failed: {e}")),
        }

        if let Some(mut player) = self.player.take() {
            if matches!(player.try_wait(), Ok(None)) {
                self.log.warn("player still running; killing it");
                if let Err(e) = player.kill() {
                    self.log.warn(format!(
                        "could not stop the player ({e}); check the instance manually"
                    ));
                }
                let _ = player.wait();
            }
        }
    }
}

impl Drop for EmulatorSession {
    fn drop(&mut self) {
        self.stop();
    }
}
