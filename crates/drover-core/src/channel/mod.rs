//! Remote control channel with failure classification and one-shot recovery.
//!
//! Every device interaction goes through [`ControlChannel`]. A command that
//! times out or exits with a known transient code triggers a reconnect and
//! exactly one retry; a second failure of that kind surfaces as
//! [`DroverError::ChannelRecoverable`], which makes the orchestrator restart
//! the routine. Any other exit code is fatal straight away.

pub mod adb;

use crate::config::{AdbConfig, Coord};
use crate::diagnostics::TargetLog;
use crate::error::{DroverError, Result};
use std::time::Duration;
use thiserror::Error;

/// Exit codes that mean the device side went away briefly: a generic adb
/// failure, and the code some emulator builds of adb return while an
/// instance is shutting down (0xFFFFFF89, i.e. -119 as a signed 32-bit value).
pub const RECOVERABLE_EXIT_CODES: [u32; 2] = [1, 0xFFFF_FF89];

const RECONNECT_PAUSE: Duration = Duration::from_millis(500);

pub fn is_recoverable_code(code: i32) -> bool {
    RECOVERABLE_EXIT_CODES.contains(&(code as u32))
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),

    #[error("exited with code {code}")]
    Exit { code: i32, stderr: String },

    #[error("could not start: {0}")]
    Spawn(String),
}

/// Runs one control-tool invocation. `args` excludes the program itself.
pub trait Transport: Send + Sync {
    fn exec(
        &self,
        args: &[String],
        timeout: Duration,
        capture_stdout: bool,
    ) -> std::result::Result<Vec<u8>, TransportError>;
}

/// Called with the channel and a short label right before every tap or swipe.
pub type ActionObserver = Box<dyn Fn(&ControlChannel, &str) + Send + Sync>;

// ---------------------------------------------------------------------------
// ControlChannel
// ---------------------------------------------------------------------------

pub struct ControlChannel {
    transport: Box<dyn Transport>,
    adb: AdbConfig,
    serial: String,
    simulate: bool,
    log: TargetLog,
    observer: Option<ActionObserver>,
    reconnect_pause: Duration,
}

impl ControlChannel {
    pub fn new(
        transport: Box<dyn Transport>,
        adb: &AdbConfig,
        device_port: u16,
        log: TargetLog,
    ) -> Self {
        Self {
            transport,
            serial: format!("{}:{device_port}", adb.host),
            adb: adb.clone(),
            simulate: false,
            log,
            observer: None,
            reconnect_pause: RECONNECT_PAUSE,
        }
    }

    pub fn simulated(mut self, simulate: bool) -> Self {
        self.simulate = simulate;
        self
    }

    pub fn with_action_observer(mut self, observer: ActionObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_reconnect_pause(mut self, pause: Duration) -> Self {
        self.reconnect_pause = pause;
        self
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn is_simulated(&self) -> bool {
        self.simulate
    }

    pub fn log(&self) -> &TargetLog {
        &self.log
    }

    /// Run a device command (`-s <serial>` is prepended) with recovery.
    pub fn execute(&self, args: &[&str], timeout: Option<Duration>) -> Result<Vec<u8>> {
        self.run(self.device_args(args), timeout, false)
    }

    /// Connect to the device and block until it answers.
    pub fn wait_for_device(&self, timeout: Option<Duration>) -> Result<()> {
        let connect_timeout = self.adb.connect_timeout();
        self.log.info(format!("connecting to {}", self.serial));
        self.run(
            vec!["connect".to_string(), self.serial.clone()],
            Some(connect_timeout),
            false,
        )?;
        self.log.info(format!("waiting for device {}", self.serial));
        self.run(
            self.device_args(&["wait-for-device"]),
            Some(timeout.unwrap_or(connect_timeout)),
            false,
        )?;
        Ok(())
    }

    /// Grab the current screen as PNG bytes. `None` in simulate mode.
    pub fn capture(&self) -> Result<Option<Vec<u8>>> {
        let argv = self.device_args(&["exec-out", "screencap", "-p"]);
        if self.simulate {
            self.log_simulated(&argv);
            return Ok(None);
        }
        let max_attempts = self.adb.capture_attempts.max(1);
        let timeout = self.adb.command_timeout();
        for attempt in 1..=max_attempts {
            match self.transport.exec(&argv, timeout, true) {
                Ok(png) => return Ok(Some(png)),
                Err(e) => self.log.warn(format!(
                    "screen capture failed: {e} (attempt {attempt}/{max_attempts})"
                )),
            }
            self.reconnect();
        }
        self.log.error(format!(
            "could not capture the screen after {max_attempts} attempts"
        ));
        Err(DroverError::CaptureFailed {
            serial: self.serial.clone(),
            attempts: max_attempts,
        })
    }

    pub fn tap(&self, coord: Coord, label: &str) -> Result<()> {
        let (x, y) = coord;
        self.notify(&if label.is_empty() {
            format!("tap-{x}-{y}")
        } else {
            format!("tap-{label}")
        });
        self.log.info(format!("tap at ({x}, {y}){}", label_suffix(label)));
        self.execute(
            &["shell", "input", "tap", &x.to_string(), &y.to_string()],
            None,
        )?;
        Ok(())
    }

    pub fn swipe(&self, start: Coord, end: Coord, duration_ms: u32, label: &str) -> Result<()> {
        self.notify(&if label.is_empty() {
            format!("swipe-{}-{}", start.0, start.1)
        } else {
            format!("swipe-{label}")
        });
        self.log.info(format!(
            "swipe ({}, {}) -> ({}, {}){}",
            start.0,
            start.1,
            end.0,
            end.1,
            label_suffix(label)
        ));
        let args = [
            start.0.to_string(),
            start.1.to_string(),
            end.0.to_string(),
            end.1.to_string(),
            duration_ms.to_string(),
        ];
        let mut argv = vec!["shell", "input", "swipe"];
        argv.extend(args.iter().map(String::as_str));
        self.execute(&argv, None)?;
        Ok(())
    }

    /// Pause the flow. Returns immediately in simulate mode.
    pub fn sleep(&self, duration: Duration) {
        if duration.is_zero() {
            return;
        }
        self.log
            .info(format!("waiting {:.1}s", duration.as_secs_f64()));
        if !self.simulate {
            std::thread::sleep(duration);
        }
    }

    /// Best-effort reconnect. Failures are logged and never raised.
    pub fn reconnect(&self) {
        if self.simulate {
            return;
        }
        let timeout = self.adb.connect_timeout();
        self.log
            .info(format!("retrying connection to {}", self.serial));
        let connect = vec!["connect".to_string(), self.serial.clone()];
        if let Err(TransportError::Timeout(_)) = self.transport.exec(&connect, timeout, false) {
            self.log.warn(format!(
                "reconnect to {} timed out; continuing",
                self.serial
            ));
        }
        if !self.reconnect_pause.is_zero() {
            std::thread::sleep(self.reconnect_pause);
        }
        if let Err(e) = self
            .transport
            .exec(&self.device_args(&["wait-for-device"]), timeout, false)
        {
            self.log.warn(format!(
                "device {} did not come back ({e}); continuing",
                self.serial
            ));
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn device_args(&self, args: &[&str]) -> Vec<String> {
        let mut argv = vec!["-s".to_string(), self.serial.clone()];
        argv.extend(args.iter().map(|a| a.to_string()));
        argv
    }

    fn run(&self, argv: Vec<String>, timeout: Option<Duration>, capture: bool) -> Result<Vec<u8>> {
        if self.simulate {
            self.log_simulated(&argv);
            return Ok(Vec::new());
        }
        let timeout = timeout.unwrap_or_else(|| self.adb.command_timeout());
        let command = argv.join(" ");

        match self.transport.exec(&argv, timeout, capture) {
            Ok(out) => return Ok(out),
            Err(TransportError::Timeout(_)) => self.log.warn(format!(
                "`{command}` exceeded {:.1}s; reconnecting before retry",
                timeout.as_secs_f64()
            )),
            Err(TransportError::Exit { code, .. }) if is_recoverable_code(code) => self
                .log
                .warn(format!(
                    "`{command}` failed with code {code}; reconnecting before retry"
                )),
            Err(TransportError::Exit { code, stderr }) => {
                return Err(self.fatal(command, code, &stderr));
            }
            Err(TransportError::Spawn(msg)) => return Err(DroverError::ChannelSpawn(msg)),
        }

        self.reconnect();

        match self.transport.exec(&argv, timeout, capture) {
            Ok(out) => Ok(out),
            Err(TransportError::Timeout(_)) => Err(DroverError::ChannelRecoverable(format!(
                "`{command}` exceeded {:.1}s even after reconnecting",
                timeout.as_secs_f64()
            ))),
            Err(TransportError::Exit { code, .. }) if is_recoverable_code(code) => {
                Err(DroverError::ChannelRecoverable(format!(
                    "`{command}` failed with code {code} after reconnecting"
                )))
            }
            Err(TransportError::Exit { code, stderr }) => Err(self.fatal(command, code, &stderr)),
            Err(TransportError::Spawn(msg)) => Err(DroverError::ChannelSpawn(msg)),
        }
    }

    fn fatal(&self, command: String, code: i32, stderr: &str) -> DroverError {
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            self.log.error(format!("`{command}` stderr: {stderr}"));
        }
        DroverError::ChannelFatal { command, code }
    }

    fn notify(&self, label: &str) {
        if let Some(observer) = &self.observer {
            observer(self, label);
        }
    }

    fn log_simulated(&self, argv: &[String]) {
        self.log.info(format!(
            "[simulate] {} {}",
            self.adb.executable,
            argv.join(" ")
        ));
    }
}

fn label_suffix(label: &str) -> String {
    if label.is_empty() {
        String::new()
    } else {
        format!(" ({label})")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
