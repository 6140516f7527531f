use super::{Transport, TransportError};
use crate::process::{run_with_timeout, RunError};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::debug;

/// Runs the adb binary as a child process per command.
pub struct AdbTransport {
    program: PathBuf,
}

impl AdbTransport {
    /// `executable` may be a path or a bare name looked up on `PATH`.
    pub fn new(executable: &str) -> Self {
        let path = Path::new(executable);
        let program = if path.components().count() > 1 || path.is_absolute() {
            path.to_path_buf()
        } else {
            which::which(executable).unwrap_or_else(|_| path.to_path_buf())
        };
        Self { program }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl Transport for AdbTransport {
    fn exec(
        &self,
        args: &[String],
        timeout: Duration,
        capture_stdout: bool,
    ) -> Result<Vec<u8>, TransportError> {
        debug!(program = %self.program.display(), args = ?args, "exec");
        let mut cmd = Command::new(&self.program);
        cmd.args(args);
        match run_with_timeout(&mut cmd, None, capture_stdout, timeout) {
            Ok(done) if done.success => Ok(done.stdout),
            Ok(done) => Err(TransportError::Exit {
                code: done.code,
                stderr: done.stderr,
            }),
            Err(RunError::Timeout) => Err(TransportError::Timeout(timeout)),
            Err(RunError::Spawn(e)) => Err(TransportError::Spawn(format!(
                "{}: {e}",
                self.program.display()
            ))),
        }
    }
}
