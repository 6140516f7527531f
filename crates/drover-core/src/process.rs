//! Child processes with a hard deadline.

use std::io::{Read, Write};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
pub(crate) enum RunError {
    Timeout,
    Spawn(String),
}

#[derive(Debug)]
pub(crate) struct Finished {
    pub success: bool,
    pub code: i32,
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Run `cmd` to completion, killing it once `timeout` passes.
///
/// stdout and stderr are drained on reader threads while waiting, so a child
/// that writes more than a pipe buffer's worth cannot stall.
pub(crate) fn run_with_timeout(
    cmd: &mut Command,
    stdin: Option<&[u8]>,
    capture_stdout: bool,
    timeout: Duration,
) -> Result<Finished, RunError> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(if capture_stdout {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| RunError::Spawn(e.to_string()))?;

    if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
        if let Err(e) = pipe.write_all(data) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(RunError::Spawn(format!("failed to write stdin: {e}")));
        }
    }

    let stdout = child.stdout.take().map(|mut out| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = out.read_to_end(&mut buf);
            buf
        })
    });
    let stderr = child.stderr.take().map(|mut err| {
        thread::spawn(move || {
            let mut buf = String::new();
            let _ = err.read_to_string(&mut buf);
            buf
        })
    });

    let start = Instant::now();
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(RunError::Timeout);
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => {
                let _ = child.kill();
                return Err(RunError::Spawn(e.to_string()));
            }
        }
    };

    Ok(Finished {
        success: status.success(),
        code: status.code().unwrap_or(-1),
        stdout: stdout.and_then(|h| h.join().ok()).unwrap_or_default(),
        stderr: stderr.and_then(|h| h.join().ok()).unwrap_or_default(),
    })
}
