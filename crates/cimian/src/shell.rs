// Copyright 2024-2025 Windows Admins Open Source
// SPDX-License-Identifier: Apache-2.0
// SPDX-License-Identifier: MIT

use std::{
    borrow::Cow,
    io::{BufRead, BufReader},
    process::{Command, Output, Stdio},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

pub trait CommandExt {
    /// Runs the command to completion, streaming its output into the log and
    /// capturing it, without treating a non-zero exit as an I/O error.
    /// Native installers encode meaning into their exit codes, so callers
    /// must inspect the status themselves.
    fn output_captured(&mut self) -> std::io::Result<Output>;
    /// Like [`CommandExt::output_captured`] but kills the child once
    /// `timeout` elapses. The caller decides how to surface the kill.
    fn output_with_timeout(&mut self, timeout: Duration) -> std::io::Result<WaitedOutput>;
}

/// Output of a command run under a deadline.
pub struct WaitedOutput {
    /// `None` when the child was killed because it outlived the deadline.
    pub output: Option<Output>,
}

impl CommandExt for Command {
    fn output_captured(&mut self) -> std::io::Result<Output> {
        output_captured_inner(self, None)
    }

    fn output_with_timeout(&mut self, timeout: Duration) -> std::io::Result<WaitedOutput> {
        match output_captured_inner(self, Some(timeout)) {
            Ok(output) => Ok(WaitedOutput {
                output: Some(output),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(WaitedOutput { output: None }),
            Err(e) => Err(e),
        }
    }
}

fn output_captured_inner(
    cmd: &mut Command,
    timeout: Option<Duration>,
) -> std::io::Result<Output> {
    tracing::debug!("Running Command `{cmd:?}`");

    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    let mut stdout = child.stdout.take().map(BufReader::new).unwrap();
    let stdout_lines = Arc::new(Mutex::new(Vec::new()));
    let stdout_lines_ = stdout_lines.clone();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut lines = stdout_lines_.lock().unwrap();
        loop {
            buf.clear();
            match stdout.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                _ => (),
            }
            log(
                "stdout",
                String::from_utf8_lossy(buf.strip_suffix(b"\n").unwrap_or(&buf)),
            );
            lines.extend(&buf);
        }
    });

    let mut stderr = child.stderr.take().map(BufReader::new).unwrap();
    let stderr_lines = Arc::new(Mutex::new(Vec::new()));
    let stderr_lines_ = stderr_lines.clone();
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let mut lines = stderr_lines_.lock().unwrap();
        loop {
            buf.clear();
            match stderr.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                _ => (),
            }
            log(
                "stderr",
                String::from_utf8_lossy(buf.strip_suffix(b"\n").unwrap_or(&buf)),
            );
            lines.extend(&buf);
        }
    });

    let status = match timeout {
        None => child.wait()?,
        Some(timeout) => {
            let deadline = Instant::now() + timeout;
            loop {
                if let Some(status) = child.try_wait()? {
                    break status;
                }
                if Instant::now() >= deadline {
                    kill_tree(&mut child);
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "command exceeded its deadline",
                    ));
                }
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    };

    let stdout = std::mem::take(&mut *stdout_lines.lock().unwrap());
    let stderr = std::mem::take(&mut *stderr_lines.lock().unwrap());
    Ok(Output {
        status,
        stdout,
        stderr,
    })
}

// taskkill /T takes the whole process tree down; installers commonly fork
// helper processes that would otherwise outlive the kill.
fn kill_tree(child: &mut std::process::Child) {
    #[cfg(windows)]
    {
        let _ = Command::new("taskkill")
            .args(["/F", "/T", "/PID", &child.id().to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
    let _ = child.kill();
    let _ = child.wait();
}

#[inline]
fn log(shell: &str, msg: Cow<'_, str>) {
    tracing::debug!(shell = shell, "{msg}");
}
