//! Centralized command execution with consistent error handling.
//!
//! Every external tool the build touches (ukify, sbsign, mtools, xorriso,
//! openssl) is run through [`Cmd`], so all of them capture their output,
//! honor a timeout and the build's [`Cancellation`], and fail with a
//! [`BuildError::ToolFailed`] that carries what the tool printed.

use anyhow::{Context, Result};
use log::debug;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::Cancellation;
use crate::error::BuildError;

/// Default upper bound for a single tool invocation.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit status of the command.
    pub status: ExitStatus,
    /// Captured stdout as a string.
    pub stdout: String,
    /// Captured stderr as a string.
    pub stderr: String,
}

impl CommandResult {
    /// Returns true if the command exited successfully.
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Get the exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    /// Get stdout, trimmed of whitespace.
    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Get stderr, trimmed of whitespace.
    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }

    /// stderr followed by stdout, the way the tools' failures are reported.
    fn combined_output(&self) -> String {
        match (self.stderr_trimmed(), self.stdout_trimmed()) {
            ("", out) => out.to_string(),
            (err, "") => err.to_string(),
            (err, out) => format!("{}\n{}", err, out),
        }
    }
}

/// Builder for configuring command execution.
pub struct Cmd {
    program: String,
    args: Vec<String>,
    current_dir: Option<PathBuf>,
    /// If true, don't fail on non-zero exit.
    allow_fail: bool,
    /// Custom error message prefix.
    error_prefix: Option<String>,
    timeout: Duration,
    cancel: Option<Cancellation>,
}

impl Cmd {
    /// Create a new command builder.
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            current_dir: None,
            allow_fail: false,
            error_prefix: None,
            timeout: DEFAULT_TIMEOUT,
            cancel: None,
        }
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().to_string());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for arg in args {
            self.args.push(arg.as_ref().to_string());
        }
        self
    }

    /// Add a path as an argument.
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.to_string_lossy().into_owned());
        self
    }

    /// Set the working directory.
    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Allow non-zero exit codes without failing.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Kill the command if it runs longer than `timeout`.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Kill the command when the build is cancelled.
    pub fn cancel_on(mut self, cancel: &Cancellation) -> Self {
        self.cancel = Some(cancel.clone());
        self
    }

    /// Printable form of the command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }

        debug!("running: {}", self.display());
        let mut child = cmd.spawn().with_context(|| {
            format!("Failed to execute '{}'. Is it installed?", self.program)
        })?;

        let stdout = child.stdout.take().map(spawn_reader);
        let stderr = child.stderr.take().map(spawn_reader);

        let status = self.wait(&mut child);
        let result = CommandResult {
            status: status?,
            stdout: join_reader(stdout),
            stderr: join_reader(stderr),
        };

        if !result.stdout.is_empty() {
            debug!("{} output: {}", self.program, result.stdout_trimmed());
        }

        if !self.allow_fail && !result.success() {
            let context = self
                .error_prefix
                .unwrap_or_else(|| format!("'{}' failed", self.program));
            return Err(BuildError::ToolFailed {
                tool: self.program,
                context,
                code: result.code(),
                output: result.combined_output(),
            }
            .into());
        }

        Ok(result)
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = child
                .try_wait()
                .with_context(|| format!("waiting for '{}'", self.program))?
            {
                return Ok(status);
            }

            if self.cancel.as_ref().is_some_and(Cancellation::is_cancelled) {
                kill(child);
                return Err(BuildError::Cancelled.into());
            }

            if started.elapsed() >= self.timeout {
                kill(child);
                return Err(BuildError::ToolTimeout {
                    tool: self.program.clone(),
                    timeout: self.timeout,
                }
                .into());
            }

            thread::sleep(POLL_INTERVAL);
        }
    }
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

/// Check if a program exists, either as a path or in PATH.
pub fn exists(program: &str) -> bool {
    which::which(program).is_ok()
}
