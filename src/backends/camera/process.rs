// SPDX-License-Identifier: GPL-3.0-only

//! External tool invocation
//!
//! Every device interaction goes through a [`CommandRunner`]. Drivers receive
//! one at construction, so the same driver code runs against the real system
//! ([`SystemRunner`]) or against canned tool output ([`ScriptedRunner`]).

use super::types::{BackendError, BackendResult};
use crate::constants::tools;
use std::collections::VecDeque;
use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Captured result of a finished external command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    /// Failed output with the given exit code and stderr
    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, as a shell `2>&1` would show them
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Convert a non-zero exit into [`BackendError::CommandFailed`]
    pub fn into_result(self, program: &str) -> BackendResult<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(BackendError::CommandFailed {
                program: program.to_string(),
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

/// Runs external programs to completion with a timeout
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`, waiting at most `timeout`
    ///
    /// # Returns
    /// * `Ok(CommandOutput)` - The program ran; inspect `status` for its exit code
    /// * `Err(BackendError::NotAvailable)` - The program could not be spawned
    /// * `Err(BackendError::Timeout)` - The program was killed after `timeout`
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> BackendResult<CommandOutput>;

    /// Run and require a zero exit code
    fn run_checked(
        &self,
        program: &str,
        args: &[&str],
        timeout: Duration,
    ) -> BackendResult<CommandOutput> {
        self.run(program, args, timeout)?.into_result(program)
    }
}

/// Runner backed by real child processes
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], timeout: Duration) -> BackendResult<CommandOutput> {
        debug!(program, ?args, "Running external command");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    BackendError::NotAvailable(format!("{} not found", program))
                } else {
                    BackendError::IoError(format!("failed to spawn {}: {}", program, e))
                }
            })?;

        // Drain both pipes on their own threads so a chatty child cannot block on a full pipe
        let stdout_reader = child.stdout.take().map(spawn_pipe_reader);
        let stderr_reader = child.stderr.take().map(spawn_pipe_reader);

        let deadline = Instant::now() + timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break Some(status),
                Ok(None) if Instant::now() >= deadline => break None,
                Ok(None) => std::thread::sleep(tools::WAIT_POLL_INTERVAL),
                Err(e) => {
                    warn!(program, error = %e, "Failed to wait on child");
                    break None;
                }
            }
        };

        let Some(status) = status else {
            let _ = child.kill();
            let _ = child.wait();
            let _ = stdout_reader.map(|h| h.join());
            let _ = stderr_reader.map(|h| h.join());
            warn!(program, timeout_secs = timeout.as_secs(), "External command timed out");
            return Err(BackendError::Timeout {
                program: program.to_string(),
                seconds: timeout.as_secs(),
            });
        };

        let stdout = stdout_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();

        Ok(CommandOutput {
            status: status.code(),
            stdout,
            stderr,
        })
    }
}

fn spawn_pipe_reader<R: Read + Send + 'static>(mut pipe: R) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Check whether `program` resolves to an executable on `PATH`
pub fn is_on_path(program: &str) -> bool {
    use std::os::unix::fs::PermissionsExt;

    let Some(path) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&path).any(|dir| {
        std::fs::metadata(dir.join(program))
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

/// A recorded invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Arguments joined by spaces
    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }

    fn matches(&self, program: &str, patterns: &[String]) -> bool {
        if self.program != program {
            return false;
        }
        let line = self.args.join(" ");
        patterns.iter().all(|p| line.contains(p.as_str()))
    }
}

struct Rule {
    program: String,
    patterns: Vec<String>,
    responses: VecDeque<BackendResult<CommandOutput>>,
}

/// Deterministic runner replaying scripted tool output
///
/// Each rule matches a program name plus substrings that must all appear in
/// the joined argument list. When several rules match, the one with the most
/// patterns wins. A rule's queued responses are consumed in order and the last
/// one repeats. Unmatched invocations exit with status 127.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    log: Mutex<Vec<Invocation>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for invocations of `program` whose arguments contain every pattern
    pub fn respond(&self, program: &str, patterns: &[&str], output: CommandOutput) -> &Self {
        self.push(program, patterns, Ok(output))
    }

    /// Queue an error (spawn failure, timeout) for matching invocations
    pub fn respond_err(&self, program: &str, patterns: &[&str], err: BackendError) -> &Self {
        self.push(program, patterns, Err(err))
    }

    fn push(&self, program: &str, patterns: &[&str], response: BackendResult<CommandOutput>) -> &Self {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(rule) = rules
            .iter_mut()
            .find(|r| r.program == program && r.patterns == patterns)
        {
            rule.responses.push_back(response);
        } else {
            rules.push(Rule {
                program: program.to_string(),
                patterns,
                responses: VecDeque::from([response]),
            });
        }
        self
    }

    /// Every invocation so far, in order
    pub fn invocations(&self) -> Vec<Invocation> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of invocations of `program` whose arguments contain every pattern
    pub fn count(&self, program: &str, patterns: &[&str]) -> usize {
        let patterns: Vec<String> = patterns.iter().map(|p| p.to_string()).collect();
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|inv| inv.matches(program, &patterns))
            .count()
    }

    /// Forget recorded invocations, keeping the rules
    pub fn clear_log(&self) {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str], _timeout: Duration) -> BackendResult<CommandOutput> {
        let invocation = Invocation {
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
        };
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(invocation.clone());

        let mut rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        let rule = rules
            .iter_mut()
            .filter(|r| invocation.matches(&r.program, &r.patterns))
            .max_by_key(|r| r.patterns.len());

        match rule {
            Some(rule) if rule.responses.len() > 1 => rule
                .responses
                .pop_front()
                .unwrap_or_else(|| Ok(CommandOutput::failed(127, "unscripted"))),
            Some(rule) => rule
                .responses
                .front()
                .cloned()
                .unwrap_or_else(|| Ok(CommandOutput::failed(127, "unscripted"))),
            None => Ok(CommandOutput::failed(
                127,
                format!("unscripted: {}", invocation.command_line()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_runner_sequences_and_repeats_last() {
        let runner = ScriptedRunner::new();
        runner
            .respond("gphoto2", &["--list-all-config"], CommandOutput::failed(1, "busy"))
            .respond("gphoto2", &["--list-all-config"], CommandOutput::ok("/main/a"));

        let timeout = Duration::from_secs(1);
        let first = runner.run("gphoto2", &["--list-all-config"], timeout).unwrap();
        let second = runner.run("gphoto2", &["--list-all-config"], timeout).unwrap();
        let third = runner.run("gphoto2", &["--list-all-config"], timeout).unwrap();

        assert!(!first.success());
        assert!(second.success());
        assert_eq!(third.stdout, "/main/a");
        assert_eq!(runner.count("gphoto2", &["--list-all-config"]), 3);
    }

    #[test]
    fn test_scripted_runner_prefers_most_specific_rule() {
        let runner = ScriptedRunner::new();
        runner
            .respond("v4l2-ctl", &[], CommandOutput::ok("generic"))
            .respond("v4l2-ctl", &["--info"], CommandOutput::ok("Video Capture"));

        let out = runner
            .run("v4l2-ctl", &["-d", "/dev/video0", "--info"], Duration::from_secs(1))
            .unwrap();
        assert_eq!(out.stdout, "Video Capture");
    }

    #[test]
    fn test_unscripted_invocation_fails() {
        let runner = ScriptedRunner::new();
        let out = runner.run("lsusb", &[], Duration::from_secs(1)).unwrap();
        assert_eq!(out.status, Some(127));
    }

    #[test]
    fn test_system_runner_missing_program() {
        let err = SystemRunner::new()
            .run("definitely-not-a-real-tool-xyz", &[], Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, BackendError::NotAvailable(_)));
    }

    #[test]
    fn test_combined_output() {
        let out = CommandOutput {
            status: Some(0),
            stdout: "a".into(),
            stderr: "b".into(),
        };
        assert_eq!(out.combined(), "a\nb");
    }
}
