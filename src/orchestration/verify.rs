//! Runs a task's verification command.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::core::Verification;
use crate::error::{Error, Result};

/// Keep at most this much of the combined output.
const MAX_OUTPUT_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationOutcome {
    pub passed: bool,
    /// `None` when the process was killed or ended by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    /// Tail of stdout followed by stderr.
    pub output: String,
    pub duration: Duration,
}

impl VerificationOutcome {
    pub fn duration_ms(&self) -> u64 {
        self.duration.as_millis() as u64
    }

    /// One-line failure description for the task record.
    pub fn failure_reason(&self) -> Option<String> {
        if self.passed {
            None
        } else if self.timed_out {
            Some(format!(
                "verification timed out after {}s",
                self.duration.as_secs()
            ))
        } else {
            Some(match self.exit_code {
                Some(code) => format!("verification exited with code {}", code),
                None => "verification terminated by signal".to_string(),
            })
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct VerificationRunner;

impl VerificationRunner {
    /// Run `verification.command` through the shell in `cwd`.
    ///
    /// The process is killed when the timeout expires; that is reported as
    /// a failed outcome with `timed_out`, not as an error. Errors are only
    /// returned when the process cannot be spawned.
    pub async fn run(&self, verification: &Verification, cwd: &Path) -> Result<VerificationOutcome> {
        let timeout = verification.timeout_duration();
        let mut cmd = shell(&verification.command);
        cmd.current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(command = %verification.command, cwd = %cwd.display(), "Starting verification");
        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            Error::Collaborator(format!(
                "Cannot spawn verification {:?}: {}",
                verification.command, e
            ))
        })?;

        let outcome = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => {
                let output = output?;
                let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
                text.push_str(&String::from_utf8_lossy(&output.stderr));
                VerificationOutcome {
                    passed: output.status.success(),
                    exit_code: output.status.code(),
                    timed_out: false,
                    output: tail(&text, MAX_OUTPUT_BYTES),
                    duration: started.elapsed(),
                }
            }
            // The dropped future owns the child, which kill_on_drop reaps.
            Err(_) => VerificationOutcome {
                passed: false,
                exit_code: None,
                timed_out: true,
                output: String::new(),
                duration: started.elapsed(),
            },
        };

        if outcome.passed {
            info!(command = %verification.command, ms = outcome.duration_ms(), "Verification passed");
        } else {
            warn!(
                command = %verification.command,
                exit_code = ?outcome.exit_code,
                timed_out = outcome.timed_out,
                "Verification failed"
            );
        }
        Ok(outcome)
    }
}

fn shell(command: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command);
        c
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn verification(command: &str, timeout: u64) -> Verification {
        Verification::new(command, timeout)
    }

    #[tokio::test]
    async fn test_passing_command() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = VerificationRunner
            .run(&verification("echo ok", 10), dir.path())
            .await
            .unwrap();
        assert!(outcome.passed);
        assert_eq!(outcome.exit_code, Some(0));
        assert_eq!(outcome.output.trim(), "ok");
        assert!(outcome.failure_reason().is_none());
    }

    #[tokio::test]
    async fn test_failing_command_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = VerificationRunner
            .run(&verification("echo broken >&2; exit 3", 10), dir.path())
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert!(!outcome.timed_out);
        assert_eq!(outcome.exit_code, Some(3));
        assert!(outcome.output.contains("broken"));
        assert_eq!(
            outcome.failure_reason().as_deref(),
            Some("verification exited with code 3")
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_process() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = VerificationRunner
            .run(&verification("sleep 30", 1), dir.path())
            .await
            .unwrap();
        assert!(!outcome.passed);
        assert!(outcome.timed_out);
        assert!(outcome.duration < Duration::from_secs(10));
        assert!(outcome.failure_reason().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_runs_in_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let outcome = VerificationRunner
            .run(&verification("test -f marker.txt", 10), dir.path())
            .await
            .unwrap();
        assert!(outcome.passed);
    }

    #[test]
    fn test_tail_respects_char_boundary() {
        let text = "ééé";
        let cut = tail(text, 3);
        assert_eq!(cut, "é");
        assert_eq!(tail("short", 100), "short");
    }
}
