//! External command execution
//!
//! Every external tool (`aws`, `ssh-keygen`, `scp`, `ssh`, `sh`) is run
//! through [`CommandRunner`], so tests can swap in a scripted runner and
//! never spawn a process.

#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod ssh;

pub use ssh::SshTarget;

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, warn};

use crate::DeployError;

/// Default timeout for short CLI calls (describe, create, import)
pub const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(120);

/// A command to run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new<I, S>(program: &str, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.to_string(),
            args: args.into_iter().map(Into::into).collect(),
            current_dir: None,
            timeout: DEFAULT_CMD_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Program and arguments joined for logs
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Turn a non-zero exit into [`DeployError::CommandFailed`]
    pub fn check(self, program: &str) -> Result<Self, DeployError> {
        if self.success() {
            Ok(self)
        } else {
            Err(DeployError::CommandFailed {
                program: program.to_string(),
                code: self.code.unwrap_or(-1),
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external commands
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; callers decide via
    /// [`CommandOutput::check`].
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError>;
}

/// Production runner on tokio processes
///
/// The child is killed when the timeout expires.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioCommandRunner;

#[async_trait]
impl CommandRunner for TokioCommandRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, DeployError> {
        debug!("Running: {}", spec.display());

        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| DeployError::Spawn {
            program: spec.program.clone(),
            message: e.to_string(),
        })?;

        let mut stdout_handle = child.stdout.take();
        let mut stderr_handle = child.stderr.take();

        // Drain both pipes while waiting, a full pipe would block the child.
        tokio::select! {
            result = async {
                let (status, stdout, stderr) = tokio::join!(
                    child.wait(),
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stdout_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                    async {
                        let mut buf = Vec::new();
                        if let Some(ref mut h) = stderr_handle {
                            let _ = h.read_to_end(&mut buf).await;
                        }
                        buf
                    },
                );
                let status = status.map_err(DeployError::from)?;
                Ok::<_, DeployError>(CommandOutput {
                    code: status.code(),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                })
            } => result,
            () = tokio::time::sleep(spec.timeout) => {
                warn!("{} timed out after {}s, killing it", spec.program, spec.timeout.as_secs());
                let _ = child.kill().await;
                Err(DeployError::Timeout(format!(
                    "{} ({}s)",
                    spec.program,
                    spec.timeout.as_secs()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_display() {
        let spec = CommandSpec::new("aws", ["ec2", "describe-key-pairs"]);
        assert_eq!(spec.display(), "aws ec2 describe-key-pairs");
        assert_eq!(spec.timeout, DEFAULT_CMD_TIMEOUT);
    }

    #[test]
    fn test_check_maps_failure() {
        let output = CommandOutput {
            code: Some(255),
            stdout: String::new(),
            stderr: "Connection refused\n".to_string(),
        };
        match output.check("ssh") {
            Err(DeployError::CommandFailed {
                program,
                code,
                stderr,
            }) => {
                assert_eq!(program, "ssh");
                assert_eq!(code, 255);
                assert_eq!(stderr, "Connection refused");
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_signal_exit_is_failure() {
        let output = CommandOutput {
            code: None,
            ..Default::default()
        };
        assert!(!output.success());
        assert!(output.check("tar").is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output() {
        let spec = CommandSpec::new("sh", ["-c", "echo out; echo err >&2; exit 3"]);
        let output = TokioCommandRunner.run(&spec).await.unwrap();

        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_times_out() {
        let spec = CommandSpec::new("sleep", ["5"]).with_timeout(Duration::from_millis(100));
        let result = TokioCommandRunner.run(&spec).await;
        assert!(matches!(result, Err(DeployError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_tokio_runner_missing_program() {
        let spec = CommandSpec::new("definitely-not-a-real-binary-xyz", Vec::<String>::new());
        let result = TokioCommandRunner.run(&spec).await;
        assert!(matches!(result, Err(DeployError::Spawn { .. })));
    }
}
