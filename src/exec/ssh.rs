//! OpenSSH client invocations for the remote steps
//!
//! Host keys are not pinned: the instance is brand new on first contact and
//! its address is reassigned whenever it is replaced. Connection retries
//! while the instance boots are left to OpenSSH's `ConnectionAttempts`.

use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use super::{CommandOutput, CommandRunner, CommandSpec};
use crate::DeployError;

#[cfg(windows)]
const NULL_DEVICE: &str = "NUL";
#[cfg(not(windows))]
const NULL_DEVICE: &str = "/dev/null";

/// Remote end of the secured channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub user: String,
    pub identity: PathBuf,
    pub connection_attempts: u32,
    pub connect_timeout: Duration,
    /// Upper bound for one scp/ssh invocation
    pub command_timeout: Duration,
}

impl SshTarget {
    pub fn new(host: impl Into<String>, user: impl Into<String>, identity: impl AsRef<Path>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            identity: identity.as_ref().to_path_buf(),
            connection_attempts: 30,
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(600),
        }
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Options shared by scp and ssh
    fn common_args(&self) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.identity.to_string_lossy().into_owned(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            format!("UserKnownHostsFile={NULL_DEVICE}"),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectionAttempts={}", self.connection_attempts),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs()),
        ]
    }

    /// scp invocation copying `local` to `remote` on the target
    pub fn copy_spec(&self, local: &Path, remote: &str) -> CommandSpec {
        let mut args = self.common_args();
        args.push(local.to_string_lossy().into_owned());
        args.push(format!("{}:{}", self.destination(), remote));
        CommandSpec::new("scp", args).with_timeout(self.command_timeout)
    }

    /// ssh invocation running `command` in the login shell of the target
    pub fn exec_spec(&self, command: &str) -> CommandSpec {
        let mut args = self.common_args();
        args.push(self.destination());
        args.push(command.to_string());
        CommandSpec::new("ssh", args).with_timeout(self.command_timeout)
    }

    /// Copy a local file to the target
    pub async fn copy_file(
        &self,
        runner: &dyn CommandRunner,
        local: &Path,
        remote: &str,
    ) -> Result<(), DeployError> {
        debug!("Copying {} to {}:{}", local.display(), self.host, remote);
        runner.run(&self.copy_spec(local, remote)).await?.check("scp")?;
        Ok(())
    }

    /// Run a command on the target, failing on non-zero exit
    pub async fn exec(
        &self,
        runner: &dyn CommandRunner,
        command: &str,
    ) -> Result<CommandOutput, DeployError> {
        debug!("Running on {}: {}", self.host, command);
        runner.run(&self.exec_spec(command)).await?.check("ssh")
    }
}
