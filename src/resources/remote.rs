//! Steps that reach the instance over SSH

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use super::{Properties, Resource, RunContext};
use crate::DeployError;
use crate::exec::SshTarget;
use crate::graph::Freshness;
use crate::template::CommandTemplate;

/// Where and how to connect; host and key come from upstream steps
#[derive(Debug, Clone)]
pub struct Connection {
    /// Instance step providing `public_ip`
    pub instance: String,
    /// Credential step providing `private_key_path`
    pub credential: String,
    pub user: String,
    pub connection_attempts: u32,
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
}

impl Connection {
    fn target(&self, ctx: &RunContext) -> Result<SshTarget, DeployError> {
        let host = ctx.require(&self.instance, "public_ip")?;
        let identity = ctx.require(&self.credential, "private_key_path")?;
        let mut target = SshTarget::new(host, self.user.clone(), identity);
        target.connection_attempts = self.connection_attempts;
        target.connect_timeout = self.connect_timeout;
        target.command_timeout = self.command_timeout;
        Ok(target)
    }
}

/// Uploads the packaged archive to the instance
#[derive(Debug, Clone)]
pub struct CopyFile {
    pub name: String,
    /// Packaging step providing `archive`
    pub package: String,
    pub connection: Connection,
    pub remote_path: String,
}

#[async_trait]
impl Resource for CopyFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "command:remote:CopyFile"
    }

    fn dependencies(&self) -> Vec<String> {
        vec![
            self.package.clone(),
            self.connection.instance.clone(),
            self.connection.credential.clone(),
        ]
    }

    fn freshness(&self) -> Freshness {
        Freshness::Always
    }

    async fn create(&self, ctx: &RunContext) -> Result<Properties, DeployError> {
        let target = self.connection.target(ctx)?;
        let local = PathBuf::from(ctx.require(&self.package, "archive")?);

        info!(
            "Uploading {} to {}:{}",
            local.display(),
            target.host,
            self.remote_path
        );
        target
            .copy_file(ctx.runner.as_ref(), &local, &self.remote_path)
            .await?;

        Ok(Properties::new()
            .with("host", target.host.clone())
            .with("remote_path", self.remote_path.clone()))
    }
}

/// Runs the install command on the instance
#[derive(Debug, Clone)]
pub struct RemoteCommand {
    pub name: String,
    /// Upload step that must finish first
    pub upload: String,
    pub connection: Connection,
    /// Command template
    pub command: String,
    pub install_arg: String,
    /// Where the upload step put the archive
    pub remote_path: String,
}

impl RemoteCommand {
    /// Render the command for one host
    pub fn render(&self, host: &str) -> Result<String, DeployError> {
        let archive_name = Path::new(&self.remote_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.remote_path.clone());

        CommandTemplate::new()
            .var("archive_name", archive_name)
            .var("remote_path", self.remote_path.clone())
            .var("install_arg", self.install_arg.clone())
            .var("user", self.connection.user.clone())
            .var("host", host.to_string())
            .render(&self.command)
    }
}

#[async_trait]
impl Resource for RemoteCommand {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &'static str {
        "command:remote:Command"
    }

    fn dependencies(&self) -> Vec<String> {
        vec![
            self.upload.clone(),
            self.connection.instance.clone(),
            self.connection.credential.clone(),
        ]
    }

    fn freshness(&self) -> Freshness {
        Freshness::Always
    }

    async fn create(&self, ctx: &RunContext) -> Result<Properties, DeployError> {
        let target = self.connection.target(ctx)?;
        let command = self.render(&target.host)?;

        info!("Running install on {}", target.host);
        let output = target.exec(ctx.runner.as_ref(), &command).await?;
        debug!(
            "install finished: {} bytes stdout, {} bytes stderr",
            output.stdout.len(),
            output.stderr.len()
        );

        Ok(Properties::new()
            .with("command", command)
            .with("stdout", output.stdout)
            .with("stderr", output.stderr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::mock::ScriptedRunner;
    use crate::graph::TriggerToken;
    use crate::provider::mock::MockEc2;
    use std::sync::Arc;

    use crate::config::InstallConfig;

    fn connection() -> Connection {
        Connection {
            instance: "ec2-runner".to_string(),
            credential: "ec2-runner-key".to_string(),
            user: "ec2-user".to_string(),
            connection_attempts: 5,
            connect_timeout: Duration::from_secs(7),
            command_timeout: Duration::from_secs(60),
        }
    }

    fn install() -> RemoteCommand {
        RemoteCommand {
            name: "install-server-cmd".to_string(),
            upload: "upload-server-cmd".to_string(),
            connection: connection(),
            command: InstallConfig::default().command,
            install_arg: "root".to_string(),
            remote_path: "/home/ec2-user/server.tar.gz".to_string(),
        }
    }

    fn ctx(runner: Arc<ScriptedRunner>) -> RunContext {
        let mut ctx = RunContext::new(Arc::new(MockEc2::new()), runner, TriggerToken::fresh());
        ctx.record(
            "ec2-runner",
            Properties::new().with("public_ip", "203.0.113.10"),
        );
        ctx.record(
            "ec2-runner-key",
            Properties::new().with("private_key_path", ".deploy/dev-ec2-runner-key"),
        );
        ctx.record("tar-cmd", Properties::new().with("archive", "server.tar.gz"));
        ctx
    }

    #[test]
    fn test_render_install_command() {
        assert_eq!(
            install().render("203.0.113.10").unwrap(),
            "rm -rf server && mkdir -p server && tar xzf /home/ec2-user/server.tar.gz -C server && bash ./server/install.sh root"
        );
    }

    #[tokio::test]
    async fn test_custom_remote_path_is_uploaded_and_extracted() {
        let runner = Arc::new(ScriptedRunner::new());
        let ctx = ctx(runner.clone());
        let upload = CopyFile {
            name: "upload-server-cmd".to_string(),
            package: "tar-cmd".to_string(),
            connection: connection(),
            remote_path: "/tmp/server.tar.gz".to_string(),
        };
        let install = RemoteCommand {
            remote_path: "/tmp/server.tar.gz".to_string(),
            ..install()
        };

        upload.create(&ctx).await.unwrap();
        let props = install.create(&ctx).await.unwrap();

        let scp = runner.calls_to("scp");
        assert_eq!(
            scp[0].args.last().map(String::as_str),
            Some("ec2-user@203.0.113.10:/tmp/server.tar.gz")
        );
        let command = props.get("command").unwrap();
        assert!(command.contains("tar xzf /tmp/server.tar.gz -C server"));
        assert!(runner.calls_to("ssh")[0].args.contains(&command.to_string()));
    }

    #[tokio::test]
    async fn test_upload_targets_instance_address() {
        let runner = Arc::new(ScriptedRunner::new());
        let step = CopyFile {
            name: "upload-server-cmd".to_string(),
            package: "tar-cmd".to_string(),
            connection: connection(),
            remote_path: "/home/ec2-user/server.tar.gz".to_string(),
        };

        step.create(&ctx(runner.clone())).await.unwrap();

        let calls = runner.calls_to("scp");
        assert_eq!(calls.len(), 1);
        let args = &calls[0].args;
        assert!(args.contains(&".deploy/dev-ec2-runner-key".to_string()));
        assert!(args.contains(&"ConnectionAttempts=5".to_string()));
        assert_eq!(args[args.len() - 2], "server.tar.gz");
        assert_eq!(
            args[args.len() - 1],
            "ec2-user@203.0.113.10:/home/ec2-user/server.tar.gz"
        );
        assert_eq!(calls[0].timeout, Duration::from_secs(60));
    }

    #[tokio::test]
    async fn test_install_captures_output() {
        let runner = Arc::new(
            ScriptedRunner::new().respond("ssh", Some("install.sh root"), "runner registered\n"),
        );
        let props = install().create(&ctx(runner.clone())).await.unwrap();

        assert_eq!(props.get("stdout"), Some("runner registered\n"));
        assert_eq!(props.get("stderr"), Some(""));
        assert_eq!(runner.calls_to("ssh").len(), 1);
    }

    #[tokio::test]
    async fn test_install_failure_carries_stderr() {
        let runner = Arc::new(ScriptedRunner::new().fail("ssh", None, 3, "install.sh: bad arg\n"));
        let err = install().create(&ctx(runner)).await.unwrap_err();

        match err {
            DeployError::CommandFailed { code, stderr, .. } => {
                assert_eq!(code, 3);
                assert!(stderr.contains("bad arg"));
            }
            other => panic!("expected CommandFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_install_without_instance_address_fails() {
        let runner = Arc::new(ScriptedRunner::new());
        let empty = RunContext::new(Arc::new(MockEc2::new()), runner.clone(), TriggerToken::fresh());

        let err = install().create(&empty).await.unwrap_err();
        assert!(matches!(err, DeployError::MissingInput { .. }));
        assert!(runner.calls().is_empty());
    }
}
