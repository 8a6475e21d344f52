//! The runner stack
//!
//! Declares the six steps that provision the runner and wires their edges:
//!
//! ```text
//! ec2-runner-sg ──┐
//!                 ├─> ec2-runner ─> tar-cmd ─> upload-server-cmd ─> install-server-cmd
//! ec2-runner-key ─┘
//! ```
//!
//! Upload and install also read the instance address and the private key,
//! so they carry edges to those steps as well.

use std::time::Duration;

use crate::DeployError;
use crate::config::DeployConfig;
use crate::engine::outputs::{OutputValue, RunOutputs};
use crate::graph::ResourceGraph;
use crate::resources::remote::Connection;
use crate::resources::{
    CopyFile, Credential, Instance, Package, RemoteCommand, Resource, RunContext, SecurityGroup,
};

pub const FIREWALL: &str = "ec2-runner-sg";
pub const CREDENTIAL: &str = "ec2-runner-key";
pub const INSTANCE: &str = "ec2-runner";
pub const PACKAGE: &str = "tar-cmd";
pub const UPLOAD: &str = "upload-server-cmd";
pub const INSTALL: &str = "install-server-cmd";

/// A stack output and where its value comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Export {
    pub key: &'static str,
    pub resource: &'static str,
    pub property: &'static str,
    pub secret: bool,
}

const EXPORTS: [Export; 4] = [
    Export {
        key: "ip",
        resource: INSTANCE,
        property: "public_ip",
        secret: false,
    },
    Export {
        key: "sshKey",
        resource: CREDENTIAL,
        property: "private_key",
        secret: true,
    },
    Export {
        key: "installStdout",
        resource: INSTALL,
        property: "stdout",
        secret: false,
    },
    Export {
        key: "installStderr",
        resource: INSTALL,
        property: "stderr",
        secret: false,
    },
];

/// Declared resources plus the outputs read from them
pub struct Stack {
    pub name: String,
    resources: Vec<Box<dyn Resource>>,
    exports: Vec<Export>,
}

impl Stack {
    /// Declare the runner stack from configuration
    pub fn declare(config: &DeployConfig) -> Self {
        let connection = Connection {
            instance: INSTANCE.to_string(),
            credential: CREDENTIAL.to_string(),
            user: config.instance.user.clone(),
            connection_attempts: config.transfer.connection_attempts,
            connect_timeout: Duration::from_secs(config.transfer.connect_timeout_secs),
            command_timeout: Duration::from_secs(config.transfer.command_timeout_secs),
        };

        let resources: Vec<Box<dyn Resource>> = vec![
            Box::new(SecurityGroup {
                name: FIREWALL.to_string(),
                group_name: config.physical_name(&config.firewall.name),
                stack: config.stack.clone(),
                rules: config.firewall.rules.clone(),
            }),
            Box::new(Credential {
                name: CREDENTIAL.to_string(),
                key_name: config.physical_name(&config.credential.name),
                stack: config.stack.clone(),
                bits: config.credential.bits,
                key_path: config.private_key_path(),
            }),
            Box::new(Instance {
                name: INSTANCE.to_string(),
                instance_name: config.physical_name(&config.instance.name),
                stack: config.stack.clone(),
                image: config.instance.image.clone(),
                instance_type: config.instance.instance_type.clone(),
                firewall: FIREWALL.to_string(),
                credential: CREDENTIAL.to_string(),
            }),
            Box::new(Package {
                name: PACKAGE.to_string(),
                after: INSTANCE.to_string(),
                source_dir: config.package.source_dir.clone(),
                archive: config.package.archive.clone(),
                excludes: config.package.excludes.clone(),
                command: config.package.command.clone(),
            }),
            Box::new(CopyFile {
                name: UPLOAD.to_string(),
                package: PACKAGE.to_string(),
                connection: connection.clone(),
                remote_path: config.transfer.remote_path.clone(),
            }),
            Box::new(RemoteCommand {
                name: INSTALL.to_string(),
                upload: UPLOAD.to_string(),
                connection,
                command: config.install.command.clone(),
                install_arg: config.install.install_arg.clone(),
                remote_path: config.transfer.remote_path.clone(),
            }),
        ];

        Self {
            name: config.stack.clone(),
            resources,
            exports: EXPORTS.to_vec(),
        }
    }

    /// Build a stack from arbitrary resources
    pub fn from_resources(
        name: impl Into<String>,
        resources: Vec<Box<dyn Resource>>,
        exports: Vec<Export>,
    ) -> Self {
        Self {
            name: name.into(),
            resources,
            exports,
        }
    }

    pub fn resources(&self) -> impl Iterator<Item = &dyn Resource> {
        self.resources.iter().map(|r| r.as_ref())
    }

    pub fn resource(&self, name: &str) -> Option<&dyn Resource> {
        self.resources().find(|r| r.name() == name)
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    /// Dependency graph of the declared resources
    pub fn graph(&self) -> Result<ResourceGraph, DeployError> {
        let mut graph = ResourceGraph::new();
        for resource in &self.resources {
            graph.add(resource.name(), &resource.dependencies())?;
        }
        Ok(graph)
    }

    /// Read the exported values out of a finished run
    pub fn export(&self, ctx: &RunContext) -> Result<RunOutputs, DeployError> {
        let entries = self
            .exports
            .iter()
            .map(|export| {
                ctx.require(export.resource, export.property)
                    .map(|value| OutputValue {
                        key: export.key.to_string(),
                        value: value.to_string(),
                        secret: export.secret,
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RunOutputs { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> Stack {
        Stack::declare(&DeployConfig::default())
    }

    #[test]
    fn test_declares_six_steps() {
        let declared = stack();
        let names: Vec<&str> = declared.resources().map(|r| r.name()).collect();
        assert_eq!(
            names,
            vec![FIREWALL, CREDENTIAL, INSTANCE, PACKAGE, UPLOAD, INSTALL]
        );
    }

    #[test]
    fn test_order_runs_commands_after_instance() {
        let order = stack().graph().unwrap().topological_order().unwrap();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();

        assert!(pos(FIREWALL) < pos(INSTANCE));
        assert!(pos(CREDENTIAL) < pos(INSTANCE));
        assert!(pos(INSTANCE) < pos(PACKAGE));
        assert!(pos(PACKAGE) < pos(UPLOAD));
        assert!(pos(UPLOAD) < pos(INSTALL));
    }

    #[test]
    fn test_physical_names_follow_stack() {
        let mut config = DeployConfig::default();
        config.stack = "ci".to_string();
        let stack = Stack::declare(&config);
        assert_eq!(stack.name, "ci");
        assert!(stack.resource(INSTANCE).is_some());
        assert!(stack.resource("nope").is_none());
    }

    #[test]
    fn test_ssh_key_is_the_only_secret() {
        let secrets: Vec<&str> = stack()
            .exports()
            .iter()
            .filter(|e| e.secret)
            .map(|e| e.key)
            .collect();
        assert_eq!(secrets, vec!["sshKey"]);
    }
}
