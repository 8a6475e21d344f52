//! Config files as an operator would write them

use ec2_runner_deploy::DeployError;
use ec2_runner_deploy::config::{Overrides, Protocol, load_config};
use ec2_runner_deploy::stack::{self, Stack};
use std::path::PathBuf;
use tempfile::TempDir;

#[tokio::test]
async fn test_full_config_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("deploy.yaml");
    std::fs::write(
        &path,
        r#"
stack: prod
region: us-east-1
firewall:
  name: runner-sg
  description: runner access
  ingress:
    - description: SSH
      from_port: 22
      to_port: 22
      protocol: tcp
      cidr_blocks: ["10.0.0.0/8"]
  egress:
    - from_port: 0
      to_port: 0
      protocol: "-1"
      cidr_blocks: ["0.0.0.0/0"]
credential:
  key_dir: /var/lib/deploy/keys
instance:
  instance_type: t3.micro
package:
  source_dir: /srv/app
  excludes: [".bundle", "infrastructure", "tmp"]
install:
  install_arg: ci
"#,
    )
    .unwrap();

    let config = load_config(Some(&path), &Overrides::default()).await.unwrap();

    assert_eq!(config.stack, "prod");
    assert_eq!(config.firewall.rules.ingress.len(), 1);
    assert_eq!(config.firewall.rules.egress[0].protocol, Protocol::All);
    assert_eq!(
        config.private_key_path(),
        PathBuf::from("/var/lib/deploy/keys/prod-ec2-runner-key")
    );
    assert_eq!(config.package.excludes.len(), 3);

    // Custom values flow into the declared stack unchanged.
    let declared = Stack::declare(&config);
    assert!(declared.resource(stack::INSTALL).is_some());
    assert_eq!(declared.name, "prod");
}

#[tokio::test]
async fn test_env_style_overrides() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("deploy.yaml");
    std::fs::write(&path, "stack: dev\nregion: eu-west-1\n").unwrap();

    let overrides = Overrides {
        stack: Some("feature-42".to_string()),
        region: None,
        profile: Some("ci".to_string()),
    };
    let config = load_config(Some(&path), &overrides).await.unwrap();

    assert_eq!(config.stack, "feature-42");
    assert_eq!(config.region.as_deref(), Some("eu-west-1"));
    assert_eq!(config.profile.as_deref(), Some("ci"));
}

#[tokio::test]
async fn test_rule_set_without_ssh_fails_to_load() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("deploy.yaml");
    std::fs::write(
        &path,
        r#"
firewall:
  ingress:
    - from_port: 53
      to_port: 53
      protocol: udp
      cidr_blocks: ["0.0.0.0/0"]
"#,
    )
    .unwrap();

    let err = load_config(Some(&path), &Overrides::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DeployError::RuleSet(_)));
    assert!(err.to_string().contains("tcp/22"));
}
