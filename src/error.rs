//! Error types for ec2-runner-deploy

use thiserror::Error;

/// Main error type for deploy operations
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid rule set: {0}")]
    RuleSet(String),

    #[error("Dependency graph error: {0}")]
    Graph(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to run {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("{program} exited with status {code}: {stderr}")]
    CommandFailed {
        program: String,
        code: i32,
        stderr: String,
    },

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Cloud API error: {0}")]
    Cloud(String),

    #[error("Resource '{resource}' has no output '{key}'")]
    MissingInput { resource: String, key: String },

    #[error("Template error: {0}")]
    Template(String),

    #[error("Packaging error: {0}")]
    Package(String),

    #[error("Step '{step}' failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<DeployError>,
    },
}

impl DeployError {
    /// Wrap an error with the name of the step that produced it
    pub fn step(step: impl Into<String>, source: DeployError) -> Self {
        Self::Step {
            step: step.into(),
            source: Box::new(source),
        }
    }

    /// Create a missing-input error
    pub fn missing(resource: impl Into<String>, key: impl Into<String>) -> Self {
        Self::MissingInput {
            resource: resource.into(),
            key: key.into(),
        }
    }

    /// Name of the failed step, if this error came out of the engine
    pub fn failed_step(&self) -> Option<&str> {
        match self {
            Self::Step { step, .. } => Some(step),
            _ => None,
        }
    }
}
