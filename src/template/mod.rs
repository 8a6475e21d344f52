//! Jinja2-compatible command templates
//!
//! The install command and the optional packaging command are templates
//! rendered with values only known mid-run (host, archive name, ...).
//! Unknown variables are an error, so a typo never turns into an empty
//! string inside a shell command.

use crate::DeployError;
use minijinja::{Environment, UndefinedBehavior, Value};
use std::collections::BTreeMap;
use tracing::debug;

/// Template renderer with a fixed set of variables
pub struct CommandTemplate {
    env: Environment<'static>,
    context: BTreeMap<String, Value>,
}

impl CommandTemplate {
    pub fn new() -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Strict);
        Self {
            env,
            context: BTreeMap::new(),
        }
    }

    /// Add a variable to the context
    pub fn var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(name.into(), value.into());
        self
    }

    /// Render a template string
    pub fn render(&self, template: &str) -> Result<String, DeployError> {
        debug!("Rendering command template");

        self.env
            .render_str(template, &self.context)
            .map_err(|e| DeployError::Template(format!("{template:?}: {e}")))
    }
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self::new()
    }
}
