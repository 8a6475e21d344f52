//! Stack execution
//!
//! Steps run one at a time in dependency order. `Once` steps are looked up
//! first and reused when found; `Always` steps execute on every run and are
//! stamped with the run's trigger token. The first failure stops the run
//! and nothing is exported.

pub mod outputs;

pub use outputs::{OutputValue, RunOutputs};

use std::sync::Arc;
use tracing::{Instrument, info, info_span};

use crate::DeployError;
use crate::exec::CommandRunner;
use crate::graph::{Freshness, TriggerToken};
use crate::provider::Ec2Api;
use crate::resources::{Properties, Resource, RunContext};
use crate::stack::Stack;

/// What happened (or would happen) to a step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Resource did not exist and was created
    Create,
    /// Existing resource found and reused
    Reuse,
    /// Command executed for this run
    Run,
}

impl std::fmt::Display for StepAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // pad() so column widths in previews apply
        f.pad(match self {
            Self::Create => "create",
            Self::Reuse => "reuse",
            Self::Run => "run",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepReport {
    pub name: String,
    pub kind: &'static str,
    pub action: StepAction,
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub token: TriggerToken,
    pub steps: Vec<StepReport>,
    pub outputs: RunOutputs,
}

impl RunReport {
    pub fn action(&self, step: &str) -> Option<StepAction> {
        self.steps.iter().find(|s| s.name == step).map(|s| s.action)
    }
}

/// Applies stacks against one cloud account
pub struct Engine {
    ec2: Arc<dyn Ec2Api>,
    runner: Arc<dyn CommandRunner>,
}

impl Engine {
    pub fn new(ec2: Arc<dyn Ec2Api>, runner: Arc<dyn CommandRunner>) -> Self {
        Self { ec2, runner }
    }

    /// Work out what `up` would do without creating or running anything
    pub async fn preview(&self, stack: &Stack) -> Result<Vec<StepReport>, DeployError> {
        let order = stack.graph()?.topological_order()?;
        let ctx = RunContext::new(self.ec2.clone(), self.runner.clone(), TriggerToken::fresh());

        let mut steps = Vec::with_capacity(order.len());
        for name in order {
            let resource = find(stack, &name)?;
            let action = match resource.freshness() {
                Freshness::Always => StepAction::Run,
                Freshness::Once => match resource.lookup(&ctx).await {
                    Ok(Some(_)) => StepAction::Reuse,
                    Ok(None) => StepAction::Create,
                    Err(e) => return Err(DeployError::step(name, e)),
                },
            };
            steps.push(StepReport {
                name,
                kind: resource.kind(),
                action,
            });
        }
        Ok(steps)
    }

    /// Bring the stack up with a new trigger token
    pub async fn up(&self, stack: &Stack) -> Result<RunReport, DeployError> {
        self.up_with_token(stack, TriggerToken::fresh()).await
    }

    pub async fn up_with_token(
        &self,
        stack: &Stack,
        token: TriggerToken,
    ) -> Result<RunReport, DeployError> {
        let span = info_span!("run", stack = %stack.name, run_id = %token.run_id());
        self.apply(stack, token).instrument(span).await
    }

    async fn apply(&self, stack: &Stack, token: TriggerToken) -> Result<RunReport, DeployError> {
        let order = stack.graph()?.topological_order()?;
        info!(
            "Applying {} steps via {} (trigger {})",
            order.len(),
            self.ec2.name(),
            token
        );

        let mut ctx = RunContext::new(self.ec2.clone(), self.runner.clone(), token);
        let mut steps = Vec::with_capacity(order.len());

        for name in order {
            let resource = find(stack, &name)?;
            let span = info_span!("step", name = %name);
            let (action, properties) = execute(resource, &ctx, token)
                .instrument(span)
                .await
                .map_err(|e| DeployError::step(name.clone(), e))?;

            info!("{} {} ({})", action, name, resource.kind());
            ctx.record(&name, properties);
            steps.push(StepReport {
                name,
                kind: resource.kind(),
                action,
            });
        }

        let outputs = stack.export(&ctx)?;
        info!("Stack {} is up", stack.name);
        Ok(RunReport {
            token,
            steps,
            outputs,
        })
    }
}

fn find<'a>(stack: &'a Stack, name: &str) -> Result<&'a dyn Resource, DeployError> {
    stack
        .resource(name)
        .ok_or_else(|| DeployError::Graph(format!("no resource named '{name}'")))
}

async fn execute(
    resource: &dyn Resource,
    ctx: &RunContext,
    token: TriggerToken,
) -> Result<(StepAction, Properties), DeployError> {
    match resource.freshness() {
        Freshness::Once => {
            if let Some(found) = resource.lookup(ctx).await? {
                return Ok((StepAction::Reuse, resource.reconcile(ctx, found).await?));
            }
            Ok((StepAction::Create, resource.create(ctx).await?))
        }
        Freshness::Always => {
            let mut properties = resource.create(ctx).await?;
            properties.insert("trigger", token.value());
            Ok((StepAction::Run, properties))
        }
    }
}
