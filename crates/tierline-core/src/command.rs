//! Command-backed external collaborators.
//!
//! Each adapter runs an external program and reads its exit status:
//!
//! | exit code                 | meaning                       |
//! |---------------------------|-------------------------------|
//! | 0                         | success, nothing changed      |
//! | `changed_exit_code` (2)   | success, something changed    |
//! | any `transient_exit_codes`| transient failure (retryable) |
//! | anything else             | permanent failure             |
//!
//! Arguments may reference `{environment}`, `{tier}`, `{version}`,
//! `{revision}` and `{label}`. Children are killed when their future is
//! dropped, so stage timeouts never leak processes.

use std::process::Stdio;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::domain::Environment;
use crate::external::{
    ApplyReport, Artifact, CheckContext, CheckReport, ContentStore, Convergence, ExternalError,
    ExternalResult, PlanReport, ProvisioningEngine, SyncReport, ValidationCheck,
};

fn default_changed_exit_code() -> i32 {
    2
}

/// An external command and its exit-code convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    #[serde(default = "default_changed_exit_code")]
    pub changed_exit_code: i32,
    #[serde(default)]
    pub transient_exit_codes: Vec<i32>,
}

impl CommandSpec {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            changed_exit_code: default_changed_exit_code(),
            transient_exit_codes: Vec::new(),
        }
    }

    pub fn with_transient_codes(mut self, codes: &[i32]) -> Self {
        self.transient_exit_codes = codes.to_vec();
        self
    }
}

/// Captured result of one command invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// How an exit status maps onto the convention above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Unchanged,
    Changed,
    Transient,
    Failed,
}

impl CommandOutput {
    pub fn classify(&self, spec: &CommandSpec) -> ExitClass {
        match self.exit_code {
            0 => ExitClass::Unchanged,
            code if code == spec.changed_exit_code => ExitClass::Changed,
            code if spec.transient_exit_codes.contains(&code) => ExitClass::Transient,
            _ => ExitClass::Failed,
        }
    }

    /// Last non-empty stderr line, else stdout's.
    pub fn summary(&self) -> String {
        let last_line = |s: &str| {
            s.lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim().to_string())
        };
        last_line(&self.stderr)
            .or_else(|| last_line(&self.stdout))
            .unwrap_or_else(|| format!("exit code {}", self.exit_code))
    }
}

/// Template variables for one environment/artifact pair.
pub fn template_vars(environment: &Environment, artifact: &Artifact) -> Vec<(&'static str, String)> {
    vec![
        ("environment", environment.name.clone()),
        ("tier", environment.tier.as_str().to_string()),
        (
            "version",
            artifact
                .version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        ),
        ("revision", artifact.revision.clone()),
        ("label", artifact.label()),
    ]
}

fn render(arg: &str, vars: &[(&'static str, String)]) -> String {
    vars.iter().fold(arg.to_string(), |acc, (key, value)| {
        acc.replace(&format!("{{{}}}", key), value)
    })
}

/// Run a command to completion and capture its output.
pub async fn run_command(
    spec: &CommandSpec,
    vars: &[(&'static str, String)],
) -> ExternalResult<CommandOutput> {
    let start = Instant::now();

    let (exe, args) = spec
        .command
        .split_first()
        .ok_or_else(|| ExternalError::Permanent("empty command".to_string()))?;
    let args: Vec<String> = args.iter().map(|a| render(a, vars)).collect();

    tracing::debug!(command = %exe, args = ?args, "running external command");

    let child = Command::new(render(exe, vars))
        .args(&args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ExternalError::Permanent(format!("failed to spawn {}: {}", exe, e)))?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| ExternalError::Permanent(format!("failed to wait for {}: {}", exe, e)))?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

// ---------------------------------------------------------------------------
// Provisioning
// ---------------------------------------------------------------------------

/// [`ProvisioningEngine`] driven by external commands.
#[derive(Debug, Clone)]
pub struct CommandProvisioningEngine {
    apply: CommandSpec,
    plan: Option<CommandSpec>,
    converge: Option<CommandSpec>,
}

impl CommandProvisioningEngine {
    pub fn new(apply: CommandSpec) -> Self {
        Self {
            apply,
            plan: None,
            converge: None,
        }
    }

    pub fn with_plan(mut self, plan: CommandSpec) -> Self {
        self.plan = Some(plan);
        self
    }

    /// Convergence check: exit 0 converged, the changed code means pending.
    pub fn with_converge(mut self, converge: CommandSpec) -> Self {
        self.converge = Some(converge);
        self
    }
}

#[async_trait]
impl ProvisioningEngine for CommandProvisioningEngine {
    async fn apply(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<ApplyReport> {
        let output = run_command(&self.apply, &template_vars(environment, artifact)).await?;
        match output.classify(&self.apply) {
            ExitClass::Unchanged => Ok(ApplyReport {
                success: true,
                changed: false,
                error: None,
            }),
            ExitClass::Changed => Ok(ApplyReport {
                success: true,
                changed: true,
                error: None,
            }),
            ExitClass::Transient => Err(ExternalError::Transient(output.summary())),
            ExitClass::Failed => Ok(ApplyReport {
                success: false,
                changed: false,
                error: Some(output.summary()),
            }),
        }
    }

    async fn plan(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<PlanReport> {
        let Some(spec) = &self.plan else {
            return Ok(PlanReport {
                success: true,
                diff_summary: "no plan command configured".to_string(),
            });
        };
        let output = run_command(spec, &template_vars(environment, artifact)).await?;
        match output.classify(spec) {
            ExitClass::Unchanged => Ok(PlanReport {
                success: true,
                diff_summary: "no changes".to_string(),
            }),
            ExitClass::Changed => Ok(PlanReport {
                success: true,
                diff_summary: output.stdout.trim().to_string(),
            }),
            ExitClass::Transient => Err(ExternalError::Transient(output.summary())),
            ExitClass::Failed => Ok(PlanReport {
                success: false,
                diff_summary: output.summary(),
            }),
        }
    }

    async fn converged(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<Convergence> {
        let Some(spec) = &self.converge else {
            return Ok(Convergence::Converged);
        };
        let output = run_command(spec, &template_vars(environment, artifact)).await?;
        Ok(match output.classify(spec) {
            ExitClass::Unchanged => Convergence::Converged,
            ExitClass::Changed | ExitClass::Transient => Convergence::Pending,
            ExitClass::Failed => Convergence::Failed(output.summary()),
        })
    }
}

// ---------------------------------------------------------------------------
// Content
// ---------------------------------------------------------------------------

/// [`ContentStore`] driven by an external sync command.
#[derive(Debug, Clone)]
pub struct CommandContentStore {
    sync: CommandSpec,
}

impl CommandContentStore {
    pub fn new(sync: CommandSpec) -> Self {
        Self { sync }
    }
}

#[async_trait]
impl ContentStore for CommandContentStore {
    async fn sync(
        &self,
        environment: &Environment,
        artifact: &Artifact,
    ) -> ExternalResult<SyncReport> {
        let output = run_command(&self.sync, &template_vars(environment, artifact)).await?;
        match output.classify(&self.sync) {
            ExitClass::Unchanged => Ok(SyncReport {
                success: true,
                changed: false,
                error: None,
            }),
            ExitClass::Changed => Ok(SyncReport {
                success: true,
                changed: true,
                error: None,
            }),
            ExitClass::Transient => Err(ExternalError::Transient(output.summary())),
            ExitClass::Failed => Ok(SyncReport {
                success: false,
                changed: false,
                error: Some(output.summary()),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// [`ValidationCheck`] that passes when its command exits 0.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    name: String,
    spec: CommandSpec,
}

impl CommandCheck {
    pub fn new(name: &str, spec: CommandSpec) -> Self {
        Self {
            name: name.to_string(),
            spec,
        }
    }
}

#[async_trait]
impl ValidationCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &CheckContext) -> ExternalResult<CheckReport> {
        let mut vars = vec![
            ("environment", ctx.environment.clone()),
            ("stage", ctx.stage.clone()),
            ("revision", ctx.artifact.revision.clone()),
            ("label", ctx.artifact.label()),
        ];
        vars.push((
            "version",
            ctx.artifact
                .version
                .as_ref()
                .map(|v| v.to_string())
                .unwrap_or_default(),
        ));
        let output = run_command(&self.spec, &vars).await?;
        let passed = output.exit_code == 0;
        Ok(CheckReport {
            name: self.name.clone(),
            passed,
            detail: if passed {
                format!("passed in {}ms", output.duration_ms)
            } else {
                output.summary()
            },
        })
    }
}
