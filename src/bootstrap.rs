//! The end-to-end bootstrap: validate, provision, check ports, launch.

use anyhow::{anyhow, bail, Context, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::models::Manifest;
use crate::plan::{self, ExecPlan};
use crate::ports::{self, PortTable};
use crate::provision::{self, Provisioner};
use crate::runners::models::RunSummary;
use crate::runners::{RunCtx, Runner};
use crate::validate::{validate, ValidationReport};

#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    pub workflow: Option<String>,
    pub skip_provision: bool,
    pub allow_bound: bool,
    pub strict: bool,
    pub record_path: Option<PathBuf>,
}

/// Manifest `[env]` overlaid with `KEY=VALUE` overrides; overrides win.
pub fn merged_env(m: &Manifest, overrides: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: BTreeMap<String, String> = m.env.clone();
    for (k, v) in overrides {
        env.insert(k.clone(), v.clone());
    }
    env.into_iter().collect()
}

/// Parses a `KEY=VALUE` pair as given on the command line.
pub fn parse_env_pair(s: &str) -> Result<(String, String)> {
    let (k, v) = s.split_once('=').ok_or_else(|| anyhow!("expected KEY=VALUE, got '{}'", s))?;
    if k.trim().is_empty() {
        bail!("empty variable name in '{}'", s);
    }
    Ok((k.trim().to_string(), v.to_string()))
}

/// Validation gate shared by every command that executes something.
pub fn ensure_valid(m: &Manifest, strict: bool) -> Result<ValidationReport> {
    let report = validate(m);
    for issue in &report.issues {
        tracing::warn!("{}", issue);
    }
    if !report.passes(strict) {
        let first = report.errors().next().or(report.issues.first()).map(ToString::to_string).unwrap_or_default();
        bail!("manifest is invalid ({} issue(s)); first: {}", report.issues.len(), first);
    }
    Ok(report)
}

pub fn resolve_workflow(m: &Manifest, name: Option<&str>) -> Result<ExecPlan> {
    let name = match name {
        Some(n) => n,
        None => plan::default_workflow(m)
            .ok_or_else(|| anyhow!("no workflow given and the manifest has no runButton"))?,
    };
    plan::resolve(m, name)
}

/// provision environment → install dependencies → start process → bind ports
pub async fn up(
    m: &Manifest,
    provisioner: &dyn Provisioner,
    runner: &dyn Runner,
    opts: &UpOptions,
    mut ctx: RunCtx,
) -> Result<RunSummary> {
    ensure_valid(m, opts.strict)?;
    let plan = resolve_workflow(m, opts.workflow.as_deref())?;

    if opts.skip_provision {
        tracing::info!("skipping provisioning");
    } else {
        provision::check_runtimes(&m.modules).await;
        provision::provision(provisioner, m.packages(), opts.record_path.as_deref(), false)
            .await
            .context("provisioning native packages")?;
    }

    ctx.ports = PortTable::from(m.ports.as_slice());
    let taken = ports::preflight(&ctx.ports).await;
    if !taken.is_empty() && !opts.allow_bound {
        bail!("local port(s) already bound: {:?}", taken);
    }

    tracing::info!("starting workflow via {} runner", runner.name());
    let summary = runner.run(&plan, &ctx).await?;
    finish(summary)
}

/// Runs the deployment's optional build, then its run command.
pub async fn deploy(m: &Manifest, runner: &dyn Runner, strict: bool, mut ctx: RunCtx) -> Result<RunSummary> {
    ensure_valid(m, strict)?;
    let deployment = m.deployment.as_ref().ok_or_else(|| anyhow!("manifest has no [deployment] section"))?;
    if deployment.run.is_empty() {
        bail!("deployment.run is empty");
    }
    ctx.ports = PortTable::from(m.ports.as_slice());

    if let Some(build) = deployment.build.as_ref().filter(|b| !b.is_empty()) {
        let summary = runner.run_argv("deployment-build", build, &ctx).await?;
        finish(summary).context("deployment build")?;
    }
    let summary = runner.run_argv("deployment", &deployment.run, &ctx).await?;
    finish(summary)
}

fn finish(summary: RunSummary) -> Result<RunSummary> {
    if let Some(failed) = summary.first_failure() {
        bail!(
            "[{}] '{}' failed: {}",
            failed.workflow,
            failed.command,
            failed.error.as_deref().unwrap_or("non-zero exit")
        );
    }
    Ok(summary)
}
