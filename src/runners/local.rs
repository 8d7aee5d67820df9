// src/runners/local.rs
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use futures_util::future::{join_all, BoxFuture, FutureExt};
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use which::which;

use super::models::{LeafOutcome, RunSummary};
use super::{RunCtx, Runner};
use crate::config::SHELL;
use crate::plan::ExecPlan;
use crate::ports::wait_for_port;

/// Runs workflows as child processes of this machine.
pub struct LocalRunner;

#[async_trait::async_trait]
impl Runner for LocalRunner {
    fn name(&self) -> &'static str { "local" }

    async fn run(&self, plan: &ExecPlan, ctx: &RunCtx) -> Result<RunSummary> {
        if which(SHELL).is_err() {
            bail!("{} not found on PATH (required for shell.exec tasks)", SHELL);
        }
        let started_at = Utc::now();
        let leaves = interruptible(exec_plan(plan, ctx)).await?;
        Ok(RunSummary { started_at, leaves })
    }

    async fn run_argv(&self, label: &str, argv: &[String], ctx: &RunCtx) -> Result<RunSummary> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command for {}", label))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        let started_at = Utc::now();
        let leaf = interruptible(run_leaf(label, &argv.join(" "), cmd, None, ctx)).await?;
        Ok(RunSummary { started_at, leaves: vec![leaf] })
    }
}

/// Races `fut` against Ctrl-C.
async fn interruptible<T>(fut: impl Future<Output = T> + Send) -> Result<T> {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            // no signal handler available, never interrupt
            std::future::pending::<()>().await;
        }
    };
    interruptible_with(fut, ctrl_c).await
}

/// Races `fut` against `cancel`. Dropping `fut` kills its children (`kill_on_drop`).
async fn interruptible_with<T>(
    fut: impl Future<Output = T> + Send,
    cancel: impl Future<Output = ()> + Send,
) -> Result<T> {
    tokio::select! {
        out = fut => Ok(out),
        () = cancel => {
            tracing::warn!("interrupted, stopping all processes");
            bail!("interrupted")
        }
    }
}

fn exec_plan<'a>(plan: &'a ExecPlan, ctx: &'a RunCtx) -> BoxFuture<'a, Vec<LeafOutcome>> {
    async move {
        match plan {
            ExecPlan::Shell { workflow, command, wait_for_port } => {
                let mut cmd = Command::new(SHELL);
                cmd.arg("-c").arg(command);
                vec![run_leaf(workflow, command, cmd, *wait_for_port, ctx).await]
            }
            ExecPlan::Sequential { workflow, steps } => {
                let mut out = vec![];
                for s in steps {
                    let leaves = exec_plan(s, ctx).await;
                    let failed = leaves.iter().any(|l| !l.success());
                    out.extend(leaves);
                    if failed {
                        tracing::warn!("workflow '{}' stopped after a failed step", workflow);
                        break;
                    }
                }
                out
            }
            ExecPlan::Parallel { workflow, steps } => {
                tracing::info!("workflow '{}': starting {} branches in parallel", workflow, steps.len());
                join_all(steps.iter().map(|s| exec_plan(s, ctx)))
                    .await
                    .into_iter()
                    .flatten()
                    .collect()
            }
        }
    }
    .boxed()
}

async fn run_leaf(
    workflow: &str,
    command: &str,
    mut cmd: Command,
    wait_port: Option<u16>,
    ctx: &RunCtx,
) -> LeafOutcome {
    let started = Instant::now();
    let mut outcome = LeafOutcome {
        workflow: workflow.to_string(),
        command: command.to_string(),
        exit_code: None,
        wait_for_port: wait_port,
        ready: false,
        elapsed_ms: 0,
        error: None,
    };

    if let Err(e) = drive(&mut outcome, &mut cmd, ctx).await {
        outcome.error = Some(format!("{e:#}"));
    }
    outcome.elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

    match &outcome.error {
        None => tracing::info!("[{}] '{}' finished in {} ms", workflow, command, outcome.elapsed_ms),
        Some(e) => tracing::warn!("[{}] '{}' failed: {}", workflow, command, e),
    }
    outcome
}

enum Gate {
    Exited(std::io::Result<ExitStatus>),
    Ready(Result<Duration>),
}

async fn drive(outcome: &mut LeafOutcome, cmd: &mut Command, ctx: &RunCtx) -> Result<()> {
    for (k, v) in &ctx.env {
        cmd.env(k, v);
    }
    if let Some(dir) = &ctx.cwd {
        cmd.current_dir(dir);
    }

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("spawning '{}' for workflow {}", outcome.command, outcome.workflow))?;
    tracing::info!("[{}] started '{}' (pid {:?})", outcome.workflow, outcome.command, child.id());

    let stdout = child.stdout.take().ok_or_else(|| anyhow!("child stdout was not captured"))?;
    let stderr = child.stderr.take().ok_or_else(|| anyhow!("child stderr was not captured"))?;
    let pump_out = pump(stdout, format!("[{}][stdout] ", outcome.workflow), ctx.quiet, false);
    let pump_err = pump(stderr, format!("[{}][stderr] ", outcome.workflow), ctx.quiet, true);

    if let Some(port) = outcome.wait_for_port {
        let gate = tokio::select! {
            status = child.wait() => Gate::Exited(status),
            ready = wait_for_port(port, ctx.ready_timeout, ctx.ready_interval) => Gate::Ready(ready),
        };
        match gate {
            Gate::Exited(status) => {
                let status = status?;
                outcome.exit_code = status.code();
                bail!("process exited with {} before port {} opened", status, port);
            }
            Gate::Ready(Err(e)) => {
                let _ = child.kill().await;
                return Err(e);
            }
            Gate::Ready(Ok(after)) => {
                outcome.ready = true;
                match ctx.ports.external_for(port) {
                    Some(ext) => tracing::info!("[{}] ready on port {} (external {}) after {:?}", outcome.workflow, port, ext, after),
                    None => tracing::info!("[{}] ready on port {} after {:?}", outcome.workflow, port, after),
                }
            }
        }
    }

    let status = child.wait().await?;
    let _ = pump_out.await;
    let _ = pump_err.await;

    outcome.exit_code = status.code();
    if !status.success() {
        bail!("'{}' failed with {}", outcome.command, status);
    }
    Ok(())
}

fn pump<R>(reader: R, tag: String, quiet: bool, to_stderr: bool) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        // raw bytes: a pipe must be drained to EOF even when the child writes non-UTF-8
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!("{}read error: {}", tag, e);
                    break;
                }
            }
            if quiet {
                continue;
            }
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if to_stderr {
                eprintln!("{tag}{line}");
            } else {
                println!("{tag}{line}");
            }
        }
    })
}
