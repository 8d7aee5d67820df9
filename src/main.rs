use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use envboot::bootstrap::{self, UpOptions};
use envboot::config::LOG_ENV;
use envboot::manifest;
use envboot::models::Manifest;
use envboot::provision::{self, DryRunProvisioner, NixProvisioner, ProvisionRecord, Provisioner};
use envboot::runners::local::LocalRunner;
use envboot::runners::models::RunSummary;
use envboot::runners::{RunCtx, Runner};
use envboot::validate::validate;

#[derive(Parser, Debug)]
#[command(name="envboot", version, about="Bootstrap an environment from its manifest")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to the manifest (defaults to $ENVBOOT_MANIFEST, then .replit)
    #[arg(short, long, global = true)]
    manifest: Option<PathBuf>,
    /// Verbose logs
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate the manifest
    Check {
        /// Treat warnings as failures
        #[arg(long)]
        strict: bool,
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the parsed manifest as JSON
    Show,
    /// Print the resolved execution tree of a workflow
    Plan {
        workflow: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Install the native packages and check runtime modules
    Provision {
        #[arg(long)]
        dry_run: bool,
        /// Reinstall even packages recorded as provisioned
        #[arg(long)]
        force: bool,
    },
    /// Run a workflow (default: the run button)
    Run {
        workflow: Option<String>,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Provision, then start a workflow (default: the run button)
    Up {
        workflow: Option<String>,
        #[arg(long)]
        skip_provision: bool,
        #[arg(long)]
        dry_run: bool,
        /// Start even if a mapped local port is already bound
        #[arg(long)]
        allow_bound: bool,
        #[arg(long)]
        strict: bool,
        #[command(flatten)]
        launch: LaunchArgs,
    },
    /// Run the deployment command
    Deploy {
        #[arg(long)]
        strict: bool,
        #[command(flatten)]
        launch: LaunchArgs,
    },
}

#[derive(clap::Args, Debug)]
struct LaunchArgs {
    /// Extra environment for launched processes (KEY=VALUE)
    #[arg(short = 'e', long = "env", value_parser = parse_env)]
    env: Vec<(String, String)>,
    /// Working directory for launched processes
    #[arg(long)]
    cwd: Option<PathBuf>,
    /// Print a JSON run summary when done
    #[arg(long)]
    summary: bool,
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    bootstrap::parse_env_pair(s).map_err(|e| e.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var(LOG_ENV).unwrap_or_else(|_| filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let path = manifest::locate(cli.manifest.as_deref());
    let m = manifest::load(&path)?;
    tracing::info!("loaded manifest {}", path.display());

    match cli.command {
        Commands::Check { strict, json } => cmd_check(&m, strict, json)?,
        Commands::Show => println!("{}", serde_json::to_string_pretty(&m)?),
        Commands::Plan { workflow, json } => cmd_plan(&m, workflow, json)?,
        Commands::Provision { dry_run, force } => cmd_provision(&m, dry_run, force).await?,
        Commands::Run { workflow, launch } => cmd_run(&m, workflow, launch).await?,
        Commands::Up { workflow, skip_provision, dry_run, allow_bound, strict, launch } => {
            let opts = UpOptions {
                workflow,
                skip_provision,
                allow_bound,
                strict,
                record_path: Some(ProvisionRecord::default_path()),
            };
            cmd_up(&m, opts, dry_run, launch).await?
        }
        Commands::Deploy { strict, launch } => {
            let ctx = run_ctx(&m, &launch);
            let summary = bootstrap::deploy(&m, &LocalRunner, strict, ctx).await?;
            print_summary(&summary, launch.summary)?;
        }
    }
    Ok(())
}

fn cmd_check(m: &Manifest, strict: bool, json: bool) -> Result<()> {
    let report = validate(m);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if report.is_clean() {
        println!("✓ manifest is valid");
    } else {
        for issue in &report.issues {
            println!("{issue}");
        }
    }
    if !report.passes(strict) {
        bail!("manifest check failed");
    }
    Ok(())
}

fn cmd_plan(m: &Manifest, workflow: Option<String>, json: bool) -> Result<()> {
    let plan = bootstrap::resolve_workflow(m, workflow.as_deref())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        print!("{plan}");
    }
    Ok(())
}

fn provisioner_for(m: &Manifest, dry_run: bool) -> Box<dyn Provisioner> {
    if dry_run {
        Box::new(DryRunProvisioner::default())
    } else {
        Box::new(NixProvisioner::new(m.nix.channel.clone()))
    }
}

async fn cmd_provision(m: &Manifest, dry_run: bool, force: bool) -> Result<()> {
    for (module, status) in provision::check_runtimes(&m.modules).await {
        println!("{module}: {status:?}");
    }
    let provisioner = provisioner_for(m, dry_run);
    // a dry run must not mark anything as installed
    let record = if dry_run { None } else { Some(ProvisionRecord::default_path()) };
    let installed = provision::provision(provisioner.as_ref(), m.packages(), record.as_deref(), force).await?;
    println!("✓ {} package(s) provisioned", installed.len());
    Ok(())
}

async fn cmd_run(m: &Manifest, workflow: Option<String>, launch: LaunchArgs) -> Result<()> {
    let plan = bootstrap::resolve_workflow(m, workflow.as_deref())?;
    let ctx = run_ctx(m, &launch);
    let summary = LocalRunner.run(&plan, &ctx).await?;
    print_summary(&summary, launch.summary)?;
    if let Some(failed) = summary.first_failure() {
        bail!("[{}] '{}' failed", failed.workflow, failed.command);
    }
    Ok(())
}

async fn cmd_up(m: &Manifest, mut opts: UpOptions, dry_run: bool, launch: LaunchArgs) -> Result<()> {
    if dry_run {
        opts.record_path = None;
    }
    let provisioner = provisioner_for(m, dry_run);
    let ctx = run_ctx(m, &launch);
    let summary = bootstrap::up(m, provisioner.as_ref(), &LocalRunner, &opts, ctx).await?;
    print_summary(&summary, launch.summary)
}

fn run_ctx(m: &Manifest, launch: &LaunchArgs) -> RunCtx {
    RunCtx {
        env: bootstrap::merged_env(m, &launch.env),
        cwd: launch.cwd.clone(),
        ports: envboot::ports::PortTable::from(m.ports.as_slice()),
        ..Default::default()
    }
}

fn print_summary(summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("=== run summary ===\n{}", serde_json::to_string_pretty(summary)?);
    } else if summary.success() {
        println!("✓ {} process(es) finished", summary.leaves.len());
    }
    Ok(())
}
