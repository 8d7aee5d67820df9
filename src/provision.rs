use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio::process::Command;
use which::which;

use crate::config::{NIXPKGS_ATTR_PREFIX, NIX_ENV, PROVISION_RECORD};

#[async_trait::async_trait]
pub trait Provisioner: Send + Sync {
    fn name(&self) -> &'static str;
    /// Installs a single package. Failures are returned, never retried.
    async fn install(&self, package: &str) -> Result<()>;
}

pub struct NixProvisioner {
    pub program: PathBuf,
    pub channel: Option<String>,
}

impl NixProvisioner {
    pub fn new(channel: Option<String>) -> Self {
        Self { program: PathBuf::from(NIX_ENV), channel }
    }

    /// `nix-env` arguments for one package. With a channel the attribute is looked up in
    /// that channel's expression, otherwise in the active `nixpkgs`.
    pub fn install_args(&self, package: &str) -> Vec<String> {
        match &self.channel {
            Some(ch) => vec!["-f".into(), format!("channel:{}", channel_name(ch)), "-iA".into(), package.to_string()],
            None => vec!["-iA".into(), format!("{NIXPKGS_ATTR_PREFIX}{package}")],
        }
    }
}

/// Maps `stable-24_05` style names onto the nixos channel they track.
pub fn channel_name(channel: &str) -> String {
    match channel.strip_prefix("stable-") {
        Some(release) => format!("nixos-{}", release.replace('_', ".")),
        None => channel.to_string(),
    }
}

#[async_trait::async_trait]
impl Provisioner for NixProvisioner {
    fn name(&self) -> &'static str { "nix" }

    async fn install(&self, package: &str) -> Result<()> {
        if which(&self.program).is_err() {
            bail!("{} not found on PATH (required to provision native packages)", self.program.display());
        }
        let args = self.install_args(package);
        tracing::info!("{} {}", self.program.display(), args.join(" "));
        let status = Command::new(&self.program)
            .args(&args)
            .status()
            .await
            .with_context(|| format!("spawning {} for package {}", self.program.display(), package))?;
        if !status.success() {
            bail!("installing package '{}' failed with {}", package, status);
        }
        Ok(())
    }
}

/// Logs what would be installed and remembers it.
#[derive(Default)]
pub struct DryRunProvisioner {
    seen: Mutex<Vec<String>>,
}

impl DryRunProvisioner {
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

#[async_trait::async_trait]
impl Provisioner for DryRunProvisioner {
    fn name(&self) -> &'static str { "dry-run" }

    async fn install(&self, package: &str) -> Result<()> {
        println!("would install {NIXPKGS_ATTR_PREFIX}{package}");
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(package.to_string());
        }
        Ok(())
    }
}

// ---- provisioning record ----

/// Packages already provisioned on this machine, so repeated bootstraps skip them.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ProvisionRecord {
    #[serde(default)]
    pub packages: BTreeMap<String, DateTime<Utc>>,
}

impl ProvisionRecord {
    pub fn default_path() -> PathBuf {
        dirs::cache_dir().unwrap_or(std::env::temp_dir()).join(PROVISION_RECORD)
    }

    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("reading provision record '{}'", path.display()))?;
        serde_json::from_str(&txt).context("parsing provision record")
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("writing provision record '{}'", path.display()))
    }

    pub fn missing(&self, packages: &[String]) -> Vec<String> {
        packages.iter().filter(|p| !self.packages.contains_key(*p)).cloned().collect()
    }

    pub fn mark(&mut self, packages: &[String]) {
        let now = Utc::now();
        for p in packages {
            self.packages.insert(p.clone(), now);
        }
    }
}

/// Installs whatever the record says is missing (everything with `force`), saving the
/// record after each package so a failure part-way keeps what did install.
pub async fn provision(
    provisioner: &dyn Provisioner,
    packages: &[String],
    record_path: Option<&Path>,
    force: bool,
) -> Result<Vec<String>> {
    let mut record = match record_path {
        Some(p) => ProvisionRecord::load(p)?,
        None => ProvisionRecord::default(),
    };
    let todo = if force { packages.to_vec() } else { record.missing(packages) };
    if todo.is_empty() {
        tracing::info!("all {} packages already provisioned", packages.len());
        return Ok(vec![]);
    }
    tracing::info!("provisioning {} of {} packages via {}", todo.len(), packages.len(), provisioner.name());

    let mut installed = Vec::with_capacity(todo.len());
    for pkg in todo {
        provisioner.install(&pkg).await?;
        record.mark(std::slice::from_ref(&pkg));
        if let Some(p) = record_path {
            record.save(p)?;
        }
        installed.push(pkg);
    }
    Ok(installed)
}

// ---- runtime modules ----

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeModule {
    pub language: String,
    pub version: String,
}

impl RuntimeModule {
    /// Parses `python-3.11` style module names.
    pub fn parse(module: &str) -> Option<Self> {
        let (language, version) = module.rsplit_once('-')?;
        if language.is_empty() || !version.chars().next()?.is_ascii_digit() {
            return None;
        }
        Some(Self { language: language.to_string(), version: version.to_string() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Matches { found: String },
    Mismatch { found: String },
    Missing,
}

/// Finds the first version-looking token in e.g. "Python 3.11.9" and whether it
/// falls under `wanted`.
pub fn parse_version(output: &str, wanted: &str) -> Option<(String, bool)> {
    let found = output.split_whitespace().find(|tok| tok.chars().next().is_some_and(|c| c.is_ascii_digit()))?;
    let ok = found == wanted || found.starts_with(&format!("{wanted}."));
    Some((found.to_string(), ok))
}

pub async fn check_runtime(module: &RuntimeModule) -> RuntimeStatus {
    let candidates = [format!("{}3", module.language), module.language.clone()];
    for bin in candidates.iter() {
        if which(bin).is_err() {
            continue;
        }
        let Ok(out) = Command::new(bin).arg("--version").output().await else { continue };
        // python 2 printed its version on stderr
        let text = format!("{}{}", String::from_utf8_lossy(&out.stdout), String::from_utf8_lossy(&out.stderr));
        match parse_version(&text, &module.version) {
            Some((found, true)) => return RuntimeStatus::Matches { found },
            Some((found, false)) => return RuntimeStatus::Mismatch { found },
            None => continue,
        }
    }
    RuntimeStatus::Missing
}

/// Checks every runtime module; problems are warnings only.
pub async fn check_runtimes(modules: &[String]) -> Vec<(String, RuntimeStatus)> {
    let mut out = vec![];
    for m in modules {
        let Some(rt) = RuntimeModule::parse(m) else {
            tracing::debug!("skipping module '{}' (no version)", m);
            continue;
        };
        let status = check_runtime(&rt).await;
        match &status {
            RuntimeStatus::Matches { found } => tracing::info!("{} {} found", rt.language, found),
            RuntimeStatus::Mismatch { found } => {
                tracing::warn!("{} {} requested but {} found", rt.language, rt.version, found)
            }
            RuntimeStatus::Missing => tracing::warn!("{} {} not found on PATH", rt.language, rt.version),
        }
        out.push((m.clone(), status));
    }
    out
}
