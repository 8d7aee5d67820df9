use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{DEFAULT_MANIFEST, MANIFEST_ENV};
use crate::models::Manifest;

impl Manifest {
    pub fn from_toml_str(s: &str) -> Result<Manifest> {
        toml::from_str::<Manifest>(s).context("parsing manifest toml")
    }
}

/// Reads and parses the manifest at `path`.
pub fn load(path: &Path) -> Result<Manifest> {
    let txt = fs::read_to_string(path)
        .with_context(|| format!("reading manifest '{}'", path.display()))?;
    Manifest::from_toml_str(&txt).with_context(|| format!("in manifest '{}'", path.display()))
}

/// Explicit path, then `ENVBOOT_MANIFEST`, then `.replit` in the working directory.
pub fn locate(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    match std::env::var(MANIFEST_ENV) {
        Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
        _ => PathBuf::from(DEFAULT_MANIFEST),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::WorkflowMode;
    use std::io::Write;

    const FIXTURE: &str = include_str!("../manifests/zwaif.replit");

    #[test]
    fn test_parse_fixture() {
        let m = Manifest::from_toml_str(FIXTURE).unwrap();
        assert_eq!(m.modules, vec!["python-3.11"]);
        assert_eq!(m.nix.channel.as_deref(), Some("stable-24_05"));
        assert_eq!(m.packages().len(), 9);
        assert_eq!(m.packages()[0], "espeak-ng");
        assert_eq!(m.workflows.run_button.as_deref(), Some("Project"));
        assert_eq!(m.workflows.workflow.len(), 3);

        let project = m.workflow("Project").unwrap();
        assert_eq!(project.mode, WorkflowMode::Parallel);
        assert_eq!(project.tasks.len(), 2);

        let server = m.workflow("Z-Waif AI VTuber Server").unwrap();
        assert_eq!(server.tasks[0].args, "python simple_app.py");
        assert_eq!(server.tasks[0].wait_for_port, Some(5000));

        assert_eq!(m.env.get("WEB_UI_PORT").map(String::as_str), Some("5000"));
        assert_eq!(m.deployment.as_ref().unwrap().deployment_target.as_deref(), Some("autoscale"));
    }

    #[test]
    fn test_parse_error_is_reported() {
        let err = Manifest::from_toml_str("[[ports]]\nlocalPort = \"five thousand\"\n").unwrap_err();
        assert!(format!("{err:#}").contains("parsing manifest toml"));

        assert!(Manifest::from_toml_str("modules = [").is_err());
    }

    #[test]
    fn test_empty_manifest_parses() {
        let m = Manifest::from_toml_str("").unwrap();
        assert!(m.packages().is_empty());
        assert!(m.deployment.is_none());
    }

    #[test]
    fn test_load_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(FIXTURE.as_bytes()).unwrap();
        let m = load(f.path()).unwrap();
        assert_eq!(m.ports.len(), 2);

        let err = load(Path::new("/definitely/not/here.replit")).unwrap_err();
        assert!(err.to_string().contains("reading manifest"));
    }

    #[test]
    fn test_locate_prefers_explicit_path() {
        assert_eq!(locate(Some(Path::new("custom.toml"))), PathBuf::from("custom.toml"));
    }
}
