use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---- Environment manifest schema ----
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    #[serde(default)]
    pub modules: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,
    #[serde(default)]
    pub nix: NixSection,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub workflows: Workflows,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<Deployment>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NixSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Workflows {
    #[serde(rename = "runButton", default, skip_serializing_if = "Option::is_none")]
    pub run_button: Option<String>,
    #[serde(rename = "workflow", default)]
    pub workflow: Vec<Workflow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub mode: WorkflowMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowMode {
    Parallel,
    #[default]
    Sequential,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub task: String, // "shell.exec" | "workflow.run"
    #[serde(default)]
    pub args: String,
    #[serde(rename = "waitForPort", default, skip_serializing_if = "Option::is_none")]
    pub wait_for_port: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind<'a> {
    ShellExec,
    WorkflowRun,
    Other(&'a str),
}

impl Task {
    pub fn kind(&self) -> TaskKind<'_> {
        match self.task.as_str() {
            "shell.exec" => TaskKind::ShellExec,
            "workflow.run" => TaskKind::WorkflowRun,
            other => TaskKind::Other(other),
        }
    }

    pub fn shell(command: &str) -> Self {
        Self { task: "shell.exec".into(), args: command.into(), wait_for_port: None }
    }

    pub fn run_workflow(name: &str) -> Self {
        Self { task: "workflow.run".into(), args: name.into(), wait_for_port: None }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    #[serde(default)]
    pub run: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<Vec<String>>,
    #[serde(rename = "deploymentTarget", default, skip_serializing_if = "Option::is_none")]
    pub deployment_target: Option<String>,
}

impl Deployment {
    /// The command line the deployment would execute, with a `sh -c` wrapper peeled off.
    pub fn command_line(&self) -> Option<String> {
        match self.run.as_slice() {
            [] => None,
            [shell, flag, script] if is_shell(shell) && flag == "-c" => Some(script.trim().to_string()),
            argv => Some(argv.join(" ")),
        }
    }
}

fn is_shell(program: &str) -> bool {
    matches!(program.rsplit('/').next(), Some("sh") | Some("bash"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortMapping {
    #[serde(rename = "localPort")]
    pub local_port: u16,
    #[serde(rename = "externalPort")]
    pub external_port: u16,
    #[serde(rename = "exposeLocalhost", default, skip_serializing_if = "Option::is_none")]
    pub expose_localhost: Option<bool>,
}

impl Manifest {
    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.workflow.iter().find(|w| w.name == name)
    }

    pub fn packages(&self) -> &[String] {
        &self.nix.packages
    }
}
