use anyhow::{anyhow, bail, Result};
use serde::Serialize;
use std::fmt;

use crate::models::{Manifest, TaskKind, WorkflowMode};

/// A workflow expanded into the shell commands it will launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecPlan {
    Shell {
        workflow: String,
        command: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        wait_for_port: Option<u16>,
    },
    Parallel { workflow: String, steps: Vec<ExecPlan> },
    Sequential { workflow: String, steps: Vec<ExecPlan> },
}

impl ExecPlan {
    /// Shell leaves in declaration order.
    pub fn commands(&self) -> Vec<&str> {
        let mut out = vec![];
        self.walk(&mut |p| {
            if let ExecPlan::Shell { command, .. } = p {
                out.push(command.as_str());
            }
        });
        out
    }

    /// Every readiness gate in the tree.
    pub fn ready_ports(&self) -> Vec<u16> {
        let mut out = vec![];
        self.walk(&mut |p| {
            if let ExecPlan::Shell { wait_for_port: Some(port), .. } = p {
                out.push(*port);
            }
        });
        out
    }

    fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a ExecPlan)) {
        f(self);
        match self {
            ExecPlan::Shell { .. } => {}
            ExecPlan::Parallel { steps, .. } | ExecPlan::Sequential { steps, .. } => {
                for s in steps { s.walk(f); }
            }
        }
    }

    fn fmt_indent(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        let pad = "  ".repeat(depth);
        match self {
            ExecPlan::Shell { workflow, command, wait_for_port } => {
                write!(f, "{pad}[{workflow}] $ {command}")?;
                if let Some(port) = wait_for_port {
                    write!(f, "  (ready on :{port})")?;
                }
                writeln!(f)
            }
            ExecPlan::Parallel { workflow, steps } | ExecPlan::Sequential { workflow, steps } => {
                let mode = if matches!(self, ExecPlan::Parallel { .. }) { "parallel" } else { "sequential" };
                writeln!(f, "{pad}{workflow} ({mode})")?;
                for s in steps { s.fmt_indent(f, depth + 1)?; }
                Ok(())
            }
        }
    }
}

impl fmt::Display for ExecPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_indent(f, 0)
    }
}

/// The run button workflow, or the only workflow when there is exactly one.
pub fn default_workflow(m: &Manifest) -> Option<&str> {
    if let Some(rb) = m.workflows.run_button.as_deref() {
        return Some(rb);
    }
    match m.workflows.workflow.as_slice() {
        [only] => Some(only.name.as_str()),
        _ => None,
    }
}

/// Expands workflow `name`, inlining `workflow.run` references.
pub fn resolve(m: &Manifest, name: &str) -> Result<ExecPlan> {
    let mut stack = vec![];
    resolve_inner(m, name, &mut stack)
}

fn resolve_inner(m: &Manifest, name: &str, stack: &mut Vec<String>) -> Result<ExecPlan> {
    if stack.iter().any(|s| s == name) {
        stack.push(name.to_string());
        bail!("cycle detected in workflow references: {}", stack.join(" -> "));
    }
    let w = m.workflow(name).ok_or_else(|| anyhow!("unknown workflow '{}'", name))?;
    stack.push(name.to_string());

    let mut steps = Vec::with_capacity(w.tasks.len());
    for t in &w.tasks {
        let step = match t.kind() {
            TaskKind::ShellExec => {
                if t.args.trim().is_empty() {
                    bail!("workflow '{}' has an empty shell.exec task", name);
                }
                ExecPlan::Shell {
                    workflow: name.to_string(),
                    command: t.args.trim().to_string(),
                    wait_for_port: t.wait_for_port,
                }
            }
            TaskKind::WorkflowRun => resolve_inner(m, &t.args, stack)?,
            TaskKind::Other(kind) => bail!("workflow '{}' uses unknown task kind '{}'", name, kind),
        };
        steps.push(step);
    }
    stack.pop();

    Ok(match w.mode {
        WorkflowMode::Parallel => ExecPlan::Parallel { workflow: name.to_string(), steps },
        WorkflowMode::Sequential => ExecPlan::Sequential { workflow: name.to_string(), steps },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Task, Workflow, Workflows};
    use pretty_assertions::assert_eq;

    const FIXTURE: &str = include_str!("../manifests/zwaif.replit");

    #[test]
    fn test_resolve_run_button() {
        let m = Manifest::from_toml_str(FIXTURE).unwrap();
        let name = default_workflow(&m).unwrap();
        assert_eq!(name, "Project");

        let plan = resolve(&m, name).unwrap();
        let expected = ExecPlan::Parallel {
            workflow: "Project".into(),
            steps: vec![
                ExecPlan::Sequential {
                    workflow: "Z-Waif AI VTuber Server".into(),
                    steps: vec![ExecPlan::Shell {
                        workflow: "Z-Waif AI VTuber Server".into(),
                        command: "python simple_app.py".into(),
                        wait_for_port: Some(5000),
                    }],
                },
                ExecPlan::Sequential {
                    workflow: "install_dependencies".into(),
                    steps: vec![ExecPlan::Shell {
                        workflow: "install_dependencies".into(),
                        command: "pip install -r attached_assets/requirements_1750158479952.txt".into(),
                        wait_for_port: None,
                    }],
                },
            ],
        };
        assert_eq!(plan, expected);
        assert_eq!(plan.ready_ports(), vec![5000]);
        assert_eq!(plan.commands().len(), 2);
    }

    #[test]
    fn test_display_tree() {
        let m = Manifest::from_toml_str(FIXTURE).unwrap();
        let text = resolve(&m, "Project").unwrap().to_string();
        assert!(text.starts_with("Project (parallel)\n"));
        assert!(text.contains("    [Z-Waif AI VTuber Server] $ python simple_app.py  (ready on :5000)\n"));
    }

    #[test]
    fn test_default_workflow_single() {
        let m = Manifest {
            workflows: Workflows {
                run_button: None,
                workflow: vec![Workflow { name: "solo".into(), mode: Default::default(), author: None, tasks: vec![] }],
            },
            ..Default::default()
        };
        assert_eq!(default_workflow(&m), Some("solo"));
        assert_eq!(default_workflow(&Manifest::default()), None);
    }

    #[test]
    fn test_resolve_errors() {
        let wf = |name: &str, tasks: Vec<Task>| Workflow { name: name.into(), mode: Default::default(), author: None, tasks };
        let m = Manifest {
            workflows: Workflows {
                run_button: None,
                workflow: vec![
                    wf("a", vec![Task::run_workflow("b")]),
                    wf("b", vec![Task::run_workflow("a")]),
                    wf("c", vec![Task::run_workflow("missing")]),
                ],
            },
            ..Default::default()
        };
        let err = resolve(&m, "a").unwrap_err().to_string();
        assert_eq!(err, "cycle detected in workflow references: a -> b -> a");
        assert!(resolve(&m, "c").unwrap_err().to_string().contains("unknown workflow 'missing'"));
        assert!(resolve(&m, "zzz").is_err());
    }

    #[test]
    fn test_diamond_is_not_a_cycle() {
        let wf = |name: &str, tasks: Vec<Task>| Workflow { name: name.into(), mode: Default::default(), author: None, tasks };
        let m = Manifest {
            workflows: Workflows {
                run_button: None,
                workflow: vec![
                    wf("top", vec![Task::run_workflow("left"), Task::run_workflow("right")]),
                    wf("left", vec![Task::run_workflow("base")]),
                    wf("right", vec![Task::run_workflow("base")]),
                    wf("base", vec![Task::shell("true")]),
                ],
            },
            ..Default::default()
        };
        assert_eq!(resolve(&m, "top").unwrap().commands(), vec!["true", "true"]);
    }
}
