use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

use crate::models::{Manifest, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IssueKind {
    #[error("no native packages are listed under [nix]")]
    NoPackages,
    #[error("package '{name}' is listed more than once")]
    DuplicatePackage { name: String },
    #[error("port {port} is out of range")]
    PortOutOfRange { port: u16 },
    #[error("local port {port} is mapped more than once")]
    DuplicateLocalPort { port: u16 },
    #[error("external port {port} is mapped more than once")]
    DuplicateExternalPort { port: u16 },
    #[error("workflow '{name}' is defined more than once")]
    DuplicateWorkflow { name: String },
    #[error("runButton names unknown workflow '{name}'")]
    UnknownRunButton { name: String },
    #[error("workflow '{workflow}' runs unknown workflow '{target}'")]
    UnknownWorkflowRef { workflow: String, target: String },
    #[error("workflows reference each other in a cycle: {}", .members.join(", "))]
    WorkflowCycle { members: Vec<String> },
    #[error("workflow '{workflow}' has an invalid command '{command}': {reason}")]
    InvalidCommand { workflow: String, command: String, reason: String },
    #[error("workflow '{workflow}' uses unknown task kind '{task}'")]
    UnknownTaskKind { workflow: String, task: String },
    #[error("workflow '{workflow}' waits for port {port}, which has no port mapping")]
    UndeclaredWaitPort { workflow: String, port: u16 },
    #[error("deployment runs '{deployment}' but the main workflow runs '{main}'")]
    DeploymentMismatch { deployment: String, main: String },
    #[error("workflow '{name}' has no tasks")]
    EmptyWorkflow { name: String },
}

impl IssueKind {
    pub fn severity(&self) -> Severity {
        match self {
            IssueKind::UndeclaredWaitPort { .. }
            | IssueKind::DeploymentMismatch { .. }
            | IssueKind::EmptyWorkflow { .. } => Severity::Warning,
            _ => Severity::Error,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: IssueKind,
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        write!(f, "{tag}: {}", self.kind)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ValidationReport {
    pub issues: Vec<Issue>,
}

impl ValidationReport {
    fn push(&mut self, kind: IssueKind) {
        self.issues.push(Issue { severity: kind.severity(), kind });
    }

    pub fn errors(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Error)
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(|i| i.severity == Severity::Warning)
    }

    pub fn is_ok(&self) -> bool {
        self.errors().next().is_none()
    }

    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }

    /// `is_ok`, or `is_clean` when warnings count as failures.
    pub fn passes(&self, strict: bool) -> bool {
        if strict { self.is_clean() } else { self.is_ok() }
    }

    pub fn contains(&self, kind: &IssueKind) -> bool {
        self.issues.iter().any(|i| &i.kind == kind)
    }
}

/// Runs every configuration check and collects all issues found.
pub fn validate(m: &Manifest) -> ValidationReport {
    let mut report = ValidationReport::default();
    check_packages(m, &mut report);
    check_ports(m, &mut report);
    check_workflows(m, &mut report);
    check_deployment(m, &mut report);
    report
}

fn check_packages(m: &Manifest, report: &mut ValidationReport) {
    if m.packages().is_empty() {
        report.push(IssueKind::NoPackages);
    }
    let mut seen = HashSet::new();
    let mut reported = HashSet::new();
    for p in m.packages() {
        if !seen.insert(p.as_str()) && reported.insert(p.as_str()) {
            report.push(IssueKind::DuplicatePackage { name: p.clone() });
        }
    }
}

fn check_ports(m: &Manifest, report: &mut ValidationReport) {
    let (mut locals, mut local_dups) = (HashSet::new(), HashSet::new());
    let (mut externals, mut external_dups) = (HashSet::new(), HashSet::new());
    for pm in &m.ports {
        for port in [pm.local_port, pm.external_port] {
            if port == 0 {
                report.push(IssueKind::PortOutOfRange { port });
            }
        }
        if !locals.insert(pm.local_port) && local_dups.insert(pm.local_port) {
            report.push(IssueKind::DuplicateLocalPort { port: pm.local_port });
        }
        if !externals.insert(pm.external_port) && external_dups.insert(pm.external_port) {
            report.push(IssueKind::DuplicateExternalPort { port: pm.external_port });
        }
    }
}

fn check_workflows(m: &Manifest, report: &mut ValidationReport) {
    let mut names = HashSet::new();
    for w in &m.workflows.workflow {
        if !names.insert(w.name.as_str()) {
            report.push(IssueKind::DuplicateWorkflow { name: w.name.clone() });
        }
    }

    if let Some(rb) = &m.workflows.run_button {
        if !names.contains(rb.as_str()) {
            report.push(IssueKind::UnknownRunButton { name: rb.clone() });
        }
    }

    let declared: HashSet<u16> = m.ports.iter().map(|p| p.local_port).collect();

    for w in &m.workflows.workflow {
        if w.tasks.is_empty() {
            report.push(IssueKind::EmptyWorkflow { name: w.name.clone() });
        }
        for t in &w.tasks {
            match t.kind() {
                TaskKind::ShellExec => {
                    if let Err(reason) = check_shell_words(&t.args) {
                        report.push(IssueKind::InvalidCommand {
                            workflow: w.name.clone(),
                            command: t.args.clone(),
                            reason,
                        });
                    }
                }
                TaskKind::WorkflowRun => {
                    if !names.contains(t.args.as_str()) {
                        report.push(IssueKind::UnknownWorkflowRef {
                            workflow: w.name.clone(),
                            target: t.args.clone(),
                        });
                    }
                }
                TaskKind::Other(kind) => {
                    report.push(IssueKind::UnknownTaskKind {
                        workflow: w.name.clone(),
                        task: kind.to_string(),
                    });
                }
            }
            if let Some(port) = t.wait_for_port {
                if !declared.contains(&port) {
                    report.push(IssueKind::UndeclaredWaitPort { workflow: w.name.clone(), port });
                }
            }
        }
    }

    if let Some(members) = workflow_cycle(m) {
        report.push(IssueKind::WorkflowCycle { members });
    }
}

fn check_deployment(m: &Manifest, report: &mut ValidationReport) {
    let Some(deployment) = m.deployment.as_ref().and_then(|d| d.command_line()) else { return };
    let Some(main) = main_command(m) else { return };
    if normalize(&deployment) != normalize(&main) {
        report.push(IssueKind::DeploymentMismatch { deployment, main });
    }
}

fn normalize(cmd: &str) -> String {
    cmd.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// The command the run button ultimately serves: the first `shell.exec` task with a
/// readiness port reachable from `runButton`, else the top-level `run`.
pub fn main_command(m: &Manifest) -> Option<String> {
    let from_workflows = m.workflows.run_button.as_deref().and_then(|rb| {
        let mut visited = HashSet::new();
        find_served_command(m, rb, &mut visited)
    });
    from_workflows.or_else(|| m.run.clone())
}

fn find_served_command<'a>(m: &'a Manifest, name: &'a str, visited: &mut HashSet<&'a str>) -> Option<String> {
    if !visited.insert(name) {
        return None;
    }
    let w = m.workflow(name)?;
    for t in &w.tasks {
        match t.kind() {
            TaskKind::ShellExec if t.wait_for_port.is_some() => return Some(t.args.trim().to_string()),
            TaskKind::WorkflowRun => {
                if let Some(cmd) = find_served_command(m, &t.args, visited) {
                    return Some(cmd);
                }
            }
            _ => {}
        }
    }
    None
}

/// Workflows left over after a topological sort of `workflow.run` edges, if any.
pub fn workflow_cycle(m: &Manifest) -> Option<Vec<String>> {
    let ids: HashSet<&str> = m.workflows.workflow.iter().map(|w| w.name.as_str()).collect();
    let mut indeg: HashMap<&str, usize> = ids.iter().map(|id| (*id, 0)).collect();
    let mut adj: HashMap<&str, Vec<&str>> = ids.iter().map(|id| (*id, vec![])).collect();

    for w in &m.workflows.workflow {
        for t in &w.tasks {
            if t.kind() == TaskKind::WorkflowRun && ids.contains(t.args.as_str()) {
                if let Some(edges) = adj.get_mut(w.name.as_str()) {
                    edges.push(t.args.as_str());
                }
                if let Some(d) = indeg.get_mut(t.args.as_str()) {
                    *d += 1;
                }
            }
        }
    }

    let mut q: VecDeque<&str> = indeg.iter().filter(|(_, &d)| d == 0).map(|(k, _)| *k).collect();
    let mut done = 0usize;
    while let Some(u) = q.pop_front() {
        done += 1;
        for v in adj.get(u).into_iter().flatten() {
            if let Some(e) = indeg.get_mut(v) {
                *e -= 1;
                if *e == 0 { q.push_back(*v); }
            }
        }
    }

    if done == ids.len() {
        return None;
    }
    // Leftovers include nodes merely downstream of a cycle; keep the ones that reach themselves.
    let leftover: HashSet<&str> = indeg.into_iter().filter(|(_, d)| *d > 0).map(|(k, _)| k).collect();
    let members: BTreeSet<String> = leftover
        .iter()
        .filter(|start| reaches(&adj, &leftover, start, start))
        .map(|k| k.to_string())
        .collect();
    Some(members.into_iter().collect())
}

/// True when `to` is reachable from `from` in one or more steps, staying inside `within`.
fn reaches(adj: &HashMap<&str, Vec<&str>>, within: &HashSet<&str>, from: &str, to: &str) -> bool {
    let mut seen = HashSet::new();
    let mut stack = vec![from];
    while let Some(u) = stack.pop() {
        for v in adj.get(u).into_iter().flatten() {
            if *v == to {
                return true;
            }
            if within.contains(v) && seen.insert(*v) {
                stack.push(*v);
            }
        }
    }
    false
}

/// Checks that `cmd` splits into shell words: non-empty, quotes balanced, no dangling escape.
pub fn check_shell_words(cmd: &str) -> Result<(), String> {
    if cmd.trim().is_empty() {
        return Err("command is empty".into());
    }
    let mut chars = cmd.chars();
    let mut single = false;
    let mut double = false;
    while let Some(c) = chars.next() {
        match c {
            '\'' if !double => single = !single,
            '"' if !single => double = !double,
            '\\' if !single => {
                if chars.next().is_none() {
                    return Err("trailing backslash".into());
                }
            }
            _ => {}
        }
    }
    if single {
        return Err("unterminated single quote".into());
    }
    if double {
        return Err("unterminated double quote".into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Deployment, PortMapping, Task, Workflow, WorkflowMode};
    use pretty_assertions::assert_eq;

    const FIXTURE: &str = include_str!("../manifests/zwaif.replit");

    fn fixture() -> Manifest {
        Manifest::from_toml_str(FIXTURE).unwrap()
    }

    fn workflow(name: &str, tasks: Vec<Task>) -> Workflow {
        Workflow { name: name.into(), mode: WorkflowMode::Sequential, author: None, tasks }
    }

    #[test]
    fn test_fixture_is_clean() {
        let report = validate(&fixture());
        assert_eq!(report.issues, vec![]);
        assert!(report.passes(true));
    }

    #[test]
    fn test_fixture_port_table() {
        let m = fixture();
        assert_eq!(m.ports.len(), 2);
        let locals: Vec<u16> = m.ports.iter().map(|p| p.local_port).collect();
        let externals: Vec<u16> = m.ports.iter().map(|p| p.external_port).collect();
        assert_eq!(locals, vec![5000, 8765]);
        assert_eq!(externals, vec![80, 3000]);
    }

    #[test]
    fn test_fixture_project_references_exist() {
        let m = fixture();
        let project = m.workflow("Project").unwrap();
        let targets: Vec<&str> = project.tasks.iter().map(|t| t.args.as_str()).collect();
        assert_eq!(targets, vec!["Z-Waif AI VTuber Server", "install_dependencies"]);
        for t in targets {
            assert!(m.workflow(t).is_some(), "missing workflow {t}");
        }
    }

    #[test]
    fn test_fixture_deployment_matches_main() {
        let m = fixture();
        assert_eq!(main_command(&m).as_deref(), Some("python simple_app.py"));
        assert_eq!(m.deployment.unwrap().command_line().as_deref(), Some("python simple_app.py"));
    }

    #[test]
    fn test_fixture_packages_unique() {
        let m = fixture();
        assert!(!m.packages().is_empty());
        let unique: HashSet<&String> = m.packages().iter().collect();
        assert_eq!(unique.len(), m.packages().len());
    }

    #[test]
    fn test_packages_empty_and_duplicated() {
        let mut m = fixture();
        m.nix.packages.clear();
        assert!(validate(&m).contains(&IssueKind::NoPackages));

        m.nix.packages = vec!["ffmpeg-full".into(), "scrot".into(), "ffmpeg-full".into(), "ffmpeg-full".into()];
        let report = validate(&m);
        let dups: Vec<_> = report.issues.iter().filter(|i| matches!(i.kind, IssueKind::DuplicatePackage { .. })).collect();
        assert_eq!(dups.len(), 1);
        assert!(!report.is_ok());
    }

    #[test]
    fn test_port_collisions() {
        let mut m = fixture();
        m.ports.push(PortMapping { local_port: 5000, external_port: 3000, expose_localhost: None });
        let report = validate(&m);
        assert!(report.contains(&IssueKind::DuplicateLocalPort { port: 5000 }));
        assert!(report.contains(&IssueKind::DuplicateExternalPort { port: 3000 }));

        m.ports = vec![PortMapping { local_port: 0, external_port: 80, expose_localhost: None }];
        assert!(validate(&m).contains(&IssueKind::PortOutOfRange { port: 0 }));
    }

    #[test]
    fn test_repeated_port_reported_once() {
        let mut m = fixture();
        let pm = PortMapping { local_port: 5000, external_port: 80, expose_localhost: None };
        m.ports = vec![pm, pm, pm];
        let report = validate(&m);
        let locals = report.issues.iter().filter(|i| i.kind == IssueKind::DuplicateLocalPort { port: 5000 }).count();
        let externals = report.issues.iter().filter(|i| i.kind == IssueKind::DuplicateExternalPort { port: 80 }).count();
        assert_eq!((locals, externals), (1, 1));
    }

    #[test]
    fn test_unknown_references() {
        let mut m = fixture();
        m.workflows.run_button = Some("Nope".into());
        m.workflows.workflow[0].tasks.push(Task::run_workflow("ghost"));
        let report = validate(&m);
        assert!(report.contains(&IssueKind::UnknownRunButton { name: "Nope".into() }));
        assert!(report.contains(&IssueKind::UnknownWorkflowRef { workflow: "Project".into(), target: "ghost".into() }));
    }

    #[test]
    fn test_duplicate_workflow_names() {
        let mut m = fixture();
        m.workflows.workflow.push(workflow("install_dependencies", vec![Task::shell("true")]));
        assert!(validate(&m).contains(&IssueKind::DuplicateWorkflow { name: "install_dependencies".into() }));
    }

    #[test]
    fn test_cycle_detected() {
        let m = Manifest {
            nix: crate::models::NixSection { channel: None, packages: vec!["gettext".into()] },
            workflows: crate::models::Workflows {
                run_button: Some("a".into()),
                workflow: vec![
                    workflow("a", vec![Task::run_workflow("b")]),
                    workflow("b", vec![Task::run_workflow("a")]),
                    workflow("c", vec![Task::shell("true")]),
                ],
            },
            ..Default::default()
        };
        let report = validate(&m);
        assert!(report.contains(&IssueKind::WorkflowCycle { members: vec!["a".into(), "b".into()] }));
        assert_eq!(main_command(&m), None);
    }

    #[test]
    fn test_cycle_excludes_downstream_workflows() {
        let m = Manifest {
            workflows: crate::models::Workflows {
                run_button: Some("a".into()),
                workflow: vec![
                    workflow("a", vec![Task::run_workflow("b")]),
                    workflow("b", vec![Task::run_workflow("a"), Task::run_workflow("leaf")]),
                    workflow("leaf", vec![Task::run_workflow("shell")]),
                    workflow("shell", vec![Task::shell("true")]),
                ],
            },
            ..Default::default()
        };
        assert_eq!(workflow_cycle(&m), Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_self_reference_is_a_cycle() {
        let m = Manifest {
            workflows: crate::models::Workflows {
                run_button: Some("loop".into()),
                workflow: vec![
                    workflow("loop", vec![Task::run_workflow("loop"), Task::run_workflow("after")]),
                    workflow("after", vec![Task::shell("true")]),
                ],
            },
            ..Default::default()
        };
        assert_eq!(workflow_cycle(&m), Some(vec!["loop".to_string()]));
    }

    #[test]
    fn test_invalid_commands_and_kinds() {
        let mut m = fixture();
        m.workflows.workflow.push(workflow(
            "broken",
            vec![
                Task::shell("echo 'oops"),
                Task::shell("   "),
                Task { task: "packager.installForAll".into(), args: String::new(), wait_for_port: None },
            ],
        ));
        let report = validate(&m);
        assert_eq!(report.errors().count(), 3);
        assert!(report.contains(&IssueKind::UnknownTaskKind { workflow: "broken".into(), task: "packager.installForAll".into() }));
    }

    #[test]
    fn test_warnings_only_fail_strict() {
        let mut m = fixture();
        m.deployment = Some(Deployment { run: vec!["python".into(), "main.py".into()], ..Default::default() });
        m.workflows.workflow.push(workflow("idle", vec![]));
        let report = validate(&m);
        assert!(report.is_ok());
        assert!(!report.passes(true));
        assert_eq!(report.warnings().count(), 2);
        assert!(report.contains(&IssueKind::DeploymentMismatch {
            deployment: "python main.py".into(),
            main: "python simple_app.py".into(),
        }));
    }

    #[test]
    fn test_wait_port_must_be_mapped() {
        let mut m = fixture();
        m.workflows.workflow[1].tasks[0].wait_for_port = Some(9999);
        let report = validate(&m);
        assert!(report.contains(&IssueKind::UndeclaredWaitPort { workflow: "Z-Waif AI VTuber Server".into(), port: 9999 }));
    }

    #[test]
    fn test_main_command_falls_back_to_run() {
        let m = Manifest { run: Some("python app.py".into()), ..Default::default() };
        assert_eq!(main_command(&m).as_deref(), Some("python app.py"));
    }

    #[test]
    fn test_check_shell_words() {
        assert!(check_shell_words("pip install -r \"req s.txt\"").is_ok());
        assert!(check_shell_words("echo 'it\"s'").is_ok());
        assert!(check_shell_words(r#"echo "a \" b""#).is_ok());
        assert_eq!(check_shell_words("echo \"x").unwrap_err(), "unterminated double quote");
        assert_eq!(check_shell_words("echo \\").unwrap_err(), "trailing backslash");
    }

    #[test]
    fn test_issue_display() {
        let issue = Issue { severity: Severity::Error, kind: IssueKind::DuplicateLocalPort { port: 5000 } };
        assert_eq!(issue.to_string(), "error: local port 5000 is mapped more than once");
    }
}
