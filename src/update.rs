//! Source update: `git pull` (optionally after discarding local changes),
//! then a dependency reinstall into the sandbox.

use crate::error::BmsError;
use crate::host::{HostFacts, Tool};
use crate::runner::{CommandRunner, CommandSpec};
use crate::sandbox::{EnvironmentManager, RuntimeSandbox};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const GIT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    Standard,
    Force,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum UpdateStatus {
    Ok,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UpdateStep {
    pub name: String,
    #[serde(flatten)]
    pub status: UpdateStatus,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UpdateReport {
    pub mode: UpdateMode,
    pub steps: Vec<UpdateStep>,
}

impl UpdateReport {
    pub fn succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|s| !matches!(s.status, UpdateStatus::Failed(_)))
    }
}

pub struct Updater<'a, R: CommandRunner> {
    runner: &'a R,
    project_root: PathBuf,
    facts: &'a HostFacts,
    echo: bool,
}

impl<'a, R: CommandRunner> Updater<'a, R> {
    pub fn new(runner: &'a R, project_root: &Path, facts: &'a HostFacts) -> Self {
        Self {
            runner,
            project_root: project_root.to_path_buf(),
            facts,
            echo: false,
        }
    }

    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Runs every git step in order; a failed git step stops the remaining
    /// git steps but the dependency install is still attempted.
    pub fn update(&self, mode: UpdateMode, sandbox: &mut RuntimeSandbox) -> UpdateReport {
        let mut steps = Vec::new();
        let git_steps: Vec<Vec<&str>> = match mode {
            UpdateMode::Standard => vec![vec!["pull"]],
            UpdateMode::Force => vec![vec!["reset", "--hard", "HEAD"], vec!["clean", "-fd"], vec!["pull"]],
        };

        if !self.facts.has_tool(Tool::Git) {
            warn!("git not installed; skipping source update");
            steps.push(UpdateStep {
                name: "git".to_string(),
                status: UpdateStatus::Skipped("git not installed".to_string()),
            });
        } else {
            let mut failed = false;
            for args in git_steps {
                let name = format!("git {}", args.join(" "));
                if failed {
                    steps.push(UpdateStep {
                        name,
                        status: UpdateStatus::Skipped("previous git step failed".to_string()),
                    });
                    continue;
                }
                let status = self.git(&args);
                failed = matches!(status, UpdateStatus::Failed(_));
                steps.push(UpdateStep { name, status });
            }
        }

        let manager = EnvironmentManager::new(
            self.runner,
            &self.project_root,
            sandbox.root.clone(),
            sandbox.manifest.clone(),
            self.facts.os.clone(),
        )
        .echo(self.echo);
        let status = match manager.install(sandbox) {
            Ok(()) => UpdateStatus::Ok,
            Err(err) => UpdateStatus::Failed(describe(&err)),
        };
        steps.push(UpdateStep {
            name: "dependencies".to_string(),
            status,
        });

        UpdateReport { mode, steps }
    }

    fn git(&self, args: &[&str]) -> UpdateStatus {
        let spec = CommandSpec::new("git")
            .args(args.iter().copied())
            .cwd(&self.project_root)
            .timeout(GIT_TIMEOUT);
        info!(command = %spec.render(), "updating sources");
        match self.runner.run(&spec) {
            Ok(out) if out.success() => UpdateStatus::Ok,
            Ok(out) => UpdateStatus::Failed(out.excerpt()),
            Err(err) => UpdateStatus::Failed(err.to_string()),
        }
    }
}

fn describe(err: &BmsError) -> String {
    match err {
        BmsError::Provisioning {
            message,
            output: Some(output),
        } => format!("{message}: {output}"),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OsFamily;
    use crate::runner::testing::{fail, MockRunner};
    use tempfile::tempdir;

    fn sandbox(root: &Path) -> RuntimeSandbox {
        RuntimeSandbox {
            root: root.join("venv"),
            interpreter: root.join("venv/bin/python3"),
            manifest: root.join("requirements.txt"),
            provisioned: true,
        }
    }

    fn facts_with_git() -> HostFacts {
        let mut facts = HostFacts::baseline(OsFamily::Linux);
        facts.tools = [Tool::Git].into_iter().collect();
        facts
    }

    #[test]
    fn standard_update_pulls_then_installs() {
        let dir = tempdir().unwrap();
        let facts = facts_with_git();
        let runner = MockRunner::default();
        let mut sb = sandbox(dir.path());
        let report = Updater::new(&runner, dir.path(), &facts).update(UpdateMode::Standard, &mut sb);
        assert!(report.succeeded());
        let names: Vec<&str> = report.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["git pull", "dependencies"]);
        assert_eq!(runner.count("git reset"), 0);
        let calls = runner.calls();
        assert_eq!(calls[0].cwd.as_deref(), Some(dir.path()));
    }

    #[test]
    fn force_update_discards_local_changes_first() {
        let dir = tempdir().unwrap();
        let facts = facts_with_git();
        let runner = MockRunner::default();
        let mut sb = sandbox(dir.path());
        Updater::new(&runner, dir.path(), &facts).update(UpdateMode::Force, &mut sb);
        let rendered = runner.rendered();
        let position = |needle: &str| rendered.iter().position(|line| line.contains(needle)).unwrap();
        assert!(position("git reset --hard HEAD") < position("git clean -fd"));
        assert!(position("git clean -fd") < position("git pull"));
        assert!(position("git pull") < position("pip install --upgrade pip"));
    }

    #[test]
    fn failed_pull_still_installs_dependencies() {
        let dir = tempdir().unwrap();
        let facts = facts_with_git();
        let runner = MockRunner::default();
        runner.on("git reset", fail(128, "fatal: not a git repository"));
        let mut sb = sandbox(dir.path());
        let report = Updater::new(&runner, dir.path(), &facts).update(UpdateMode::Force, &mut sb);
        assert!(!report.succeeded());
        assert_eq!(
            report.steps[0].status,
            UpdateStatus::Failed("fatal: not a git repository".to_string())
        );
        assert!(matches!(report.steps[1].status, UpdateStatus::Skipped(_)));
        assert!(matches!(report.steps[2].status, UpdateStatus::Skipped(_)));
        assert_eq!(report.steps[3].status, UpdateStatus::Ok);
        assert_eq!(runner.count("git pull"), 0);
    }

    #[test]
    fn missing_git_is_skipped_with_warning() {
        let dir = tempdir().unwrap();
        let facts = HostFacts::baseline(OsFamily::Linux);
        let runner = MockRunner::default();
        let mut sb = sandbox(dir.path());
        let report = Updater::new(&runner, dir.path(), &facts).update(UpdateMode::Standard, &mut sb);
        assert!(report.succeeded());
        assert!(matches!(report.steps[0].status, UpdateStatus::Skipped(_)));
        assert_eq!(runner.count("git pull"), 0);
    }
}
