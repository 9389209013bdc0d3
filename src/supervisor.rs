//! Supervisor Configurator: renders the `[program:<name>]` unit and drives
//! supervisorctl's reread/update/restart sequence.

use crate::config::Config;
use crate::error::BmsError;
use crate::fsutil::install_file;
use crate::host::{HostFacts, OsFamily, Tool};
use crate::recommend::ProcessServer;
use crate::runner::{CommandRunner, CommandSpec};
use crate::sandbox::RuntimeSandbox;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const CTL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CtlStep {
    pub command: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SupervisorReport {
    pub unit_path: PathBuf,
    pub changed: bool,
    pub activation: Vec<CtlStep>,
    pub warnings: Vec<String>,
}

pub struct UnitTemplate<'a> {
    pub name: &'a str,
    pub project_root: &'a Path,
    pub interpreter: &'a Path,
    pub bin_dir: &'a Path,
    pub log_dir: &'a Path,
    pub workers: u32,
    pub threads: u32,
    pub bind: &'a str,
    pub target: &'a str,
}

pub fn render_unit(unit: &UnitTemplate<'_>) -> String {
    format!(
        "[program:{name}]\n\
directory={root}\n\
command={python} -m gunicorn -w {workers} --threads {threads} -b {bind} {target}\n\
autostart=true\n\
autorestart=true\n\
stderr_logfile={logs}/gunicorn_err.log\n\
stdout_logfile={logs}/gunicorn_out.log\n\
environment=PATH=\"{bin}\"\n",
        name = unit.name,
        root = unit.project_root.display(),
        python = unit.interpreter.display(),
        workers = unit.workers,
        threads = unit.threads,
        bind = unit.bind,
        target = unit.target,
        logs = unit.log_dir.display(),
        bin = unit.bin_dir.display(),
    )
}

/// Gunicorn worker/thread counts for the unit; a fallback-server profile
/// still gets the standard multi-worker layout under the supervisor.
pub fn unit_workers(server: ProcessServer) -> (u32, u32) {
    match server {
        ProcessServer::Gunicorn { workers, threads } => (workers, threads),
        ProcessServer::Waitress => (3, 3),
    }
}

pub struct SupervisorConfigurator<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a Config,
    project_root: PathBuf,
    facts: &'a HostFacts,
}

impl<'a, R: CommandRunner + ?Sized> SupervisorConfigurator<'a, R> {
    pub fn new(runner: &'a R, config: &'a Config, project_root: &Path, facts: &'a HostFacts) -> Self {
        Self {
            runner,
            config,
            project_root: project_root.to_path_buf(),
            facts,
        }
    }

    pub fn unit_path(&self) -> PathBuf {
        Path::new(&self.config.supervisor.conf_dir).join(format!("{}.conf", self.config.service.name))
    }

    pub fn render(&self, sandbox: &RuntimeSandbox, server: ProcessServer) -> String {
        let (workers, threads) = unit_workers(server);
        let log_dir = self.config.log_dir(&self.project_root);
        let bin_dir = sandbox.bin_dir();
        let bind = self.config.loopback_bind();
        render_unit(&UnitTemplate {
            name: &self.config.service.name,
            project_root: &self.project_root,
            interpreter: &sandbox.interpreter,
            bin_dir: &bin_dir,
            log_dir: &log_dir,
            workers,
            threads,
            bind: &bind,
            target: &self.config.service.wsgi_target,
        })
    }

    pub fn configure(&self, sandbox: &RuntimeSandbox, server: ProcessServer) -> Result<SupervisorReport, BmsError> {
        if self.facts.os != OsFamily::Linux {
            return Err(BmsError::Unsupported(
                "supervisor units are only managed on Linux".to_string(),
            ));
        }
        let mut warnings = Vec::new();
        if !self.facts.has_tool(Tool::Supervisorctl) {
            let message = "supervisorctl not found; the unit is installed but cannot be activated until supervisor is installed".to_string();
            warn!("{message}");
            warnings.push(message);
        }

        let log_dir = self.config.log_dir(&self.project_root);
        if !log_dir.exists() {
            fs::create_dir_all(&log_dir)?;
            info!(path = %log_dir.display(), "created log directory");
        }

        let unit_path = self.unit_path();
        let rendered = self.render(sandbox, server);
        let changed = fs::read_to_string(&unit_path)
            .map(|live| live != rendered)
            .unwrap_or(true);
        if changed {
            info!(path = %unit_path.display(), "installing supervisor unit");
            install_file(self.runner, &unit_path, &rendered, &self.config.runtime_dir())?;
        }

        Ok(SupervisorReport {
            unit_path,
            changed,
            activation: self.activate(),
            warnings,
        })
    }

    /// reread, update, restart. Each step is attempted regardless of the
    /// previous one.
    pub fn activate(&self) -> Vec<CtlStep> {
        let name = self.config.service.name.as_str();
        [vec!["reread"], vec!["update"], vec!["restart", name]]
            .into_iter()
            .map(|args| self.ctl(&args))
            .collect()
    }

    fn ctl(&self, args: &[&str]) -> CtlStep {
        let spec = CommandSpec::new("supervisorctl")
            .args(args.iter().copied())
            .timeout(CTL_TIMEOUT)
            .elevated();
        let command = spec.render();
        match self.runner.run(&spec) {
            Ok(out) if out.success() => CtlStep {
                command,
                ok: true,
                detail: non_empty(out.stdout_text()),
            },
            Ok(out) => {
                warn!(command = %command, output = %out.excerpt(), "supervisorctl step failed");
                CtlStep {
                    command,
                    ok: false,
                    detail: non_empty(out.excerpt()),
                }
            }
            Err(err) => {
                warn!(command = %command, error = %err, "supervisorctl step failed");
                CtlStep {
                    command,
                    ok: false,
                    detail: Some(err.to_string()),
                }
            }
        }
    }

    /// PID supervisor reports for the program, if it is running.
    pub fn program_pid(&self) -> Option<u32> {
        if !self.facts.has_tool(Tool::Supervisorctl) {
            return None;
        }
        let spec = CommandSpec::new("supervisorctl")
            .args(["pid", self.config.service.name.as_str()])
            .timeout(Duration::from_secs(2))
            .elevated();
        let out = self.runner.run(&spec).ok()?;
        out.stdout_text().trim().parse().ok().filter(|pid| *pid > 0)
    }

    /// `supervisorctl status <name>` parsed into (running, pid).
    pub fn program_status(&self) -> Option<(bool, Option<u32>)> {
        if !self.facts.has_tool(Tool::Supervisorctl) {
            return None;
        }
        let spec = CommandSpec::new("supervisorctl")
            .args(["status", self.config.service.name.as_str()])
            .timeout(Duration::from_secs(2))
            .elevated();
        let out = self.runner.run(&spec).ok()?;
        parse_status_line(&out.stdout_text())
    }
}

/// `BMS  RUNNING   pid 1234, uptime 0:10:00`
pub fn parse_status_line(line: &str) -> Option<(bool, Option<u32>)> {
    let mut parts = line.split_whitespace();
    parts.next()?;
    let state = parts.next()?;
    let running = state == "RUNNING";
    let pid = line
        .split("pid ")
        .nth(1)
        .and_then(|rest| rest.split(',').next())
        .and_then(|digits| digits.trim().parse().ok());
    Some((running, pid))
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
