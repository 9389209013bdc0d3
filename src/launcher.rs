//! Service Launcher: picks the start command for the current profile and
//! runs it in the foreground, streaming output.

use crate::config::Config;
use crate::error::BmsError;
use crate::host::{HostFacts, OsFamily};
use crate::process::{process_alive, terminate, Escalation, Termination};
use crate::proxy::ProxyConfigurator;
use crate::recommend::{DeploymentProfile, ProcessServer, ReverseProxy};
use crate::runner::{probe, spawn_error, CommandRunner, CommandSpec};
use crate::sandbox::RuntimeSandbox;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

const DEV_WORKERS: u32 = 2;
const DEV_THREADS: u32 = 2;

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceHandle {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid_file: Option<PathBuf>,
    pub bind: String,
    pub log_paths: Vec<PathBuf>,
}

impl ServiceHandle {
    pub fn recorded_pid(&self) -> Option<u32> {
        let path = self.pid_file.as_ref()?;
        fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    /// Terminates the recorded process and removes its PID file.
    pub fn stop<R: CommandRunner + ?Sized>(&self, runner: &R) -> Termination {
        let outcome = match self.recorded_pid() {
            Some(pid) => terminate(runner, pid, Escalation::default()),
            None => Termination::AlreadyGone,
        };
        if outcome.stopped() {
            if let Some(path) = &self.pid_file {
                let _ = fs::remove_file(path);
            }
        }
        outcome
    }

    pub fn is_running(&self) -> bool {
        self.recorded_pid().map_or(false, process_alive)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub server: ProcessServer,
    pub spec: CommandSpec,
    pub handle: ServiceHandle,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct LaunchResult {
    pub handle: ServiceHandle,
    pub server: &'static str,
    pub command: String,
    pub exit_code: i32,
}

pub struct Launcher<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a Config,
    project_root: PathBuf,
    facts: &'a HostFacts,
}

impl<'a, R: CommandRunner + ?Sized> Launcher<'a, R> {
    pub fn new(runner: &'a R, config: &'a Config, project_root: &Path, facts: &'a HostFacts) -> Self {
        Self {
            runner,
            config,
            project_root: project_root.to_path_buf(),
            facts,
        }
    }

    /// Whether gunicorn can be imported by the sandbox interpreter. Windows
    /// has no gunicorn.
    pub fn gunicorn_available(&self, sandbox: &RuntimeSandbox) -> bool {
        if self.facts.os == OsFamily::Windows || self.facts.is_termux {
            return false;
        }
        probe(
            self.runner,
            &CommandSpec::new(sandbox.interpreter_str())
                .args(["-m", "gunicorn", "--version"])
                .timeout(Duration::from_secs(5)),
        )
        .map_or(false, |out| out.success())
    }

    fn log_paths(&self) -> Vec<PathBuf> {
        let dir = self.config.log_dir(&self.project_root);
        vec![dir.join("gunicorn_out.log"), dir.join("gunicorn_err.log")]
    }

    fn gunicorn_spec(&self, sandbox: &RuntimeSandbox, workers: u32, threads: u32, bind: &str, target: &str) -> CommandSpec {
        CommandSpec::new(sandbox.interpreter_str())
            .args(["-m", "gunicorn", "-w"])
            .arg(workers.to_string())
            .arg("--threads")
            .arg(threads.to_string())
            .args(["-b", bind])
            .cwd(&self.project_root)
            .arg(target)
    }

    fn waitress_spec(&self, sandbox: &RuntimeSandbox, bind: &str, target: &str) -> CommandSpec {
        let spec = CommandSpec::new(sandbox.interpreter_str())
            .args(["-m", "waitress"])
            .arg(format!("--listen={bind}"))
            .cwd(&self.project_root);
        // factory targets are called by waitress rather than imported
        match target.strip_suffix("()") {
            Some(factory) => spec.arg("--call").arg(factory),
            None => spec.arg(target),
        }
    }

    /// The production server as recorded by its PID file.
    pub fn recorded_handle(&self) -> ServiceHandle {
        ServiceHandle {
            name: self.config.service.name.clone(),
            pid_file: Some(self.config.pid_file()),
            bind: self.config.loopback_bind(),
            log_paths: self.log_paths(),
        }
    }

    pub fn plan_development(&self, sandbox: &RuntimeSandbox) -> LaunchPlan {
        let bind = self.config.public_bind();
        let target = self.config.service.dev_target.as_str();
        let use_gunicorn = self.facts.os == OsFamily::Linux && self.gunicorn_available(sandbox);
        let (server, spec) = if use_gunicorn {
            (
                ProcessServer::Gunicorn {
                    workers: DEV_WORKERS,
                    threads: DEV_THREADS,
                },
                self.gunicorn_spec(sandbox, DEV_WORKERS, DEV_THREADS, &bind, target),
            )
        } else {
            (ProcessServer::Waitress, self.waitress_spec(sandbox, &bind, target))
        };
        LaunchPlan {
            server,
            spec,
            handle: ServiceHandle {
                name: self.config.service.name.clone(),
                pid_file: None,
                bind,
                log_paths: Vec::new(),
            },
        }
    }

    pub fn plan_production(&self, sandbox: &RuntimeSandbox, profile: &DeploymentProfile) -> LaunchPlan {
        let proxied = profile.reverse_proxy != ReverseProxy::None;
        let bind = if proxied {
            self.config.loopback_bind()
        } else {
            self.config.public_bind()
        };
        let target = self.config.service.wsgi_target.as_str();
        let pid_file = self.config.pid_file();
        match profile.process_server {
            ProcessServer::Gunicorn { workers, threads } if self.gunicorn_available(sandbox) => {
                let spec = self
                    .gunicorn_spec(sandbox, workers, threads, &bind, target)
                    .args(["--pid".to_string(), pid_file.to_string_lossy().to_string()]);
                LaunchPlan {
                    server: profile.process_server,
                    spec,
                    handle: ServiceHandle {
                        bind,
                        ..self.recorded_handle()
                    },
                }
            }
            preferred => {
                if preferred != ProcessServer::Waitress {
                    warn!("gunicorn is not available in the sandbox; falling back to waitress");
                }
                // waitress writes no PID file of its own; the runner records it
                LaunchPlan {
                    server: ProcessServer::Waitress,
                    spec: self.waitress_spec(sandbox, &bind, target).pid_file(&pid_file),
                    handle: ServiceHandle {
                        bind,
                        log_paths: Vec::new(),
                        ..self.recorded_handle()
                    },
                }
            }
        }
    }

    pub fn launch_development(
        &self,
        sandbox: &RuntimeSandbox,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<LaunchResult, BmsError> {
        let plan = self.plan_development(sandbox);
        info!(server = plan.server.name(), bind = %plan.handle.bind, "starting development server");
        self.run_plan(plan, on_line)
    }

    /// With a proxy in the profile, the proxy is configured and reloaded
    /// first and a failure there aborts the launch. The proxy may briefly
    /// answer 502 until the app server is listening.
    pub fn launch_production(
        &self,
        sandbox: &RuntimeSandbox,
        profile: &DeploymentProfile,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<LaunchResult, BmsError> {
        if profile.reverse_proxy != ReverseProxy::None {
            let proxy = ProxyConfigurator::new(self.runner, self.config, &self.project_root, self.facts);
            let outcome = proxy.configure()?;
            info!(site = %outcome.site_path.display(), changed = outcome.changed, "proxy site ready");
            let action = proxy.reload()?;
            info!(?action, "proxy active");
        }
        let plan = self.plan_production(sandbox, profile);
        if let Some(pid_file) = &plan.handle.pid_file {
            if let Some(parent) = pid_file.parent() {
                fs::create_dir_all(parent)?;
            }
        }
        let log_dir = self.config.log_dir(&self.project_root);
        fs::create_dir_all(&log_dir)?;
        info!(server = plan.server.name(), bind = %plan.handle.bind, "starting production server");
        self.run_plan(plan, on_line)
    }

    fn run_plan(&self, plan: LaunchPlan, on_line: &mut dyn FnMut(&str)) -> Result<LaunchResult, BmsError> {
        let command = plan.spec.render();
        let exit_code = self
            .runner
            .stream(&plan.spec, on_line)
            .map_err(|err| spawn_error(&err, &plan.spec))?;
        if exit_code != 0 {
            warn!(exit_code, command = %command, "server exited with non-zero status");
        }
        if let Some(pid_file) = &plan.handle.pid_file {
            if !plan.handle.is_running() {
                let _ = fs::remove_file(pid_file);
            }
        }
        Ok(LaunchResult {
            handle: plan.handle,
            server: plan.server.name(),
            command,
            exit_code,
        })
    }
}
