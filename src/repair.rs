//! Repair Orchestrator: a fixed sequence of independent, single-attempt
//! recovery steps. A failed step is recorded and the next step still runs.

use crate::config::Config;
use crate::error::BmsError;
use crate::health::{probe_port, prune_monitoring_logs, LOG_RETENTION_DAYS};
use crate::host::{HostFacts, OsFamily, Tool};
use crate::probe::Probes;
use crate::process::{
    find_matching, process_alive, process_table, terminate, with_descendants, Escalation, ProcessInfo,
    Termination,
};
use crate::proxy::{ProxyConfigurator, ReloadAction};
use crate::runner::{CommandRunner, CommandSpec};
use crate::sandbox::{clear_bytecode_caches, EnvironmentManager, RuntimeSandbox};
use crate::supervisor::SupervisorConfigurator;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

pub const LOG_ARCHIVE_BYTES: u64 = 10 * 1024 * 1024;
pub const ARCHIVE_MAX_AGE: Duration = Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
const ARCHIVE_DIR: &str = "archive";
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const DIR_MODE: u32 = 0o755;
const EXEC_MODE: u32 = 0o755;
const FILE_MODE: u32 = 0o644;
const SECRET_MODE: u32 = 0o600;
const EXEC_SUFFIXES: [&str; 2] = [".sh", ".cgi"];
const SECRET_FILES: [&str; 4] = [".env", "users.db", "bmsctl.yaml", "secret.key"];
const UNWALKED_DIRS: [&str; 3] = ["venv", ".git", "node_modules"];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RepairStep {
    AppServerCleanup,
    PortCleanup,
    Supervisor,
    ReverseProxy,
    Dependencies,
    Logs,
    Permissions,
}

impl RepairStep {
    pub const ORDER: [RepairStep; 7] = [
        RepairStep::AppServerCleanup,
        RepairStep::PortCleanup,
        RepairStep::Supervisor,
        RepairStep::ReverseProxy,
        RepairStep::Dependencies,
        RepairStep::Logs,
        RepairStep::Permissions,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Self::AppServerCleanup => "app-server cleanup",
            Self::PortCleanup => "port cleanup",
            Self::Supervisor => "supervisor repair",
            Self::ReverseProxy => "reverse-proxy repair",
            Self::Dependencies => "dependency repair",
            Self::Logs => "log repair",
            Self::Permissions => "permission repair",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum StepStatus {
    Ok,
    Failed(String),
    Skipped(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RepairAction {
    Terminated { pid: u32, outcome: Termination },
    RemovedArtifact { path: PathBuf },
    ForcedPortRelease { port: u16, command: String },
    RestartedProgram { name: String },
    RestartedService { unit: String },
    RegeneratedConfig { path: PathBuf },
    ReloadedProxy { result: ReloadAction },
    ReinstalledDependencies,
    ClearedCaches { count: usize },
    ArchivedLog { path: PathBuf, archive: PathBuf },
    DeletedLog { path: PathBuf },
    CreatedDirectory { path: PathBuf },
    ChangedMode { path: PathBuf, mode: String },
    ChangedOwner { path: PathBuf, owner: String },
}

impl RepairAction {
    /// Actions that remove a process, a file or a live configuration.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            Self::Terminated { .. }
                | Self::RemovedArtifact { .. }
                | Self::ForcedPortRelease { .. }
                | Self::RegeneratedConfig { .. }
                | Self::ArchivedLog { .. }
                | Self::DeletedLog { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StepReport {
    pub step: RepairStep,
    #[serde(flatten)]
    pub status: StepStatus,
    pub actions: Vec<RepairAction>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RepairReport {
    pub started_at: DateTime<Local>,
    pub steps: Vec<StepReport>,
}

impl RepairReport {
    pub fn destructive_actions(&self) -> usize {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .filter(|a| a.is_destructive())
            .count()
    }

    pub fn failed_steps(&self) -> Vec<RepairStep> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed(_)))
            .map(|s| s.step)
            .collect()
    }

    pub fn step(&self, step: RepairStep) -> Option<&StepReport> {
        self.steps.iter().find(|s| s.step == step)
    }
}

type StepResult = Result<StepStatus, String>;

pub struct RepairOrchestrator<'a, R: CommandRunner> {
    runner: &'a R,
    config: &'a Config,
    project_root: PathBuf,
    facts: &'a HostFacts,
    sandbox: Option<RuntimeSandbox>,
    escalation: Escalation,
}

impl<'a, R: CommandRunner> RepairOrchestrator<'a, R> {
    pub fn new(
        runner: &'a R,
        config: &'a Config,
        project_root: &Path,
        facts: &'a HostFacts,
        sandbox: Option<RuntimeSandbox>,
    ) -> Self {
        Self {
            runner,
            config,
            project_root: project_root.to_path_buf(),
            facts,
            sandbox,
            escalation: Escalation::default(),
        }
    }

    #[cfg(test)]
    pub fn with_escalation(mut self, escalation: Escalation) -> Self {
        self.escalation = escalation;
        self
    }

    fn supervisor(&self) -> SupervisorConfigurator<'_, R> {
        SupervisorConfigurator::new(self.runner, self.config, &self.project_root, self.facts)
    }

    fn proxy(&self) -> ProxyConfigurator<'_, R> {
        ProxyConfigurator::new(self.runner, self.config, &self.project_root, self.facts)
    }

    /// The supervisor-managed program and its workers. Cleanup never
    /// touches these, so repairing a healthy deployment leaves it running.
    pub fn protected_pids(&self, table: &[ProcessInfo]) -> BTreeSet<u32> {
        match self.supervisor().program_pid() {
            Some(pid) => with_descendants(table, &[pid]),
            None => BTreeSet::new(),
        }
    }

    pub fn repair(&self) -> RepairReport {
        let started_at = Local::now();
        let protected = self.protected_pids(&process_table());
        let mut steps = Vec::with_capacity(RepairStep::ORDER.len());
        for step in RepairStep::ORDER {
            info!(step = step.label(), "repair step starting");
            let mut actions = Vec::new();
            let result = match step {
                RepairStep::AppServerCleanup => self.app_server_cleanup(&protected, &mut actions),
                RepairStep::PortCleanup => self.port_cleanup(&protected, &mut actions),
                RepairStep::Supervisor => self.supervisor_repair(&mut actions),
                RepairStep::ReverseProxy => self.proxy_repair(&mut actions),
                RepairStep::Dependencies => self.dependency_repair(&mut actions),
                RepairStep::Logs => self.log_repair(&mut actions),
                RepairStep::Permissions => self.permission_repair(&mut actions),
            };
            let status = result.unwrap_or_else(StepStatus::Failed);
            if let StepStatus::Failed(reason) = &status {
                warn!(step = step.label(), reason = %reason, "repair step failed");
            }
            steps.push(StepReport {
                step,
                status,
                actions,
            });
        }
        RepairReport { started_at, steps }
    }

    /// Step 1: stray app-server processes, then stale PID/socket files.
    pub fn app_server_cleanup(&self, protected: &BTreeSet<u32>, actions: &mut Vec<RepairAction>) -> StepResult {
        let table = process_table();
        let candidates: Vec<ProcessInfo> = find_matching(&table, &self.config.service.process_patterns)
            .into_iter()
            .filter(|p| !protected.contains(&p.pid))
            .collect();
        let pids: BTreeSet<u32> = candidates.iter().map(|p| p.pid).collect();
        // masters first; their workers usually exit with them
        let mut ordered: Vec<&ProcessInfo> = candidates.iter().collect();
        ordered.sort_by_key(|p| p.parent.map_or(false, |parent| pids.contains(&parent)));

        let mut failures = Vec::new();
        for proc in ordered {
            match terminate(self.runner, proc.pid, self.escalation) {
                Termination::AlreadyGone => {}
                Termination::Failed(reason) => failures.push(reason),
                outcome => actions.push(RepairAction::Terminated {
                    pid: proc.pid,
                    outcome,
                }),
            }
        }

        for path in self.config.artifact_paths() {
            if fs::symlink_metadata(&path).is_err() || !artifact_is_stale(&path, protected) {
                continue;
            }
            match self.remove_path(&path) {
                Ok(()) => actions.push(RepairAction::RemovedArtifact { path }),
                Err(err) => failures.push(format!("{}: {err}", path.display())),
            }
        }

        if failures.is_empty() {
            Ok(StepStatus::Ok)
        } else {
            Err(failures.join("; "))
        }
    }

    fn remove_path(&self, path: &Path) -> Result<(), String> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => {
                let spec = CommandSpec::new("rm")
                    .arg("-f")
                    .arg(path.to_string_lossy())
                    .elevated();
                match self.runner.run(&spec) {
                    Ok(out) if out.success() => Ok(()),
                    Ok(out) => Err(out.excerpt()),
                    Err(err) => Err(err.to_string()),
                }
            }
            Err(err) => Err(err.to_string()),
        }
    }

    /// Step 2: whatever still holds the app-server port.
    pub fn port_cleanup(&self, protected: &BTreeSet<u32>, actions: &mut Vec<RepairAction>) -> StepResult {
        let port = self.config.service.port;
        let probes = Probes::new(self.runner, self.facts);
        let owners = live_owners(&probes, port);
        let strangers: Vec<u32> = owners.iter().copied().filter(|p| !protected.contains(p)).collect();
        if strangers.is_empty() {
            let occupied = probe_port("127.0.0.1", port, PORT_PROBE_TIMEOUT).is_open();
            if !occupied || !owners.is_empty() || !protected.is_empty() {
                return Ok(StepStatus::Ok);
            }
            // held, but nobody could be enumerated
            return match probes.force_free_port(port) {
                Ok(command) => {
                    actions.push(RepairAction::ForcedPortRelease { port, command });
                    Ok(StepStatus::Ok)
                }
                Err(reason) => Err(format!("port {port} is occupied by an unknown process; {reason}")),
            };
        }

        let mut failures = Vec::new();
        for pid in strangers {
            match terminate(self.runner, pid, self.escalation) {
                Termination::AlreadyGone => {}
                Termination::Failed(reason) => failures.push(reason),
                outcome => actions.push(RepairAction::Terminated { pid, outcome }),
            }
        }
        let remaining: Vec<u32> = live_owners(&probes, port)
            .into_iter()
            .filter(|p| !protected.contains(p))
            .collect();
        if !remaining.is_empty() {
            failures.push(format!("port {port} still held by {remaining:?}"));
        } else if protected.is_empty() && probe_port("127.0.0.1", port, PORT_PROBE_TIMEOUT).is_open() {
            // an owner the port tools could not see, or one that re-bound
            failures.push(format!("port {port} is still occupied after terminating its owners"));
        }
        if failures.is_empty() {
            Ok(StepStatus::Ok)
        } else {
            Err(failures.join("; "))
        }
    }

    /// Step 3: reread/update/restart; restart the supervisor daemon itself
    /// when its CLI cannot talk to it.
    pub fn supervisor_repair(&self, actions: &mut Vec<RepairAction>) -> StepResult {
        if self.facts.os != OsFamily::Linux {
            return Ok(StepStatus::Skipped("supervisor is only managed on Linux".to_string()));
        }
        if !self.facts.has_tool(Tool::Supervisorctl) {
            return Ok(StepStatus::Skipped("supervisorctl not installed".to_string()));
        }
        let supervisor = self.supervisor();
        if !supervisor.unit_path().exists() {
            return Ok(StepStatus::Skipped("no supervisor unit installed".to_string()));
        }
        let steps = supervisor.activate();
        if steps.iter().all(|s| !s.ok) {
            if !self.facts.has_tool(Tool::Systemctl) {
                return Err("supervisorctl is unusable and systemctl is not available".to_string());
            }
            let spec = CommandSpec::new("systemctl")
                .args(["restart", "supervisor"])
                .elevated();
            return match self.runner.run(&spec) {
                Ok(out) if out.success() => {
                    actions.push(RepairAction::RestartedService {
                        unit: "supervisor".to_string(),
                    });
                    Ok(StepStatus::Ok)
                }
                Ok(out) => Err(format!("`{}` failed: {}", spec.render(), out.excerpt())),
                Err(err) => Err(format!("`{}` failed: {err}", spec.render())),
            };
        }
        let restart_ok = steps.last().map_or(false, |s| s.ok);
        if restart_ok {
            actions.push(RepairAction::RestartedProgram {
                name: self.config.service.name.clone(),
            });
            Ok(StepStatus::Ok)
        } else {
            let details: Vec<String> = steps
                .iter()
                .filter(|s| !s.ok)
                .map(|s| format!("{}: {}", s.command, s.detail.clone().unwrap_or_default()))
                .collect();
            Err(details.join("; "))
        }
    }

    /// Step 4: regenerate an invalid configuration; otherwise reload or start.
    pub fn proxy_repair(&self, actions: &mut Vec<RepairAction>) -> StepResult {
        if self.facts.os != OsFamily::Linux {
            return Ok(StepStatus::Skipped("reverse proxy is only managed on Linux".to_string()));
        }
        if !self.facts.has_tool(Tool::Nginx) {
            return Ok(StepStatus::Skipped("nginx not installed".to_string()));
        }
        let proxy = self.proxy();
        match proxy.check() {
            Ok(()) => {}
            Err(BmsError::Validation { message }) => {
                warn!(output = %message, "proxy configuration invalid; regenerating");
                let outcome = proxy.configure().map_err(|err| err.to_string())?;
                if outcome.changed {
                    actions.push(RepairAction::RegeneratedConfig {
                        path: outcome.site_path,
                    });
                }
            }
            Err(err) => return Err(err.to_string()),
        }
        let result = proxy.reload().map_err(|err| err.to_string())?;
        actions.push(RepairAction::ReloadedProxy { result });
        Ok(StepStatus::Ok)
    }

    /// Step 5: pip upgrade and manifest reinstall, then bytecode caches.
    pub fn dependency_repair(&self, actions: &mut Vec<RepairAction>) -> StepResult {
        let install_result = match &self.sandbox {
            Some(sandbox) => {
                let manager = EnvironmentManager::new(
                    self.runner,
                    &self.project_root,
                    sandbox.root.clone(),
                    sandbox.manifest.clone(),
                    self.facts.os.clone(),
                );
                let mut sandbox = sandbox.clone();
                match manager.install(&mut sandbox) {
                    Ok(()) => {
                        actions.push(RepairAction::ReinstalledDependencies);
                        Ok(())
                    }
                    Err(err) => Err(err.to_string()),
                }
            }
            None => Err("no sandbox available".to_string()),
        };
        let count = clear_bytecode_caches(&self.project_root);
        if count > 0 {
            actions.push(RepairAction::ClearedCaches { count });
        }
        install_result.map(|_| StepStatus::Ok)
    }

    /// Step 6: archive oversized logs, prune old archives and monitoring
    /// files, fix the log dir.
    pub fn log_repair(&self, actions: &mut Vec<RepairAction>) -> StepResult {
        let log_dir = self.config.log_dir(&self.project_root);
        if !log_dir.exists() {
            fs::create_dir_all(&log_dir).map_err(|err| err.to_string())?;
            actions.push(RepairAction::CreatedDirectory {
                path: log_dir.clone(),
            });
        }
        let mut failures = Vec::new();
        if let Err(err) = ensure_mode(&log_dir, DIR_MODE, actions) {
            failures.push(err);
        }

        let archive_dir = log_dir.join(ARCHIVE_DIR);
        let stamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let entries = fs::read_dir(&log_dir).map_err(|err| err.to_string())?;
        for entry in entries.flatten() {
            let path = entry.path();
            let is_log = path.extension().map_or(false, |ext| ext == "log");
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !is_log || !meta.is_file() || meta.len() <= LOG_ARCHIVE_BYTES {
                continue;
            }
            match archive_log(&path, &archive_dir, &stamp) {
                Ok(archive) => actions.push(RepairAction::ArchivedLog { path, archive }),
                Err(err) => failures.push(format!("{}: {err}", path.display())),
            }
        }

        if let Ok(archives) = fs::read_dir(&archive_dir) {
            let now = SystemTime::now();
            for entry in archives.flatten() {
                let path = entry.path();
                let old = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| now.duration_since(modified).ok())
                    .map_or(false, |age| age > ARCHIVE_MAX_AGE);
                if !old {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => actions.push(RepairAction::DeletedLog { path }),
                    Err(err) => failures.push(format!("{}: {err}", path.display())),
                }
            }
        }

        for path in prune_monitoring_logs(&log_dir, Local::now().date_naive()) {
            actions.push(RepairAction::DeletedLog { path });
        }

        if failures.is_empty() {
            Ok(StepStatus::Ok)
        } else {
            Err(failures.join("; "))
        }
    }

    /// Step 7: restrictive-but-functional modes across the project tree,
    /// and service-account ownership of the log and upload directories.
    pub fn permission_repair(&self, actions: &mut Vec<RepairAction>) -> StepResult {
        if !cfg!(unix) {
            return Ok(StepStatus::Skipped("file modes are not managed on this platform".to_string()));
        }
        let mut failures = Vec::new();
        let mut stack = vec![self.project_root.clone()];
        while let Some(dir) = stack.pop() {
            if let Err(err) = ensure_mode(&dir, DIR_MODE, actions) {
                failures.push(err);
            }
            let Ok(entries) = fs::read_dir(&dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                let Ok(file_type) = entry.file_type() else {
                    continue;
                };
                if file_type.is_symlink() {
                    continue;
                }
                if file_type.is_dir() {
                    if !UNWALKED_DIRS.contains(&name.as_str()) {
                        stack.push(path);
                    }
                    continue;
                }
                if let Err(err) = ensure_mode(&path, file_mode_for(&name), actions) {
                    failures.push(err);
                }
            }
        }

        let mut notes = Vec::new();
        if self.facts.os == OsFamily::Linux {
            for dir in [
                self.config.log_dir(&self.project_root),
                self.config.upload_dir(&self.project_root),
            ] {
                match self.ensure_owner(&dir, actions) {
                    Ok(Some(note)) => notes.push(note),
                    Ok(None) => {}
                    Err(err) => failures.push(err),
                }
            }
        }

        if !failures.is_empty() {
            let shown: Vec<String> = failures.iter().take(5).cloned().collect();
            let more = failures.len().saturating_sub(shown.len());
            let mut reason = shown.join("; ");
            if more > 0 {
                reason.push_str(&format!("; and {more} more"));
            }
            return Err(reason);
        }
        if notes.is_empty() {
            Ok(StepStatus::Ok)
        } else {
            Ok(StepStatus::Skipped(notes.join("; ")))
        }
    }

    #[cfg(unix)]
    fn ensure_owner(&self, dir: &Path, actions: &mut Vec<RepairAction>) -> Result<Option<String>, String> {
        use nix::unistd::{Group, User};

        if !dir.exists() {
            return Ok(None);
        }
        let account = self.config.service.user.as_str();
        let user = match User::from_name(account) {
            Ok(Some(user)) => user,
            _ => return Ok(Some(format!("service account {account} does not exist; ownership left unchanged"))),
        };
        let Some(misowned) = first_misowned(dir, user.uid.as_raw(), user.gid.as_raw()) else {
            return Ok(None);
        };
        debug!(path = %misowned.display(), "not owned by the service account");
        let group = Group::from_gid(user.gid)
            .ok()
            .flatten()
            .map(|g| g.name)
            .unwrap_or_else(|| user.gid.as_raw().to_string());
        let owner = format!("{account}:{group}");
        let spec = CommandSpec::new("chown")
            .args(["-R", owner.as_str()])
            .arg(dir.to_string_lossy())
            .elevated();
        match self.runner.run(&spec) {
            Ok(out) if out.success() => {
                actions.push(RepairAction::ChangedOwner {
                    path: dir.to_path_buf(),
                    owner,
                });
                Ok(None)
            }
            Ok(out) => Err(format!("`{}` failed: {}", spec.render(), out.excerpt())),
            Err(err) => Err(format!("`{}` failed: {err}", spec.render())),
        }
    }

    #[cfg(not(unix))]
    fn ensure_owner(&self, _dir: &Path, _actions: &mut Vec<RepairAction>) -> Result<Option<String>, String> {
        Ok(None)
    }
}

/// The first entry under `dir` (itself included) not owned by `uid:gid`.
/// Symlinks are not followed.
#[cfg(unix)]
fn first_misowned(dir: &Path, uid: u32, gid: u32) -> Option<PathBuf> {
    use std::os::unix::fs::MetadataExt;

    let mut stack = vec![dir.to_path_buf()];
    while let Some(path) = stack.pop() {
        let Ok(meta) = fs::symlink_metadata(&path) else {
            continue;
        };
        if meta.uid() != uid || meta.gid() != gid {
            return Some(path);
        }
        if meta.is_dir() {
            if let Ok(entries) = fs::read_dir(&path) {
                stack.extend(entries.flatten().map(|entry| entry.path()));
            }
        }
    }
    None
}

/// Port owners that are still alive; `ss` output can lag a kill.
fn live_owners<R: CommandRunner + ?Sized>(probes: &Probes<'_, R>, port: u16) -> BTreeSet<u32> {
    probes
        .port_owners(port)
        .into_iter()
        .filter(|pid| process_alive(*pid))
        .collect()
}

pub fn file_mode_for(name: &str) -> u32 {
    if SECRET_FILES.contains(&name) {
        SECRET_MODE
    } else if EXEC_SUFFIXES.iter().any(|suffix| name.ends_with(suffix)) {
        EXEC_MODE
    } else {
        FILE_MODE
    }
}

#[cfg(unix)]
fn ensure_mode(path: &Path, mode: u32, actions: &mut Vec<RepairAction>) -> Result<(), String> {
    use std::os::unix::fs::PermissionsExt;

    let current = crate::fsutil::file_mode(path).ok_or_else(|| format!("{}: unreadable", path.display()))?;
    if current & 0o777 == mode {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|err| format!("{}: {err}", path.display()))?;
    actions.push(RepairAction::ChangedMode {
        path: path.to_path_buf(),
        mode: format!("{mode:o}"),
    });
    Ok(())
}

#[cfg(not(unix))]
fn ensure_mode(_path: &Path, _mode: u32, _actions: &mut Vec<RepairAction>) -> Result<(), String> {
    Ok(())
}

/// Copies the log into the archive dir and truncates it in place, so
/// writers holding the file open keep a valid handle.
fn archive_log(path: &Path, archive_dir: &Path, stamp: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(archive_dir)?;
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "log".to_string());
    let archive = archive_dir.join(format!("{stem}_{stamp}.log"));
    fs::copy(path, &archive)?;
    fs::OpenOptions::new().write(true).open(path)?.set_len(0)?;
    Ok(archive)
}

/// A PID file whose process is gone (and not supervisor-owned), or a socket
/// nobody is listening on.
fn artifact_is_stale(path: &Path, protected: &BTreeSet<u32>) -> bool {
    let is_socket = path.extension().map_or(false, |ext| ext == "sock");
    if is_socket {
        #[cfg(unix)]
        {
            return std::os::unix::net::UnixStream::connect(path).is_err();
        }
        #[cfg(not(unix))]
        {
            return true;
        }
    }
    match fs::read_to_string(path)
        .ok()
        .and_then(|text| text.trim().parse::<u32>().ok())
    {
        Some(pid) => !(protected.contains(&pid) || process_alive(pid)),
        None => true,
    }
}
