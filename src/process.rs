//! Process lookup and graceful-then-forced termination.

use crate::runner::{CommandRunner, CommandSpec};
use serde::Serialize;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::thread;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind};
use tracing::{debug, warn};

/// Time a process gets to honour a termination request before it is killed.
pub const GRACEFUL_WAIT: Duration = Duration::from_secs(3);
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
const KILL_CONFIRM_WAIT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent: Option<u32>,
    pub name: String,
    pub cmdline: String,
    pub run_time_secs: u64,
}

fn join_cmd(cmd: &[OsString]) -> String {
    cmd.iter()
        .map(|part| part.to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A refreshed process table including command lines.
pub fn process_table() -> Vec<ProcessInfo> {
    let mut system = System::new();
    system.refresh_processes_specifics(
        ProcessesToUpdate::All,
        true,
        ProcessRefreshKind::nothing().with_cmd(UpdateKind::OnlyIfNotSet),
    );
    system
        .processes()
        .iter()
        .map(|(pid, proc)| ProcessInfo {
            pid: pid.as_u32(),
            parent: proc.parent().map(|p| p.as_u32()),
            name: proc.name().to_string_lossy().to_string(),
            cmdline: join_cmd(proc.cmd()),
            run_time_secs: proc.run_time(),
        })
        .collect()
}

fn basename(word: &str) -> &str {
    word.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(word)
}

/// The words naming what a process runs: its name, the basename of
/// argv[0], and for an interpreter the `-m` module or script it was given.
/// Plain arguments such as file paths are never included.
pub fn program_words(proc: &ProcessInfo) -> Vec<&str> {
    let mut words = vec![proc.name.as_str()];
    let mut argv = proc.cmdline.split_whitespace();
    let Some(argv0) = argv.next() else {
        return words;
    };
    let program = basename(argv0);
    words.push(program);
    if program.starts_with("python") || proc.name.starts_with("python") {
        while let Some(arg) = argv.next() {
            if arg == "-m" {
                words.extend(argv.next());
                break;
            }
            if !arg.starts_with('-') {
                words.push(basename(arg));
                break;
            }
        }
    }
    words
}

/// Processes whose program words start with any of `patterns`, excluding
/// this process.
pub fn find_matching(table: &[ProcessInfo], patterns: &[String]) -> Vec<ProcessInfo> {
    let me = std::process::id();
    table
        .iter()
        .filter(|proc| proc.pid != me)
        .filter(|proc| {
            let words = program_words(proc);
            patterns
                .iter()
                .map(|p| p.trim())
                .filter(|p| !p.is_empty())
                .any(|p| words.iter().any(|word| word.starts_with(p)))
        })
        .cloned()
        .collect()
}

/// `roots` plus every process descending from them.
pub fn with_descendants(table: &[ProcessInfo], roots: &[u32]) -> BTreeSet<u32> {
    let mut set: BTreeSet<u32> = roots.iter().copied().collect();
    loop {
        let before = set.len();
        for proc in table {
            if let Some(parent) = proc.parent {
                if set.contains(&parent) {
                    set.insert(proc.pid);
                }
            }
        }
        if set.len() == before {
            return set;
        }
    }
}

#[cfg(unix)]
pub fn process_alive(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    let exists = match kill(NixPid::from_raw(raw), None::<Signal>) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(Errno::ESRCH) => false,
        Err(_) => false,
    };
    exists && !is_zombie(pid)
}

#[cfg(not(unix))]
pub fn process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    system.process(Pid::from_u32(pid)).is_some()
}

/// An exited-but-unreaped child still answers signal 0.
#[cfg(unix)]
fn is_zombie(pid: u32) -> bool {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| parse_stat_state(&stat))
        .map_or(false, |state| state == 'Z')
}

pub fn parse_stat_state(stat: &str) -> Option<char> {
    let rest = &stat[stat.rfind(')')? + 1..];
    rest.split_whitespace().next()?.chars().next()
}

/// Field 22 of `/proc/<pid>/stat`: start time in clock ticks since boot.
pub fn parse_stat_start_ticks(stat: &str) -> Option<u64> {
    let rest = &stat[stat.rfind(')')? + 1..];
    // fields after the command name start at field 3
    rest.split_whitespace().nth(19)?.parse().ok()
}

/// Process uptime from `/proc` where available, else from sysinfo.
pub fn process_uptime_secs(pid: u32) -> Option<u64> {
    #[cfg(target_os = "linux")]
    {
        let from_proc = (|| {
            let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
            let start_ticks = parse_stat_start_ticks(&stat)?;
            let uptime = std::fs::read_to_string("/proc/uptime").ok()?;
            let system_uptime: f64 = uptime.split_whitespace().next()?.parse().ok()?;
            let ticks = nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK)
                .ok()
                .flatten()
                .filter(|t| *t > 0)? as f64;
            let started = start_ticks as f64 / ticks;
            Some((system_uptime - started).max(0.0) as u64)
        })();
        if from_proc.is_some() {
            return from_proc;
        }
    }
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[Pid::from_u32(pid)]), true);
    system.process(Pid::from_u32(pid)).map(|p| p.run_time())
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum Termination {
    AlreadyGone,
    Graceful,
    Forced,
    Failed(String),
}

impl Termination {
    pub fn stopped(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    pub grace: Duration,
    pub poll: Duration,
}

impl Default for Escalation {
    fn default() -> Self {
        Self {
            grace: GRACEFUL_WAIT,
            poll: POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Graceful,
    Forced,
}

fn wait_for_exit(pid: u32, limit: Duration, poll: Duration) -> bool {
    let started = Instant::now();
    loop {
        if !process_alive(pid) {
            return true;
        }
        if started.elapsed() >= limit {
            return false;
        }
        thread::sleep(poll);
    }
}

/// Requests termination, waits `grace`, then kills survivors.
pub fn terminate<R: CommandRunner + ?Sized>(runner: &R, pid: u32, escalation: Escalation) -> Termination {
    if !process_alive(pid) {
        return Termination::AlreadyGone;
    }
    if let Err(err) = send(runner, pid, Phase::Graceful) {
        warn!(pid, error = %err, "graceful termination request failed");
    }
    if wait_for_exit(pid, escalation.grace, escalation.poll) {
        debug!(pid, "exited after graceful request");
        return Termination::Graceful;
    }
    warn!(pid, "still running after {:?}; killing", escalation.grace);
    if let Err(err) = send(runner, pid, Phase::Forced) {
        return Termination::Failed(err);
    }
    if wait_for_exit(pid, KILL_CONFIRM_WAIT.max(escalation.poll), escalation.poll) {
        Termination::Forced
    } else {
        Termination::Failed(format!("pid {pid} survived a forced kill"))
    }
}

#[cfg(unix)]
fn send<R: CommandRunner + ?Sized>(runner: &R, pid: u32, phase: Phase) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    let raw = i32::try_from(pid).map_err(|_| format!("pid {pid} out of range"))?;
    let (signal, flag) = match phase {
        Phase::Graceful => (Signal::SIGTERM, "-TERM"),
        Phase::Forced => (Signal::SIGKILL, "-KILL"),
    };
    match kill(NixPid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(Errno::EPERM) => {
            // owned by another user, typically the service account
            let spec = CommandSpec::new("kill")
                .arg(flag)
                .arg(pid.to_string())
                .elevated();
            match runner.run(&spec) {
                Ok(out) if out.success() => Ok(()),
                Ok(out) => Err(format!("`{}` failed: {}", spec.render(), out.excerpt())),
                Err(err) => Err(format!("`{}` failed: {err}", spec.render())),
            }
        }
        Err(err) => Err(format!("failed to send {signal:?} to {pid}: {err}")),
    }
}

#[cfg(not(unix))]
fn send<R: CommandRunner + ?Sized>(runner: &R, pid: u32, phase: Phase) -> Result<(), String> {
    let pid_string = pid.to_string();
    let mut spec = CommandSpec::new("taskkill").args(["/PID", pid_string.as_str(), "/T"]);
    if phase == Phase::Forced {
        spec = spec.arg("/F");
    }
    match runner.run(&spec) {
        Ok(out) if out.success() || !process_alive(pid) => Ok(()),
        Ok(out) => Err(format!("`{}` failed: {}", spec.render(), out.excerpt())),
        Err(err) => Err(format!("`{}` failed: {err}", spec.render())),
    }
}
