//! Health Monitor: a bounded-latency point-in-time snapshot.

use crate::config::Config;
use crate::error::BmsError;
use crate::fsutil::write_atomic_text_file;
use crate::host::{HostFacts, OsFamily};
use crate::probe::{Probes, ServiceManagerState, TemperatureReading};
use crate::process::{find_matching, process_table, process_uptime_secs, ProcessInfo};
use crate::runner::CommandRunner;
use crate::supervisor::SupervisorConfigurator;
use chrono::{DateTime, Days, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use sysinfo::{Disks, System};
use tracing::{debug, warn};

pub const TEMP_WARNING_C: f64 = 70.0;
pub const TEMP_CRITICAL_C: f64 = 80.0;
/// Days monitoring files and log archives are kept.
pub const LOG_RETENTION_DAYS: u64 = 7;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureLevel {
    Normal,
    Warning,
    Critical,
    Unknown,
}

pub fn temperature_level(celsius: Option<f64>) -> TemperatureLevel {
    match celsius {
        None => TemperatureLevel::Unknown,
        Some(c) if c >= TEMP_CRITICAL_C => TemperatureLevel::Critical,
        Some(c) if c >= TEMP_WARNING_C => TemperatureLevel::Warning,
        Some(_) => TemperatureLevel::Normal,
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SystemMetrics {
    pub load_average: Option<[f64; 3]>,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
    pub disk_used_gb: Option<f64>,
    pub disk_total_gb: Option<f64>,
    pub temperature: TemperatureReading,
    pub temperature_level: TemperatureLevel,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortOutcome {
    Open,
    Refused,
    Timeout,
    Closed,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PortStatus {
    pub port: u16,
    pub outcome: PortOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PortStatus {
    pub fn is_open(&self) -> bool {
        self.outcome == PortOutcome::Open
    }
}

/// TCP connect with a timeout; refused, timed out and other failures are
/// reported distinctly.
pub fn probe_port(host: &str, port: u16, timeout: Duration) -> PortStatus {
    let addr: SocketAddr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(err) => {
            return PortStatus {
                port,
                outcome: PortOutcome::Closed,
                latency_ms: None,
                error: Some(err.to_string()),
            }
        }
    };
    let started = Instant::now();
    match TcpStream::connect_timeout(&addr, timeout) {
        Ok(_) => PortStatus {
            port,
            outcome: PortOutcome::Open,
            latency_ms: Some(started.elapsed().as_secs_f64() * 1000.0),
            error: None,
        },
        Err(err) => {
            let outcome = match err.kind() {
                io::ErrorKind::ConnectionRefused => PortOutcome::Refused,
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => PortOutcome::Timeout,
                _ => PortOutcome::Closed,
            };
            PortStatus {
                port,
                outcome,
                latency_ms: None,
                error: Some(err.to_string()),
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StatusSource {
    ServiceManager,
    Supervisor,
    ProcessSearch,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ServiceStatus {
    pub name: String,
    pub running: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime_secs: Option<u64>,
    pub source: StatusSource,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Healthy,
    Degraded,
    Stopped,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Local>,
    pub hostname: String,
    pub local_ip: String,
    pub os: String,
    pub system: SystemMetrics,
    pub services: Vec<ServiceStatus>,
    pub ports: Vec<PortStatus>,
    pub state: ServiceState,
}

impl HealthSnapshot {
    pub fn service(&self, name: &str) -> Option<&ServiceStatus> {
        self.services.iter().find(|s| s.name == name)
    }

    pub fn port(&self, port: u16) -> Option<&PortStatus> {
        self.ports.iter().find(|p| p.port == port)
    }
}

/// Running app server but closed port, or critical temperature, is degraded.
pub fn derive_state(app: &ServiceStatus, app_port: &PortStatus, level: TemperatureLevel) -> ServiceState {
    if !app.running {
        return ServiceState::Stopped;
    }
    if !app_port.is_open() || level == TemperatureLevel::Critical {
        return ServiceState::Degraded;
    }
    ServiceState::Healthy
}

pub struct HealthMonitor<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a Config,
    facts: &'a HostFacts,
    project_root: Option<PathBuf>,
    sys_root: PathBuf,
}

impl<'a, R: CommandRunner + ?Sized> HealthMonitor<'a, R> {
    pub fn new(runner: &'a R, config: &'a Config, facts: &'a HostFacts) -> Self {
        Self {
            runner,
            config,
            facts,
            project_root: None,
            sys_root: PathBuf::from("/"),
        }
    }

    pub fn with_project_root(mut self, root: &Path) -> Self {
        self.project_root = Some(root.to_path_buf());
        self
    }

    pub fn with_sys_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sys_root = root.into();
        self
    }

    fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.config.monitoring.probe_timeout_ms.max(1))
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let probes = Probes::new(self.runner, self.facts).with_sys_root(&self.sys_root);
        let system = self.system_metrics(&probes);
        let table = process_table();

        let app = self.app_status(&table);
        let proxy = self.daemon_status(&probes, &table, "nginx", "nginx", "nginx");
        let supervisor = self.daemon_status(&probes, &table, "supervisor", "supervisor", "supervisord");

        let timeout = self.probe_timeout();
        let app_port = probe_port("127.0.0.1", self.config.service.port, timeout);
        let proxy_port = probe_port("127.0.0.1", self.config.proxy.listen_port, timeout);
        let state = derive_state(&app, &app_port, system.temperature_level);
        debug!(?state, "health snapshot taken");

        HealthSnapshot {
            timestamp: Local::now(),
            hostname: self.facts.network.hostname.clone(),
            local_ip: self.facts.network.local_ip.clone(),
            os: match &self.facts.os_edition {
                Some(edition) => edition.clone(),
                None if self.facts.os == OsFamily::Linux => self.facts.distro.clone(),
                None => self.facts.os.as_str().to_string(),
            },
            system,
            services: vec![app, proxy, supervisor],
            ports: vec![app_port, proxy_port],
            state,
        }
    }

    fn system_metrics(&self, probes: &Probes<'_, R>) -> SystemMetrics {
        let mut sys = System::new();
        sys.refresh_memory();
        let load = System::load_average();
        let load_average = if self.facts.os == OsFamily::Windows {
            None
        } else {
            Some([load.one, load.five, load.fifteen])
        };
        let (disk_used_gb, disk_total_gb) = self.disk_usage();
        let temperature = probes.temperature();
        SystemMetrics {
            load_average,
            memory_used_mb: sys.used_memory() / (1024 * 1024),
            memory_total_mb: sys.total_memory() / (1024 * 1024),
            disk_used_gb,
            disk_total_gb,
            temperature_level: temperature_level(temperature.celsius),
            temperature,
            uptime_secs: System::uptime(),
        }
    }

    /// Usage of the disk holding the project root (or `/`).
    fn disk_usage(&self) -> (Option<f64>, Option<f64>) {
        let target = self
            .project_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("/"));
        let disks = Disks::new_with_refreshed_list();
        let best = disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len());
        match best {
            Some(disk) => {
                let gb = |bytes: u64| (bytes as f64 / 1024f64.powi(3) * 10.0).round() / 10.0;
                let total = disk.total_space();
                let used = total.saturating_sub(disk.available_space());
                (Some(gb(used)), Some(gb(total)))
            }
            None => (None, None),
        }
    }

    /// Supervisor first (it owns the production program), then a process
    /// search for the configured app-server patterns.
    fn app_status(&self, table: &[ProcessInfo]) -> ServiceStatus {
        let name = self.config.service.name.clone();
        let supervisor = SupervisorConfigurator::new(
            self.runner,
            self.config,
            self.project_root.as_deref().unwrap_or_else(|| Path::new(".")),
            self.facts,
        );
        if let Some((true, pid)) = supervisor.program_status() {
            return ServiceStatus {
                name,
                running: true,
                uptime_secs: pid.and_then(process_uptime_secs),
                pid,
                source: StatusSource::Supervisor,
            };
        }
        process_status(name, table, &self.config.service.process_patterns)
    }

    fn daemon_status(
        &self,
        probes: &Probes<'_, R>,
        table: &[ProcessInfo],
        name: &str,
        unit: &str,
        process: &str,
    ) -> ServiceStatus {
        let found = find_matching(table, &[process.to_string()]);
        let pid = found.iter().map(|p| p.pid).min();
        match probes.service_state(unit) {
            ServiceManagerState::Active => ServiceStatus {
                name: name.to_string(),
                running: true,
                uptime_secs: pid.and_then(process_uptime_secs),
                pid,
                source: StatusSource::ServiceManager,
            },
            ServiceManagerState::Inactive => ServiceStatus {
                name: name.to_string(),
                running: false,
                pid: None,
                uptime_secs: None,
                source: StatusSource::ServiceManager,
            },
            ServiceManagerState::Unknown => process_status(name.to_string(), table, &[process.to_string()]),
        }
    }
}

fn process_status(name: String, table: &[ProcessInfo], patterns: &[String]) -> ServiceStatus {
    let found = find_matching(table, patterns);
    // the oldest match is the master process
    let master = found.iter().max_by_key(|p| p.run_time_secs);
    ServiceStatus {
        name,
        running: master.is_some(),
        pid: master.map(|p| p.pid),
        uptime_secs: master.and_then(|p| process_uptime_secs(p.pid).or(Some(p.run_time_secs))),
        source: StatusSource::ProcessSearch,
    }
}

pub fn monitoring_log_path(log_dir: &Path, date: &str) -> PathBuf {
    log_dir.join(format!("monitoring_{date}.json"))
}

/// Removes monitoring files dated more than `LOG_RETENTION_DAYS` before
/// `today`. Returns the removed paths.
pub fn prune_monitoring_logs(log_dir: &Path, today: NaiveDate) -> Vec<PathBuf> {
    let Some(cutoff) = today.checked_sub_days(Days::new(LOG_RETENTION_DAYS)) else {
        return Vec::new();
    };
    let Ok(entries) = fs::read_dir(log_dir) else {
        return Vec::new();
    };
    let mut removed = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        let dated = name
            .strip_prefix("monitoring_")
            .and_then(|rest| rest.strip_suffix(".json"))
            .and_then(|date| NaiveDate::parse_from_str(date, "%Y-%m-%d").ok());
        if !dated.map_or(false, |date| date < cutoff) {
            continue;
        }
        let path = entry.path();
        match fs::remove_file(&path) {
            Ok(()) => removed.push(path),
            Err(err) => warn!(path = %path.display(), error = %err, "could not remove old monitoring log"),
        }
    }
    removed
}

/// Appends to today's monitoring file, keeping the newest `max_entries`.
pub fn append_snapshot(log_dir: &Path, snapshot: &HealthSnapshot, max_entries: usize) -> Result<PathBuf, BmsError> {
    let path = monitoring_log_path(log_dir, &snapshot.timestamp.format("%Y-%m-%d").to_string());
    let mut entries: Vec<serde_json::Value> = match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "monitoring log unreadable; starting a new one");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    };
    entries.push(serde_json::to_value(snapshot)?);
    if entries.len() > max_entries {
        let excess = entries.len() - max_entries;
        entries.drain(..excess);
    }
    let text = serde_json::to_string_pretty(&entries)?;
    write_atomic_text_file(&path, &text, None)?;
    let pruned = prune_monitoring_logs(log_dir, snapshot.timestamp.date_naive());
    if !pruned.is_empty() {
        debug!(count = pruned.len(), "pruned old monitoring logs");
    }
    Ok(path)
}

#[derive(Debug, Deserialize)]
struct StoredEntry {
    timestamp: String,
}

/// Timestamps stored in a monitoring file, oldest first.
pub fn stored_timestamps(path: &Path) -> Result<Vec<String>, BmsError> {
    let text = fs::read_to_string(path)?;
    let entries: Vec<StoredEntry> = serde_json::from_str(&text)?;
    Ok(entries.into_iter().map(|e| e.timestamp).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Tool;
    use crate::probe::TemperatureSource;
    use crate::runner::testing::{ok, MockRunner};
    use std::net::TcpListener;
    use tempfile::tempdir;

    fn status(running: bool) -> ServiceStatus {
        ServiceStatus {
            name: "BMS".to_string(),
            running,
            pid: running.then_some(42),
            uptime_secs: None,
            source: StatusSource::ProcessSearch,
        }
    }

    fn port(outcome: PortOutcome) -> PortStatus {
        PortStatus {
            port: 5000,
            outcome,
            latency_ms: None,
            error: None,
        }
    }

    #[test]
    fn temperature_thresholds() {
        assert_eq!(temperature_level(None), TemperatureLevel::Unknown);
        assert_eq!(temperature_level(Some(69.9)), TemperatureLevel::Normal);
        assert_eq!(temperature_level(Some(70.0)), TemperatureLevel::Warning);
        assert_eq!(temperature_level(Some(80.0)), TemperatureLevel::Critical);
    }

    #[test]
    fn degraded_when_running_but_port_closed_or_hot() {
        assert_eq!(
            derive_state(&status(true), &port(PortOutcome::Refused), TemperatureLevel::Normal),
            ServiceState::Degraded
        );
        assert_eq!(
            derive_state(&status(true), &port(PortOutcome::Open), TemperatureLevel::Critical),
            ServiceState::Degraded
        );
        assert_eq!(
            derive_state(&status(true), &port(PortOutcome::Open), TemperatureLevel::Warning),
            ServiceState::Healthy
        );
        assert_eq!(
            derive_state(&status(false), &port(PortOutcome::Open), TemperatureLevel::Normal),
            ServiceState::Stopped
        );
    }

    #[test]
    fn port_probe_distinguishes_open_and_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let open_port = listener.local_addr().unwrap().port();
        let open = probe_port("127.0.0.1", open_port, Duration::from_secs(1));
        assert_eq!(open.outcome, PortOutcome::Open);
        assert!(open.latency_ms.is_some());

        drop(listener);
        let closed = probe_port("127.0.0.1", open_port, Duration::from_secs(1));
        assert_eq!(closed.outcome, PortOutcome::Refused);
        assert!(closed.error.is_some());
    }

    #[test]
    fn snapshot_reports_supervised_app() {
        let dir = tempdir().unwrap();
        let zone = dir.path().join("sys/class/thermal/thermal_zone0");
        fs::create_dir_all(&zone).unwrap();
        fs::write(zone.join("temp"), "85000").unwrap();

        let mut config = Config::default();
        let unused = TcpListener::bind("127.0.0.1:0").unwrap();
        config.service.port = unused.local_addr().unwrap().port();
        drop(unused);

        let mut facts = HostFacts::baseline(OsFamily::Linux);
        facts.tools = [Tool::Supervisorctl].into_iter().collect();
        let runner = MockRunner::default();
        runner.on(
            "supervisorctl status BMS",
            ok("BMS                              RUNNING   pid 999999, uptime 0:10:00"),
        );
        let snapshot = HealthMonitor::new(&runner, &config, &facts)
            .with_sys_root(dir.path())
            .snapshot();

        let app = snapshot.service("BMS").unwrap();
        assert!(app.running);
        assert_eq!(app.pid, Some(999999));
        assert_eq!(app.source, StatusSource::Supervisor);
        assert_eq!(snapshot.system.temperature.source, TemperatureSource::ThermalZone);
        assert_eq!(snapshot.system.temperature_level, TemperatureLevel::Critical);
        assert_eq!(snapshot.state, ServiceState::Degraded);
        assert!(!snapshot.port(config.service.port).unwrap().is_open());
    }

    #[test]
    fn monitoring_log_is_capped() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let facts = HostFacts::baseline(OsFamily::Other("plan9".to_string()));
        let runner = MockRunner::default();
        let monitor = HealthMonitor::new(&runner, &config, &facts);
        let snapshot = monitor.snapshot();

        let mut path = PathBuf::new();
        for _ in 0..5 {
            path = append_snapshot(dir.path(), &snapshot, 3).unwrap();
        }
        assert!(path
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("monitoring_"));
        assert_eq!(stored_timestamps(&path).unwrap().len(), 3);
    }

    #[test]
    fn old_monitoring_logs_are_pruned_on_save() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let facts = HostFacts::baseline(OsFamily::Other("plan9".to_string()));
        let runner = MockRunner::default();
        let snapshot = HealthMonitor::new(&runner, &config, &facts).snapshot();
        let today = snapshot.timestamp.date_naive();
        let recent = today.checked_sub_days(Days::new(3)).unwrap().format("%Y-%m-%d").to_string();
        let stale = today.checked_sub_days(Days::new(30)).unwrap().format("%Y-%m-%d").to_string();
        fs::write(monitoring_log_path(dir.path(), &recent), "[]").unwrap();
        fs::write(monitoring_log_path(dir.path(), &stale), "[]").unwrap();
        fs::write(dir.path().join("gunicorn_out.log"), "").unwrap();

        let saved = append_snapshot(dir.path(), &snapshot, 10).unwrap();
        assert!(saved.exists());
        assert!(monitoring_log_path(dir.path(), &recent).exists());
        assert!(!monitoring_log_path(dir.path(), &stale).exists());
        assert!(dir.path().join("gunicorn_out.log").exists());
    }

    #[test]
    fn corrupt_monitoring_log_is_replaced() {
        let dir = tempdir().unwrap();
        let config = Config::default();
        let facts = HostFacts::baseline(OsFamily::Other("plan9".to_string()));
        let runner = MockRunner::default();
        let snapshot = HealthMonitor::new(&runner, &config, &facts).snapshot();
        let path = monitoring_log_path(dir.path(), &snapshot.timestamp.format("%Y-%m-%d").to_string());
        fs::write(&path, "{not json").unwrap();
        append_snapshot(dir.path(), &snapshot, 10).unwrap();
        assert_eq!(stored_timestamps(&path).unwrap().len(), 1);
    }
}
