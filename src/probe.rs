//! Per-fact platform probes. Each fact has one function that dispatches on
//! the OS family in one place; adding a platform means adding one arm.

use crate::host::{HostFacts, OsFamily, Tool};
use crate::runner::{probe, CommandRunner, CommandSpec};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureSource {
    Vcgencmd,
    ThermalZone,
    Powermetrics,
    Wmi,
    NoSource,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct TemperatureReading {
    pub celsius: Option<f64>,
    pub source: TemperatureSource,
}

impl TemperatureReading {
    fn none() -> Self {
        Self {
            celsius: None,
            source: TemperatureSource::NoSource,
        }
    }

    fn from(source: TemperatureSource, celsius: f64) -> Self {
        Self {
            celsius: Some(celsius),
            source,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceManagerState {
    Active,
    Inactive,
    /// No service manager answered for this unit.
    Unknown,
}

pub struct Probes<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    facts: &'a HostFacts,
    sys_root: PathBuf,
}

impl<'a, R: CommandRunner + ?Sized> Probes<'a, R> {
    pub fn new(runner: &'a R, facts: &'a HostFacts) -> Self {
        Self {
            runner,
            facts,
            sys_root: PathBuf::from("/"),
        }
    }

    /// Reads `/sys` and `/proc` files relative to `root` instead of `/`.
    pub fn with_sys_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.sys_root = root.into();
        self
    }

    fn run_probe(&self, spec: CommandSpec) -> Option<String> {
        probe(self.runner, &spec.timeout(PROBE_TIMEOUT))
            .filter(|out| out.success())
            .map(|out| out.stdout_text())
    }

    /// Board tool, then thermal zones on Linux; powermetrics on macOS; WMI on
    /// Windows.
    pub fn temperature(&self) -> TemperatureReading {
        match self.facts.os {
            OsFamily::Linux => {
                if self.facts.has_tool(Tool::Vcgencmd) {
                    if let Some(celsius) = self
                        .run_probe(CommandSpec::new("vcgencmd").arg("measure_temp"))
                        .and_then(|out| parse_vcgencmd(&out))
                    {
                        return TemperatureReading::from(TemperatureSource::Vcgencmd, celsius);
                    }
                }
                thermal_zone_celsius(&self.sys_root.join("sys/class/thermal"))
                    .map(|c| TemperatureReading::from(TemperatureSource::ThermalZone, c))
                    .unwrap_or_else(TemperatureReading::none)
            }
            OsFamily::Mac => self
                .run_probe(
                    CommandSpec::new("powermetrics")
                        .args(["--samplers", "smc", "-n", "1", "-i", "1"])
                        .elevated(),
                )
                .and_then(|out| parse_powermetrics(&out))
                .map(|c| TemperatureReading::from(TemperatureSource::Powermetrics, c))
                .unwrap_or_else(TemperatureReading::none),
            OsFamily::Windows => self
                .run_probe(CommandSpec::new("powershell").args([
                    "-NoProfile",
                    "-Command",
                    "(Get-CimInstance -Namespace root/wmi -ClassName MSAcpi_ThermalZoneTemperature).CurrentTemperature",
                ]))
                .and_then(|out| parse_wmi_temperature(&out))
                .map(|c| TemperatureReading::from(TemperatureSource::Wmi, c))
                .unwrap_or_else(TemperatureReading::none),
            OsFamily::Other(_) => TemperatureReading::none(),
        }
    }

    /// PIDs listening on `port`.
    pub fn port_owners(&self, port: u16) -> BTreeSet<u32> {
        let found = match self.facts.os {
            OsFamily::Linux => {
                let via_ss = if self.facts.has_tool(Tool::Ss) {
                    let filter = format!(":{port}");
                    self.run_probe(
                        CommandSpec::new("ss")
                            .args(["-ltnpH", "sport", "=", filter.as_str()])
                            .elevated(),
                    )
                    .map(|out| parse_ss_pids(&out))
                } else {
                    None
                };
                match via_ss {
                    Some(pids) if !pids.is_empty() => pids,
                    _ => self.lsof_pids(port),
                }
            }
            OsFamily::Mac | OsFamily::Other(_) => self.lsof_pids(port),
            OsFamily::Windows => self
                .run_probe(CommandSpec::new("netstat").arg("-ano"))
                .map(|out| parse_netstat_pids(&out, port))
                .unwrap_or_default(),
        };
        debug!(port, pids = ?found, "port owners");
        found
    }

    fn lsof_pids(&self, port: u16) -> BTreeSet<u32> {
        let selector = format!("-iTCP:{port}");
        self.run_probe(CommandSpec::new("lsof").args(["-t", selector.as_str(), "-sTCP:LISTEN"]))
        .map(|out| {
            out.lines()
                .filter_map(|line| line.trim().parse().ok())
                .collect()
        })
        .unwrap_or_default()
    }

    /// OS-native "kill whatever holds this port". Returns the command run.
    pub fn force_free_port(&self, port: u16) -> Result<String, String> {
        let spec = match self.facts.os {
            OsFamily::Linux if self.facts.has_tool(Tool::Fuser) => CommandSpec::new("fuser")
                .arg("-k")
                .arg(format!("{port}/tcp"))
                .elevated(),
            OsFamily::Windows => CommandSpec::new("powershell").args([
                "-NoProfile".to_string(),
                "-Command".to_string(),
                format!(
                    "Get-NetTCPConnection -LocalPort {port} -State Listen | ForEach-Object {{ Stop-Process -Id $_.OwningProcess -Force }}"
                ),
            ]),
            _ => return Err("no port-kill fallback on this platform".to_string()),
        };
        let rendered = spec.render();
        match self.runner.run(&spec.timeout(PROBE_TIMEOUT)) {
            Ok(out) if out.success() => Ok(rendered),
            // fuser exits 1 when nothing held the port
            Ok(out) if out.status_code == 1 && out.stderr_text().is_empty() => Ok(rendered),
            Ok(out) => Err(format!("`{rendered}` failed: {}", out.excerpt())),
            Err(err) => Err(format!("`{rendered}` failed: {err}")),
        }
    }

    /// The service manager's opinion of `unit`.
    pub fn service_state(&self, unit: &str) -> ServiceManagerState {
        match self.facts.os {
            OsFamily::Linux if self.facts.has_tool(Tool::Systemctl) => {
                match probe(
                    self.runner,
                    &CommandSpec::new("systemctl")
                        .args(["is-active", unit])
                        .timeout(PROBE_TIMEOUT),
                ) {
                    Some(out) if out.stdout_text() == "active" => ServiceManagerState::Active,
                    Some(out) if out.timed_out => ServiceManagerState::Unknown,
                    Some(out) if matches!(out.stdout_text().as_str(), "inactive" | "failed" | "activating" | "deactivating") => {
                        ServiceManagerState::Inactive
                    }
                    _ => ServiceManagerState::Unknown,
                }
            }
            _ => ServiceManagerState::Unknown,
        }
    }
}

pub fn parse_vcgencmd(output: &str) -> Option<f64> {
    let value = output.trim().strip_prefix("temp=")?;
    let number: String = value
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    number.parse().ok()
}

/// First thermal zone with a readable millidegree value.
pub fn thermal_zone_celsius(thermal_dir: &Path) -> Option<f64> {
    let mut zones: Vec<PathBuf> = fs::read_dir(thermal_dir)
        .ok()?
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .map(|n| n.to_string_lossy().starts_with("thermal_zone"))
                .unwrap_or(false)
        })
        .collect();
    zones.sort();
    zones.iter().find_map(|zone| {
        let raw = fs::read_to_string(zone.join("temp")).ok()?;
        let milli: f64 = raw.trim().parse().ok()?;
        if milli <= 0.0 {
            return None;
        }
        Some(milli / 1000.0)
    })
}

pub fn parse_powermetrics(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("CPU die temperature:")?;
        rest.trim().trim_end_matches('C').trim().parse().ok()
    })
}

/// WMI reports tenths of a kelvin.
pub fn parse_wmi_temperature(output: &str) -> Option<f64> {
    let tenths: f64 = output.lines().find_map(|l| l.trim().parse().ok())?;
    let celsius = tenths / 10.0 - 273.15;
    Some((celsius * 100.0).round() / 100.0)
}

pub fn parse_ss_pids(output: &str) -> BTreeSet<u32> {
    let mut pids = BTreeSet::new();
    for chunk in output.split("pid=").skip(1) {
        let digits: String = chunk.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(pid) = digits.parse() {
            pids.insert(pid);
        }
    }
    pids
}

pub fn parse_netstat_pids(output: &str, port: u16) -> BTreeSet<u32> {
    let suffix = format!(":{port}");
    output
        .lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 5 || !cols[0].eq_ignore_ascii_case("TCP") {
                return None;
            }
            if !cols[1].ends_with(&suffix) || !cols[3].eq_ignore_ascii_case("LISTENING") {
                return None;
            }
            cols[4].parse().ok()
        })
        .filter(|pid| *pid != 0)
        .collect()
}
