//! Host Profiler: gathers raw facts about the machine.
//!
//! Every probe degrades to a conservative default on failure. Nothing here
//! returns an error to the caller, and nothing is cached across invocations.

use crate::runner::{probe, CommandRunner, CommandSpec};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

const TOOL_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const PUBLIC_IP_TIMEOUT: Duration = Duration::from_secs(2);
const REACHABILITY_TIMEOUT: Duration = Duration::from_millis(1500);
const PUBLIC_IP_URL: &str = "https://api.ipify.org";
const REACHABILITY_ADDR: &str = "1.1.1.1:53";
const LOCAL_IP_PROBE_ADDR: &str = "8.8.8.8:80";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OsFamily {
    Linux,
    Windows,
    Mac,
    /// Unrecognized platform name, kept verbatim.
    Other(String),
}

impl OsFamily {
    pub fn from_system_name(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "linux" | "android" => Self::Linux,
            "windows" => Self::Windows,
            "macos" | "darwin" | "mac" => Self::Mac,
            _ => Self::Other(name.trim().to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Linux => "linux",
            Self::Windows => "windows",
            Self::Mac => "mac",
            Self::Other(name) => name.as_str(),
        }
    }
}

impl Serialize for OsFamily {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// The single "what kind of host is this" label. All markers are still
/// recorded independently on `HostFacts`; this is only the first match.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostFlavor {
    Termux,
    Wsl,
    Container,
    RaspberryPi,
    VirtualMachine,
    Bare,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    Systemctl,
    Nginx,
    Gunicorn,
    Waitress,
    Supervisorctl,
    Git,
    Docker,
    Podman,
    Ufw,
    FirewallCmd,
    Iptables,
    Vcgencmd,
    Ss,
    Lsof,
    Fuser,
    Netstat,
}

impl Tool {
    pub const ALL: [Tool; 16] = [
        Tool::Systemctl,
        Tool::Nginx,
        Tool::Gunicorn,
        Tool::Waitress,
        Tool::Supervisorctl,
        Tool::Git,
        Tool::Docker,
        Tool::Podman,
        Tool::Ufw,
        Tool::FirewallCmd,
        Tool::Iptables,
        Tool::Vcgencmd,
        Tool::Ss,
        Tool::Lsof,
        Tool::Fuser,
        Tool::Netstat,
    ];

    pub fn binaries(self) -> &'static [&'static str] {
        match self {
            Tool::Systemctl => &["systemctl"],
            Tool::Nginx => &["nginx"],
            Tool::Gunicorn => &["gunicorn", "gunicorn3"],
            Tool::Waitress => &["waitress-serve"],
            Tool::Supervisorctl => &["supervisorctl"],
            Tool::Git => &["git"],
            Tool::Docker => &["docker"],
            Tool::Podman => &["podman"],
            Tool::Ufw => &["ufw"],
            Tool::FirewallCmd => &["firewall-cmd"],
            Tool::Iptables => &["iptables"],
            Tool::Vcgencmd => &["vcgencmd"],
            Tool::Ss => &["ss"],
            Tool::Lsof => &["lsof"],
            Tool::Fuser => &["fuser"],
            Tool::Netstat => &["netstat"],
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct ToolSet(BTreeSet<Tool>);

impl ToolSet {
    pub fn has(&self, tool: Tool) -> bool {
        self.0.contains(&tool)
    }

    pub fn insert(&mut self, tool: Tool) {
        self.0.insert(tool);
    }

    pub fn remove(&mut self, tool: Tool) {
        self.0.remove(&tool);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tool> {
        self.0.iter()
    }
}

impl FromIterator<Tool> for ToolSet {
    fn from_iter<I: IntoIterator<Item = Tool>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NetworkFacts {
    pub hostname: String,
    pub local_ip: String,
    pub public_ip: Option<String>,
    pub internet: bool,
}

impl Default for NetworkFacts {
    fn default() -> Self {
        Self {
            hostname: "unknown".to_string(),
            local_ip: "127.0.0.1".to_string(),
            public_ip: None,
            internet: false,
        }
    }
}

/// Immutable snapshot of the host, recomputed on every invocation.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct HostFacts {
    pub os: OsFamily,
    pub os_edition: Option<String>,
    pub distro: String,
    pub flavor: HostFlavor,
    pub is_container: bool,
    pub is_vm: bool,
    pub is_wsl: bool,
    pub is_termux: bool,
    pub is_raspberry_pi: bool,
    pub has_gui: bool,
    pub cpu_cores: usize,
    pub memory_mb: u64,
    pub architecture: String,
    pub tools: ToolSet,
    pub network: NetworkFacts,
    pub proxy_env_set: bool,
    pub virtual_env_active: bool,
}

impl HostFacts {
    /// A neutral baseline; tests and callers override the fields they need.
    pub fn baseline(os: OsFamily) -> Self {
        Self {
            os,
            os_edition: None,
            distro: "unknown".to_string(),
            flavor: HostFlavor::Bare,
            is_container: false,
            is_vm: false,
            is_wsl: false,
            is_termux: false,
            is_raspberry_pi: false,
            has_gui: false,
            cpu_cores: 1,
            memory_mb: 0,
            architecture: env::consts::ARCH.to_string(),
            tools: ToolSet::default(),
            network: NetworkFacts::default(),
            proxy_env_set: false,
            virtual_env_active: false,
        }
    }

    pub fn has_tool(&self, tool: Tool) -> bool {
        self.tools.has(tool)
    }
}

type EnvLookup = Box<dyn Fn(&str) -> Option<String>>;

pub struct Profiler {
    root: PathBuf,
    os_name: String,
    network: bool,
    env: EnvLookup,
}

impl Default for Profiler {
    fn default() -> Self {
        Self::new(true)
    }
}

impl Profiler {
    pub fn new(network: bool) -> Self {
        Self {
            root: PathBuf::from("/"),
            os_name: env::consts::OS.to_string(),
            network,
            env: Box::new(|name| env::var(name).ok()),
        }
    }

    /// Reads marker files relative to `root` instead of `/`.
    #[cfg(test)]
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    #[cfg(test)]
    pub fn with_os_name(mut self, os_name: impl Into<String>) -> Self {
        self.os_name = os_name.into();
        self
    }

    #[cfg(test)]
    pub fn with_env(mut self, env: impl Fn(&str) -> Option<String> + 'static) -> Self {
        self.env = Box::new(env);
        self
    }

    fn path(&self, rel: &str) -> PathBuf {
        self.root.join(rel.trim_start_matches('/'))
    }

    fn read(&self, rel: &str) -> Option<String> {
        fs::read_to_string(self.path(rel)).ok()
    }

    fn env_set(&self, name: &str) -> bool {
        (self.env)(name)
            .map(|value| !value.trim().is_empty())
            .unwrap_or(false)
    }

    pub fn profile<R: CommandRunner>(&self, runner: &R) -> HostFacts {
        let os = OsFamily::from_system_name(&self.os_name);
        let linux = os == OsFamily::Linux;
        let mut facts = HostFacts::baseline(os.clone());

        let tools = detect_tools();
        facts.is_termux = linux
            && detect_termux(
                self.path("data/data/com.termux/files/usr").exists(),
                (self.env)("PREFIX").as_deref(),
            );
        facts.is_wsl = linux
            && detect_wsl(
                self.read("proc/sys/kernel/osrelease").as_deref(),
                self.env_set("WSL_DISTRO_NAME") || self.env_set("WSL_INTEROP"),
            );
        facts.is_container = linux
            && detect_container(
                self.path(".dockerenv").exists() || self.path("run/.containerenv").exists(),
                self.read("proc/1/cgroup").as_deref(),
                self.env_set("container") || self.env_set("KUBERNETES_SERVICE_HOST"),
            );
        let cpuinfo = self.read("proc/cpuinfo");
        facts.is_raspberry_pi = linux
            && detect_raspberry_pi(
                self.read("proc/device-tree/model").as_deref(),
                cpuinfo.as_deref(),
                tools.has(Tool::Vcgencmd),
            );
        let kernel_log = self
            .read("var/log/dmesg")
            .or_else(|| self.read("var/log/kern.log"));
        facts.is_vm = detect_vm(cpuinfo.as_deref(), kernel_log.as_deref());
        facts.flavor = select_flavor(&facts);

        facts.distro = if facts.is_termux {
            "Android (Termux)".to_string()
        } else if linux {
            self.detect_distro().unwrap_or_else(|| "unknown".to_string())
        } else {
            "unknown".to_string()
        };
        facts.os_edition = match os {
            OsFamily::Windows => probe(runner, &CommandSpec::new("cmd").args(["/C", "ver"]).timeout(TOOL_PROBE_TIMEOUT))
                .filter(|out| out.success())
                .and_then(|out| windows_edition(&out.stdout_text())),
            OsFamily::Mac => probe(
                runner,
                &CommandSpec::new("sw_vers")
                    .arg("-productVersion")
                    .timeout(TOOL_PROBE_TIMEOUT),
            )
            .filter(|out| out.success())
            .map(|out| mac_edition(&out.stdout_text())),
            _ => None,
        };
        facts.has_gui = match os {
            OsFamily::Windows | OsFamily::Mac => true,
            OsFamily::Linux => {
                !facts.is_termux && (self.env_set("DISPLAY") || self.env_set("WAYLAND_DISPLAY"))
            }
            OsFamily::Other(_) => false,
        };

        facts.cpu_cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        facts.memory_mb = self.detect_memory_mb();

        let mut tools = tools;
        // gunicorn on the host PATH is meaningless under Termux
        if facts.is_termux {
            tools.remove(Tool::Gunicorn);
        }
        facts.tools = tools;

        facts.proxy_env_set = ["HTTP_PROXY", "HTTPS_PROXY", "ALL_PROXY", "http_proxy", "https_proxy", "all_proxy"]
            .iter()
            .any(|name| self.env_set(name));
        facts.virtual_env_active = self.env_set("VIRTUAL_ENV");

        facts.network = if self.network {
            detect_network()
        } else {
            NetworkFacts {
                hostname: detect_hostname(),
                ..NetworkFacts::default()
            }
        };
        debug!(flavor = ?facts.flavor, distro = %facts.distro, "host profiled");
        facts
    }

    fn detect_distro(&self) -> Option<String> {
        let os_release = self.read("etc/os-release");
        if let Some(pretty) = os_release
            .as_deref()
            .and_then(|text| key_value(text, "PRETTY_NAME"))
        {
            return Some(pretty);
        }
        let guess = [
            ("etc/lsb-release", DistroFile::KeyValue("DISTRIB_DESCRIPTION")),
            ("etc/debian_version", DistroFile::Versioned("Debian")),
            ("etc/redhat-release", DistroFile::FirstLine),
            ("etc/alpine-release", DistroFile::Versioned("Alpine Linux")),
            ("etc/arch-release", DistroFile::Fixed("Arch Linux")),
        ]
        .iter()
        .find_map(|(rel, kind)| {
            let path = self.path(rel);
            if !path.exists() {
                return None;
            }
            let text = fs::read_to_string(&path).unwrap_or_default();
            kind.name_from(&text)
        });
        guess.or_else(|| os_release.as_deref().and_then(|text| key_value(text, "NAME")))
    }

    fn detect_memory_mb(&self) -> u64 {
        if let Some(mb) = self.read("proc/meminfo").as_deref().and_then(parse_meminfo_total_mb) {
            return mb;
        }
        let mut system = sysinfo::System::new();
        system.refresh_memory();
        system.total_memory() / (1024 * 1024)
    }
}

enum DistroFile {
    KeyValue(&'static str),
    Versioned(&'static str),
    FirstLine,
    Fixed(&'static str),
}

impl DistroFile {
    fn name_from(&self, text: &str) -> Option<String> {
        match self {
            Self::KeyValue(key) => key_value(text, key),
            Self::Versioned(name) => {
                let version = text.lines().next().unwrap_or("").trim();
                if version.is_empty() {
                    Some(name.to_string())
                } else {
                    Some(format!("{name} {version}"))
                }
            }
            Self::FirstLine => text
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string),
            Self::Fixed(name) => Some(name.to_string()),
        }
    }
}

/// Reads `KEY=value` / `KEY="value"` from os-release style text.
pub fn key_value(text: &str, key: &str) -> Option<String> {
    text.lines().find_map(|line| {
        let (k, v) = line.split_once('=')?;
        if k.trim() != key {
            return None;
        }
        let value = v.trim().trim_matches('"').trim_matches('\'').trim();
        if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        }
    })
}

pub fn detect_termux(prefix_dir_exists: bool, prefix_env: Option<&str>) -> bool {
    prefix_dir_exists || prefix_env.map(|p| p.contains("com.termux")).unwrap_or(false)
}

pub fn detect_wsl(kernel_release: Option<&str>, wsl_env: bool) -> bool {
    if wsl_env {
        return true;
    }
    kernel_release
        .map(|release| {
            let lower = release.to_lowercase();
            lower.contains("microsoft") || lower.contains("wsl")
        })
        .unwrap_or(false)
}

pub fn detect_container(marker_file: bool, cgroup: Option<&str>, container_env: bool) -> bool {
    if marker_file || container_env {
        return true;
    }
    cgroup
        .map(|text| {
            ["docker", "kubepods", "containerd", "lxc", "libpod"]
                .iter()
                .any(|needle| text.contains(needle))
        })
        .unwrap_or(false)
}

pub fn detect_raspberry_pi(model: Option<&str>, cpuinfo: Option<&str>, has_vcgencmd: bool) -> bool {
    if model
        .map(|m| m.to_lowercase().contains("raspberry pi"))
        .unwrap_or(false)
    {
        return true;
    }
    if let Some(cpuinfo) = cpuinfo {
        let lower = cpuinfo.to_lowercase();
        if lower.contains("raspberry pi") || lower.contains("bcm2") {
            return true;
        }
    }
    has_vcgencmd
}

pub fn detect_vm(cpuinfo: Option<&str>, kernel_log: Option<&str>) -> bool {
    let hypervisor_flag = cpuinfo
        .map(|text| {
            text.lines()
                .filter(|line| line.starts_with("flags"))
                .any(|line| line.split_whitespace().any(|flag| flag == "hypervisor"))
        })
        .unwrap_or(false);
    if hypervisor_flag {
        return true;
    }
    kernel_log
        .map(|text| {
            let lower = text.to_lowercase();
            lower.contains("hypervisor detected")
                || ["vmware", "virtualbox", "kvm-clock", "hyper-v", "xen:", "qemu"]
                    .iter()
                    .any(|needle| lower.contains(needle))
        })
        .unwrap_or(false)
}

/// Termux, then WSL, then container, then Raspberry Pi, then VM.
pub fn select_flavor(facts: &HostFacts) -> HostFlavor {
    if facts.is_termux {
        HostFlavor::Termux
    } else if facts.is_wsl {
        HostFlavor::Wsl
    } else if facts.is_container {
        HostFlavor::Container
    } else if facts.is_raspberry_pi {
        HostFlavor::RaspberryPi
    } else if facts.is_vm {
        HostFlavor::VirtualMachine
    } else {
        HostFlavor::Bare
    }
}

pub fn parse_meminfo_total_mb(meminfo: &str) -> Option<u64> {
    meminfo.lines().find_map(|line| {
        let rest = line.strip_prefix("MemTotal:")?;
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb / 1024)
    })
}

pub fn windows_edition(ver_output: &str) -> Option<String> {
    let start = ver_output.find("Version")?;
    let version = ver_output[start + "Version".len()..]
        .trim()
        .trim_end_matches(']')
        .trim();
    let parts: Vec<u32> = version
        .split('.')
        .filter_map(|part| part.trim().parse().ok())
        .collect();
    let edition = match parts.as_slice() {
        [10, 0, build, ..] if *build >= 22000 => "Windows 11",
        [10, 0, ..] => "Windows 10",
        [6, 3, ..] => "Windows 8.1",
        [6, 2, ..] => "Windows 8",
        [6, 1, ..] => "Windows 7",
        _ => "Windows",
    };
    Some(format!("{edition} ({version})"))
}

pub fn mac_edition(product_version: &str) -> String {
    let version = product_version.trim();
    let mut parts = version.split('.').filter_map(|p| p.parse::<u32>().ok());
    let major = parts.next().unwrap_or(0);
    let minor = parts.next().unwrap_or(0);
    let name = match (major, minor) {
        (15, _) => "Sequoia",
        (14, _) => "Sonoma",
        (13, _) => "Ventura",
        (12, _) => "Monterey",
        (11, _) => "Big Sur",
        (10, 15) => "Catalina",
        (10, 14) => "Mojave",
        _ => "macOS",
    };
    format!("{name} ({version})")
}

fn detect_tools() -> ToolSet {
    Tool::ALL
        .iter()
        .copied()
        .filter(|tool| tool.binaries().iter().any(|bin| which::which(bin).is_ok()))
        .collect()
}

fn detect_hostname() -> String {
    sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string())
}

/// Local address of the interface that routes to the internet. A UDP
/// connect sends no packet.
pub fn detect_local_ip() -> String {
    let attempt = || -> std::io::Result<String> {
        let socket = UdpSocket::bind("0.0.0.0:0")?;
        socket.connect(LOCAL_IP_PROBE_ADDR)?;
        Ok(socket.local_addr()?.ip().to_string())
    };
    attempt().unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn detect_public_ip() -> Option<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(PUBLIC_IP_TIMEOUT)
        .build()
        .ok()?;
    let response = client.get(PUBLIC_IP_URL).send().ok()?;
    if !response.status().is_success() {
        return None;
    }
    let text = response.text().ok()?;
    let ip = text.trim();
    if ip.parse::<std::net::IpAddr>().is_ok() {
        Some(ip.to_string())
    } else {
        None
    }
}

fn detect_internet() -> bool {
    REACHABILITY_ADDR
        .parse::<SocketAddr>()
        .map(|addr| TcpStream::connect_timeout(&addr, REACHABILITY_TIMEOUT).is_ok())
        .unwrap_or(false)
}

fn detect_network() -> NetworkFacts {
    let internet = detect_internet();
    NetworkFacts {
        hostname: detect_hostname(),
        local_ip: detect_local_ip(),
        public_ip: if internet { detect_public_ip() } else { None },
        internet,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::MockRunner;
    use std::path::Path;
    use tempfile::tempdir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn offline_profiler(root: &Path, os: &str) -> Profiler {
        Profiler::new(false)
            .with_root(root)
            .with_os_name(os)
            .with_env(|_| None)
    }

    #[test]
    fn os_family_passes_unknown_names_through() {
        assert_eq!(OsFamily::from_system_name("linux"), OsFamily::Linux);
        assert_eq!(OsFamily::from_system_name("macos"), OsFamily::Mac);
        assert_eq!(OsFamily::from_system_name("Windows"), OsFamily::Windows);
        let other = OsFamily::from_system_name("freebsd");
        assert_eq!(other.as_str(), "freebsd");
    }

    #[test]
    fn pretty_name_overrides_generic_guess() {
        let dir = tempdir().unwrap();
        write(dir.path(), "etc/debian_version", "12.5\n");
        write(
            dir.path(),
            "etc/os-release",
            "NAME=\"Debian GNU/Linux\"\nPRETTY_NAME=\"Debian GNU/Linux 12 (bookworm)\"\n",
        );
        let facts = offline_profiler(dir.path(), "linux").profile(&MockRunner::default());
        assert_eq!(facts.distro, "Debian GNU/Linux 12 (bookworm)");
    }

    #[test]
    fn first_release_file_wins_without_os_release() {
        let dir = tempdir().unwrap();
        write(dir.path(), "etc/debian_version", "11.9\n");
        write(dir.path(), "etc/arch-release", "");
        let facts = offline_profiler(dir.path(), "linux").profile(&MockRunner::default());
        assert_eq!(facts.distro, "Debian 11.9");
    }

    #[test]
    fn raspberry_pi_detected_from_device_tree_model() {
        let dir = tempdir().unwrap();
        write(dir.path(), "proc/device-tree/model", "Raspberry Pi 4 Model B Rev 1.4\0");
        write(dir.path(), "proc/meminfo", "MemTotal:        3884888 kB\n");
        let facts = offline_profiler(dir.path(), "linux").profile(&MockRunner::default());
        assert!(facts.is_raspberry_pi);
        assert_eq!(facts.flavor, HostFlavor::RaspberryPi);
        assert_eq!(facts.memory_mb, 3793);
    }

    #[test]
    fn termux_takes_flavor_priority_but_all_markers_recorded() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("data/data/com.termux/files/usr")).unwrap();
        write(dir.path(), "proc/cpuinfo", "Hardware\t: BCM2835\n");
        let facts = offline_profiler(dir.path(), "android").profile(&MockRunner::default());
        assert!(facts.is_termux);
        assert!(facts.is_raspberry_pi);
        assert_eq!(facts.flavor, HostFlavor::Termux);
        assert_eq!(facts.os, OsFamily::Linux);
        assert!(!facts.has_tool(Tool::Gunicorn));
    }

    #[test]
    fn wsl_detected_from_kernel_release() {
        assert!(detect_wsl(Some("5.15.146.1-microsoft-standard-WSL2"), false));
        assert!(detect_wsl(None, true));
        assert!(!detect_wsl(Some("6.1.0-18-amd64"), false));
    }

    #[test]
    fn container_detected_from_cgroup_or_marker() {
        assert!(detect_container(true, None, false));
        assert!(detect_container(false, Some("0::/kubepods/besteffort/pod1"), false));
        assert!(!detect_container(false, Some("0::/init.scope"), false));
    }

    #[test]
    fn vm_detected_from_hypervisor_flag() {
        let cpuinfo = "processor\t: 0\nflags\t\t: fpu vme hypervisor lahf_lm\n";
        assert!(detect_vm(Some(cpuinfo), None));
        assert!(detect_vm(None, Some("[    0.000000] Hypervisor detected: KVM")));
        assert!(!detect_vm(Some("flags\t\t: fpu vme\n"), Some("normal boot")));
    }

    #[test]
    fn windows_and_mac_editions() {
        assert_eq!(
            windows_edition("Microsoft Windows [Version 10.0.22631.2428]").as_deref(),
            Some("Windows 11 (10.0.22631.2428)")
        );
        assert_eq!(
            windows_edition("Microsoft Windows [Version 10.0.19045.3803]").as_deref(),
            Some("Windows 10 (10.0.19045.3803)")
        );
        assert_eq!(mac_edition("14.2.1"), "Sonoma (14.2.1)");
        assert_eq!(mac_edition("10.15.7"), "Catalina (10.15.7)");
    }

    #[test]
    fn proxy_and_virtualenv_markers_read_from_env() {
        let dir = tempdir().unwrap();
        let facts = Profiler::new(false)
            .with_root(dir.path())
            .with_os_name("linux")
            .with_env(|name| match name {
                "HTTPS_PROXY" => Some("http://proxy:3128".to_string()),
                "VIRTUAL_ENV" => Some("/srv/bms/venv".to_string()),
                _ => None,
            })
            .profile(&MockRunner::default());
        assert!(facts.proxy_env_set);
        assert!(facts.virtual_env_active);
    }

    #[test]
    fn offline_profile_uses_loopback_defaults() {
        let dir = tempdir().unwrap();
        let facts = offline_profiler(dir.path(), "linux").profile(&MockRunner::default());
        assert_eq!(facts.network.local_ip, "127.0.0.1");
        assert!(!facts.network.internet);
        assert!(facts.network.public_ip.is_none());
    }
}
