//! Deployment Recommender: a pure, total mapping from `HostFacts` to a
//! `DeploymentProfile`.

use crate::host::{HostFacts, OsFamily, Tool};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

pub const HIGH_MEMORY_MB: u64 = 4096;
pub const MULTI_WORKER_CORES: usize = 2;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    Development,
    Production,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum ProcessServer {
    Gunicorn { workers: u32, threads: u32 },
    Waitress,
}

impl ProcessServer {
    pub const STANDARD: ProcessServer = ProcessServer::Gunicorn {
        workers: 3,
        threads: 3,
    };
    pub const REDUCED: ProcessServer = ProcessServer::Gunicorn {
        workers: 2,
        threads: 2,
    };

    pub fn name(&self) -> &'static str {
        match self {
            Self::Gunicorn { .. } => "gunicorn",
            Self::Waitress => "waitress",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReverseProxy {
    None,
    Nginx,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum Hint {
    HighMemory,
    MultiWorker,
    LowResource,
    DirectInternet,
    VirtualEnvActive,
    /// A proxied deployment was indicated but no proxy binary is installed.
    ProxyUnavailable,
}

impl fmt::Display for Hint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::HighMemory => "high-memory",
            Self::MultiWorker => "multi-worker",
            Self::LowResource => "low-resource",
            Self::DirectInternet => "direct-internet",
            Self::VirtualEnvActive => "virtual-env-active",
            Self::ProxyUnavailable => "proxy-unavailable",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DeploymentProfile {
    pub server_type: ServerType,
    pub process_server: ProcessServer,
    pub reverse_proxy: ReverseProxy,
    pub use_supervisor: bool,
    pub tls_recommended: bool,
    pub hints: BTreeSet<Hint>,
}

impl DeploymentProfile {
    fn development() -> Self {
        Self {
            server_type: ServerType::Development,
            process_server: ProcessServer::Waitress,
            reverse_proxy: ReverseProxy::None,
            use_supervisor: false,
            tls_recommended: false,
            hints: BTreeSet::new(),
        }
    }

    fn production(process_server: ProcessServer, tls_recommended: bool) -> Self {
        Self {
            server_type: ServerType::Production,
            process_server,
            reverse_proxy: ReverseProxy::Nginx,
            use_supervisor: true,
            tls_recommended,
            hints: BTreeSet::new(),
        }
    }

    pub fn has_hint(&self, hint: Hint) -> bool {
        self.hints.contains(&hint)
    }
}

pub fn recommend(facts: &HostFacts) -> DeploymentProfile {
    let linux = facts.os == OsFamily::Linux;
    let mut profile = if linux && !facts.is_termux && !facts.is_raspberry_pi && !facts.is_wsl {
        DeploymentProfile::production(ProcessServer::STANDARD, true)
    } else if linux && facts.is_raspberry_pi && !facts.is_termux {
        DeploymentProfile::production(ProcessServer::REDUCED, false)
    } else {
        // Termux, WSL, Windows, macOS and anything unrecognized
        DeploymentProfile::development()
    };

    if profile.reverse_proxy == ReverseProxy::Nginx && !facts.has_tool(Tool::Nginx) {
        profile.reverse_proxy = ReverseProxy::None;
        profile.tls_recommended = false;
        profile.hints.insert(Hint::ProxyUnavailable);
    }

    if facts.memory_mb > HIGH_MEMORY_MB {
        profile.hints.insert(Hint::HighMemory);
    }
    if facts.cpu_cores > MULTI_WORKER_CORES {
        profile.hints.insert(Hint::MultiWorker);
    }
    if facts.is_raspberry_pi {
        profile.hints.insert(Hint::LowResource);
    }
    if facts.network.internet && !facts.proxy_env_set {
        profile.hints.insert(Hint::DirectInternet);
    }
    if facts.virtual_env_active {
        profile.hints.insert(Hint::VirtualEnvActive);
    }
    profile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::ToolSet;

    fn linux_server() -> HostFacts {
        let mut facts = HostFacts::baseline(OsFamily::Linux);
        facts.tools = [Tool::Systemctl, Tool::Nginx, Tool::Supervisorctl]
            .into_iter()
            .collect::<ToolSet>();
        facts
    }

    /// Every combination of the boolean markers across each OS family.
    fn fact_grid() -> Vec<HostFacts> {
        let mut grid = Vec::new();
        for os in [
            OsFamily::Linux,
            OsFamily::Windows,
            OsFamily::Mac,
            OsFamily::Other("haiku".to_string()),
        ] {
            for bits in 0u32..64 {
                let mut facts = HostFacts::baseline(os.clone());
                facts.is_termux = bits & 1 != 0;
                facts.is_raspberry_pi = bits & 2 != 0;
                facts.is_wsl = bits & 4 != 0;
                facts.network.internet = bits & 8 != 0;
                facts.proxy_env_set = bits & 16 != 0;
                if bits & 32 != 0 {
                    facts.tools.insert(Tool::Nginx);
                    facts.memory_mb = 8192;
                    facts.cpu_cores = 8;
                }
                grid.push(facts);
            }
        }
        grid
    }

    #[test]
    fn recommend_is_deterministic() {
        for facts in fact_grid() {
            assert_eq!(recommend(&facts), recommend(&facts));
        }
    }

    #[test]
    fn windows_and_mac_never_use_proxy_or_supervisor() {
        for facts in fact_grid()
            .into_iter()
            .filter(|f| matches!(f.os, OsFamily::Windows | OsFamily::Mac))
        {
            let profile = recommend(&facts);
            assert_eq!(profile.reverse_proxy, ReverseProxy::None);
            assert!(!profile.use_supervisor);
        }
    }

    #[test]
    fn raspberry_pi_never_recommends_tls_and_is_low_resource() {
        for facts in fact_grid().into_iter().filter(|f| f.is_raspberry_pi) {
            let profile = recommend(&facts);
            assert!(!profile.tls_recommended);
            assert!(profile.has_hint(Hint::LowResource));
        }
    }

    #[test]
    fn scenario_linux_server_gets_full_production_stack() {
        let profile = recommend(&linux_server());
        assert_eq!(profile.server_type, ServerType::Production);
        assert_eq!(profile.reverse_proxy, ReverseProxy::Nginx);
        assert!(profile.use_supervisor);
        assert!(profile.tls_recommended);
        assert_eq!(profile.process_server, ProcessServer::STANDARD);
    }

    #[test]
    fn scenario_termux_runs_development() {
        let mut facts = HostFacts::baseline(OsFamily::Linux);
        facts.is_termux = true;
        let profile = recommend(&facts);
        assert_eq!(profile.server_type, ServerType::Development);
        assert_eq!(profile.reverse_proxy, ReverseProxy::None);
        assert!(!profile.use_supervisor);
        assert_eq!(profile.process_server, ProcessServer::Waitress);
    }

    #[test]
    fn raspberry_pi_uses_reduced_workers() {
        let mut facts = linux_server();
        facts.is_raspberry_pi = true;
        let profile = recommend(&facts);
        assert_eq!(profile.server_type, ServerType::Production);
        assert_eq!(profile.process_server, ProcessServer::REDUCED);
        assert!(profile.use_supervisor);
    }

    #[test]
    fn wsl_runs_development() {
        let mut facts = linux_server();
        facts.is_wsl = true;
        let profile = recommend(&facts);
        assert_eq!(profile.server_type, ServerType::Development);
        assert_eq!(profile.reverse_proxy, ReverseProxy::None);
    }

    #[test]
    fn missing_proxy_binary_degrades_to_direct_bind() {
        let mut facts = linux_server();
        facts.tools.remove(Tool::Nginx);
        let profile = recommend(&facts);
        assert_eq!(profile.server_type, ServerType::Production);
        assert_eq!(profile.reverse_proxy, ReverseProxy::None);
        assert!(!profile.tls_recommended);
        assert!(profile.has_hint(Hint::ProxyUnavailable));
    }

    #[test]
    fn hints_follow_thresholds() {
        let mut facts = linux_server();
        facts.memory_mb = 4096;
        facts.cpu_cores = 2;
        let profile = recommend(&facts);
        assert!(!profile.has_hint(Hint::HighMemory));
        assert!(!profile.has_hint(Hint::MultiWorker));

        facts.memory_mb = 4097;
        facts.cpu_cores = 3;
        facts.network.internet = true;
        facts.virtual_env_active = true;
        let profile = recommend(&facts);
        assert!(profile.has_hint(Hint::HighMemory));
        assert!(profile.has_hint(Hint::MultiWorker));
        assert!(profile.has_hint(Hint::DirectInternet));
        assert!(profile.has_hint(Hint::VirtualEnvActive));

        facts.proxy_env_set = true;
        assert!(!recommend(&facts).has_hint(Hint::DirectInternet));
    }
}
