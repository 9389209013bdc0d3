use crate::error::BmsError;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "bmsctl.yaml";
pub const CONFIG_ENV: &str = "BMSCTL_CONFIG";
pub const PROJECT_ROOT_ENV: &str = "BMSCTL_PROJECT_ROOT";

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub version: u32,
    pub service: ServiceConfig,
    pub paths: PathsConfig,
    pub proxy: ProxyConfig,
    pub supervisor: SupervisorConfig,
    pub monitoring: MonitoringConfig,
    pub network: NetworkConfig,
    pub privilege: PrivilegeConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ServiceConfig {
    /// Program name used for the supervisor unit and artifact files.
    pub name: String,
    pub port: u16,
    pub wsgi_target: String,
    pub dev_target: String,
    /// Account that owns log and upload directories on Linux.
    pub user: String,
    pub process_patterns: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PathsConfig {
    pub venv_dir: String,
    pub manifest: String,
    pub log_dir: String,
    pub static_dir: String,
    pub upload_dir: String,
    /// Where PID and socket artifacts live. Empty means the platform tmp dir.
    pub runtime_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ProxyConfig {
    pub site_name: String,
    pub sites_available: String,
    pub sites_enabled: String,
    pub listen_port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    pub conf_dir: String,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    pub max_entries: usize,
    pub probe_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    pub probe: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SudoMode {
    Auto,
    Always,
    Never,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct PrivilegeConfig {
    pub sudo: SudoMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            service: ServiceConfig::default(),
            paths: PathsConfig::default(),
            proxy: ProxyConfig::default(),
            supervisor: SupervisorConfig::default(),
            monitoring: MonitoringConfig::default(),
            network: NetworkConfig::default(),
            privilege: PrivilegeConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: "BMS".to_string(),
            port: 5000,
            wsgi_target: "wsgi:application".to_string(),
            dev_target: "app:create_app()".to_string(),
            user: "www-data".to_string(),
            process_patterns: vec!["gunicorn".to_string(), "waitress".to_string()],
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            venv_dir: "venv".to_string(),
            manifest: "requirements.txt".to_string(),
            log_dir: "logs".to_string(),
            static_dir: "app/static".to_string(),
            upload_dir: "UPLOAD".to_string(),
            runtime_dir: String::new(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            site_name: "BMS.conf".to_string(),
            sites_available: "/etc/nginx/sites-available".to_string(),
            sites_enabled: "/etc/nginx/sites-enabled".to_string(),
            listen_port: 80,
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            conf_dir: "/etc/supervisor/conf.d".to_string(),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_entries: 500,
            probe_timeout_ms: 1000,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self { probe: true }
    }
}

impl Default for SudoMode {
    fn default() -> Self {
        Self::Auto
    }
}

impl Default for PrivilegeConfig {
    fn default() -> Self {
        Self {
            sudo: SudoMode::Auto,
        }
    }
}

impl Config {
    pub fn venv_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.paths.venv_dir)
    }

    pub fn manifest_path(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.paths.manifest)
    }

    pub fn log_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.paths.log_dir)
    }

    pub fn static_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.paths.static_dir)
    }

    pub fn upload_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.paths.upload_dir)
    }

    pub fn runtime_dir(&self) -> PathBuf {
        if self.paths.runtime_dir.trim().is_empty() {
            env::temp_dir()
        } else {
            PathBuf::from(&self.paths.runtime_dir)
        }
    }

    pub fn pid_file(&self) -> PathBuf {
        self.runtime_dir()
            .join(format!("{}.pid", self.service.name.to_lowercase()))
    }

    /// Every PID/socket artifact a previous run may have left behind.
    pub fn artifact_paths(&self) -> Vec<PathBuf> {
        let runtime = self.runtime_dir();
        let name = self.service.name.to_lowercase();
        vec![
            runtime.join(format!("{name}.pid")),
            runtime.join(format!("{name}.sock")),
            runtime.join("gunicorn.pid"),
        ]
    }

    pub fn loopback_bind(&self) -> String {
        format!("127.0.0.1:{}", self.service.port)
    }

    pub fn public_bind(&self) -> String {
        format!("0.0.0.0:{}", self.service.port)
    }
}

pub fn read_config_from_str(content: &str) -> Result<Config, BmsError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

pub fn read_config(path: &Path) -> Result<Config, BmsError> {
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

pub fn validate_config(cfg: &Config) -> Result<(), BmsError> {
    if cfg.version != 1 {
        return Err(BmsError::Config(format!(
            "unsupported config version {}; expected 1",
            cfg.version
        )));
    }
    if cfg.service.name.trim().is_empty() {
        return Err(BmsError::Config("service.name must be non-empty".to_string()));
    }
    if cfg
        .service
        .name
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
    {
        return Err(BmsError::Config(format!(
            "service.name may only contain letters, digits, '_' and '-': {}",
            cfg.service.name
        )));
    }
    if cfg.service.port == 0 {
        return Err(BmsError::Config("service.port must be non-zero".to_string()));
    }
    if cfg.proxy.listen_port == 0 {
        return Err(BmsError::Config(
            "proxy.listen_port must be non-zero".to_string(),
        ));
    }
    if cfg.service.wsgi_target.trim().is_empty() || !cfg.service.wsgi_target.contains(':') {
        return Err(BmsError::Config(
            "service.wsgi_target must be a module:callable string".to_string(),
        ));
    }
    if cfg.service.process_patterns.iter().all(|p| p.trim().is_empty()) {
        return Err(BmsError::Config(
            "service.process_patterns must contain at least one pattern".to_string(),
        ));
    }
    for (field, value) in [
        ("paths.venv_dir", &cfg.paths.venv_dir),
        ("paths.manifest", &cfg.paths.manifest),
        ("paths.log_dir", &cfg.paths.log_dir),
        ("paths.static_dir", &cfg.paths.static_dir),
        ("paths.upload_dir", &cfg.paths.upload_dir),
    ] {
        if value.trim().is_empty() {
            return Err(BmsError::Config(format!("{field} must be non-empty")));
        }
        if Path::new(value).is_absolute() {
            return Err(BmsError::Config(format!(
                "{field} must be relative to the project root: {value}"
            )));
        }
    }
    if cfg.monitoring.max_entries == 0 {
        return Err(BmsError::Config(
            "monitoring.max_entries must be at least 1".to_string(),
        ));
    }
    Ok(())
}

/// `--config`, then `BMSCTL_CONFIG`, then `<project_root>/bmsctl.yaml`.
pub fn resolve_config_path(override_path: Option<&PathBuf>, project_root: &Path) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var(CONFIG_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    project_root.join(CONFIG_FILE_NAME)
}

pub fn resolve_project_root(override_path: Option<&PathBuf>) -> PathBuf {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    let raw = match override_path {
        Some(path) => path.clone(),
        None => match env::var(PROJECT_ROOT_ENV) {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => cwd.clone(),
        },
    };
    let absolute = if raw.is_absolute() { raw } else { cwd.join(raw) };
    fs::canonicalize(&absolute).unwrap_or(absolute)
}

/// Loads the config if the file exists; a missing file means defaults.
pub fn load_or_default(path: &Path) -> Result<Config, BmsError> {
    if path.exists() {
        read_config(path)
    } else {
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn config_defaults_apply() {
        let cfg = read_config_from_str("version: 1").expect("config");
        assert_eq!(cfg.service.name, "BMS");
        assert_eq!(cfg.service.port, 5000);
        assert_eq!(cfg.proxy.listen_port, 80);
        assert_eq!(cfg.monitoring.max_entries, 500);
        assert_eq!(cfg.privilege.sudo, SudoMode::Auto);
    }

    #[test]
    fn config_unknown_field_errors() {
        let yaml = r#"
version: 1
service:
  name: BMS
  colour: blue
"#;
        let result = read_config_from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn config_rejects_absolute_project_paths() {
        let yaml = "version: 1\npaths:\n  log_dir: /var/log/bms\n";
        let err = read_config_from_str(yaml).expect_err("absolute path should fail");
        assert!(err.to_string().contains("paths.log_dir"));
    }

    #[test]
    fn config_rejects_bad_service_name() {
        let yaml = "version: 1\nservice:\n  name: \"bms app\"\n";
        assert!(read_config_from_str(yaml).is_err());
    }

    #[test]
    fn artifact_paths_live_under_runtime_dir() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.runtime_dir = dir.path().to_string_lossy().to_string();
        let artifacts = cfg.artifact_paths();
        assert!(artifacts.contains(&dir.path().join("bms.pid")));
        assert!(artifacts.contains(&dir.path().join("bms.sock")));
        assert!(artifacts.iter().all(|p| p.starts_with(dir.path())));
    }

    #[test]
    fn resolve_config_path_prefers_override() {
        let dir = tempdir().unwrap();
        let explicit = dir.path().join("custom.yaml");
        assert_eq!(
            resolve_config_path(Some(&explicit), dir.path()),
            explicit
        );
    }

    #[test]
    fn load_or_default_handles_missing_file() {
        let dir = tempdir().unwrap();
        let cfg = load_or_default(&dir.path().join("missing.yaml")).unwrap();
        assert_eq!(cfg, Config::default());
    }
}
