//! Reverse-Proxy Configurator for nginx.

use crate::config::Config;
use crate::error::BmsError;
use crate::fsutil::{dir_writable, install_file, write_atomic_text_file};
use crate::host::{HostFacts, Tool};
use crate::probe::{Probes, ServiceManagerState};
use crate::process::{find_matching, process_table};
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Characters that would escape the quoted values in the site template.
const FORBIDDEN_PATH_CHARS: [char; 9] = ['"', '{', '}', ';', '$', '\\', '#', '\n', '\r'];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ConfigureOutcome {
    pub site_path: PathBuf,
    pub enabled_path: PathBuf,
    pub changed: bool,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReloadAction {
    Reloaded,
    Started,
}

pub struct SiteTemplate<'a> {
    pub listen_port: u16,
    pub upstream: &'a str,
    pub static_dir: &'a Path,
    pub log_prefix: &'a str,
}

pub fn render_site(template: &SiteTemplate<'_>) -> Result<String, BmsError> {
    let static_dir = template.static_dir.to_string_lossy();
    if let Some(bad) = static_dir.chars().find(|c| FORBIDDEN_PATH_CHARS.contains(c)) {
        return Err(BmsError::Validation {
            message: format!("static path {static_dir:?} contains unsupported character {bad:?}"),
        });
    }
    let static_dir = static_dir.trim_end_matches('/');
    let prefix = template.log_prefix;
    Ok(format!(
        r#"# Managed by bmsctl; regenerated on every configure.
server {{
    listen {listen};
    server_name _;

    access_log /var/log/nginx/{prefix}_access.log;
    error_log /var/log/nginx/{prefix}_error.log;

    location / {{
        proxy_pass http://{upstream};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
    }}

    location /static/ {{
        alias "{static_dir}/";
        try_files $uri =404;
        expires 30d;
    }}
}}
"#,
        listen = template.listen_port,
        upstream = template.upstream,
    ))
}

/// Structural check of nginx syntax: balanced blocks, terminated statements,
/// closed quotes. Runs before the nginx binary sees the file.
pub fn lint(text: &str) -> Result<(), String> {
    let mut depth: i64 = 0;
    let mut pending = false;
    let mut line = 1usize;
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            '#' => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        line += 1;
                        break;
                    }
                }
            }
            '"' | '\'' => {
                pending = true;
                let quote = c;
                let mut closed = false;
                while let Some(next) = chars.next() {
                    match next {
                        '\\' => {
                            chars.next();
                        }
                        '\n' => line += 1,
                        n if n == quote => {
                            closed = true;
                            break;
                        }
                        _ => {}
                    }
                }
                if !closed {
                    return Err(format!("unterminated quoted string starting near line {line}"));
                }
            }
            '{' => {
                depth += 1;
                pending = false;
            }
            '}' => {
                if pending {
                    return Err(format!("directive missing ';' before '}}' on line {line}"));
                }
                depth -= 1;
                if depth < 0 {
                    return Err(format!("unexpected '}}' on line {line}"));
                }
            }
            ';' => pending = false,
            c if c.is_whitespace() => {}
            _ => pending = true,
        }
    }
    if depth != 0 {
        return Err(format!("{depth} unclosed block(s) at end of file"));
    }
    if pending {
        return Err("last directive is missing ';'".to_string());
    }
    Ok(())
}

pub struct ProxyConfigurator<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a Config,
    project_root: PathBuf,
    facts: &'a HostFacts,
}

impl<'a, R: CommandRunner + ?Sized> ProxyConfigurator<'a, R> {
    pub fn new(runner: &'a R, config: &'a Config, project_root: &Path, facts: &'a HostFacts) -> Self {
        Self {
            runner,
            config,
            project_root: project_root.to_path_buf(),
            facts,
        }
    }

    pub fn site_path(&self) -> PathBuf {
        Path::new(&self.config.proxy.sites_available).join(&self.config.proxy.site_name)
    }

    pub fn enabled_path(&self) -> PathBuf {
        Path::new(&self.config.proxy.sites_enabled).join(&self.config.proxy.site_name)
    }

    pub fn render(&self) -> Result<String, BmsError> {
        let upstream = self.config.loopback_bind();
        let static_dir = self.config.static_dir(&self.project_root);
        let prefix = self.config.service.name.to_lowercase();
        render_site(&SiteTemplate {
            listen_port: self.config.proxy.listen_port,
            upstream: &upstream,
            static_dir: &static_dir,
            log_prefix: &prefix,
        })
    }

    /// Renders, validates, then atomically installs and enables the site.
    /// On any validation failure the live file is left untouched.
    pub fn configure(&self) -> Result<ConfigureOutcome, BmsError> {
        let rendered = self.render()?;
        self.install_site(&rendered)
    }

    pub fn install_site(&self, rendered: &str) -> Result<ConfigureOutcome, BmsError> {
        let site_path = self.site_path();
        let enabled_path = self.enabled_path();
        let unchanged = fs::read_to_string(&site_path)
            .map(|live| live == rendered)
            .unwrap_or(false);

        if !unchanged {
            self.validate_candidate(rendered)?;
            info!(path = %site_path.display(), "installing proxy site");
            install_file(self.runner, &site_path, rendered, &self.config.runtime_dir())?;
        }
        self.enable(&site_path, &enabled_path)?;
        Ok(ConfigureOutcome {
            site_path,
            enabled_path,
            changed: !unchanged,
        })
    }

    /// Lints the candidate, then runs `nginx -t` against a throwaway main
    /// config that includes only the candidate.
    pub fn validate_candidate(&self, rendered: &str) -> Result<(), BmsError> {
        lint(rendered).map_err(|message| BmsError::Validation { message })?;
        if !self.facts.has_tool(Tool::Nginx) {
            warn!("nginx not installed; only the built-in lint was applied");
            return Ok(());
        }
        let scratch = self
            .config
            .runtime_dir()
            .join(format!("bmsctl-nginx-{}", std::process::id()));
        fs::create_dir_all(&scratch)?;
        let result = self.run_candidate_test(&scratch, rendered);
        let _ = fs::remove_dir_all(&scratch);
        result
    }

    fn run_candidate_test(&self, scratch: &Path, rendered: &str) -> Result<(), BmsError> {
        let candidate = scratch.join("candidate.conf");
        let wrapper = scratch.join("nginx.conf");
        write_atomic_text_file(&candidate, rendered, Some(0o644))?;
        let wrapper_text = format!(
            "pid \"{}\";\nerror_log \"{}\";\nevents {{}}\nhttp {{\n    include \"{}\";\n}}\n",
            scratch.join("nginx.pid").display(),
            scratch.join("error.log").display(),
            candidate.display(),
        );
        write_atomic_text_file(&wrapper, &wrapper_text, Some(0o644))?;
        let spec = CommandSpec::new("nginx")
            .arg("-t")
            .arg("-p")
            .arg(scratch.to_string_lossy())
            .arg("-c")
            .arg(wrapper.to_string_lossy())
            .elevated();
        let output = self
            .runner
            .run(&spec)
            .map_err(|err| crate::runner::spawn_error(&err, &spec))?;
        if output.success() {
            Ok(())
        } else {
            Err(BmsError::Validation {
                message: output.excerpt(),
            })
        }
    }

    fn enable(&self, site_path: &Path, enabled_path: &Path) -> Result<(), BmsError> {
        if fs::read_link(enabled_path).map(|t| t == site_path).unwrap_or(false) {
            return Ok(());
        }
        let parent = enabled_path.parent().unwrap_or_else(|| Path::new("/"));
        if dir_writable(parent) {
            fs::create_dir_all(parent)?;
            if fs::symlink_metadata(enabled_path).is_ok() {
                fs::remove_file(enabled_path)?;
            }
            link(site_path, enabled_path)?;
            return Ok(());
        }
        run_checked(
            self.runner,
            &CommandSpec::new("ln")
                .arg("-sf")
                .arg(site_path.to_string_lossy())
                .arg(enabled_path.to_string_lossy())
                .elevated(),
        )?;
        Ok(())
    }

    /// `nginx -t` on the live configuration; `Err` carries nginx's output.
    pub fn check(&self) -> Result<(), BmsError> {
        let spec = CommandSpec::new("nginx").arg("-t").elevated();
        let output = self
            .runner
            .run(&spec)
            .map_err(|err| crate::runner::spawn_error(&err, &spec))?;
        if output.success() {
            Ok(())
        } else {
            Err(BmsError::Validation {
                message: output.excerpt(),
            })
        }
    }

    /// Validates, then reloads a running proxy or starts a stopped one.
    pub fn reload(&self) -> Result<ReloadAction, BmsError> {
        self.check()?;
        if self.facts.has_tool(Tool::Systemctl) {
            let state = Probes::new(self.runner, self.facts).service_state("nginx");
            if state == ServiceManagerState::Active {
                run_checked(
                    self.runner,
                    &CommandSpec::new("systemctl").args(["reload", "nginx"]).elevated(),
                )?;
                return Ok(ReloadAction::Reloaded);
            }
            run_checked(
                self.runner,
                &CommandSpec::new("systemctl").args(["restart", "nginx"]).elevated(),
            )?;
            return Ok(ReloadAction::Started);
        }
        let running = !find_matching(&process_table(), &["nginx".to_string()]).is_empty();
        if running {
            run_checked(
                self.runner,
                &CommandSpec::new("nginx").args(["-s", "reload"]).elevated(),
            )?;
            Ok(ReloadAction::Reloaded)
        } else {
            run_checked(self.runner, &CommandSpec::new("nginx").elevated())?;
            Ok(ReloadAction::Started)
        }
    }
}

#[cfg(unix)]
fn link(target: &Path, link_path: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, link_path)
}

#[cfg(not(unix))]
fn link(target: &Path, link_path: &Path) -> std::io::Result<()> {
    fs::copy(target, link_path).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::OsFamily;
    use crate::runner::testing::{fail, ok, MockRunner};
    use tempfile::tempdir;

    fn setup(dir: &Path) -> (Config, HostFacts) {
        let mut config = Config::default();
        config.proxy.sites_available = dir.join("sites-available").to_string_lossy().to_string();
        config.proxy.sites_enabled = dir.join("sites-enabled").to_string_lossy().to_string();
        config.paths.runtime_dir = dir.join("run").to_string_lossy().to_string();
        let mut facts = HostFacts::baseline(OsFamily::Linux);
        facts.tools = [Tool::Nginx, Tool::Systemctl].into_iter().collect();
        (config, facts)
    }

    #[test]
    fn rendered_site_passes_lint_for_ordinary_paths() {
        for root in [
            "/srv/bms",
            "/home/pi/My Projects/BMS",
            "/opt/bms-2.0/release_1",
            "/data/médias/bms",
            "/tmp/a'b",
        ] {
            let static_dir = Path::new(root).join("app/static");
            let text = render_site(&SiteTemplate {
                listen_port: 80,
                upstream: "127.0.0.1:5000",
                static_dir: &static_dir,
                log_prefix: "bms",
            })
            .unwrap();
            assert_eq!(lint(&text), Ok(()), "root {root}");
            assert!(text.contains("proxy_pass http://127.0.0.1:5000;"));
            assert!(text.contains("listen 80;"));
        }
    }

    #[test]
    fn render_rejects_template_breaking_paths() {
        for bad in ["/srv/a;b", "/srv/a\"b", "/srv/{x}", "/srv/$host", "/srv/a\\b", "/srv/bms#1"] {
            let static_dir = PathBuf::from(bad);
            let result = render_site(&SiteTemplate {
                listen_port: 80,
                upstream: "127.0.0.1:5000",
                static_dir: &static_dir,
                log_prefix: "bms",
            });
            assert!(result.is_err(), "{bad}");
        }
    }

    #[test]
    fn lint_catches_structural_errors() {
        assert!(lint("server { listen 80 }").is_err());
        assert!(lint("server { listen 80; ").is_err());
        assert!(lint("server { listen 80; }}").is_err());
        assert!(lint("server { alias \"/x; }").is_err());
        assert!(lint("# only a comment; {\n").is_ok());
    }

    #[test]
    fn configure_installs_and_enables_site() {
        let dir = tempdir().unwrap();
        let (config, facts) = setup(dir.path());
        let runner = MockRunner::default();
        let proxy = ProxyConfigurator::new(&runner, &config, Path::new("/srv/bms"), &facts);

        let outcome = proxy.configure().unwrap();
        assert!(outcome.changed);
        let live = fs::read_to_string(&outcome.site_path).unwrap();
        assert!(live.contains("alias \"/srv/bms/app/static/\";"));
        assert!(fs::symlink_metadata(&outcome.enabled_path).is_ok());
        assert_eq!(runner.count("nginx -t -p"), 1);

        let again = proxy.configure().unwrap();
        assert!(!again.changed);
        assert_eq!(runner.count("nginx -t -p"), 1);
    }

    #[test]
    fn invalid_candidate_leaves_live_config_untouched() {
        let dir = tempdir().unwrap();
        let (config, facts) = setup(dir.path());
        let site = dir.path().join("sites-available/BMS.conf");
        fs::create_dir_all(site.parent().unwrap()).unwrap();
        let previous = b"server { listen 80; } # previous\n".to_vec();
        fs::write(&site, &previous).unwrap();

        let runner = MockRunner::default();
        runner.on(
            "nginx -t -p",
            fail(1, "nginx: [emerg] unknown directive \"expires30d\" in candidate.conf:22"),
        );
        let proxy = ProxyConfigurator::new(&runner, &config, Path::new("/srv/bms"), &facts);
        let err = proxy.configure().expect_err("validation must fail");
        match err {
            BmsError::Validation { message } => {
                assert!(message.contains("unknown directive \"expires30d\""))
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert_eq!(fs::read(&site).unwrap(), previous);
    }

    #[test]
    fn reload_aborts_on_failed_check() {
        let dir = tempdir().unwrap();
        let (config, facts) = setup(dir.path());
        let runner = MockRunner::default();
        runner.on("nginx -t", fail(1, "nginx: configuration file /etc/nginx/nginx.conf test failed"));
        let proxy = ProxyConfigurator::new(&runner, &config, dir.path(), &facts);
        let err = proxy.reload().expect_err("reload must fail");
        assert!(err.to_string().contains("test failed"));
        assert_eq!(runner.count("systemctl"), 0);
    }

    #[test]
    fn reload_restarts_inactive_service() {
        let dir = tempdir().unwrap();
        let (config, facts) = setup(dir.path());
        let runner = MockRunner::default();
        runner.on("is-active nginx", fail(3, ""));
        let proxy = ProxyConfigurator::new(&runner, &config, dir.path(), &facts);
        assert_eq!(proxy.reload().unwrap(), ReloadAction::Started);
        assert_eq!(runner.count("systemctl restart nginx"), 1);

        let runner = MockRunner::default();
        runner.on("is-active nginx", ok("active"));
        let proxy = ProxyConfigurator::new(&runner, &config, dir.path(), &facts);
        assert_eq!(proxy.reload().unwrap(), ReloadAction::Reloaded);
        assert_eq!(runner.count("systemctl reload nginx"), 1);
    }
}
