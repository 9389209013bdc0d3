//! Environment Manager: owns the project's virtualenv.
//!
//! Whether the sandbox is provisioned is never remembered in memory. It is
//! re-derived from a stamp file written after a successful install, keyed by
//! the manifest's content hash.

use crate::error::BmsError;
use crate::fsutil::{stable_hash, write_atomic_text_file};
use crate::host::OsFamily;
use crate::runner::{probe, truncate_output, CommandRunner, CommandSpec, MAX_TOOL_OUTPUT};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

const STAMP_FILE: &str = ".provisioned";
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(2);
const INTERPRETER_CANDIDATES: [&str; 7] = [
    "python3.13",
    "python3.12",
    "python3.11",
    "python3.10",
    "python3.9",
    "python3",
    "python",
];
const HARDWARE_PACKAGES: [&str; 3] = ["rpi.gpio", "picamera", "gpiozero"];
const SKIPPED_DIRS: [&str; 3] = ["venv", ".git", "node_modules"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RuntimeSandbox {
    pub root: PathBuf,
    pub interpreter: PathBuf,
    pub manifest: PathBuf,
    pub provisioned: bool,
}

impl RuntimeSandbox {
    pub fn bin_dir(&self) -> PathBuf {
        self.interpreter
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.join("bin"))
    }

    pub fn interpreter_str(&self) -> String {
        self.interpreter.to_string_lossy().to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct SandboxHealth {
    pub exists: bool,
    pub interpreter_found: bool,
    pub package_manager_found: bool,
    pub issues: Vec<String>,
}

impl SandboxHealth {
    pub fn healthy(&self) -> bool {
        self.exists && self.interpreter_found && self.package_manager_found
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnsureOutcome {
    AlreadyProvisioned,
    Installed,
    Created,
}

#[derive(Debug, Serialize, Deserialize)]
struct ProvisionStamp {
    manifest_hash: String,
    interpreter: String,
    provisioned_at: DateTime<Utc>,
}

pub struct EnvironmentManager<'a, R: CommandRunner> {
    runner: &'a R,
    project_root: PathBuf,
    venv_dir: PathBuf,
    manifest: PathBuf,
    os: OsFamily,
    echo: bool,
}

impl<'a, R: CommandRunner> EnvironmentManager<'a, R> {
    pub fn new(runner: &'a R, project_root: &Path, venv_dir: PathBuf, manifest: PathBuf, os: OsFamily) -> Self {
        Self {
            runner,
            project_root: project_root.to_path_buf(),
            venv_dir,
            manifest,
            os,
            echo: false,
        }
    }

    /// Print installer output to stderr as it arrives.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn interpreter_path(&self) -> PathBuf {
        if self.os == OsFamily::Windows {
            return self.venv_dir.join("Scripts").join("python.exe");
        }
        let bin = self.venv_dir.join("bin");
        let python3 = bin.join("python3");
        let python = bin.join("python");
        if !python3.exists() && python.exists() {
            python
        } else {
            python3
        }
    }

    /// The sandbox as it currently exists on disk.
    pub fn locate(&self) -> RuntimeSandbox {
        let interpreter = self.interpreter_path();
        let provisioned = self.read_stamp().map_or(false, |stamp| {
            stamp.manifest_hash == self.manifest_hash()
                && stamp.interpreter == interpreter.to_string_lossy()
        });
        RuntimeSandbox {
            root: self.venv_dir.clone(),
            interpreter,
            manifest: self.manifest.clone(),
            provisioned,
        }
    }

    pub fn check_health(&self, sandbox: &RuntimeSandbox) -> SandboxHealth {
        let mut health = SandboxHealth {
            exists: sandbox.root.is_dir(),
            ..SandboxHealth::default()
        };
        if !health.exists {
            health
                .issues
                .push(format!("sandbox directory {} is missing", sandbox.root.display()));
        }
        health.interpreter_found = python_identity(self.runner, &sandbox.interpreter_str()).is_some();
        if !health.interpreter_found {
            health.issues.push(format!(
                "interpreter {} is missing or not runnable",
                sandbox.interpreter.display()
            ));
        }
        health.package_manager_found = probe(
            self.runner,
            &CommandSpec::new(sandbox.interpreter_str())
                .args(["-m", "pip", "--version"])
                .timeout(VERSION_PROBE_TIMEOUT),
        )
        .map_or(false, |out| out.success());
        if !health.package_manager_found {
            health.issues.push("pip is not available in the sandbox".to_string());
        }
        health
    }

    /// Reuses a healthy sandbox, installs into one that is not provisioned,
    /// and rebuilds a missing or broken one (or any sandbox when `force`).
    pub fn ensure(
        &self,
        interpreter_hint: Option<&str>,
        force: bool,
    ) -> Result<(RuntimeSandbox, EnsureOutcome), BmsError> {
        let current = self.locate();
        if !force {
            let health = self.check_health(&current);
            if health.healthy() {
                if current.provisioned {
                    info!(root = %current.root.display(), "sandbox already provisioned");
                    return Ok((current, EnsureOutcome::AlreadyProvisioned));
                }
                let mut sandbox = current;
                self.install(&mut sandbox)?;
                return Ok((sandbox, EnsureOutcome::Installed));
            }
            if health.exists {
                warn!(issues = ?health.issues, "sandbox is broken; rebuilding");
            }
        }

        if self.venv_dir.exists() {
            info!(root = %self.venv_dir.display(), "removing sandbox");
            fs::remove_dir_all(&self.venv_dir)?;
        }
        let base = self.discover_interpreter(interpreter_hint)?;
        self.create(&base)?;
        let mut sandbox = self.locate();
        let health = self.check_health(&sandbox);
        if !(health.interpreter_found && health.package_manager_found) {
            return Err(BmsError::Provisioning {
                message: "sandbox was created but failed verification".to_string(),
                output: Some(health.issues.join("; ")),
            });
        }
        self.install(&mut sandbox)?;
        Ok((sandbox, EnsureOutcome::Created))
    }

    /// An explicit hint first, then the first versioned interpreter on PATH.
    /// Candidates must identify themselves as Python 3 to be accepted.
    pub fn discover_interpreter(&self, hint: Option<&str>) -> Result<String, BmsError> {
        let candidates = hint
            .into_iter()
            .chain(INTERPRETER_CANDIDATES.iter().copied());
        for candidate in candidates {
            if let Some(identity) = python_identity(self.runner, candidate) {
                debug!(candidate, identity = %identity, "interpreter accepted");
                return Ok(candidate.to_string());
            }
        }
        Err(BmsError::Provisioning {
            message: "no usable Python 3 interpreter found".to_string(),
            output: None,
        })
    }

    fn create(&self, base: &str) -> Result<(), BmsError> {
        info!(interpreter = base, root = %self.venv_dir.display(), "creating sandbox");
        let spec = CommandSpec::new(base)
            .args(["-m", "venv"])
            .arg(self.venv_dir.to_string_lossy())
            .cwd(&self.project_root);
        let (code, output) = self.stream_captured(&spec)?;
        if code != 0 {
            return Err(BmsError::Provisioning {
                message: format!("`{}` exited with status {code}", spec.render()),
                output: Some(output),
            });
        }
        Ok(())
    }

    /// Upgrades pip, then installs the manifest with one no-cache retry.
    pub fn install(&self, sandbox: &mut RuntimeSandbox) -> Result<(), BmsError> {
        let python = sandbox.interpreter_str();
        let upgrade = CommandSpec::new(&python)
            .args(["-m", "pip", "install", "--upgrade", "pip", "setuptools", "wheel"])
            .cwd(&self.project_root);
        let (code, output) = self.stream_captured(&upgrade)?;
        if code != 0 {
            warn!(output = %output, "pip upgrade failed; continuing with the installed pip");
        }

        if !sandbox.manifest.is_file() {
            warn!(manifest = %sandbox.manifest.display(), "dependency manifest not found; nothing to install");
        } else {
            self.hardware_notice(&sandbox.manifest);
            let manifest = sandbox.manifest.to_string_lossy().to_string();
            let install = CommandSpec::new(&python)
                .args(["-m", "pip", "install", "-r"])
                .arg(&manifest)
                .cwd(&self.project_root);
            let (code, _) = self.stream_captured(&install)?;
            if code != 0 {
                warn!("dependency install failed; retrying without cache");
                let retry = install.clone().arg("--no-cache-dir");
                let (code, output) = self.stream_captured(&retry)?;
                if code != 0 {
                    return Err(BmsError::Provisioning {
                        message: format!("`{}` exited with status {code}", retry.render()),
                        output: Some(output),
                    });
                }
            }
        }

        self.write_stamp(sandbox)?;
        sandbox.provisioned = true;
        Ok(())
    }

    fn hardware_notice(&self, manifest: &Path) {
        let content = fs::read_to_string(manifest).unwrap_or_default().to_lowercase();
        if HARDWARE_PACKAGES.iter().any(|pkg| content.contains(pkg)) {
            info!("manifest uses Raspberry Pi hardware libraries; SPI/I2C may need enabling with raspi-config");
        }
    }

    fn stream_captured(&self, spec: &CommandSpec) -> Result<(i32, String), BmsError> {
        let mut captured = String::new();
        let echo = self.echo;
        let code = self
            .runner
            .stream(spec, &mut |line| {
                if echo {
                    eprintln!("    {line}");
                }
                captured.push_str(line);
                captured.push('\n');
            })
            .map_err(|err| BmsError::Provisioning {
                message: format!("failed to run `{}`: {err}", spec.render()),
                output: None,
            })?;
        Ok((code, truncate_output(captured.trim_end(), MAX_TOOL_OUTPUT)))
    }

    fn manifest_hash(&self) -> String {
        let bytes = fs::read(&self.manifest).unwrap_or_default();
        format!("{:016x}", stable_hash(&bytes))
    }

    fn stamp_path(&self) -> PathBuf {
        self.venv_dir.join(STAMP_FILE)
    }

    fn read_stamp(&self) -> Option<ProvisionStamp> {
        let text = fs::read_to_string(self.stamp_path()).ok()?;
        serde_json::from_str(&text).ok()
    }

    fn write_stamp(&self, sandbox: &RuntimeSandbox) -> Result<(), BmsError> {
        let stamp = ProvisionStamp {
            manifest_hash: self.manifest_hash(),
            interpreter: sandbox.interpreter_str(),
            provisioned_at: Utc::now(),
        };
        let text = serde_json::to_string_pretty(&stamp)?;
        write_atomic_text_file(&self.stamp_path(), &text, None)
    }
}

/// The interpreter's self-reported version, if it reports Python 3.
pub fn python_identity<R: CommandRunner + ?Sized>(runner: &R, interpreter: &str) -> Option<String> {
    let out = probe(
        runner,
        &CommandSpec::new(interpreter)
            .arg("--version")
            .timeout(VERSION_PROBE_TIMEOUT),
    )?;
    if !out.success() {
        return None;
    }
    // Python 2 printed its version on stderr.
    let text = if out.stdout_text().is_empty() {
        out.stderr_text()
    } else {
        out.stdout_text()
    };
    if text.starts_with("Python 3") {
        Some(text)
    } else {
        None
    }
}

/// Removes `__pycache__` directories and stray `.pyc` files below `root`.
/// Returns the number of entries removed.
pub fn clear_bytecode_caches(root: &Path) -> usize {
    let mut removed = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                if name == "__pycache__" {
                    if fs::remove_dir_all(&path).is_ok() {
                        removed += 1;
                    }
                } else if !SKIPPED_DIRS.contains(&name.as_str()) {
                    stack.push(path);
                }
            } else if name.ends_with(".pyc") && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::{fail, ok, MockRunner};
    use tempfile::tempdir;

    fn manager<'a>(runner: &'a MockRunner, root: &Path) -> EnvironmentManager<'a, MockRunner> {
        EnvironmentManager::new(
            runner,
            root,
            root.join("venv"),
            root.join("requirements.txt"),
            OsFamily::Linux,
        )
    }

    #[test]
    fn ensure_twice_provisions_once() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("venv/bin")).unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask\n").unwrap();
        let runner = MockRunner::default();
        runner.on("--version", ok("Python 3.11.2"));
        let manager = manager(&runner, dir.path());

        let (sandbox, outcome) = manager.ensure(None, false).unwrap();
        assert_eq!(outcome, EnsureOutcome::Installed);
        assert!(sandbox.provisioned);
        assert_eq!(runner.count("pip install -r"), 1);

        let (sandbox, outcome) = manager.ensure(None, false).unwrap();
        assert_eq!(outcome, EnsureOutcome::AlreadyProvisioned);
        assert!(sandbox.provisioned);
        assert_eq!(runner.count("pip install -r"), 1);
        assert_eq!(runner.count("--upgrade pip"), 1);
    }

    #[test]
    fn manifest_change_invalidates_provisioning() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("venv/bin")).unwrap();
        let manifest = dir.path().join("requirements.txt");
        fs::write(&manifest, "flask\n").unwrap();
        let runner = MockRunner::default();
        runner.on("--version", ok("Python 3.11.2"));
        let manager = manager(&runner, dir.path());
        manager.ensure(None, false).unwrap();

        fs::write(&manifest, "flask\ngunicorn\n").unwrap();
        assert!(!manager.locate().provisioned);
        let (_, outcome) = manager.ensure(None, false).unwrap();
        assert_eq!(outcome, EnsureOutcome::Installed);
        assert_eq!(runner.count("pip install -r"), 2);
    }

    #[test]
    fn health_distinguishes_missing_from_broken() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        runner.missing("venv/bin/python3");
        let manager = manager(&runner, dir.path());

        let health = manager.check_health(&manager.locate());
        assert!(!health.exists);
        assert!(!health.interpreter_found);

        fs::create_dir_all(dir.path().join("venv/bin")).unwrap();
        let health = manager.check_health(&manager.locate());
        assert!(health.exists);
        assert!(!health.interpreter_found);
        assert!(!health.healthy());
        assert!(!health.issues.is_empty());
    }

    #[test]
    fn discovery_verifies_identity_not_name() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        runner.missing("python3.13 --version");
        runner.on("python3.12 --version", ok("Python 2.7.18"));
        runner.on("python3.11 --version", fail(1, ""));
        runner.on("python3.10 --version", ok("Python 3.10.12"));
        let manager = manager(&runner, dir.path());
        assert_eq!(manager.discover_interpreter(None).unwrap(), "python3.10");
    }

    #[test]
    fn discovery_prefers_hint() {
        let dir = tempdir().unwrap();
        let runner = MockRunner::default();
        runner.on("--version", ok("Python 3.12.1"));
        let manager = manager(&runner, dir.path());
        assert_eq!(
            manager.discover_interpreter(Some("/opt/py/bin/python3")).unwrap(),
            "/opt/py/bin/python3"
        );
    }

    #[test]
    fn install_retries_without_cache_then_reports_output() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("venv/bin")).unwrap();
        fs::write(dir.path().join("requirements.txt"), "flask\n").unwrap();
        let runner = MockRunner::default();
        runner.on("--version", ok("Python 3.11.2"));
        runner.on("pip install -r", fail(1, "ERROR: No matching distribution found for flask"));
        let manager = manager(&runner, dir.path());

        let err = manager.ensure(None, false).expect_err("install should fail");
        assert_eq!(runner.count("--no-cache-dir"), 1);
        match err {
            BmsError::Provisioning { output, .. } => {
                assert!(output.unwrap_or_default().contains("No matching distribution"));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
        assert!(!manager.locate().provisioned);
    }

    #[test]
    fn force_recreates_existing_sandbox() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("venv/bin")).unwrap();
        fs::write(dir.path().join("venv/marker"), "old").unwrap();
        let runner = MockRunner::default();
        runner.on("--version", ok("Python 3.11.2"));
        let manager = manager(&runner, dir.path());

        let (sandbox, outcome) = manager.ensure(None, true).unwrap();
        assert_eq!(outcome, EnsureOutcome::Created);
        assert!(sandbox.provisioned);
        assert!(!dir.path().join("venv/marker").exists());
        assert_eq!(runner.count("-m venv"), 1);
    }

    #[test]
    fn missing_manifest_is_not_fatal() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("venv/bin")).unwrap();
        let runner = MockRunner::default();
        runner.on("--version", ok("Python 3.11.2"));
        let manager = manager(&runner, dir.path());
        let (sandbox, _) = manager.ensure(None, false).unwrap();
        assert!(sandbox.provisioned);
        assert_eq!(runner.count("pip install -r"), 0);
    }

    #[test]
    fn clear_bytecode_caches_skips_venv() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("app/__pycache__")).unwrap();
        fs::write(dir.path().join("app/__pycache__/x.cpython-311.pyc"), "").unwrap();
        fs::write(dir.path().join("app/old.pyc"), "").unwrap();
        fs::create_dir_all(dir.path().join("venv/lib/__pycache__")).unwrap();
        assert_eq!(clear_bytecode_caches(dir.path()), 2);
        assert!(!dir.path().join("app/__pycache__").exists());
        assert!(dir.path().join("venv/lib/__pycache__").exists());
    }
}
