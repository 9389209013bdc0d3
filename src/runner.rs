use crate::error::{BmsError, ProcessErrorDetails};
use crate::fsutil::write_atomic_text_file;
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Upper bound on tool output carried in errors and reports.
pub const MAX_TOOL_OUTPUT: usize = 2000;
/// How long output readers may lag the process they read from once it has
/// exited or been killed. A grandchild holding the pipes open is abandoned.
const PIPE_GRACE: Duration = Duration::from_millis(250);

/// A structured external-tool invocation. Arguments are passed as a list and
/// never through a shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
    pub elevate: bool,
    /// Where a streamed child's PID is recorded while it runs.
    pub pid_file: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            elevate: false,
            pid_file: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Marks the invocation as needing root. Whether `sudo` is actually
    /// prefixed is decided by the runner.
    pub fn elevated(mut self) -> Self {
        self.elevate = true;
        self
    }

    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    pub fn render(&self) -> String {
        fn shell_quote(part: &str) -> String {
            if part.is_empty() {
                return "\"\"".to_string();
            }
            if part.chars().any(|c| c.is_whitespace()) {
                return format!("\"{}\"", part.replace('"', "\\\""));
            }
            part.to_string()
        }
        let mut parts = Vec::with_capacity(self.args.len() + 2);
        if self.elevate {
            parts.push("sudo".to_string());
        }
        parts.push(shell_quote(&self.program));
        parts.extend(self.args.iter().map(|arg| shell_quote(arg)));
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0 && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// stderr followed by stdout, bounded to `MAX_TOOL_OUTPUT`.
    pub fn excerpt(&self) -> String {
        let stderr = self.stderr_text();
        let stdout = self.stdout_text();
        let combined = match (stderr.is_empty(), stdout.is_empty()) {
            (true, true) => String::new(),
            (false, true) => stderr,
            (true, false) => stdout,
            (false, false) => format!("{stderr}\n{stdout}"),
        };
        truncate_output(&combined, MAX_TOOL_OUTPUT)
    }
}

pub trait CommandRunner {
    /// Runs to completion (or until its timeout) and captures output.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error>;

    /// Runs to completion with no timeout, handing each line of combined
    /// stdout/stderr to `on_line` as it is produced. Returns the exit code.
    fn stream(&self, spec: &CommandSpec, on_line: &mut dyn FnMut(&str))
        -> Result<i32, io::Error>;
}

pub struct RealCommandRunner {
    sudo: bool,
}

impl RealCommandRunner {
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }

    fn build(&self, spec: &CommandSpec) -> Command {
        let mut cmd = if spec.elevate && self.sudo {
            let mut cmd = Command::new("sudo");
            cmd.arg("-n").arg(&spec.program);
            cmd
        } else {
            Command::new(&spec.program)
        };
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null());
        cmd
    }
}

fn drain<R: Read + Send + 'static>(reader: Option<R>) -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut reader) = reader {
            let _ = reader.read_to_end(&mut buf);
        }
        let _ = tx.send(buf);
    });
    rx
}

fn collect(rx: &mpsc::Receiver<Vec<u8>>, deadline: Option<Instant>) -> Vec<u8> {
    match deadline {
        Some(deadline) => rx
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .unwrap_or_default(),
        None => rx.recv().unwrap_or_default(),
    }
}

/// Puts the child in its own process group so a timeout can reach the
/// processes it forked.
#[cfg(unix)]
fn isolate(cmd: &mut Command) {
    use std::os::unix::process::CommandExt;
    cmd.process_group(0);
}

#[cfg(not(unix))]
fn isolate(_cmd: &mut Command) {}

#[cfg(unix)]
fn kill_group(child: &mut Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Ok(raw) = i32::try_from(child.id()) {
        let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
    }
    let _ = child.kill();
}

#[cfg(not(unix))]
fn kill_group(child: &mut Child) {
    let _ = child.kill();
}

fn forward_lines<R: Read + Send + 'static>(
    reader: Option<R>,
    tx: mpsc::Sender<String>,
) -> Option<thread::JoinHandle<()>> {
    let reader = reader?;
    Some(thread::spawn(move || {
        for line in BufReader::new(reader).lines() {
            match line {
                Ok(line) => {
                    if tx.send(line).is_err() {
                        return;
                    }
                }
                Err(_) => break,
            }
        }
    }))
}

impl CommandRunner for RealCommandRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
        debug!(command = %spec.render(), "running");
        let mut cmd = self.build(spec);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        isolate(&mut cmd);
        let mut child = cmd.spawn()?;
        let stdout_reader = drain(child.stdout.take());
        let stderr_reader = drain(child.stderr.take());

        let started = Instant::now();
        let mut timed_out = false;
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }
            if let Some(limit) = spec.timeout {
                if started.elapsed() >= limit {
                    kill_group(&mut child);
                    let _ = child.wait();
                    timed_out = true;
                    break None;
                }
            }
            thread::sleep(Duration::from_millis(20));
        };

        // readers get whatever is left of the timeout, never unbounded time
        let deadline = match (timed_out, spec.timeout) {
            (true, _) => Some(Instant::now() + PIPE_GRACE),
            (false, Some(limit)) => Some(Instant::now().max(started + limit) + PIPE_GRACE),
            (false, None) => None,
        };
        let stdout = collect(&stdout_reader, deadline);
        let stderr = collect(&stderr_reader, deadline);
        let status_code = match status {
            Some(status) => status
                .code()
                .unwrap_or(if status.success() { 0 } else { 1 }),
            None => 124,
        };
        Ok(CommandOutput {
            status_code,
            stdout,
            stderr,
            timed_out,
        })
    }

    fn stream(
        &self,
        spec: &CommandSpec,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<i32, io::Error> {
        debug!(command = %spec.render(), "streaming");
        let mut cmd = self.build(spec);
        cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        let mut child = cmd.spawn()?;
        if let Some(path) = &spec.pid_file {
            if let Err(err) = write_atomic_text_file(path, &child.id().to_string(), Some(0o644)) {
                warn!(path = %path.display(), error = %err, "could not record server pid");
            }
        }

        let (tx, rx) = mpsc::channel::<String>();
        let readers: Vec<_> = [
            forward_lines(child.stdout.take(), tx.clone()),
            forward_lines(child.stderr.take(), tx),
        ]
        .into_iter()
        .flatten()
        .collect();

        for line in rx {
            on_line(&line);
        }
        for reader in readers {
            let _ = reader.join();
        }
        let status = child.wait()?;
        if let Some(path) = &spec.pid_file {
            let recorded = fs::read_to_string(path).ok();
            if recorded.as_deref().map(str::trim) == Some(child.id().to_string().as_str()) {
                let _ = fs::remove_file(path);
            }
        }
        Ok(status
            .code()
            .unwrap_or(if status.success() { 0 } else { 1 }))
    }
}

/// Keeps the tail of `text`, where tool errors usually land.
pub fn truncate_output(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    let skip = count - max_chars;
    let tail: String = text.chars().skip(skip).collect();
    format!("...{tail}")
}

/// Runs a spec and turns spawn failures, timeouts and non-zero exits into
/// structured errors.
pub fn run_checked<R: CommandRunner + ?Sized>(
    runner: &R,
    spec: &CommandSpec,
) -> Result<CommandOutput, BmsError> {
    let command = spec.render();
    let output = runner.run(spec).map_err(|err| spawn_error(&err, spec))?;
    if output.timed_out {
        return Err(BmsError::Tool {
            message: format!("`{command}` timed out"),
            details: ProcessErrorDetails {
                error_code: "timeout".to_string(),
                hint: None,
                command: Some(command),
                output_excerpt: none_if_empty(output.excerpt()),
            },
        });
    }
    if !output.success() {
        let excerpt = output.excerpt();
        let mut message = format!(
            "command failed with status {} while running `{}`",
            output.status_code, command
        );
        if !excerpt.is_empty() {
            message = format!("{message}: {excerpt}");
        }
        return Err(BmsError::Tool {
            message,
            details: ProcessErrorDetails {
                error_code: "process_command_failed".to_string(),
                hint: None,
                command: Some(command),
                output_excerpt: none_if_empty(excerpt),
            },
        });
    }
    Ok(output)
}

/// Runs a probe and returns its output only if it could be spawned at all.
pub fn probe<R: CommandRunner + ?Sized>(runner: &R, spec: &CommandSpec) -> Option<CommandOutput> {
    runner.run(spec).ok()
}

pub fn spawn_error(err: &io::Error, spec: &CommandSpec) -> BmsError {
    if err.kind() == io::ErrorKind::NotFound {
        return BmsError::ToolMissing {
            tool: spec.program.clone(),
        };
    }
    let command = spec.render();
    BmsError::Tool {
        message: format!("failed to run command `{command}`: {err}"),
        details: ProcessErrorDetails {
            error_code: "process_spawn_failed".to_string(),
            hint: None,
            command: Some(command),
            output_excerpt: None,
        },
    }
}

fn none_if_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::cell::RefCell;

    #[derive(Debug, Clone)]
    pub enum MockResponse {
        Output(CommandOutput),
        NotFound,
    }

    struct Rule {
        pattern: String,
        response: MockResponse,
        remaining: Option<usize>,
    }

    /// Records every spec and answers from substring rules matched against
    /// the rendered command. Unmatched commands succeed with empty output.
    #[derive(Default)]
    pub struct MockRunner {
        calls: RefCell<Vec<CommandSpec>>,
        rules: RefCell<Vec<Rule>>,
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            status_code: 0,
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            timed_out: false,
        }
    }

    pub fn fail(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            status_code: code,
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            timed_out: false,
        }
    }

    impl MockRunner {
        pub fn on(&self, pattern: &str, output: CommandOutput) -> &Self {
            self.push(pattern, MockResponse::Output(output), None)
        }

        pub fn once(&self, pattern: &str, output: CommandOutput) -> &Self {
            self.push(pattern, MockResponse::Output(output), Some(1))
        }

        pub fn missing(&self, pattern: &str) -> &Self {
            self.push(pattern, MockResponse::NotFound, None)
        }

        fn push(&self, pattern: &str, response: MockResponse, remaining: Option<usize>) -> &Self {
            self.rules.borrow_mut().push(Rule {
                pattern: pattern.to_string(),
                response,
                remaining,
            });
            self
        }

        pub fn calls(&self) -> Vec<CommandSpec> {
            self.calls.borrow().clone()
        }

        pub fn rendered(&self) -> Vec<String> {
            self.calls.borrow().iter().map(CommandSpec::render).collect()
        }

        pub fn count(&self, pattern: &str) -> usize {
            self.rendered()
                .iter()
                .filter(|line| line.contains(pattern))
                .count()
        }

        fn respond(&self, spec: &CommandSpec) -> MockResponse {
            self.calls.borrow_mut().push(spec.clone());
            let rendered = spec.render();
            let mut rules = self.rules.borrow_mut();
            for rule in rules.iter_mut() {
                if !rendered.contains(&rule.pattern) || rule.remaining == Some(0) {
                    continue;
                }
                if let Some(remaining) = rule.remaining.as_mut() {
                    *remaining -= 1;
                }
                return rule.response.clone();
            }
            MockResponse::Output(ok(""))
        }
    }

    impl CommandRunner for MockRunner {
        fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, io::Error> {
            match self.respond(spec) {
                MockResponse::Output(output) => Ok(output),
                MockResponse::NotFound => {
                    Err(io::Error::new(io::ErrorKind::NotFound, "not found"))
                }
            }
        }

        fn stream(
            &self,
            spec: &CommandSpec,
            on_line: &mut dyn FnMut(&str),
        ) -> Result<i32, io::Error> {
            match self.respond(spec) {
                MockResponse::Output(output) => {
                    for line in String::from_utf8_lossy(&output.stdout).lines() {
                        on_line(line);
                    }
                    for line in String::from_utf8_lossy(&output.stderr).lines() {
                        on_line(line);
                    }
                    Ok(output.status_code)
                }
                MockResponse::NotFound => {
                    Err(io::Error::new(io::ErrorKind::NotFound, "not found"))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn render_quotes_whitespace_and_marks_elevation() {
        let spec = CommandSpec::new("nginx")
            .args(["-t", "-c", "/tmp/my dir/nginx.conf"])
            .elevated();
        assert_eq!(spec.render(), "sudo nginx -t -c \"/tmp/my dir/nginx.conf\"");
    }

    #[test]
    fn truncate_output_keeps_tail() {
        let text = "a".repeat(10) + "tail";
        let truncated = truncate_output(&text, 4);
        assert_eq!(truncated, "...tail");
        assert_eq!(truncate_output("short", 100), "short");
    }

    #[test]
    fn run_checked_maps_not_found_to_tool_missing() {
        let runner = MockRunner::default();
        runner.missing("supervisorctl");
        let err = run_checked(&runner, &CommandSpec::new("supervisorctl").arg("reread"))
            .expect_err("missing tool should fail");
        match err {
            BmsError::ToolMissing { tool } => assert_eq!(tool, "supervisorctl"),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn run_checked_surfaces_bounded_excerpt() {
        let runner = MockRunner::default();
        let noisy = "x".repeat(MAX_TOOL_OUTPUT * 2);
        runner.on("pip install", fail(1, &noisy));
        let err = run_checked(
            &runner,
            &CommandSpec::new("python3").args(["-m", "pip", "install", "flask"]),
        )
        .expect_err("non-zero exit should fail");
        let details = err.details().expect("details");
        assert_eq!(details.error_code, "process_command_failed");
        let excerpt = details.output_excerpt.unwrap_or_default();
        assert!(excerpt.chars().count() <= MAX_TOOL_OUTPUT + 3);
    }

    #[test]
    fn mock_once_rule_is_consumed() {
        let runner = MockRunner::default();
        runner.once("git pull", fail(1, "conflict"));
        let spec = CommandSpec::new("git").arg("pull");
        assert!(!runner.run(&spec).unwrap().success());
        assert!(runner.run(&spec).unwrap().success());
        assert_eq!(runner.count("git pull"), 2);
    }

    #[cfg(unix)]
    #[test]
    fn real_runner_enforces_timeout() {
        let runner = RealCommandRunner::new(false);
        let spec = CommandSpec::new("sleep")
            .arg("5")
            .timeout(Duration::from_millis(200));
        let started = Instant::now();
        let output = runner.run(&spec).unwrap();
        assert!(output.timed_out);
        assert!(!output.success());
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[cfg(unix)]
    #[test]
    fn timeout_is_not_held_up_by_grandchildren() {
        let runner = RealCommandRunner::new(false);
        // `sleep` runs as a child of sh and inherits its pipes
        let spec = CommandSpec::new("sh")
            .args(["-c", "sleep 6; true"])
            .timeout(Duration::from_millis(300));
        let started = Instant::now();
        let output = runner.run(&spec).unwrap();
        assert!(output.timed_out);
        assert_eq!(output.status_code, 124);
        assert!(started.elapsed() < Duration::from_secs(3), "{:?}", started.elapsed());
    }

    #[cfg(unix)]
    #[test]
    fn real_runner_streams_combined_output() {
        let runner = RealCommandRunner::new(false);
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]);
        let mut lines = Vec::new();
        let code = runner
            .stream(&spec, &mut |line| lines.push(line.to_string()))
            .unwrap();
        assert_eq!(code, 3);
        assert!(lines.contains(&"out".to_string()));
        assert!(lines.contains(&"err".to_string()));
    }
}
