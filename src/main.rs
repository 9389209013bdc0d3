mod config;
mod error;
mod fsutil;
mod health;
mod host;
mod launcher;
mod probe;
mod process;
mod proxy;
mod recommend;
mod repair;
mod runner;
mod sandbox;
mod supervisor;
mod update;

use chrono::Local;
use clap::{ArgAction, Parser, Subcommand};
use config::{load_or_default, read_config, resolve_config_path, resolve_project_root, Config, SudoMode};
use dialoguer::console::style;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Confirm, Input};
use dirs::home_dir;
use error::{BmsError, ProcessErrorDetails};
use fsutil::write_atomic_text_file;
use health::{append_snapshot, stored_timestamps, HealthMonitor, HealthSnapshot, ServiceState};
use host::{HostFacts, Profiler, Tool};
use launcher::{LaunchResult, Launcher};
use process::Termination;
use proxy::ProxyConfigurator;
use recommend::{recommend, DeploymentProfile, Hint, ReverseProxy};
use repair::{RepairOrchestrator, RepairReport, StepStatus};
use runner::RealCommandRunner;
use sandbox::{python_identity, EnvironmentManager, RuntimeSandbox};
use serde::Serialize;
use serde_json::json;
use std::io::{self, IsTerminal};
use std::path::{Path, PathBuf};
use supervisor::SupervisorConfigurator;
use tracing::{debug, Level};
use update::{UpdateMode, UpdateReport, UpdateStatus, Updater};

#[derive(Parser, Debug)]
#[command(name = "bmsctl", version, about = "BMS deployment control plane")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long = "project-root", global = true)]
    project_root: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    /// Skip public-IP and internet reachability probes.
    #[arg(long, global = true)]
    offline: bool,
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the development server in the foreground.
    Dev,
    /// Configure the proxy (when recommended) and run the production server.
    Prod,
    /// Show host facts and the recommended deployment.
    Info,
    /// Install and activate the supervisor unit.
    Supervisor,
    /// Take a health snapshot.
    Health {
        #[arg(long, default_value_t = false)]
        save: bool,
    },
    /// Pull sources and reinstall dependencies.
    Update {
        /// Discard local changes before pulling.
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    /// Run every repair step once.
    Repair,
    /// Stop the production server recorded in the PID file.
    Stop,
    /// Print host facts and the deployment profile.
    Profile,
    /// Create or verify the runtime sandbox.
    Sandbox {
        #[arg(long, default_value_t = false)]
        force: bool,
        /// Interpreter to build the sandbox from.
        #[arg(long)]
        python: Option<String>,
    },
    /// Render, validate and install the reverse-proxy site.
    Proxy,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
    Show,
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_details: Option<ProcessErrorDetails>,
}

struct Context {
    project_root: PathBuf,
    config_path: PathBuf,
    json: bool,
    offline: bool,
}

impl Context {
    fn load_config(&self) -> Result<Config, BmsError> {
        load_or_default(&self.config_path)
    }

    fn facts(&self, config: &Config, runner: &RealCommandRunner) -> HostFacts {
        Profiler::new(config.network.probe && !self.offline).profile(runner)
    }

    fn environment<'a>(&self, runner: &'a RealCommandRunner, config: &Config, facts: &HostFacts) -> EnvironmentManager<'a, RealCommandRunner> {
        EnvironmentManager::new(
            runner,
            &self.project_root,
            config.venv_dir(&self.project_root),
            config.manifest_path(&self.project_root),
            facts.os.clone(),
        )
        .echo(!self.json)
    }
}

fn main() -> Result<(), BmsError> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let ctx = build_context(&cli);

    let result = match cli.command {
        None => handle_menu(&ctx),
        Some(Commands::Dev) => handle_dev(&ctx),
        Some(Commands::Prod) => handle_prod(&ctx),
        Some(Commands::Info) => handle_info(&ctx),
        Some(Commands::Supervisor) => handle_supervisor(&ctx),
        Some(Commands::Health { save }) => handle_health(&ctx, save),
        Some(Commands::Update { force, yes }) => handle_update(&ctx, force, yes),
        Some(Commands::Repair) => handle_repair(&ctx),
        Some(Commands::Stop) => handle_stop(&ctx),
        Some(Commands::Profile) => handle_profile(&ctx),
        Some(Commands::Sandbox { force, python }) => handle_sandbox(&ctx, force, python.as_deref()),
        Some(Commands::Proxy) => handle_proxy(&ctx),
        Some(Commands::Config { command }) => handle_config(&ctx, command),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
                error_details: err.details(),
            };
            print_json(&payload)?;
        } else {
            eprintln!("{} {err}", style("[!]").red().bold());
        }
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        _ => Level::DEBUG,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn build_context(cli: &Cli) -> Context {
    let project_root = resolve_project_root(cli.project_root.as_ref());
    let config_path = resolve_config_path(cli.config.as_ref(), &project_root);
    debug!(root = %project_root.display(), config = %config_path.display(), "resolved paths");
    Context {
        project_root,
        config_path,
        json: cli.json,
        offline: cli.offline,
    }
}

fn build_runner(config: &Config) -> RealCommandRunner {
    RealCommandRunner::new(use_sudo(config.privilege.sudo))
}

fn use_sudo(mode: SudoMode) -> bool {
    match mode {
        SudoMode::Always => true,
        SudoMode::Never => false,
        SudoMode::Auto => !running_as_root() && which::which("sudo").is_ok(),
    }
}

#[cfg(unix)]
fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(not(unix))]
fn running_as_root() -> bool {
    false
}

fn output<T: Serialize>(ctx: &Context, payload: &T, human: impl FnOnce()) -> Result<(), BmsError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
            error_details: None,
        };
        print_json(&wrapper)
    } else {
        human();
        Ok(())
    }
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), BmsError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}

fn step(message: &str) {
    println!("{} {message}", style("[+]").green().bold());
}

fn note(message: &str) {
    println!("{} {message}", style("[i]").cyan());
}

fn alert(message: &str) {
    println!("{} {message}", style("[!]").yellow().bold());
}

fn display_path_with_home(path: &Path, home: Option<&Path>) -> String {
    if let Some(home_path) = home {
        if let Ok(relative) = path.strip_prefix(home_path) {
            if relative.as_os_str().is_empty() {
                return "~".to_string();
            }
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

fn show_path(path: &Path) -> String {
    display_path_with_home(path, home_dir().as_deref())
}

/// Line sink for foreground servers; keeps stdout clean for `--json`.
fn server_output(json: bool) -> impl FnMut(&str) {
    move |line: &str| {
        if json {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }
}

fn ensure_sandbox(ctx: &Context, runner: &RealCommandRunner, config: &Config, facts: &HostFacts) -> Result<RuntimeSandbox, BmsError> {
    let manager = ctx.environment(runner, config, facts);
    let (sandbox, outcome) = manager.ensure(None, false)?;
    debug!(?outcome, "sandbox ready");
    Ok(sandbox)
}

fn handle_menu(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    step("Checking runtime sandbox");
    ensure_sandbox(ctx, &runner, &config, &facts)?;

    let theme = ColorfulTheme::default();
    loop {
        println!();
        println!("{}", style("BMS control").bold().cyan());
        for (key, label) in MENU {
            println!("  {} {label}", style(format!("{key})")).bold());
        }
        println!("  {} Exit", style("0)").bold());
        let choice: String = Input::with_theme(&theme)
            .with_prompt("Select an option")
            .allow_empty(true)
            .interact_text()?;
        let result = match choice.trim() {
            "0" => return Ok(()),
            "1" => handle_dev(ctx),
            "2" => handle_prod(ctx),
            "3" => handle_info(ctx),
            "4" => handle_supervisor(ctx),
            "5" => handle_health(ctx, false),
            "6" => handle_update(ctx, false, false),
            "7" => handle_repair(ctx),
            other => {
                alert(&format!("'{other}' is not a menu option"));
                Ok(())
            }
        };
        if let Err(err) = result {
            alert(&err.to_string());
        }
    }
}

const MENU: [(&str, &str); 7] = [
    ("1", "Run development server"),
    ("2", "Run production server"),
    ("3", "Show environment info"),
    ("4", "Configure supervisor"),
    ("5", "Health snapshot"),
    ("6", "Update sources and dependencies"),
    ("7", "Auto-repair"),
];

fn handle_dev(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let sandbox = ensure_sandbox(ctx, &runner, &config, &facts)?;
    let launcher = Launcher::new(&runner, &config, &ctx.project_root, &facts);
    if !ctx.json {
        step(&format!("Starting development server on {}", config.public_bind()));
    }
    let mut sink = server_output(ctx.json);
    let result = launcher.launch_development(&sandbox, &mut sink)?;
    report_launch(ctx, &result)
}

fn handle_prod(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let profile = recommend(&facts);
    let sandbox = ensure_sandbox(ctx, &runner, &config, &facts)?;
    let launcher = Launcher::new(&runner, &config, &ctx.project_root, &facts);
    if !ctx.json {
        if profile.reverse_proxy == ReverseProxy::Nginx {
            step("Configuring reverse proxy");
        }
        if profile.has_hint(Hint::ProxyUnavailable) {
            alert("nginx is not installed; serving without a reverse proxy");
        }
        if profile.has_hint(Hint::VirtualEnvActive) {
            alert("another virtualenv is active; the project sandbox is used regardless");
        }
        for hint in &profile.hints {
            note(&format!("hint: {hint}"));
        }
        step("Starting production server");
    }
    let mut sink = server_output(ctx.json);
    let result = launcher.launch_production(&sandbox, &profile, &mut sink)?;
    report_launch(ctx, &result)
}

fn report_launch(ctx: &Context, result: &LaunchResult) -> Result<(), BmsError> {
    output(ctx, result, || {
        if result.exit_code == 0 {
            note(&format!("{} exited", result.server));
        } else {
            alert(&format!("{} exited with status {}", result.server, result.exit_code));
        }
    })
}

fn handle_info(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let profile = recommend(&facts);
    let manager = ctx.environment(&runner, &config, &facts);
    let sandbox = manager.locate();
    let sandbox_health = manager.check_health(&sandbox);
    let python = if sandbox_health.interpreter_found {
        python_identity(&runner, &sandbox.interpreter_str())
    } else {
        None
    };
    let payload = json!({
        "project_root": ctx.project_root,
        "facts": facts,
        "profile": profile,
        "sandbox": sandbox,
        "sandbox_health": sandbox_health,
        "python": python,
    });
    output(ctx, &payload, || {
        for line in render_info(&ctx.project_root, &facts, &profile, Some((&sandbox, python.as_deref()))) {
            println!("{line}");
        }
    })
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// Grouped facts and recommendation. The Interpreter section is only shown
/// when a sandbox was located.
fn render_info(
    project_root: &Path,
    facts: &HostFacts,
    profile: &DeploymentProfile,
    sandbox: Option<(&RuntimeSandbox, Option<&str>)>,
) -> Vec<String> {
    let mut lines = Vec::new();
    let mut section = |title: &str, rows: Vec<(&str, String)>| {
        lines.push(format!("{}", style(title).bold()));
        for (key, value) in rows {
            lines.push(format!("  {:<18} {value}", style(format!("{key}:")).dim()));
        }
    };

    let os = match &facts.os_edition {
        Some(edition) => format!("{} ({edition})", facts.os.as_str()),
        None => facts.os.as_str().to_string(),
    };
    section(
        "System",
        vec![
            ("os", os),
            ("distribution", facts.distro.clone()),
            ("architecture", facts.architecture.clone()),
            ("project root", show_path(project_root)),
        ],
    );
    if let Some((sandbox, python)) = sandbox {
        section(
            "Interpreter",
            vec![
                ("sandbox", show_path(&sandbox.root)),
                ("python", python.unwrap_or("not available").to_string()),
                ("provisioned", yes_no(sandbox.provisioned).to_string()),
            ],
        );
    }
    section(
        "Device",
        vec![
            ("flavor", format!("{:?}", facts.flavor)),
            ("container", yes_no(facts.is_container).to_string()),
            ("virtual machine", yes_no(facts.is_vm).to_string()),
            ("wsl", yes_no(facts.is_wsl).to_string()),
            ("termux", yes_no(facts.is_termux).to_string()),
            ("raspberry pi", yes_no(facts.is_raspberry_pi).to_string()),
            ("desktop session", yes_no(facts.has_gui).to_string()),
            ("outer venv active", yes_no(facts.virtual_env_active).to_string()),
        ],
    );
    let tools: Vec<&str> = facts.tools.iter().map(|tool| tool.binaries()[0]).collect();
    let missing: Vec<&str> = Tool::ALL
        .iter()
        .filter(|tool| !facts.has_tool(**tool))
        .map(|tool| tool.binaries()[0])
        .collect();
    section(
        "Tools",
        vec![
            ("installed", if tools.is_empty() { "none".to_string() } else { tools.join(", ") }),
            ("missing", if missing.is_empty() { "none".to_string() } else { missing.join(", ") }),
        ],
    );
    section(
        "Hardware",
        vec![
            ("cpu cores", facts.cpu_cores.to_string()),
            ("memory", format!("{} MiB", facts.memory_mb)),
        ],
    );
    section(
        "Network",
        vec![
            ("hostname", facts.network.hostname.clone()),
            ("local ip", facts.network.local_ip.clone()),
            (
                "public ip",
                facts
                    .network
                    .public_ip
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            ),
            ("internet", yes_no(facts.network.internet).to_string()),
            ("proxy env", yes_no(facts.proxy_env_set).to_string()),
        ],
    );
    let hints: Vec<String> = profile.hints.iter().map(|h| h.to_string()).collect();
    section(
        "Recommendation",
        vec![
            ("server type", format!("{:?}", profile.server_type).to_lowercase()),
            ("process server", describe_server(profile)),
            ("reverse proxy", format!("{:?}", profile.reverse_proxy).to_lowercase()),
            ("supervisor", yes_no(profile.use_supervisor).to_string()),
            ("tls", yes_no(profile.tls_recommended).to_string()),
            ("hints", if hints.is_empty() { "none".to_string() } else { hints.join(", ") }),
        ],
    );
    lines
}

fn describe_server(profile: &DeploymentProfile) -> String {
    match profile.process_server {
        recommend::ProcessServer::Gunicorn { workers, threads } => {
            format!("gunicorn ({workers} workers x {threads} threads)")
        }
        recommend::ProcessServer::Waitress => "waitress".to_string(),
    }
}

fn handle_profile(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let profile = recommend(&facts);
    let payload = json!({ "facts": facts, "profile": profile });
    output(ctx, &payload, || {
        for line in render_info(&ctx.project_root, &facts, &profile, None) {
            println!("{line}");
        }
    })
}

fn handle_supervisor(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let profile = recommend(&facts);
    let sandbox = ensure_sandbox(ctx, &runner, &config, &facts)?;
    let supervisor = SupervisorConfigurator::new(&runner, &config, &ctx.project_root, &facts);
    let report = supervisor.configure(&sandbox, profile.process_server)?;
    output(ctx, &report, || {
        if report.changed {
            step(&format!("Installed {}", report.unit_path.display()));
        } else {
            note(&format!("{} is up to date", report.unit_path.display()));
        }
        for warning in &report.warnings {
            alert(warning);
        }
        for ctl in &report.activation {
            if ctl.ok {
                step(&ctl.command);
            } else {
                alert(&format!(
                    "{} failed: {}",
                    ctl.command,
                    ctl.detail.clone().unwrap_or_default()
                ));
            }
        }
    })
}

fn handle_health(ctx: &Context, save: bool) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let snapshot = HealthMonitor::new(&runner, &config, &facts)
        .with_project_root(&ctx.project_root)
        .snapshot();
    let saved_to = if save {
        let log_dir = config.log_dir(&ctx.project_root);
        Some(append_snapshot(&log_dir, &snapshot, config.monitoring.max_entries)?)
    } else {
        None
    };
    let payload = json!({ "snapshot": snapshot, "saved_to": saved_to });
    output(ctx, &payload, || {
        for line in render_health(&snapshot) {
            println!("{line}");
        }
        if let Some(path) = &saved_to {
            let entries = stored_timestamps(path).map(|t| t.len()).unwrap_or(0);
            note(&format!("saved to {} ({entries} entries today)", show_path(path)));
        }
    })
}

fn render_health(snapshot: &HealthSnapshot) -> Vec<String> {
    let system = &snapshot.system;
    let mut lines = vec![
        format!(
            "{} {}",
            style("Health").bold(),
            style(snapshot.timestamp.format("%Y-%m-%d %H:%M:%S")).dim()
        ),
        format!("  OS:          {}", snapshot.os),
        format!("  Host:        {} ({})", snapshot.hostname, snapshot.local_ip),
    ];
    lines.push(match system.temperature.celsius {
        Some(celsius) => format!("  Temperature: {celsius:.1} C ({:?})", system.temperature_level),
        None => "  Temperature: unavailable".to_string(),
    });
    if let Some([one, five, fifteen]) = system.load_average {
        lines.push(format!("  Load:        {one:.2} {five:.2} {fifteen:.2}"));
    }
    lines.push(format!(
        "  Memory:      {} / {} MiB",
        system.memory_used_mb, system.memory_total_mb
    ));
    if let (Some(used), Some(total)) = (system.disk_used_gb, system.disk_total_gb) {
        lines.push(format!("  Disk:        {used:.1} / {total:.1} GB"));
    }
    lines.push(format!(
        "  Uptime:      {:.1} h",
        system.uptime_secs as f64 / 3600.0
    ));
    for port in &snapshot.ports {
        lines.push(format!("  Port {:<6}   {:?}", port.port, port.outcome));
    }
    for service in &snapshot.services {
        let state = if service.running {
            style("running").green().to_string()
        } else {
            style("stopped").red().to_string()
        };
        let pid = service.pid.map(|p| format!(" pid {p}")).unwrap_or_default();
        lines.push(format!("  {:<12} {state}{pid}", service.name));
    }
    let overall = match snapshot.state {
        ServiceState::Healthy => style("healthy").green(),
        ServiceState::Degraded => style("degraded").yellow(),
        ServiceState::Stopped => style("stopped").red(),
    };
    lines.push(format!("  State:       {overall}"));
    lines
}

fn handle_update(ctx: &Context, force: bool, yes: bool) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    if force && !yes {
        if ctx.json || !io::stdin().is_terminal() {
            return Err(BmsError::Config(
                "--force discards local changes; pass --yes to confirm non-interactively".to_string(),
            ));
        }
        let confirmed = Confirm::with_theme(&ColorfulTheme::default())
            .with_prompt("Discard all local changes and untracked files?")
            .default(false)
            .interact()?;
        if !confirmed {
            note("update cancelled");
            return Ok(());
        }
    }
    let mut sandbox = ensure_sandbox(ctx, &runner, &config, &facts)?;
    let mode = if force { UpdateMode::Force } else { UpdateMode::Standard };
    let report = Updater::new(&runner, &ctx.project_root, &facts)
        .echo(!ctx.json)
        .update(mode, &mut sandbox);
    print_update(ctx, &report)?;
    if report.succeeded() {
        Ok(())
    } else {
        Err(BmsError::Provisioning {
            message: "update finished with failed steps".to_string(),
            output: None,
        })
    }
}

fn print_update(ctx: &Context, report: &UpdateReport) -> Result<(), BmsError> {
    output(ctx, report, || {
        for s in &report.steps {
            match &s.status {
                UpdateStatus::Ok => step(&s.name),
                UpdateStatus::Skipped(reason) => note(&format!("{} skipped: {reason}", s.name)),
                UpdateStatus::Failed(reason) => alert(&format!("{} failed: {reason}", s.name)),
            }
        }
    })
}

fn handle_repair(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let manager = ctx.environment(&runner, &config, &facts);
    let located = manager.locate();
    let sandbox = if manager.check_health(&located).healthy() {
        Some(located)
    } else {
        None
    };
    let report = RepairOrchestrator::new(&runner, &config, &ctx.project_root, &facts, sandbox).repair();
    output(ctx, &report, || print_repair(&report))
}

fn print_repair(report: &RepairReport) {
    for s in &report.steps {
        match &s.status {
            StepStatus::Ok => step(s.step.label()),
            StepStatus::Skipped(reason) => note(&format!("{} skipped: {reason}", s.step.label())),
            StepStatus::Failed(reason) => alert(&format!("{} failed: {reason}", s.step.label())),
        }
        for action in &s.actions {
            println!("      {}", style(format!("{action:?}")).dim());
        }
    }
    note(&format!(
        "{} destructive action(s), {} failed step(s)",
        report.destructive_actions(),
        report.failed_steps().len()
    ));
}

fn handle_stop(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = HostFacts::baseline(host::OsFamily::from_system_name(std::env::consts::OS));
    let handle = Launcher::new(&runner, &config, &ctx.project_root, &facts).recorded_handle();
    let pid = handle.recorded_pid();
    let outcome = handle.stop(&runner);
    if let Termination::Failed(reason) = &outcome {
        return Err(BmsError::Tool {
            message: format!("could not stop {}", handle.name),
            details: ProcessErrorDetails {
                error_code: "stop_failed".to_string(),
                hint: None,
                command: None,
                output_excerpt: Some(reason.clone()),
            },
        });
    }
    let payload = json!({ "handle": handle, "pid": pid, "outcome": outcome });
    output(ctx, &payload, || match (&outcome, pid) {
        (Termination::AlreadyGone, _) | (_, None) => note(&format!("{} is not running", handle.name)),
        (_, Some(pid)) => step(&format!("stopped {} (pid {pid})", handle.name)),
    })
}

fn handle_sandbox(ctx: &Context, force: bool, python: Option<&str>) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    let manager = ctx.environment(&runner, &config, &facts);
    let (sandbox, outcome) = manager.ensure(python, force)?;
    let payload = json!({ "sandbox": sandbox, "outcome": outcome });
    output(ctx, &payload, || {
        step(&format!("{:?}: {}", outcome, show_path(&sandbox.root)));
    })
}

fn handle_proxy(ctx: &Context) -> Result<(), BmsError> {
    let config = ctx.load_config()?;
    let runner = build_runner(&config);
    let facts = ctx.facts(&config, &runner);
    if !facts.has_tool(Tool::Nginx) {
        return Err(BmsError::ToolMissing {
            tool: "nginx".to_string(),
        });
    }
    let proxy = ProxyConfigurator::new(&runner, &config, &ctx.project_root, &facts);
    let outcome = proxy.configure()?;
    let action = proxy.reload()?;
    let payload = json!({ "site": outcome, "action": action });
    output(ctx, &payload, || {
        if outcome.changed {
            step(&format!("Installed {}", outcome.site_path.display()));
        } else {
            note(&format!("{} is up to date", outcome.site_path.display()));
        }
        step(&format!("nginx {:?}", action).to_lowercase());
    })
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), BmsError> {
    match command {
        ConfigCommand::Init => {
            if ctx.config_path.exists() {
                let payload = json!({"path": ctx.config_path, "created": false});
                return output(ctx, &payload, || {
                    note(&format!("{} already exists", ctx.config_path.display()));
                });
            }
            let text = default_config_yaml()?;
            write_atomic_text_file(&ctx.config_path, &text, Some(0o600))?;
            let payload = json!({"path": ctx.config_path, "created": true});
            output(ctx, &payload, || {
                step(&format!("Wrote {}", ctx.config_path.display()));
            })
        }
        ConfigCommand::Validate => {
            let _cfg = read_config(&ctx.config_path)?;
            let payload = json!({"path": ctx.config_path, "valid": true});
            output(ctx, &payload, || {
                step(&format!("{} is valid", ctx.config_path.display()));
            })
        }
        ConfigCommand::Show => {
            let config = ctx.load_config()?;
            let text = serde_yaml::to_string(&config)?;
            output(ctx, &config, || print!("{text}"))
        }
    }
}

fn default_config_yaml() -> Result<String, BmsError> {
    let body = serde_yaml::to_string(&Config::default())?;
    Ok(format!(
        "# bmsctl configuration, generated {}\n{body}",
        Local::now().format("%Y-%m-%d")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use host::OsFamily;

    #[test]
    fn display_path_with_home_rewrites_home_prefix() {
        let home = PathBuf::from("/home/pi");
        assert_eq!(display_path_with_home(&home, Some(&home)), "~");
        assert_eq!(display_path_with_home(&home.join("BMS/venv"), Some(&home)), "~/BMS/venv");
        assert_eq!(display_path_with_home(Path::new("/srv/bms"), Some(&home)), "/srv/bms");
        assert_eq!(display_path_with_home(&home.join("BMS"), None), "/home/pi/BMS");
    }

    #[test]
    fn default_config_yaml_round_trips() {
        let text = default_config_yaml().unwrap();
        let parsed = config::read_config_from_str(&text).unwrap();
        assert_eq!(parsed, Config::default());
    }

    #[test]
    fn info_rendering_has_every_section() {
        let mut facts = HostFacts::baseline(OsFamily::Linux);
        facts.tools = [Tool::Nginx].into_iter().collect();
        let profile = recommend(&facts);
        let sandbox = RuntimeSandbox {
            root: PathBuf::from("/srv/bms/venv"),
            interpreter: PathBuf::from("/srv/bms/venv/bin/python3"),
            manifest: PathBuf::from("/srv/bms/requirements.txt"),
            provisioned: false,
        };
        let text = render_info(Path::new("/srv/bms"), &facts, &profile, Some((&sandbox, Some("Python 3.11.2")))).join("\n");
        for title in ["System", "Interpreter", "Device", "Tools", "Hardware", "Network", "Recommendation"] {
            assert!(text.contains(title), "missing {title}");
        }
        assert!(text.contains("Python 3.11.2"));
        assert!(text.contains("nginx"));
    }

    #[test]
    fn profile_rendering_skips_interpreter_section() {
        let facts = HostFacts::baseline(OsFamily::Linux);
        let profile = recommend(&facts);
        let text = render_info(Path::new("/srv/bms"), &facts, &profile, None).join("\n");
        assert!(!text.contains("Interpreter"));
        assert!(text.contains("Recommendation"));
        assert!(text.contains("server type"));
    }

    #[test]
    fn cli_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["bmsctl", "health", "--save", "--json", "-vv", "--offline"]).unwrap();
        assert!(cli.json);
        assert!(cli.offline);
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Some(Commands::Health { save: true })));
    }

    #[test]
    fn no_subcommand_means_menu() {
        let cli = Cli::try_parse_from(["bmsctl"]).unwrap();
        assert!(cli.command.is_none());
    }
}
