use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use rewind_daemon::adapters::CommandReplay;
use rewind_daemon::adapters::StdioLauncher;
use rewind_daemon::RecorderConfig;
use rewind_daemon::RecorderDaemon;
use rewind_daemon::StartParams;
use rewind_ipc::command::ReplayArgs;
use rewind_ipc::command::ReplayOutput;
use rewind_ipc::command::ResolveArgs;
use rewind_ipc::read_recorder_pid;
use rewind_ipc::restart_recorder;
use rewind_ipc::stop_recorder;
use rewind_ipc::ClientConfig;
use rewind_ipc::ClientError;
use rewind_ipc::Command;
use rewind_ipc::ControlClient;
use rewind_ipc::StopOptions;
use rewind_ipc::UnixProcessController;
use rewind_log::derive_index;
use rewind_log::EventIter;
use rewind_log::EventLog;
use rewind_log::FrameIndex;
use rewind_log::Locator;
use rewind_log::Resolver;
use rewind_log::TabId;
use serde_json::json;
use serde_json::Value;
use tracing::info;
use tracing::warn;

use crate::color::Colors;
use crate::commands::OutputFormat;
use crate::commands::ReplayFormat;
use crate::commands::StartArgs;
use crate::error::CliError;

pub type HandlerResult = Result<(), CliError>;

const STARTUP_POLLS: u32 = 50;
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(100);

trait ValueExt {
    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str;
    fn u64_or(&self, key: &str, default: u64) -> u64;
}

impl ValueExt for Value {
    fn str_or<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.get(key).and_then(Value::as_str).unwrap_or(default)
    }

    fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(default)
    }
}

pub struct HandlerContext {
    pub format: OutputFormat,
    pub socket: PathBuf,
    pub client_config: ClientConfig,
}

impl HandlerContext {
    pub fn new(format: OutputFormat, socket: PathBuf) -> Self {
        Self {
            format,
            socket,
            client_config: ClientConfig::from_env(),
        }
    }

    async fn connect(&self) -> Result<ControlClient, CliError> {
        Ok(ControlClient::connect_with_config(&self.socket, &self.client_config).await?)
    }

    async fn call(&self, command: &Command) -> Result<Value, CliError> {
        let client = self.connect().await?;
        let result = client.action(command).await;
        client.close().await;
        Ok(result?)
    }

    fn present_json(&self, value: &Value) {
        println!(
            "{}",
            serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
        );
    }

    /// JSON output prints `value`; text output prints `message`.
    fn present(&self, value: &Value, message: &str) {
        match self.format {
            OutputFormat::Json => self.present_json(value),
            OutputFormat::Text => println!("{}", message),
        }
    }

    fn present_warnings(&self, warnings: &[String]) {
        for warning in warnings {
            eprintln!("{} {}", Colors::warning("Warning:"), warning);
        }
    }
}

fn format_resolution(result: &Value) -> String {
    let frame = &result["resolution"]["frame"];
    format!(
        "Frame {} at {} (tab {})",
        Colors::bold(&frame.u64_or("i", 0).to_string()),
        Colors::info(result.str_or("locator", "?")),
        result["resolution"].u64_or("tab", 0)
    )
}

/// Runs the recorder in the foreground until SIGINT or SIGTERM.
pub fn handle_daemon(ctx: &HandlerContext, start: StartArgs) -> HandlerResult {
    let config = RecorderConfig::from_env().with_socket_path(ctx.socket.clone());
    let launcher = StdioLauncher::from_config(&config).ok_or(CliError::NoBrowser)?;
    let replay = CommandReplay::from_config(&config);

    let mut daemon = RecorderDaemon::new(config, Arc::new(launcher));
    if let Some(replay) = replay {
        daemon = daemon.with_replay(Arc::new(replay));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("rewind-worker")
        .build()
        .map_err(CliError::Runtime)?;
    let report = runtime.block_on(daemon.run(StartParams {
        url: start.url,
        viewport: start.viewport,
    }))?;

    for step in report.failures() {
        warn!(step = step.name, outcome = ?step.outcome, "Teardown step failed");
    }
    info!(clean = report.is_clean(), "Recorder exited");
    Ok(())
}

pub async fn handle_ping(ctx: &HandlerContext) -> HandlerResult {
    let client = ctx.connect().await?;
    let rtt = client.ping().await?;
    client.close().await;
    let ms = rtt.as_secs_f64() * 1000.0;
    ctx.present(
        &json!({ "pong": true, "rttMs": ms }),
        &format!("{} ({:.1} ms)", Colors::success("pong"), ms),
    );
    Ok(())
}

pub async fn handle_status(ctx: &HandlerContext) -> HandlerResult {
    let status = ctx.call(&Command::Status).await?;
    if ctx.format == OutputFormat::Json {
        ctx.present_json(&status);
        return Ok(());
    }

    println!(
        "{} {}",
        Colors::bold("Recorder status:"),
        Colors::success(status.str_or("state", "unknown"))
    );
    println!("  PID: {}", status.u64_or("recorderPid", 0));
    println!("  Socket: {}", status.str_or("socketPath", "?"));
    if let Some(run) = status.get("run").filter(|r| !r.is_null()) {
        println!(
            "  Run: {} ({})",
            run.str_or("runId", "?"),
            run.str_or("url", "no url")
        );
        println!("  Directory: {}", status.str_or("runDir", "?"));
    }
    if let Some(stats) = status.get("stats").filter(|s| !s.is_null()) {
        println!(
            "  Frames: {}  Records: {}",
            stats.u64_or("frames", 0),
            stats.u64_or("records", 0)
        );
    }
    if let Some(ingest) = status.get("ingest").filter(|s| !s.is_null()) {
        let dropped = ingest.u64_or("dropped", 0);
        if dropped > 0 {
            println!("  {}", Colors::warning(&format!("Dropped events: {}", dropped)));
        }
    }
    println!("  Tabs: {}", status.u64_or("tabs", 0));
    Ok(())
}

pub async fn handle_tabs(ctx: &HandlerContext) -> HandlerResult {
    let result = ctx.call(&Command::Tabs).await?;
    if ctx.format == OutputFormat::Json {
        ctx.present_json(&result);
        return Ok(());
    }
    let tabs = result["tabs"].as_array().cloned().unwrap_or_default();
    if tabs.is_empty() {
        println!("{}", Colors::dim("No tabs recorded yet"));
    }
    for tab in &tabs {
        println!(
            "  {}  {}",
            Colors::bold(&format!("tab {}", tab.u64_or("tabId", 0))),
            tab.str_or("url", "-")
        );
    }
    Ok(())
}

pub async fn handle_action(ctx: &HandlerContext, tool: String, args: Option<String>) -> HandlerResult {
    let args = args
        .map(|raw| serde_json::from_str::<Value>(&raw))
        .transpose()?;
    let command = Command::parse(&tool, args)?;
    let result = ctx.call(&command).await?;
    match ctx.format {
        OutputFormat::Json => ctx.present_json(&result),
        OutputFormat::Text => match command {
            Command::SnapshotHtml => println!("{}", result.str_or("html", "")),
            Command::Evaluate(_) => println!("{}", result["value"]),
            _ => println!("{} {}", Colors::success("✓"), tool),
        },
    }
    Ok(())
}

pub async fn handle_resolve(ctx: &HandlerContext, locator: String, tab: Option<u32>) -> HandlerResult {
    let command = Command::Resolve(ResolveArgs {
        locator: locator.parse()?,
        tab: tab.map(TabId),
    });
    let result = ctx.call(&command).await?;
    ctx.present(&result, &format_resolution(&result));
    Ok(())
}

/// Resolves against the event log of a run on disk; no recorder needed.
pub fn handle_resolve_offline(
    ctx: &HandlerContext,
    dir: &Path,
    locator: String,
    tab: Option<u32>,
) -> HandlerResult {
    let locator: Locator = locator.parse()?;
    let log_path = dir.join(EventLog::FILE_NAME);
    if !log_path.exists() {
        return Err(CliError::NoRun {
            dir: dir.to_path_buf(),
        });
    }
    let mut events = EventIter::open(&log_path)?;
    let entries = derive_index(events.by_ref().map(|logged| logged.record));
    if events.skipped() > 0 {
        warn!(skipped = events.skipped(), "Skipped unreadable log lines");
    }
    let index = FrameIndex::from_entries(entries);
    let resolution = Resolver::new(&index).resolve(&locator, tab.map(TabId))?;

    let result = json!({
        "resolution": resolution,
        "locator": resolution.locator().to_string(),
    });
    ctx.present(&result, &format_resolution(&result));
    Ok(())
}

pub async fn handle_replay(
    ctx: &HandlerContext,
    locator: String,
    tab: Option<u32>,
    output: ReplayFormat,
    path: Option<PathBuf>,
) -> HandlerResult {
    let command = Command::Replay(ReplayArgs {
        locator: locator.parse()?,
        tab: tab.map(TabId),
        output: match output {
            ReplayFormat::Html => ReplayOutput::Html,
            ReplayFormat::Image => ReplayOutput::Image,
        },
        path,
    });
    let result = ctx.call(&command).await?;
    if ctx.format == OutputFormat::Json {
        ctx.present_json(&result);
        return Ok(());
    }

    let artifact = &result["artifact"];
    match artifact.str_or("kind", "") {
        "html" => println!("{}", artifact.str_or("html", "")),
        _ => {
            eprintln!("{}", format_resolution(&result));
            println!(
                "{} Replay written to {}",
                Colors::success("✓"),
                artifact.str_or("path", "?")
            );
        }
    }
    Ok(())
}

pub fn handle_stop(ctx: &HandlerContext, force: bool) -> HandlerResult {
    let Some(pid) = read_recorder_pid(&ctx.socket) else {
        ctx.present(
            &json!({ "stopped": false, "running": false }),
            "Recorder is not running (already stopped)",
        );
        return Ok(());
    };

    let options = StopOptions::new(RecorderConfig::from_env().teardown_budget()).forced(force);
    match stop_recorder(&UnixProcessController, pid, &ctx.socket, options) {
        Ok(result) => {
            ctx.present_warnings(&result.warnings);
            ctx.present(
                &json!({ "stopped": true, "pid": result.pid, "warnings": result.warnings }),
                &format!("{} Recorder {} stopped", Colors::success("✓"), result.pid),
            );
            Ok(())
        }
        Err(ClientError::NotRunning { .. }) => {
            ctx.present(
                &json!({ "stopped": false, "running": false }),
                "Recorder is not running (cleaned up stale files)",
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

pub fn handle_restart(ctx: &HandlerContext, start: StartArgs) -> HandlerResult {
    if ctx.format == OutputFormat::Text {
        eprintln!("{}", Colors::info("Restarting recorder..."));
    }
    let config = RecorderConfig::from_env();
    let socket = ctx.socket.clone();
    let warnings = restart_recorder(
        &UnixProcessController,
        || read_recorder_pid(&socket),
        &socket,
        StopOptions::new(config.teardown_budget()),
        config.restart_settle,
        || start_recorder_background(&socket, &start),
    )?;
    ctx.present_warnings(&warnings);
    ctx.present(
        &json!({ "restarted": true, "pid": read_recorder_pid(&socket), "warnings": warnings }),
        &format!("{} Recorder restarted", Colors::success("✓")),
    );
    Ok(())
}

/// Spawns `rewind daemon` detached, logging to `<socket>.log`, and waits for
/// its socket to appear.
fn start_recorder_background(socket: &Path, start: &StartArgs) -> Result<(), ClientError> {
    let exe = std::env::current_exe()?;
    let log_path = socket.with_extension("log");
    let stderr = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .map(Stdio::from)
        .unwrap_or_else(|_| Stdio::null());

    let mut command = std::process::Command::new(exe);
    command
        .arg("daemon")
        .arg("--socket")
        .arg(socket)
        .arg("--viewport")
        .arg(format!("{}x{}", start.viewport.width, start.viewport.height));
    if let Some(url) = &start.url {
        command.arg("--url").arg(url);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(stderr)
        .spawn()?;

    for _ in 0..STARTUP_POLLS {
        std::thread::sleep(STARTUP_POLL_INTERVAL);
        if socket.exists() && read_recorder_pid(socket).is_some() {
            return Ok(());
        }
    }

    if let Ok(log) = std::fs::read_to_string(&log_path) {
        let tail: Vec<&str> = log.lines().rev().take(5).collect();
        if !tail.is_empty() {
            eprintln!("Recorder failed to start. Recent log output:");
            for line in tail.iter().rev() {
                eprintln!("  {}", line);
            }
        }
    }
    Err(ClientError::NotRunning {
        path: socket.to_path_buf(),
    })
}

pub fn handle_reindex(ctx: &HandlerContext, dir: &Path, verify: bool) -> HandlerResult {
    if !dir.join(EventLog::FILE_NAME).exists() {
        return Err(CliError::NoRun {
            dir: dir.to_path_buf(),
        });
    }

    if verify {
        let verification = rewind_log::verify_index(dir)?;
        let value = json!(verification);
        if verification.is_consistent() {
            ctx.present(
                &value,
                &format!(
                    "{} Index matches event log ({} frames)",
                    Colors::success("✓"),
                    verification.derived_frames
                ),
            );
            return Ok(());
        }
        match ctx.format {
            OutputFormat::Json => ctx.present_json(&value),
            OutputFormat::Text => {
                println!(
                    "Derived {} frames, stored {}",
                    verification.derived_frames, verification.stored_frames
                );
                if verification.missing_tail > 0 {
                    println!("  Missing tail: {} frames", verification.missing_tail);
                }
                if let Some(line) = verification.first_mismatch {
                    println!("  First mismatch at line {}", line);
                }
                for tab in &verification.tab_mismatches {
                    println!("  Tab {} differs", tab);
                }
            }
        }
        return Err(CliError::IndexMismatch {
            dir: dir.to_path_buf(),
        });
    }

    let policy = RecorderConfig::from_env().sync_policy;
    let before = rewind_log::reindex(dir, policy)?;
    let value = json!({
        "rebuilt": !before.is_consistent(),
        "frames": before.derived_frames,
        "before": before,
    });
    let message = if before.is_consistent() {
        format!(
            "{} Index already consistent ({} frames)",
            Colors::success("✓"),
            before.derived_frames
        )
    } else {
        format!(
            "{} Index rebuilt ({} frames, {} stored before)",
            Colors::success("✓"),
            before.derived_frames,
            before.stored_frames
        )
    };
    ctx.present(&value, &message);
    Ok(())
}
