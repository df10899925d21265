use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use screenlogger_cli::audit::AuditLog;
use screenlogger_cli::cli::{Cli, Command};
use screenlogger_cli::config::{CONFIG_DIR, ProjectConfig};
use screenlogger_cli::elevation;
use screenlogger_cli::liveness::ProcessTableProbe;
use screenlogger_cli::paths::StatePaths;
use screenlogger_cli::poller::run_poll_loop;
use screenlogger_cli::sensor::SENSOR_UNAVAILABLE;
use screenlogger_cli::shell_completion;
use screenlogger_cli::store::{DEFAULT_RECENT_WINDOW, EventStore, ScreenEvent};
use screenlogger_cli::supervisor::{
    StatusSnapshot, SupervisorConfig, SupervisorFacade, SupervisorResult, SupervisorState,
};
use screenlogger_cli::worker::{self, WorkerOptions};

fn config_source_label(config_path: Option<&Path>) -> String {
    config_path
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| format!("(defaults, no {CONFIG_DIR}/config.toml found)"))
}

fn push_kv(output: &mut String, key: &str, value: impl std::fmt::Display) {
    output.push_str(&format!("  {key:<20} {value}\n"));
}

fn list_or_none(items: &[String]) -> String {
    if items.is_empty() {
        "(none)".to_string()
    } else {
        items.join(", ")
    }
}

fn render_config_human(
    config: &ProjectConfig,
    paths: &StatePaths,
    config_path: Option<&Path>,
) -> String {
    let mut output = String::new();
    output.push_str("Paths\n");
    push_kv(&mut output, "state_dir", paths.state_dir.display());
    push_kv(&mut output, "pid_file", paths.pid_file.display());
    push_kv(&mut output, "log_file", paths.log_file.display());
    push_kv(&mut output, "event_db", paths.event_db.display());
    push_kv(&mut output, "sensor_file", paths.sensor_file.display());
    output.push('\n');

    output.push_str("Launcher\n");
    push_kv(
        &mut output,
        "program",
        config
            .launcher
            .program
            .as_deref()
            .unwrap_or("(this executable, worker mode)"),
    );
    push_kv(&mut output, "args", list_or_none(&config.launcher.args));
    push_kv(
        &mut output,
        "discovery_retries",
        config.launcher.discovery_retries,
    );
    push_kv(
        &mut output,
        "discovery_interval",
        format!("{}ms", config.launcher.discovery_interval_millis),
    );
    output.push('\n');

    output.push_str("Elevation\n");
    push_kv(&mut output, "enabled", config.elevation.enabled);
    push_kv(&mut output, "program", &config.elevation.program);
    push_kv(&mut output, "args", list_or_none(&config.elevation.args));
    push_kv(
        &mut output,
        "timeout",
        format!("{}s", config.elevation.timeout_secs),
    );
    push_kv(&mut output, "oom_score_adj", config.elevation.oom_score_adj);
    output.push('\n');

    output.push_str("Stop\n");
    push_kv(&mut output, "grace", format!("{}ms", config.stop.grace_millis));
    push_kv(
        &mut output,
        "kill_wait",
        format!("{}ms", config.stop.kill_wait_millis),
    );
    output.push('\n');

    output.push_str("Worker\n");
    push_kv(&mut output, "tick", format!("{}ms", config.worker.tick_millis));
    output.push('\n');

    output.push_str("Poller\n");
    push_kv(
        &mut output,
        "interval",
        format!("{}s", config.poller.interval_secs),
    );
    output.push('\n');

    output.push_str("Source Path\n");
    push_kv(&mut output, "path", config_source_label(config_path));

    output
}

fn render_config_json(
    config: &ProjectConfig,
    paths: &StatePaths,
    config_path: Option<&Path>,
) -> Result<String> {
    let payload = serde_json::json!({
        "paths": {
            "state_dir": paths.state_dir,
            "pid_file": paths.pid_file,
            "log_file": paths.log_file,
            "event_db": paths.event_db,
            "sensor_file": paths.sensor_file
        },
        "launcher": &config.launcher,
        "elevation": &config.elevation,
        "stop": &config.stop,
        "worker": &config.worker,
        "poller": &config.poller,
        "source_path": config_source_label(config_path)
    });

    serde_json::to_string_pretty(&payload).context("failed to serialize config to JSON")
}

fn render_status(snapshot: &StatusSnapshot) -> String {
    match (snapshot.state, snapshot.pid) {
        (state, Some(pid)) => format!("{state} (pid {pid})"),
        (state, None) => state.to_string(),
    }
}

fn render_events(events: &[ScreenEvent]) -> String {
    if events.is_empty() {
        return "(no events recorded)\n".to_string();
    }
    let mut output = String::new();
    for event in events {
        output.push_str(&format!("{}  {}\n", event.timestamp, event.event_type));
    }
    output
}

fn build_facade(
    config: &ProjectConfig,
    config_path: Option<&Path>,
    paths: StatePaths,
) -> Result<SupervisorFacade> {
    let supervisor = SupervisorConfig::from_project(config, config_path, paths)?;
    Ok(SupervisorFacade::new(
        supervisor,
        Arc::new(ProcessTableProbe),
        elevation::from_settings(&config.elevation),
    ))
}

fn finish(result: SupervisorResult) -> Result<()> {
    if !result.is_success() {
        anyhow::bail!("{result}");
    }
    println!("{result}");
    Ok(())
}

fn watch(facade: &SupervisorFacade, interval: Duration) -> Result<()> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        stop_clone.store(true, Ordering::Relaxed);
    })
    .context("failed to install Ctrl-C handler")?;

    let audit = facade.audit();
    let mut last_status: Option<(SupervisorState, Option<i32>)> = None;
    let mut audit_seen = audit.entries().map(|e| e.len()).unwrap_or(0);

    run_poll_loop(facade, interval, &stop, |snapshot| {
        let current = (snapshot.state, snapshot.pid);
        if last_status != Some(current) {
            println!(
                "[{}] {}",
                snapshot.checked_at.format("%H:%M:%S"),
                render_status(snapshot)
            );
            last_status = Some(current);
        }
        if let Ok(entries) = audit.entries() {
            // A cleared log starts over.
            if entries.len() < audit_seen {
                audit_seen = 0;
            }
            for entry in &entries[audit_seen..] {
                println!("  {}", entry.render());
            }
            audit_seen = entries.len();
        }
    });
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let is_read_only = matches!(
        &cli.command,
        Command::Config { .. }
            | Command::Status { .. }
            | Command::Pid
            | Command::Sensor
            | Command::Log { .. }
            | Command::Events { .. }
            | Command::Completions { .. }
    );

    let filter = match cli.verbose {
        0 if is_read_only => "screenlogger=warn",
        0 => "screenlogger=info",
        1 => "screenlogger=debug",
        _ => "screenlogger=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let cwd = std::env::current_dir().context("failed to get current directory (was it deleted?)")?;
    // The worker runs in the state directory, which may sit outside the
    // project; it loads the file its supervisor loaded.
    let (config, config_path) = match &cli.command {
        Command::Worker {
            config: Some(path), ..
        } => (ProjectConfig::load_file(path)?, Some(path.clone())),
        _ => ProjectConfig::load(&cwd)?,
    };

    if !is_read_only || cli.verbose > 0 {
        match config_path {
            Some(ref p) => info!("loaded config from {}", p.display()),
            None => info!("no {CONFIG_DIR}/config.toml found, using defaults"),
        }
    }

    let source = config_path.as_deref();
    let paths = StatePaths::resolve(&config.paths, source, &cwd);

    match cli.command {
        Command::Start => finish(build_facade(&config, source, paths)?.start())?,
        Command::Ensure => finish(build_facade(&config, source, paths)?.ensure_running())?,
        Command::Stop => finish(build_facade(&config, source, paths)?.stop())?,
        Command::Status { json } => {
            let snapshot = build_facade(&config, source, paths)?.snapshot();
            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshot)
                        .context("failed to serialize status to JSON")?
                );
            } else {
                println!("{}", render_status(&snapshot));
            }
        }
        Command::Pid => {
            let pid = build_facade(&config, source, paths)?.current_pid().unwrap_or(-1);
            println!("{pid}");
        }
        Command::Sensor => {
            let facade = build_facade(&config, source, paths)?;
            let value = facade.read_sensor();
            println!("{value}");
            if value == SENSOR_UNAVAILABLE {
                info!(
                    "sensor {} unavailable",
                    facade.config().paths.sensor_file.display()
                );
            }
        }
        Command::Log { clear } => {
            let audit = AuditLog::new(&paths.log_file);
            if clear {
                audit.clear()?;
                println!("cleared {}", paths.log_file.display());
            } else {
                let content = audit.read_all()?;
                if content.is_empty() {
                    println!("(no log entries)");
                } else {
                    print!("{content}");
                }
            }
        }
        Command::Watch { interval } => {
            let facade = build_facade(&config, source, paths)?;
            let secs = interval.unwrap_or(config.poller.interval_secs).max(1);
            watch(&facade, Duration::from_secs(secs))?;
        }
        Command::Events { last, recent_hours } => {
            if !paths.event_db.exists() {
                print!("{}", render_events(&[]));
                return Ok(());
            }
            let store = EventStore::open(&paths.event_db)?;
            let events = match (last, recent_hours) {
                (Some(n), _) => store.last(n)?,
                (None, Some(hours)) => store.recent(Duration::from_secs(hours.saturating_mul(60 * 60)))?,
                (None, None) => store.recent(DEFAULT_RECENT_WINDOW)?,
            };
            print!("{}", render_events(&events));
        }
        Command::Config { json } => {
            if json {
                println!("{}", render_config_json(&config, &paths, source)?);
            } else {
                print!("{}", render_config_human(&config, &paths, source));
            }
        }
        Command::Completions { shell } => shell_completion::print(shell)?,
        Command::Worker {
            sensor,
            event_db,
            audit_log,
            ..
        } => {
            worker::run(WorkerOptions {
                sensor_path: sensor.unwrap_or(paths.sensor_file),
                event_db: event_db.unwrap_or(paths.event_db),
                audit_log: audit_log.unwrap_or(paths.log_file),
                tick: Duration::from_millis(config.worker.tick_millis.max(1)),
                elevation: config.elevation.clone(),
            })?;
        }
    }

    Ok(())
}
