//! agentic: host process for the dispatch core.
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Load config
//!   3. Resolve effective log level (CLI `-v` flags > env > config)
//!   4. Init logger once
//!   5. Setup dispatcher identity
//!   6. Start the supervisor (bus, registry, dispatcher, health)
//!   7. Spawn enabled built-in agents
//!   8. Run the subcommand, or serve until Ctrl-C
//!   9. Graceful shutdown

use serde_json::Value;
use tracing::info;

use agentic::config;
use agentic::dispatch::DispatchError;
use agentic::error::AppError;
use agentic::identity;
use agentic::logger;
use agentic::supervisor::Supervisor;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(e.kind().exit_code());
    }
}

async fn run() -> Result<(), AppError> {
    // .env is optional.
    let _ = dotenvy::dotenv();

    let args = parse_cli_args();

    let config = config::load(args.config_path.as_deref())?;

    let effective_log_level = args.log_level.unwrap_or(config.log_level.as_str());
    logger::init(effective_log_level, args.log_level.is_some(), config.log_file.as_deref())?;

    info!(
        name = %config.name,
        work_dir = %config.work_dir.display(),
        configured_log_level = %config.log_level,
        effective_log_level = %effective_log_level,
        "config loaded"
    );

    let identity = identity::setup(&config)?;
    info!(public_id = %identity.public_id, "identity ready; starting supervisor");

    let mut supervisor = Supervisor::init_with_identity(&config, identity).await?;
    let started = supervisor.spawn_builtin_agents().await?;
    info!(agents = ?started, "built-in agents running");

    // Ctrl-C cancels the token; every task shuts down from it.
    let shutdown = supervisor.shutdown_token();
    let ctrlc_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received; shutting down");
            ctrlc_token.cancel();
        }
    });

    let result = match args.command {
        Command::Serve => {
            println!(
                "✓ agentic running: dispatcher={} agents={}",
                config.dispatcher_id,
                started.join(",")
            );
            shutdown.cancelled().await;
            Ok(())
        }
        Command::Health => print_json(&supervisor.health_snapshot().await),
        Command::Agents => print_json(&supervisor.list_active_agents()),
        Command::Send { agent_id, task_type, payload, timeout_seconds } => {
            let payload = parse_payload(&payload)?;
            tokio::select! {
                _ = shutdown.cancelled() => Ok(()),
                outcome = supervisor.send_task(&agent_id, &task_type, payload, timeout_seconds) => {
                    match outcome.and_then(|o| o.into_result()) {
                        Ok(reply) => print_json(&reply),
                        Err(e) => Err(e.into()),
                    }
                }
            }
        }
    };

    supervisor.shutdown().await;
    result
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<(), AppError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|e| AppError::Agent(format!("failed to encode output: {e}")))?;
    println!("{text}");
    Ok(())
}

fn parse_payload(text: &str) -> Result<agentic::bus::Payload, AppError> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(DispatchError::Validation("payload must be a JSON object".into()).into()),
        Err(e) => Err(DispatchError::Validation(format!("payload is not valid JSON: {e}")).into()),
    }
}

// ── CLI ──────────────────────────────────────────────────────────────────────

enum Command {
    Serve,
    Health,
    Agents,
    Send {
        agent_id: String,
        task_type: String,
        payload: String,
        timeout_seconds: Option<f64>,
    },
}

struct CliArgs {
    log_level: Option<&'static str>,
    config_path: Option<String>,
    command: Command,
}

/// Number of `v`s in a `-vvv` style flag, saturating at `u8::MAX`.
fn verbose_count(flag: &str) -> u8 {
    u8::try_from(flag.len().saturating_sub(1)).unwrap_or(u8::MAX)
}

fn usage_error(message: &str) -> ! {
    eprintln!("error: {message}");
    std::process::exit(1);
}

fn parse_cli_args() -> CliArgs {
    let mut verbosity = 0u8;
    let mut config_path = None;
    let mut timeout_seconds = None;
    let mut positional: Vec<String> = Vec::new();

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            positional.extend(iter.by_ref());
            break;
        }

        match arg.as_str() {
            "-h" | "--help" => {
                println!("Usage: agentic [OPTIONS] [COMMAND]");
                println!();
                println!("Commands:");
                println!("  health                          Print health status as JSON");
                println!("  agents                          Print active agents as JSON");
                println!("  send <AGENT> <TASK> <JSON>      Dispatch a task and print the result");
                println!("  (none)                          Run until Ctrl-C");
                println!();
                println!("Options:");
                println!("  -h, --help                 Print help");
                println!("  -f, --config <PATH>        Path to configuration file (default: config/default.toml)");
                println!("  -t, --timeout <SECONDS>    Timeout for `send` (default: [dispatch] default_timeout_seconds)");
                println!("  -v, -vv, -vvv              Increase logging verbosity");
                std::process::exit(0);
            }
            "-f" | "--config" => match iter.next() {
                Some(path) => config_path = Some(path),
                None => usage_error("-f/--config requires a path argument"),
            },
            "-t" | "--timeout" => match iter.next().map(|s| s.parse::<f64>()) {
                Some(Ok(secs)) => timeout_seconds = Some(secs),
                _ => usage_error("-t/--timeout requires a number of seconds"),
            },
            "--verbose" => verbosity = verbosity.saturating_add(1),
            a if a.starts_with('-') && a.len() > 1 && a.chars().skip(1).all(|c| c == 'v') => {
                verbosity = verbosity.saturating_add(verbose_count(a));
            }
            a if a.starts_with('-') && a.len() > 1 => usage_error(&format!("unknown option '{a}'")),
            _ => positional.push(arg),
        }
    }

    let command = match positional.first().map(String::as_str) {
        None => Command::Serve,
        Some("health") => Command::Health,
        Some("agents") => Command::Agents,
        Some("send") => match &positional[1..] {
            [agent_id, task_type] => Command::Send {
                agent_id: agent_id.clone(),
                task_type: task_type.clone(),
                payload: "{}".into(),
                timeout_seconds,
            },
            [agent_id, task_type, payload] => Command::Send {
                agent_id: agent_id.clone(),
                task_type: task_type.clone(),
                payload: payload.clone(),
                timeout_seconds,
            },
            _ => usage_error("usage: agentic send <AGENT> <TASK> [JSON] [--timeout SECONDS]"),
        },
        Some(other) => usage_error(&format!("unknown command '{other}'")),
    };

    //   -v     → info
    //   -vv    → debug
    //   -vvv+  → trace
    let log_level = (verbosity > 0).then(|| logger::level_for_verbosity(verbosity));

    CliArgs { log_level, config_path, command }
}
