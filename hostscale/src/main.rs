//! hostscale - Entry Point
//!
//! Deploys and manages one replicated service on this host.
//! Usage: hostscale <start|status|stop|scale|logs|restart> [--key=value ...]

use std::collections::HashMap;
use std::env;
use std::fmt::Debug;
use std::path::PathBuf;
use std::str::FromStr;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use hostscale::app::engine::{Orchestrator, RestartReport, ScaleReport, StartReport, StartRequest};
use hostscale::app::options::{log_options, EngineOptions};
use hostscale::app::result::OperationResult;
use hostscale::errors::OrchestratorError;
use hostscale::logs::init_logging;
use hostscale::models::deployment::ModeRequest;
use hostscale::storage::layout::StorageLayout;
use hostscale::storage::settings::Settings;
use hostscale::utils::version_info;

const USAGE: &str = "usage: hostscale <start|status|stop|scale|logs|restart> [--key=value ...]
  start    --image=IMAGE [--replicas=1] [--mode=auto|direct|clustered|composed] [--port=8080] [--env-file=PATH]
  status
  stop     [--purge]
  scale    --replicas=N
  restart  [--replicas=N]
  logs     [--tail=100] [--follow]";

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    // Parse command line arguments
    let mut command: Option<String> = None;
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in env::args().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --follow
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        } else if command.is_none() {
            command = Some(arg);
        }
    }

    // Print version and exit
    if cli_args.contains_key("version") {
        return print_result(OperationResult::ok(version_info()));
    }

    let Some(command) = command else {
        eprintln!("{}", USAGE);
        return 2;
    };

    // Retrieve the settings file
    let layout = StorageLayout::default();
    let settings = match load_settings(&layout).await {
        Ok(settings) => settings,
        Err(e) => return print_result(OperationResult::<()>::err(&e)),
    };

    // Initialize logging; keep the guard alive until the command finishes
    let _log_guard = match init_logging(log_options(&settings, &layout)) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = EngineOptions::from_settings(&settings, layout);
    debug!("Running {} with options: {:?}", command, options);
    let engine = match Orchestrator::with_docker(options) {
        Ok(engine) => engine,
        Err(e) => return print_result(OperationResult::<()>::err(&e)),
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_signal(cancel.clone()));

    match command.as_str() {
        "start" => print_result(start(&engine, &cli_args, &cancel).await.into()),
        "status" => print_result(engine.status().await.into()),
        "stop" => {
            let purge = cli_args.contains_key("purge");
            print_result(engine.stop(purge).await.into())
        }
        "scale" => print_result(scale(&engine, &cli_args, &cancel).await.into()),
        "restart" => print_result(restart(&engine, &cli_args, &cancel).await.into()),
        "logs" => {
            let tail = match arg::<usize>(&cli_args, "tail") {
                Ok(tail) => tail.unwrap_or(100),
                Err(e) => return print_result(OperationResult::<()>::err(&e)),
            };
            let follow = cli_args.contains_key("follow");
            stream_logs(&engine, tail, follow, &cancel).await
        }
        other => {
            eprintln!("Unknown command: {}\n{}", other, USAGE);
            2
        }
    }
}

async fn start(
    engine: &Orchestrator,
    args: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<StartReport, OrchestratorError> {
    let request = StartRequest {
        replicas: arg(args, "replicas")?.unwrap_or(1),
        mode: arg::<ModeRequest>(args, "mode")?.unwrap_or_default(),
        port: arg(args, "port")?.unwrap_or(8080),
        image: required(args, "image")?,
        env_file: arg::<PathBuf>(args, "env-file")?,
    };
    engine.start(request, cancel).await
}

async fn scale(
    engine: &Orchestrator,
    args: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<ScaleReport, OrchestratorError> {
    let replicas: u32 = required(args, "replicas")?;
    engine.scale(replicas, cancel).await
}

async fn restart(
    engine: &Orchestrator,
    args: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<RestartReport, OrchestratorError> {
    let replicas = arg::<u32>(args, "replicas")?;
    engine.restart(replicas, cancel).await
}

async fn load_settings(layout: &StorageLayout) -> Result<Settings, OrchestratorError> {
    layout.setup().await?;
    let settings = Settings::load(&layout.settings_file()).await?;
    settings.validate()?;
    Ok(settings)
}

async fn stream_logs(
    engine: &Orchestrator,
    tail: usize,
    follow: bool,
    cancel: &CancellationToken,
) -> i32 {
    let mut lines = match engine.logs(tail, follow, cancel).await {
        Ok(lines) => lines,
        Err(e) => return print_result(OperationResult::<()>::err(&e)),
    };

    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => println!("{}", line),
            Err(e) => {
                error!("Log stream failed: {}", e);
                return 1;
            }
        }
    }
    0
}

fn print_result<T: Serialize>(result: OperationResult<T>) -> i32 {
    println!("{}", result.to_json());
    result.exit_code()
}

/// Parse an optional `--key=value` argument
fn arg<T>(args: &HashMap<String, String>, key: &str) -> Result<Option<T>, OrchestratorError>
where
    T: FromStr,
    T::Err: Debug,
{
    args.get(key)
        .map(|raw| {
            raw.parse::<T>().map_err(|e| {
                OrchestratorError::ConfigError(format!("Invalid --{}={}: {:?}", key, raw, e))
            })
        })
        .transpose()
}

fn required<T>(args: &HashMap<String, String>, key: &str) -> Result<T, OrchestratorError>
where
    T: FromStr,
    T::Err: Debug,
{
    arg(args, key)?.ok_or_else(|| OrchestratorError::ConfigError(format!("--{} is required", key)))
}

async fn cancel_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
            error!("Failed to listen for SIGTERM");
            return;
        };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, cancelling...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, cancelling...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            error!("Failed to listen for Ctrl+C");
            return;
        }
        info!("Ctrl+C received, cancelling...");
    }

    cancel.cancel();
}
