// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use pdb_snapshot::{SnapshotConfig, SnapshotOrchestrator, TriggerState};

const LOG_LEVEL_ENV: &str = "SNAPSHOT_LOG_LEVEL";

enum Command {
    Run { force: bool },
    Serve,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, String> {
    let mut force = false;
    let mut serve = false;
    for arg in args {
        match arg.as_str() {
            "--force" | "-f" => force = true,
            "serve" => serve = true,
            other => return Err(format!("unknown argument {other:?}")),
        }
    }
    Ok(if serve {
        Command::Serve
    } else {
        Command::Run { force }
    })
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let log_level = env::var(LOG_LEVEL_ENV)
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());
    let env_filter = format!("h2=off,hyper=off,rustls=off,sled=off,{log_level}");

    let filter = match EnvFilter::try_new(env_filter) {
        Ok(filter) => filter,
        Err(err) => {
            eprintln!("could not parse {LOG_LEVEL_ENV}: {err}");
            return ExitCode::FAILURE;
        }
    };
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .finish();
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {err}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let command = match parse_args(env::args().skip(1)) {
        Ok(command) => command,
        Err(err) => {
            error!("{err}; usage: pdb-snapshot-job [--force|-f] | pdb-snapshot-job serve");
            return ExitCode::FAILURE;
        }
    };

    let config = match SnapshotConfig::from_os_env() {
        Ok(config) => config,
        Err(err) => {
            error!("Invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };
    let listen_addr = config.listen_addr;
    let cron_secret = config.cron_secret.clone();

    let orchestrator = match SnapshotOrchestrator::from_config(config) {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!("Unable to start snapshot harvest: {err}");
            return ExitCode::FAILURE;
        }
    };

    match command {
        Command::Run { force } => run_once(&orchestrator, force).await,
        Command::Serve => {
            let state = TriggerState::new(Arc::new(orchestrator), cron_secret);
            let shutdown = async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!("Unable to listen for shutdown signal: {err}");
                }
                info!("Shutting down trigger server");
            };
            match pdb_snapshot::serve(state, listen_addr, shutdown).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(err) => {
                    error!("Trigger server failed: {err}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

async fn run_once(orchestrator: &SnapshotOrchestrator, force: bool) -> ExitCode {
    let outcome = match orchestrator.run(force, chrono::Utc::now()).await {
        Ok(outcome) => outcome,
        Err(err) => {
            error!("Snapshot run failed: {err}");
            return ExitCode::FAILURE;
        }
    };
    match serde_json::to_string_pretty(&outcome) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Unable to render snapshot result: {err}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_args() {
        assert!(matches!(parse_args(args(&[])), Ok(Command::Run { force: false })));
        assert!(matches!(parse_args(args(&["-f"])), Ok(Command::Run { force: true })));
        assert!(matches!(
            parse_args(args(&["--force"])),
            Ok(Command::Run { force: true })
        ));
        assert!(matches!(parse_args(args(&["serve"])), Ok(Command::Serve)));
        assert!(parse_args(args(&["--verbose"])).is_err());
    }
}
