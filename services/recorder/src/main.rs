// recorder: Experiment-telemetry recording server.
//
// Loads the TOML config, binds the configured endpoint and records client
// experiment streams until a shutdown signal arrives, then exports the run's
// artifacts.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Arg, ArgAction, Command};
use tracing::{error, info};

fn verbosity_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("Experiment Recorder")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A telemetry recording server for experiment clients")
        .arg(
            Arg::new("config")
                .help("Path to the TOML configuration file")
                .value_name("config_file")
                .index(1)
                .required_unless_present("config_flag"),
        )
        .arg(
            Arg::new("config_flag")
                .help("Path to the TOML configuration file (alternative to the positional form)")
                .long("config")
                .value_name("config_file")
                .conflicts_with("config"),
        )
        .arg(
            Arg::new("verbose")
                .help("Raise the STDERR logging verbosity (repeatable)")
                .short('v')
                .long("verbose")
                .action(ArgAction::Count),
        )
        .get_matches();

    let verbose = matches.get_count("verbose");
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(verbosity_filter(verbose))),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "recorder starting");

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config_flag")
            .or_else(|| matches.get_one::<String>("config"))
            .expect("config is a required argument"),
    );
    let cfg = match recorder::config::load_config_from_path(&config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "failed to load config");
            return ExitCode::from(1);
        }
    };

    // Config has already validated; a bind/store failure here is a runtime
    // error, not a configuration one.
    let server = match recorder::server::RecorderServer::bind(cfg).await {
        Ok(server) => server,
        Err(err) => {
            error!(error = %err, "failed to start server");
            return ExitCode::from(2);
        }
    };

    // Wire SIGINT/SIGTERM to the clean-shutdown path.
    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        shutdown.trigger();
    });

    match server.run().await {
        Ok(()) => {
            info!("recorder exited cleanly");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "fatal error during run");
            ExitCode::from(2)
        }
    }
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful
/// shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        _ = terminate => {},
    }
}
