#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # qbee-connect
//!
//! Remote access to fleet devices through their edge gateways.
//!
//! ## Subcommands
//!
//! - `qbee-connect connect` — forward local TCP/UDP ports (or stdio) to one
//!   or many devices, reconnecting with backoff
//! - `qbee-connect term` — interactive terminal on a device (also
//!   `connect --shell`)
//! - `qbee-connect broker` — HTTP reverse proxy that opens device tunnels on
//!   demand
//!
//! ## Broker request routing
//!
//! | Header                 | Fallback                     | Meaning             |
//! |------------------------|------------------------------|---------------------|
//! | `X-Qbee-Device-Id`     | first label of `Host`        | device to reach     |
//! | `X-Qbee-Device-Port`   | `[broker] remote_port`       | port on the device  |
//! | `X-Qbee-Authorization` | `session_token` cookie       | broker token        |
//!
//! ## Architecture
//!
//! ```text
//! main.rs          — entry point, clap subcommands, logging, signals
//! config.rs        — TOML + env-var configuration, connect file
//! target.rs        — target grammar, device connection requests
//! api/             — management API client
//! resolver.rs      — device status → edge route
//! transport/
//!   mod.rs         — Session/Connector traits, control message codec
//!   ws.rs          — WebSocket stream multiplexer
//! bridge/          — TCP listeners, UDP flows, stdio
//! terminal/        — PTY session, raw mode, SIGWINCH resizes
//! supervisor.rs    — per-device retry loop, fail-fast / tolerant batches
//! connect.rs       — resolve + open session + serve
//! broker/          — tunnel cache, auth middleware, reverse proxy
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use qbee_connect::api::{ApiClient, ApiError};
use qbee_connect::config::{load_connections, Config};
use qbee_connect::error::{BrokerError, ConfigError, TunnelError};
use qbee_connect::resolver::Resolver;
use qbee_connect::supervisor::connect_all;
use qbee_connect::transport::WsConnector;
use qbee_connect::{broker, DeviceConnection, Tunneler};

/// Remote access tunnels to fleet devices.
#[derive(Parser)]
#[command(name = "qbee-connect", version)]
struct Cli {
    /// Path to TOML settings file.
    #[arg(long, global = true)]
    settings: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to one or more devices and forward local ports.
    Connect {
        /// Device ID (as public key digest).
        #[arg(short, long)]
        device: Option<String>,
        /// Comma-separated targets `[<localHost>:]<localPort>:<remoteHost>:<remotePort>[/udp]`.
        #[arg(short, long)]
        target: Option<String>,
        /// JSON file listing `{"device_id", "targets"}` connections.
        #[arg(short, long, conflicts_with_all = ["device", "target"])]
        config: Option<String>,
        /// Keep the remaining devices running when one fails.
        #[arg(long)]
        allow_failures: bool,
        /// Connect attempts per device before giving up (default 1, 0 = forever).
        #[arg(long)]
        retries: Option<u32>,
        /// Open an interactive terminal on the device instead of forwarding ports.
        #[arg(short, long, conflicts_with_all = ["target", "config"])]
        shell: bool,
        /// With `--shell`: command to execute as a JSON string array.
        #[arg(long, requires = "shell")]
        command: Option<String>,
    },
    /// Open an interactive terminal on a device.
    Term {
        /// Device ID (as public key digest).
        #[arg(short, long)]
        device: String,
        /// Command to execute as a JSON string array, e.g. `["top", "-b"]`.
        #[arg(short, long)]
        command: Option<String>,
    },
    /// Run the on-demand HTTP broker.
    Broker {
        /// Username for the management API.
        #[arg(short, long)]
        username: Option<String>,
        /// Password for the management API.
        #[arg(short, long)]
        password: Option<String>,
        /// Management API base URL.
        #[arg(short, long)]
        base_url: Option<String>,
        /// Token clients must present in `X-Qbee-Authorization`.
        #[arg(long)]
        auth_token: Option<String>,
        /// Port to listen on.
        #[arg(long)]
        listen_port: Option<u16>,
        /// Host on the device side to forward to.
        #[arg(long)]
        remote_host: Option<String>,
        /// Default device port.
        #[arg(long)]
        remote_port: Option<u16>,
        /// Protocol spoken to the device.
        #[arg(long)]
        remote_protocol: Option<String>,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("{0}")]
    Usage(String),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let mut config = Config::load(cli.settings.as_deref())?;

    // Terminal output is raw; keep the log quiet unless asked
    let default_level = match cli.command {
        Commands::Term { .. } | Commands::Connect { shell: true, .. } => "warn".to_string(),
        _ => config.logging.level.clone(),
    };
    let log_filter = std::env::var("RUST_LOG").unwrap_or(default_level);
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Connect {
            device,
            shell: true,
            command,
            ..
        } => {
            let device = device.ok_or_else(|| CliError::Usage("missing device ID".into()))?;
            let command = parse_command(command.as_deref())?;
            run_term(&config, &device, &command).await
        }
        Commands::Connect {
            device,
            target,
            config: connect_file,
            allow_failures,
            retries,
            ..
        } => {
            let connections = connection_requests(device, target, connect_file.as_deref())?;
            if let Some(retries) = retries {
                config.connect.retries = retries;
            }
            run_connect(&config, &connections, allow_failures).await
        }
        Commands::Term { device, command } => {
            let command = parse_command(command.as_deref())?;
            run_term(&config, &device, &command).await
        }
        Commands::Broker {
            username,
            password,
            base_url,
            auth_token,
            listen_port,
            remote_host,
            remote_port,
            remote_protocol,
        } => {
            if username.is_some() {
                config.api.email = username;
            }
            if password.is_some() {
                config.api.password = password;
            }
            if let Some(url) = base_url {
                config.api.base_url = url;
            }
            if auth_token.is_some() {
                config.broker.auth_token = auth_token;
            }
            if let Some(port) = listen_port {
                config.broker.listen_port = port;
            }
            if let Some(host) = remote_host {
                config.broker.remote_host = host;
            }
            if let Some(port) = remote_port {
                config.broker.remote_port = port;
            }
            if let Some(protocol) = remote_protocol {
                config.broker.remote_protocol = protocol;
            }
            config.validate()?;

            info!("qbee-connect v{} broker starting", env!("CARGO_PKG_VERSION"));
            let shutdown = CancellationToken::new();
            spawn_shutdown_listener(shutdown.clone(), true);
            broker::serve(&config, shutdown).await?;
            info!("Goodbye");
            Ok(())
        }
    }
}

/// Connections from either the JSON connect file or `--device`/`--target`.
fn connection_requests(
    device: Option<String>,
    target: Option<String>,
    connect_file: Option<&str>,
) -> Result<Vec<DeviceConnection>, CliError> {
    if let Some(path) = connect_file {
        let connections = load_connections(path)?;
        if connections.is_empty() {
            return Err(CliError::Usage(format!("no connections defined in {path}")));
        }
        return Ok(connections);
    }

    let device_id = device.ok_or_else(|| CliError::Usage("missing device ID".into()))?;
    let targets = target.ok_or_else(|| CliError::Usage("missing target".into()))?;
    Ok(vec![DeviceConnection {
        device_id,
        targets: targets.split(',').map(str::to_string).collect(),
    }])
}

/// Remote command given as a JSON string array, e.g. `["top", "-b"]`.
fn parse_command(raw: Option<&str>) -> Result<Vec<String>, CliError> {
    match raw {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| CliError::Usage(format!("invalid command {raw:?}: {e}"))),
        None => Ok(Vec::new()),
    }
}

async fn tunneler(config: &Config) -> Result<Tunneler, CliError> {
    let client = ApiClient::login_with(&config.api.base_url, &config.api.credentials()).await?;
    Ok(Tunneler::new(
        Resolver::new(Arc::new(client)),
        Arc::new(WsConnector::new(config.connect.connect_timeout())),
    ))
}

async fn run_connect(config: &Config, connections: &[DeviceConnection], allow_failures: bool) -> Result<(), CliError> {
    let tunneler = tunneler(config).await?;
    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone(), true);

    let failures = connect_all(
        Arc::new(tunneler),
        connections,
        allow_failures,
        config.connect.retry_policy(),
        cancel,
    )
    .await?;

    if failures.is_empty() {
        Ok(())
    } else {
        Err(CliError::Usage(format!(
            "{} of {} device connections failed",
            failures.len(),
            connections.len()
        )))
    }
}

async fn run_term(config: &Config, device: &str, command: &[String]) -> Result<(), CliError> {
    let tunneler = tunneler(config).await?;
    let cancel = CancellationToken::new();
    // Ctrl-C belongs to the remote shell while in raw mode
    spawn_shutdown_listener(cancel.clone(), false);
    tunneler.terminal(device, command, cancel).await?;
    Ok(())
}

fn spawn_shutdown_listener(cancel: CancellationToken, with_ctrl_c: bool) {
    tokio::spawn(async move {
        shutdown_signal(with_ctrl_c).await;
        cancel.cancel();
    });
}

async fn shutdown_signal(with_ctrl_c: bool) {
    let ctrl_c = async {
        if with_ctrl_c && tokio::signal::ctrl_c().await.is_ok() {
            info!("Received SIGINT");
            return;
        }
        std::future::pending::<()>().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM");
            }
            Err(e) => {
                warn!("error registering SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_connect() {
        let cli = Cli::try_parse_from([
            "qbee-connect",
            "--settings",
            "s.toml",
            "connect",
            "-d",
            "abc",
            "-t",
            "8080:localhost:80,5353:localhost:53/udp",
            "--allow-failures",
            "--retries",
            "3",
        ])
        .unwrap();
        assert_eq!(cli.settings.as_deref(), Some("s.toml"));
        let Commands::Connect {
            device,
            target,
            allow_failures,
            retries,
            ..
        } = cli.command
        else {
            panic!("expected connect");
        };
        assert!(allow_failures);
        assert_eq!(retries, Some(3));

        let conns = connection_requests(device, target, None).unwrap();
        assert_eq!(conns.len(), 1);
        assert_eq!(conns[0].device_id, "abc");
        assert_eq!(conns[0].targets, vec!["8080:localhost:80", "5353:localhost:53/udp"]);
    }

    #[test]
    fn connect_file_excludes_device_flags() {
        assert!(Cli::try_parse_from(["qbee-connect", "connect", "-c", "f.json", "-d", "abc"]).is_err());
    }

    #[test]
    fn missing_target_is_usage_error() {
        let err = connection_requests(Some("abc".into()), None, None).unwrap_err();
        assert_eq!(err.to_string(), "missing target");
        let err = connection_requests(None, Some("22:localhost:22".into()), None).unwrap_err();
        assert_eq!(err.to_string(), "missing device ID");
    }

    #[test]
    fn connect_shell_takes_json_command() {
        let cli = Cli::try_parse_from([
            "qbee-connect",
            "connect",
            "-d",
            "abc",
            "--shell",
            "--command",
            r#"["top", "-b"]"#,
        ])
        .unwrap();
        let Commands::Connect {
            device,
            shell,
            command,
            ..
        } = cli.command
        else {
            panic!("expected connect");
        };
        assert!(shell);
        assert_eq!(device.as_deref(), Some("abc"));
        assert_eq!(parse_command(command.as_deref()).unwrap(), vec!["top", "-b"]);
    }

    #[test]
    fn connect_shell_excludes_targets() {
        assert!(Cli::try_parse_from(["qbee-connect", "connect", "-d", "abc", "-s", "-t", "22:localhost:22"]).is_err());
        assert!(Cli::try_parse_from(["qbee-connect", "connect", "-s", "-c", "f.json"]).is_err());
        // --command only makes sense with a shell
        assert!(Cli::try_parse_from(["qbee-connect", "connect", "-d", "abc", "--command", "[]"]).is_err());
    }

    #[test]
    fn malformed_command_is_usage_error() {
        assert!(parse_command(None).unwrap().is_empty());
        let err = parse_command(Some("top -b")).unwrap_err();
        assert!(matches!(err, CliError::Usage(_)));
    }

    #[test]
    fn cli_parses_broker_overrides() {
        let cli = Cli::try_parse_from([
            "qbee-connect",
            "broker",
            "--listen-port",
            "9000",
            "--remote-port",
            "8080",
            "--auth-token",
            "s3cret",
        ])
        .unwrap();
        let Commands::Broker {
            listen_port,
            remote_port,
            auth_token,
            ..
        } = cli.command
        else {
            panic!("expected broker");
        };
        assert_eq!(listen_port, Some(9000));
        assert_eq!(remote_port, Some(8080));
        assert_eq!(auth_token.as_deref(), Some("s3cret"));
    }
}
