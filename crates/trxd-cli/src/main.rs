//! # trxd CLI Entry Point
//!
//! Runs the request server or sends a single framed request to one.
//!
//! ## Usage
//!
//! ```bash
//! # Serve with defaults (port 53501, echo processor)
//! trxd serve
//!
//! # Serve with a JSON configuration for 60 seconds
//! trxd serve --config trxd.json --duration 60
//!
//! # Send one request and print the response body
//! trxd call 127.0.0.1:53501 '<FareDisplayRequest/>'
//!
//! # Talk to a legacy-framed listener
//! trxd call 127.0.0.1:53501 '<x/>' --legacy --version 01
//! ```
//!
//! ## Configuration file
//!
//! Groups of scalar keys, as read by `ServerConfig::from_provider`:
//!
//! ```json
//! {
//!   "SERVER_SOCKET_ADP": { "PORT": 53501, "NUM_LISTENERS": 2 },
//!   "TSE_SERVER": { "TRX_THRESHOLD": 40 },
//!   "THREAD_POOL": { "TRANSACTION_SIZE": 16, "TRANSACTION_BOOST": 4 },
//!   "BOOSTER_POOL": { "SIZE": 8 }
//! }
//! ```

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use argh::FromArgs;
use trxd_common::config::MapConfig;
use trxd_common::transport::{Codec, TcpTransport};
use trxd_common::{Command, Message};
use trxd_server::{EchoProcessor, Server, ServerConfig};

#[derive(FromArgs)]
/// trxd - transaction server for framed requests
struct Cli {
    #[argh(subcommand)]
    command: Commands,
}

/// Available subcommands.
///
/// - **Serve**: run the server until a shutdown threshold or the optional
///   duration is reached
/// - **Call**: send one request and print the response body
#[derive(FromArgs)]
#[argh(subcommand)]
enum Commands {
    Serve(ServeArgs),
    Call(CallArgs),
}

#[derive(FromArgs)]
#[argh(subcommand, name = "serve")]
/// run the request server
struct ServeArgs {
    /// path to a JSON configuration file
    #[argh(option, short = 'c')]
    config: Option<String>,

    /// port of the first listener, overriding the configuration
    ///
    /// Use 0 to bind every listener to an ephemeral port.
    #[argh(option, short = 'p')]
    port: Option<u16>,

    /// number of listeners, overriding the configuration
    #[argh(option, short = 'n')]
    listeners: Option<usize>,

    /// stop after this many seconds
    ///
    /// Without it the server runs until a shutdown threshold is reached.
    #[argh(option, short = 'd')]
    duration: Option<u64>,
}

#[derive(FromArgs)]
#[argh(subcommand, name = "call")]
/// send one request to a server
struct CallArgs {
    /// server address, e.g. 127.0.0.1:53501
    #[argh(positional)]
    server_address: String,

    /// request payload
    #[argh(positional)]
    payload: String,

    /// four-letter command code
    #[argh(option, default = "\"RQST\".into()")]
    command: String,

    /// schema version
    #[argh(option, short = 'v', default = "\"0010\".into()")]
    version: String,

    /// schema revision
    #[argh(option, short = 'r', default = "String::new()")]
    revision: String,

    /// use the legacy 12-byte frame header
    #[argh(switch)]
    legacy: bool,

    /// connect and read timeout in milliseconds
    #[argh(option, default = "5000")]
    timeout_ms: u64,
}

fn main() -> Result<()> {
    let cli: Cli = argh::from_env();

    // Keep `call` output clean for piping.
    if !matches!(cli.command, Commands::Call(_)) {
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    match cli.command {
        Commands::Serve(args) => run_serve(args),
        Commands::Call(args) => {
            let response = run_call(&args)?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(response.body())?;
            stdout.write_all(b"\n")?;
            if response.command == Command::ERROR {
                anyhow::bail!("server answered with an error");
            }
            Ok(())
        }
    }
}

/// Builds the server configuration from the optional file and overrides.
fn load_config(args: &ServeArgs) -> Result<ServerConfig> {
    let provider = match &args.config {
        Some(path) => MapConfig::from_path(path).with_context(|| format!("loading {}", path))?,
        None => MapConfig::new(),
    };
    let mut config = ServerConfig::from_provider(&provider)?;
    if let Some(port) = args.port {
        config.acceptor.base_port = port;
    }
    if let Some(listeners) = args.listeners {
        config.acceptor.num_listeners = listeners;
    }
    config.validate().map_err(|e| anyhow::anyhow!(e))?;
    Ok(config)
}

fn run_serve(args: ServeArgs) -> Result<()> {
    let config = load_config(&args)?;
    let server = Server::builder(config)
        .processor(std::sync::Arc::new(EchoProcessor))
        .start()
        .context("starting server")?;
    tracing::info!(ports = ?server.local_ports(), "serving");

    match args.duration {
        Some(secs) => {
            if server.shutdown_signal().wait_timeout(Duration::from_secs(secs)) {
                tracing::info!("shutdown threshold reached");
            }
        }
        None => server.wait(),
    }

    let snapshot = server.shutdown();
    println!("{}", snapshot.to_json()?);
    Ok(())
}

/// Sends the request described by `args` and returns the response.
fn run_call(args: &CallArgs) -> Result<Message> {
    let command: Command = args.command.parse()?;
    let codec = if args.legacy {
        Codec::legacy()
    } else {
        Codec::standard()
    };
    let transport = TcpTransport::new(codec).with_timeout(Duration::from_millis(args.timeout_ms));
    let mut socket = transport
        .connect(&args.server_address)
        .with_context(|| format!("connecting to {}", args.server_address))?;

    let request = Message::new(command, &args.version, args.payload.as_bytes().to_vec())
        .with_revision(&args.revision);
    Ok(transport.send_request(&mut socket, &request)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_cli_parse_serve_defaults() {
        let args: Cli = Cli::from_args(&["trxd"], &["serve"]).unwrap();
        match args.command {
            Commands::Serve(ServeArgs { config, port, listeners, duration }) => {
                assert!(config.is_none());
                assert!(port.is_none());
                assert!(listeners.is_none());
                assert!(duration.is_none());
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_serve_overrides() {
        let args: Cli = Cli::from_args(
            &["trxd"],
            &["serve", "-c", "trxd.json", "--port", "0", "-n", "3", "--duration", "5"],
        )
        .unwrap();
        match args.command {
            Commands::Serve(args) => {
                assert_eq!(args.config.as_deref(), Some("trxd.json"));
                assert_eq!(args.port, Some(0));
                assert_eq!(args.listeners, Some(3));
                assert_eq!(args.duration, Some(5));
            }
            _ => panic!("Expected Serve command"),
        }
    }

    #[test]
    fn test_cli_parse_call() {
        let args: Cli =
            Cli::from_args(&["trxd"], &["call", "127.0.0.1:53501", "<x/>", "--legacy", "-v", "01"])
                .unwrap();
        match args.command {
            Commands::Call(args) => {
                assert_eq!(args.server_address, "127.0.0.1:53501");
                assert_eq!(args.payload, "<x/>");
                assert_eq!(args.command, "RQST");
                assert_eq!(args.version, "01");
                assert!(args.revision.is_empty());
                assert!(args.legacy);
                assert_eq!(args.timeout_ms, 5000);
            }
            _ => panic!("Expected Call command"),
        }
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            r#"{"SERVER_SOCKET_ADP": {"PORT": 6000, "NUM_LISTENERS": 2}}"#,
        )
        .unwrap();
        let args = ServeArgs {
            config: Some(file.path().to_string_lossy().to_string()),
            port: Some(7000),
            listeners: None,
            duration: None,
        };
        let config = load_config(&args).unwrap();
        assert_eq!(config.acceptor.base_port, 7000);
        assert_eq!(config.acceptor.num_listeners, 2);
    }

    #[test]
    fn test_load_config_missing_file() {
        let args = ServeArgs {
            config: Some("/nonexistent/trxd.json".to_string()),
            port: None,
            listeners: None,
            duration: None,
        };
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_call_against_running_server() {
        let mut config = ServerConfig::default();
        config.acceptor = config
            .acceptor
            .with_base_port(0)
            .with_host(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let server = Server::builder(config).start().unwrap();
        let port = server.local_ports()[0];

        let args: Cli = Cli::from_args(
            &["trxd"],
            &["call", &format!("127.0.0.1:{}", port), "<Ping/>"],
        )
        .unwrap();
        let Commands::Call(call) = args.command else {
            panic!("Expected Call command");
        };
        let response = run_call(&call).unwrap();
        assert_eq!(response.command, Command::RESPONSE);
        assert_eq!(response.body(), b"<Ping/>");
        server.shutdown();
    }
}
