use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing_subscriber::EnvFilter;

use beacon_link::client::{GatewayClient, GatewayClientHandler, GatewayClientOptions, RequestOptions};
use beacon_link::nodes::{NodeInvokeRequestEvent, NodeInvokeResultParams};
use beacon_link::protocol::{ErrorCode, ErrorShape, EventFrame, HelloOk, NODE_ROLE, events};
use beacon_link::{Config, DeviceAuthStore, DeviceIdentity, GatewayServer};

/// Beacon - gateway protocol core
#[derive(Parser)]
#[command(name = "beacon", version, about)]
struct Cli {
    /// Config file (defaults to ~/.config/omni/beacon/gateway.toml)
    #[arg(short, long, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the gateway server
    Serve {
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
    },
    /// Connect to a gateway as a node and answer invocations
    Node {
        /// Gateway URL (ws:// or wss://)
        #[arg(long)]
        url: Option<String>,
        /// Display name announced to the gateway
        #[arg(long)]
        name: Option<String>,
    },
    /// Print this device's identity
    Identity,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,beacon_link=info",
        1 => "info,beacon_link=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { port } => serve(config, port).await,
        Command::Node { url, name } => node(config, url, name).await,
        Command::Identity => identity(&config),
    }
}

async fn serve(mut config: Config, port: Option<u16>) -> anyhow::Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    if config.server.token.is_none() && config.server.password.is_none() {
        tracing::warn!("no gateway token or password configured, accepting any peer");
    }

    let server = GatewayServer::bind(config.server).await?;
    let state = server.state();
    let handle = server.spawn();

    tokio::signal::ctrl_c().await?;
    state.shutdown("interrupted");
    handle.await??;
    Ok(())
}

/// Answers `node.invoke.request` events
struct NodeHandler {
    identity: Arc<DeviceIdentity>,
    display_name: Option<String>,
}

impl NodeHandler {
    fn run_command(&self, request: &NodeInvokeRequestEvent) -> Result<serde_json::Value, ErrorShape> {
        match request.command.as_str() {
            "device.info" => Ok(json!({
                "deviceId": self.identity.device_id,
                "displayName": self.display_name,
                "hostname": hostname::get().ok().and_then(|h| h.into_string().ok()),
                "platform": std::env::consts::OS,
                "arch": std::env::consts::ARCH,
                "version": env!("CARGO_PKG_VERSION"),
            })),
            "device.status" => Ok(json!({ "ok": true, "ts": chrono::Utc::now().timestamp_millis() })),
            other => Err(ErrorShape::new(
                ErrorCode::InvalidRequest,
                format!("unsupported command: {other}"),
            )),
        }
    }
}

impl GatewayClientHandler for NodeHandler {
    fn on_event(&self, client: &GatewayClient, event: &EventFrame) {
        if event.event != events::NODE_INVOKE_REQUEST {
            return;
        }
        let Some(request) = event
            .payload
            .clone()
            .and_then(|p| serde_json::from_value::<NodeInvokeRequestEvent>(p).ok())
        else {
            tracing::warn!("malformed node invoke request");
            return;
        };

        tracing::info!(command = %request.command, invoke_id = %request.id, "handling invoke");
        let (ok, payload, error) = match self.run_command(&request) {
            Ok(payload) => (true, Some(payload), None),
            Err(error) => (false, None, Some(error)),
        };
        let result = NodeInvokeResultParams {
            id: request.id,
            node_id: request.node_id,
            ok,
            payload,
            payload_json: None,
            error,
        };

        let client = client.clone();
        tokio::spawn(async move {
            let params = match serde_json::to_value(&result) {
                Ok(params) => params,
                Err(e) => {
                    tracing::error!(error = %e, "failed to encode invoke result");
                    return;
                }
            };
            if let Err(e) = client
                .request("node.invoke.result", Some(params), RequestOptions::default())
                .await
            {
                tracing::warn!(error = %e, "failed to send invoke result");
            }
        });
    }

    fn on_hello_ok(&self, _client: &GatewayClient, hello: &HelloOk) {
        tracing::info!(host = %hello.server.host, conn_id = %hello.server.conn_id, "node online");
    }

    fn on_close(&self, code: u16, reason: &str) {
        tracing::info!(code, reason = %reason, "node offline");
    }
}

async fn node(config: Config, url: Option<String>, name: Option<String>) -> anyhow::Result<()> {
    let identity = Arc::new(DeviceIdentity::load_or_create(&config.identity_path())?);
    let device_auth = DeviceAuthStore::new(config.device_auth_path());

    let client_config = config.client;
    let mut options = GatewayClientOptions::new(url.unwrap_or(client_config.url));
    options.token = client_config.token;
    options.password = client_config.password;
    options.tls_fingerprint = client_config.tls_fingerprint;
    options.role = NODE_ROLE.to_string();
    options.client.id = "beacon-node".to_string();
    options.client.mode = "node".to_string();
    options.client.display_name.clone_from(&name);
    options.commands = vec!["device.info".to_string(), "device.status".to_string()];
    options.caps = vec!["device".to_string()];
    options.identity = Some(identity.clone());
    options.device_auth = Some(device_auth);

    let client = GatewayClient::new(
        options,
        NodeHandler {
            identity,
            display_name: name,
        },
    );
    client.start();

    tokio::signal::ctrl_c().await?;
    client.stop().await;
    Ok(())
}

fn identity(config: &Config) -> anyhow::Result<()> {
    let path = config.identity_path();
    let identity = DeviceIdentity::load_or_create(&path)?;
    println!("Device ID:  {}", identity.device_id);
    println!("Public key: {}", identity.raw_public_key()?);
    println!("Stored at:  {}", path.display());
    Ok(())
}
