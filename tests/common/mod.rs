//! Shared test utilities

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use beacon_link::client::{ClientState, GatewayClient, GatewayClientHandler, GatewayClientOptions};
use beacon_link::config::ServerConfig;
use beacon_link::protocol::{EventFrame, HelloOk};
use beacon_link::{Error, GatewayServer, GatewayState};
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Gateway server running on an ephemeral loopback port
pub struct TestGateway {
    pub url: String,
    pub state: Arc<GatewayState>,
    pub task: tokio::task::JoinHandle<beacon_link::Result<()>>,
}

impl TestGateway {
    pub fn shutdown(&self) {
        self.state.shutdown("test finished");
    }
}

/// Server config bound to `127.0.0.1:0`
#[must_use]
pub fn server_config() -> ServerConfig {
    ServerConfig {
        port: 0,
        ..ServerConfig::default()
    }
}

/// Start a gateway in the background
pub async fn start_gateway(config: ServerConfig) -> TestGateway {
    let server = GatewayServer::bind(config).await.expect("failed to bind gateway");
    let addr = server.local_addr().expect("no local addr");
    let state = server.state();
    let task = server.spawn();
    TestGateway {
        url: format!("ws://{addr}"),
        state,
        task,
    }
}

/// Client options with fast reconnects, for the given role and scopes
#[must_use]
pub fn client_options(url: &str, role: &str, scopes: &[&str]) -> GatewayClientOptions {
    let mut options = GatewayClientOptions::new(url);
    options.role = role.to_string();
    options.scopes = scopes.iter().map(|s| (*s).to_string()).collect();
    options.connect_delay = Duration::from_millis(200);
    options.backoff = beacon_link::client::Backoff::new(Duration::from_millis(50), Duration::from_millis(200));
    options
}

/// Everything a client handler observed
#[derive(Default)]
pub struct Recorded {
    pub events: Mutex<Vec<EventFrame>>,
    pub hellos: Mutex<Vec<HelloOk>>,
    pub connect_errors: Mutex<Vec<String>>,
    pub closes: Mutex<Vec<(u16, String)>>,
    pub gaps: Mutex<Vec<(u64, u64)>>,
}

impl Recorded {
    #[must_use]
    pub fn event_names(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.event.clone()).collect()
    }
}

/// Handler that records callbacks and forwards events to a channel
pub struct RecordingHandler {
    pub recorded: Arc<Recorded>,
    tx: mpsc::UnboundedSender<EventFrame>,
}

impl RecordingHandler {
    #[must_use]
    pub fn new() -> (Self, Arc<Recorded>, mpsc::UnboundedReceiver<EventFrame>) {
        let recorded = Arc::new(Recorded::default());
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                recorded: recorded.clone(),
                tx,
            },
            recorded,
            rx,
        )
    }
}

impl GatewayClientHandler for RecordingHandler {
    fn on_event(&self, _client: &GatewayClient, event: &EventFrame) {
        self.recorded.events.lock().push(event.clone());
        let _ = self.tx.send(event.clone());
    }

    fn on_hello_ok(&self, _client: &GatewayClient, hello: &HelloOk) {
        self.recorded.hellos.lock().push(hello.clone());
    }

    fn on_connect_error(&self, error: &Error) {
        self.recorded.connect_errors.lock().push(error.to_string());
    }

    fn on_close(&self, code: u16, reason: &str) {
        self.recorded.closes.lock().push((code, reason.to_string()));
    }

    fn on_gap(&self, expected: u64, received: u64) {
        self.recorded.gaps.lock().push((expected, received));
    }
}

/// Start a client and wait for hello-ok
pub async fn connect(options: GatewayClientOptions) -> (GatewayClient, Arc<Recorded>, mpsc::UnboundedReceiver<EventFrame>) {
    let (handler, recorded, rx) = RecordingHandler::new();
    let client = GatewayClient::new(options, handler);
    client.start();
    client
        .wait_for_state(ClientState::Connected, Duration::from_secs(5))
        .await
        .expect("client did not connect");
    (client, recorded, rx)
}

/// Wait for the next event named `name`
pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<EventFrame>, name: &str) -> EventFrame {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if event.event == name {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {name} event"))
}

/// Poll `check` until it holds
pub async fn eventually<F: Fn() -> bool>(check: F) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached");
}
