//! Reconnecting gateway client
//!
//! A single driver task owns the socket. It opens the transport (pinning the
//! server certificate when configured), answers the connect challenge with a
//! signed handshake, multiplexes requests over the connection, watches the
//! server tick and reconnects with exponential backoff when anything goes
//! wrong.
//!
//! ```text
//! Disconnected ─► Connecting ─► AwaitingChallenge ─► SendingHandshake ─► Connected
//!      ▲                                                                   │
//!      └──────────────────── close / error / tick timeout ◄────────────────┘
//! ```

pub mod backoff;
pub mod pending;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use backoff::Backoff;
pub use pending::{PendingPhase, PendingRequests, Resolution};

use crate::protocol::{
    ClientInfo, ConnectAuth, ConnectParams, DEFAULT_ROLE, DeviceAuth, EventFrame, Frame, HelloOk,
    PROTOCOL_VERSION, RequestFrame, ResponseFrame, close, events, now_ms,
};
use crate::security::fingerprint::webpki_client_config;
use crate::security::{
    DeviceAuthPayload, DeviceAuthStore, DeviceIdentity, PinnedCertVerifier, build_device_auth_payload,
    pinned_client_config,
};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Debounce before sending the handshake when no challenge arrives
pub const DEFAULT_CONNECT_DELAY: Duration = Duration::from_millis(750);

/// Connection lifecycle as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    /// Socket open, waiting for `connect.challenge` or the debounce
    AwaitingChallenge,
    /// Handshake sent, waiting for hello-ok
    SendingHandshake,
    Connected,
}

/// Callbacks from the driver task
///
/// Called on the driver task; keep them short and spawn for anything that
/// awaits.
pub trait GatewayClientHandler: Send + Sync + 'static {
    fn on_event(&self, _client: &GatewayClient, _event: &EventFrame) {}

    fn on_hello_ok(&self, _client: &GatewayClient, _hello: &HelloOk) {}

    fn on_connect_error(&self, _error: &Error) {}

    fn on_close(&self, _code: u16, _reason: &str) {}

    /// A broadcast sequence number was skipped
    fn on_gap(&self, _expected: u64, _received: u64) {}
}

/// Handler that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl GatewayClientHandler for NoopHandler {}

/// Client configuration
#[derive(Debug, Clone)]
pub struct GatewayClientOptions {
    /// `ws://` or `wss://` URL
    pub url: String,
    /// Shared gateway token
    pub token: Option<SecretString>,
    pub password: Option<SecretString>,
    pub client: ClientInfo,
    pub role: String,
    pub scopes: Vec<String>,
    pub caps: Vec<String>,
    pub commands: Vec<String>,
    pub permissions: Option<HashMap<String, bool>>,
    pub path_env: Option<String>,
    /// Signs the handshake when present
    pub identity: Option<Arc<DeviceIdentity>>,
    /// Caches rotated device tokens when present
    pub device_auth: Option<DeviceAuthStore>,
    pub min_protocol: u32,
    pub max_protocol: u32,
    /// Expected server certificate fingerprint (`wss://` only)
    pub tls_fingerprint: Option<String>,
    pub connect_delay: Duration,
    pub backoff: Backoff,
}

impl GatewayClientOptions {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            password: None,
            client: ClientInfo {
                id: "beacon-cli".to_string(),
                display_name: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                platform: std::env::consts::OS.to_string(),
                mode: "cli".to_string(),
                instance_id: Some(Uuid::new_v4().to_string()),
                device_family: None,
                model_identifier: None,
            },
            role: DEFAULT_ROLE.to_string(),
            scopes: Vec::new(),
            caps: Vec::new(),
            commands: Vec::new(),
            permissions: None,
            path_env: None,
            identity: None,
            device_auth: None,
            min_protocol: PROTOCOL_VERSION,
            max_protocol: PROTOCOL_VERSION,
            tls_fingerprint: None,
            connect_delay: DEFAULT_CONNECT_DELAY,
            backoff: Backoff::default(),
        }
    }

    fn has_shared_credential(&self) -> bool {
        self.token.is_some() || self.password.is_some()
    }
}

/// Per-request options
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestOptions {
    /// Treat `{status:"accepted"}` as interim and wait for the final response
    pub expect_final: bool,
    pub timeout: Option<Duration>,
}

struct Driver {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

/// The running driver and the handover state between successive ones
struct DriverSlot {
    /// Bumped by every `start` that spawns a driver
    generation: u64,
    current: Option<Driver>,
    /// Cancelled once the most recently spawned driver has fully exited
    finished: CancellationToken,
}

impl Default for DriverSlot {
    fn default() -> Self {
        let finished = CancellationToken::new();
        finished.cancel();
        Self {
            generation: 0,
            current: None,
            finished,
        }
    }
}

struct Inner {
    options: GatewayClientOptions,
    handler: Arc<dyn GatewayClientHandler>,
    pending: PendingRequests,
    /// Writer of the live connection, set only once hello-ok arrived
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    state: watch::Sender<ClientState>,
    hello: Mutex<Option<HelloOk>>,
    driver: Mutex<DriverSlot>,
}

impl Inner {
    fn set_state(&self, state: ClientState) {
        self.state.send_replace(state);
    }

    /// Retire the live writer and fail everything registered against it
    ///
    /// Requests register while holding the outbound lock, so each one is
    /// either drained here or finds no writer.
    fn close_outbound(&self, code: u16, reason: &str) -> usize {
        let mut outbound = self.outbound.lock();
        outbound.take();
        self.pending.fail_all(|| Error::Closed {
            code,
            reason: reason.to_string(),
        })
    }
}

/// Handle to a reconnecting gateway connection
#[derive(Clone)]
pub struct GatewayClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for GatewayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayClient")
            .field("url", &self.inner.options.url)
            .field("state", &self.state())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl GatewayClient {
    #[must_use]
    pub fn new<H: GatewayClientHandler>(options: GatewayClientOptions, handler: H) -> Self {
        let (state, _) = watch::channel(ClientState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                options,
                handler: Arc::new(handler),
                pending: PendingRequests::default(),
                outbound: Mutex::new(None),
                state,
                hello: Mutex::new(None),
                driver: Mutex::new(DriverSlot::default()),
            }),
        }
    }

    /// Spawn the driver task; a no-op while one is running
    ///
    /// A driver started while a previous one is still stopping waits for it
    /// to exit before connecting.
    pub fn start(&self) {
        let mut slot = self.inner.driver.lock();
        if slot.current.as_ref().is_some_and(|d| !d.task.is_finished()) {
            return;
        }
        slot.generation += 1;
        let shutdown = CancellationToken::new();
        let finished = CancellationToken::new();
        let previous = std::mem::replace(&mut slot.finished, finished.clone());
        let task = tokio::spawn(drive(self.inner.clone(), shutdown.clone(), previous, finished));
        slot.current = Some(Driver { shutdown, task });
    }

    /// Stop the driver and fail every outstanding request
    pub async fn stop(&self) {
        let (driver, generation) = {
            let mut slot = self.inner.driver.lock();
            (slot.current.take(), slot.generation)
        };
        if let Some(driver) = driver {
            driver.shutdown.cancel();
            if let Err(e) = driver.task.await {
                tracing::warn!(error = %e, "gateway client driver ended abnormally");
            }
        }

        let slot = self.inner.driver.lock();
        if slot.generation != generation {
            // Restarted while stopping; the new driver owns the connection
            return;
        }
        self.inner.close_outbound(close::NORMAL, "gateway client stopped");
        self.inner.set_state(ClientState::Disconnected);
        drop(slot);
    }

    #[must_use]
    pub fn state(&self) -> ClientState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    #[must_use]
    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    /// Wait until the client reaches `target`
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if it does not get there within `timeout`
    pub async fn wait_for_state(&self, target: ClientState, timeout: Duration) -> Result<()> {
        let mut rx = self.subscribe_state();
        let reached = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| *s == target).await.is_ok()
        })
        .await
        .map_err(|_| Error::Timeout(format!("client did not reach {target:?}")))?;
        if reached {
            Ok(())
        } else {
            Err(Error::Unavailable("client dropped".to_string()))
        }
    }

    /// Last hello-ok received
    #[must_use]
    pub fn hello(&self) -> Option<HelloOk> {
        self.inner.hello.lock().clone()
    }

    /// Number of requests awaiting a response
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.pending.len()
    }

    /// Phase of an outstanding request
    #[must_use]
    pub fn pending_phase(&self, id: &str) -> Option<PendingPhase> {
        self.inner.pending.phase(id)
    }

    /// Send a request and wait for its terminal response
    ///
    /// # Errors
    ///
    /// `NotConnected` when no session is established, `Timeout` when the
    /// optional bound elapses, `Closed` when the connection drops first, or
    /// the gateway's own error
    pub async fn request(&self, method: &str, params: Option<Value>, opts: RequestOptions) -> Result<Value> {
        let id = Uuid::new_v4().to_string();
        self.request_with_id(&id, method, params, opts).await
    }

    /// [`Self::request`] with a caller-chosen id
    ///
    /// # Errors
    ///
    /// Same as [`Self::request`]
    pub async fn request_with_id(
        &self,
        id: &str,
        method: &str,
        params: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Value> {
        let text = Frame::Request(RequestFrame {
            id: id.to_string(),
            method: method.to_string(),
            params,
        })
        .to_text()?;

        // Registered under the outbound lock; see `Inner::close_outbound`
        let (tx, rx) = {
            let outbound = self.inner.outbound.lock();
            let Some(tx) = outbound.clone() else {
                return Err(Error::NotConnected("gateway not connected".to_string()));
            };
            (tx, self.inner.pending.insert(id, opts.expect_final)?)
        };
        if tx.send(Message::text(text)).is_err() {
            self.inner.pending.remove(id);
            return Err(Error::NotConnected("gateway not connected".to_string()));
        }

        let outcome = match opts.timeout {
            Some(limit) => {
                if let Ok(outcome) = tokio::time::timeout(limit, rx).await {
                    outcome
                } else {
                    self.inner.pending.remove(id);
                    return Err(Error::Timeout(format!("{method} timed out")));
                }
            }
            None => rx.await,
        };
        outcome.unwrap_or_else(|_| {
            Err(Error::Closed {
                code: close::ABNORMAL,
                reason: "request abandoned".to_string(),
            })
        })
    }
}

/// Reconnect loop: one connection at a time, backoff between them
async fn drive(
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    previous: CancellationToken,
    finished: CancellationToken,
) {
    let _finished = finished.drop_guard();
    tokio::select! {
        () = shutdown.cancelled() => return,
        () = previous.cancelled() => {}
    }

    let mut backoff = inner.options.backoff.clone();

    loop {
        if shutdown.is_cancelled() {
            break;
        }

        inner.set_state(ClientState::Connecting);
        let (code, reason) = run_connection(&inner, &shutdown, &mut backoff).await;

        let failed = inner.close_outbound(code, &reason);
        inner.set_state(ClientState::Disconnected);
        tracing::info!(code, reason = %reason, failed_requests = failed, "gateway connection closed");
        inner.handler.on_close(code, &reason);

        if shutdown.is_cancelled() {
            break;
        }
        let delay = backoff.next_delay();
        tracing::info!(delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "scheduling gateway reconnect");
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
}

async fn open_transport(options: &GatewayClientOptions) -> Result<WsStream> {
    let mut verifier: Option<Arc<PinnedCertVerifier>> = None;
    let connector = if options.url.starts_with("wss://") {
        let config = match options.tls_fingerprint.as_deref() {
            Some(expected) => {
                let (config, pinned) = pinned_client_config(expected)?;
                verifier = Some(pinned);
                config
            }
            None => webpki_client_config()?,
        };
        Some(Connector::Rustls(config))
    } else {
        None
    };

    match connect_async_tls_with_config(options.url.as_str(), None, false, connector).await {
        Ok((ws, _response)) => Ok(ws),
        Err(e) => {
            if let Some(verifier) = &verifier
                && let Some(actual) = verifier.take_mismatch()
            {
                return Err(Error::FingerprintMismatch {
                    expected: verifier.expected().to_string(),
                    actual,
                });
            }
            Err(Error::Transport(e.to_string()))
        }
    }
}

/// Per-connection handshake bookkeeping
#[derive(Default)]
struct Handshake {
    request_id: Option<String>,
    used_stored_token: bool,
}

/// Run one connection to completion, returning its close code and reason
async fn run_connection(inner: &Arc<Inner>, shutdown: &CancellationToken, backoff: &mut Backoff) -> (u16, String) {
    let ws = tokio::select! {
        () = shutdown.cancelled() => return (close::NORMAL, "gateway client stopped".to_string()),
        ws = open_transport(&inner.options) => ws,
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(e) => {
            let code = if matches!(e, Error::FingerprintMismatch { .. }) {
                close::POLICY_VIOLATION
            } else {
                close::ABNORMAL
            };
            tracing::warn!(url = %inner.options.url, error = %e, "gateway connect failed");
            inner.handler.on_connect_error(&e);
            return (code, e.to_string());
        }
    };

    tracing::debug!(url = %inner.options.url, "gateway socket open");
    inner.set_state(ClientState::AwaitingChallenge);

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if sink.send(msg).await.is_err() || closing {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let client = GatewayClient { inner: inner.clone() };
    let mut handshake = Handshake::default();
    let mut last_seq: Option<u64> = None;
    let mut last_tick = Instant::now();
    let mut tick_interval = Duration::ZERO;
    let mut watchdog: Option<Interval> = None;

    let debounce = tokio::time::sleep(inner.options.connect_delay);
    tokio::pin!(debounce);

    let outcome = loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                send_close(&tx, close::NORMAL, "gateway client stopped");
                break (close::NORMAL, "gateway client stopped".to_string());
            }
            () = &mut debounce, if handshake.request_id.is_none() => {
                if let Err(e) = send_connect(inner, &tx, &mut handshake, None) {
                    break fail_handshake(inner, &tx, &e);
                }
            }
            () = watchdog_tick(&mut watchdog) => {
                if last_tick.elapsed() > tick_interval * 2 {
                    tracing::warn!(
                        since_ms = u64::try_from(last_tick.elapsed().as_millis()).unwrap_or(u64::MAX),
                        "gateway tick timeout, closing"
                    );
                    send_close(&tx, close::TICK_TIMEOUT, "tick timeout");
                    break (close::TICK_TIMEOUT, "tick timeout".to_string());
                }
            }
            msg = stream.next() => {
                let text = match msg {
                    None => break (close::ABNORMAL, "connection lost".to_string()),
                    Some(Err(e)) => break (close::ABNORMAL, e.to_string()),
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map_or_else(
                            || (close::ABNORMAL, String::new()),
                            |f| (u16::from(f.code), f.reason.as_str().to_string()),
                        );
                    }
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(_)) => continue,
                };

                let frame = match Frame::parse(text.as_str()) {
                    Ok(frame) => frame,
                    Err(e) => {
                        tracing::debug!(error = %e, "ignoring unparseable gateway frame");
                        continue;
                    }
                };

                match frame {
                    Frame::Event(event) => {
                        if event.event == events::CONNECT_CHALLENGE && handshake.request_id.is_none() {
                            let nonce = event
                                .payload
                                .as_ref()
                                .and_then(|p| p.get("nonce"))
                                .and_then(Value::as_str)
                                .map(str::to_string);
                            if let Err(e) = send_connect(inner, &tx, &mut handshake, nonce) {
                                break fail_handshake(inner, &tx, &e);
                            }
                        }
                        if event.event == events::TICK {
                            last_tick = Instant::now();
                        }
                        if let Some(seq) = event.seq {
                            if let Some(last) = last_seq
                                && seq > last + 1
                            {
                                inner.handler.on_gap(last + 1, seq);
                            }
                            last_seq = Some(seq);
                        }
                        inner.handler.on_event(&client, &event);
                    }
                    Frame::Response(response) if handshake.request_id.as_deref() == Some(response.id.as_str()) => {
                        match accept_hello(inner, &tx, &handshake, response) {
                            Ok(hello) => {
                                backoff.reset();
                                tick_interval = Duration::from_millis(hello.policy.tick_interval_ms.max(1));
                                last_tick = Instant::now();
                                let mut interval = tokio::time::interval_at(
                                    Instant::now() + tick_interval.max(Duration::from_secs(1)),
                                    tick_interval.max(Duration::from_secs(1)),
                                );
                                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                                watchdog = Some(interval);
                                inner.handler.on_hello_ok(&client, &hello);
                            }
                            Err(e) => break fail_handshake(inner, &tx, &e),
                        }
                    }
                    Frame::Response(response) => {
                        if inner.pending.resolve(response) == Resolution::Unknown {
                            tracing::trace!("ignoring response for unknown request");
                        }
                    }
                    Frame::Request(_) => {}
                }
            }
        }
    };

    inner.outbound.lock().take();
    drop(tx);
    if tokio::time::timeout(Duration::from_secs(1), writer).await.is_err() {
        tracing::debug!("gateway writer did not drain in time");
    }
    outcome
}

async fn watchdog_tick(watchdog: &mut Option<Interval>) {
    match watchdog {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, code: u16, reason: &str) {
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code: code.into(),
        reason: reason.to_string().into(),
    })));
}

/// Build, sign and send the `connect` request
fn send_connect(
    inner: &Inner,
    tx: &mpsc::UnboundedSender<Message>,
    handshake: &mut Handshake,
    nonce: Option<String>,
) -> Result<()> {
    let options = &inner.options;
    let role = options.role.clone();

    let stored_token = match (&options.identity, &options.device_auth) {
        (Some(identity), Some(store)) => store.load(&identity.device_id, &role).map(|e| e.token),
        _ => None,
    };
    handshake.used_stored_token = stored_token.is_some();
    let token = stored_token.or_else(|| options.token.as_ref().map(|t| t.expose_secret().to_string()));
    let password = options.password.as_ref().map(|p| p.expose_secret().to_string());

    let device = match &options.identity {
        Some(identity) => {
            let signed_at = now_ms();
            let payload = build_device_auth_payload(&DeviceAuthPayload {
                device_id: &identity.device_id,
                client_id: &options.client.id,
                client_mode: &options.client.mode,
                role: &role,
                scopes: &options.scopes,
                signed_at_ms: signed_at,
                token: token.as_deref(),
                nonce: nonce.as_deref(),
            });
            Some(DeviceAuth {
                id: identity.device_id.clone(),
                public_key: identity.raw_public_key()?,
                signature: identity.sign(&payload)?,
                signed_at,
                nonce,
            })
        }
        None => None,
    };

    let auth = (token.is_some() || password.is_some()).then(|| ConnectAuth { token, password });
    let params = ConnectParams {
        min_protocol: options.min_protocol,
        max_protocol: options.max_protocol,
        client: options.client.clone(),
        caps: options.caps.clone(),
        commands: options.commands.clone(),
        permissions: options.permissions.clone(),
        path_env: options.path_env.clone(),
        auth,
        role: Some(role),
        scopes: options.scopes.clone(),
        device,
    };

    let id = Uuid::new_v4().to_string();
    let text = Frame::Request(RequestFrame {
        id: id.clone(),
        method: "connect".to_string(),
        params: Some(serde_json::to_value(&params)?),
    })
    .to_text()?;
    tx.send(Message::text(text))
        .map_err(|_| Error::Unavailable("socket writer closed".to_string()))?;

    handshake.request_id = Some(id);
    inner.set_state(ClientState::SendingHandshake);
    tracing::debug!(signed = params.device.is_some(), "sent gateway handshake");
    Ok(())
}

/// Apply the connect response; on success the connection becomes usable
fn accept_hello(
    inner: &Inner,
    tx: &mpsc::UnboundedSender<Message>,
    handshake: &Handshake,
    response: ResponseFrame,
) -> Result<HelloOk> {
    if !response.ok {
        if handshake.used_stored_token
            && inner.options.has_shared_credential()
            && let (Some(identity), Some(store)) = (&inner.options.identity, &inner.options.device_auth)
        {
            tracing::info!("clearing stored device token after rejected handshake");
            if let Err(e) = store.clear(&identity.device_id, &inner.options.role) {
                tracing::warn!(error = %e, "failed to clear stored device token");
            }
        }
        let shape = response
            .error
            .ok_or_else(|| Error::Auth("connect rejected".to_string()))?;
        return Err(Error::from(shape));
    }

    let hello: HelloOk = serde_json::from_value(response.payload.unwrap_or(Value::Null))?;

    if let (Some(auth), Some(identity), Some(store)) =
        (&hello.auth, &inner.options.identity, &inner.options.device_auth)
        && let Err(e) = store.store(&identity.device_id, &auth.role, &auth.device_token, &auth.scopes)
    {
        tracing::warn!(error = %e, "failed to persist device token");
    }

    *inner.hello.lock() = Some(hello.clone());
    *inner.outbound.lock() = Some(tx.clone());
    inner.set_state(ClientState::Connected);
    tracing::info!(
        url = %inner.options.url,
        conn_id = %hello.server.conn_id,
        protocol = hello.protocol,
        "connected to gateway"
    );
    Ok(hello)
}

fn fail_handshake(inner: &Inner, tx: &mpsc::UnboundedSender<Message>, error: &Error) -> (u16, String) {
    tracing::warn!(error = %error, "gateway handshake failed");
    inner.handler.on_connect_error(error);
    send_close(tx, close::POLICY_VIOLATION, "connect failed");
    (close::POLICY_VIOLATION, "connect failed".to_string())
}
