//! Certificate pinning against a local TLS WebSocket listener

use std::sync::Arc;
use std::time::Duration;

use beacon_link::client::{ClientState, GatewayClient};
use beacon_link::security::cert_fingerprint;
use rcgen::CertifiedKey;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

mod common;
use common::{RecordingHandler, client_options, eventually};

/// TLS listener that completes the WebSocket upgrade and then idles
async fn start_tls_listener() -> (String, String) {
    let CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let der: CertificateDer<'static> = cert.der().clone();
    let fingerprint = cert_fingerprint(der.as_ref());

    let config = ServerConfig::builder_with_provider(Arc::new(
        tokio_rustls::rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
        vec![der],
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der())),
    )
    .unwrap();
    let acceptor = TlsAcceptor::from(Arc::new(config));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(tcp).await else {
                    return;
                };
                if let Ok(ws) = tokio_tungstenite::accept_async(tls).await {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    drop(ws);
                }
            });
        }
    });

    (format!("wss://127.0.0.1:{}", addr.port()), fingerprint)
}

#[tokio::test]
async fn mismatched_pin_never_connects() {
    let (url, actual) = start_tls_listener().await;

    let mut options = client_options(&url, "operator", &[]);
    options.tls_fingerprint = Some(format!("sha256:{}", "00".repeat(32)));
    let (handler, recorded, _rx) = RecordingHandler::new();
    let client = GatewayClient::new(options, handler);
    client.start();

    eventually(|| !recorded.connect_errors.lock().is_empty()).await;
    let error = recorded.connect_errors.lock()[0].clone();
    assert!(error.contains("fingerprint mismatch"), "{error}");
    assert!(error.contains(&actual), "{error}");
    assert!(recorded.closes.lock().iter().all(|(code, _)| *code == 1008));

    assert_ne!(client.state(), ClientState::Connected);
    assert!(client.hello().is_none());

    client.stop().await;
}

#[tokio::test]
async fn matching_pin_opens_the_socket() {
    let (url, actual) = start_tls_listener().await;

    let mut options = client_options(&url, "operator", &[]);
    // Separators and case do not matter
    let pretty = actual
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).to_uppercase())
        .collect::<Vec<_>>()
        .join(":");
    options.tls_fingerprint = Some(format!("SHA256:{pretty}"));
    options.connect_delay = Duration::from_secs(30);
    let (handler, recorded, _rx) = RecordingHandler::new();
    let client = GatewayClient::new(options, handler);
    client.start();

    client
        .wait_for_state(ClientState::AwaitingChallenge, Duration::from_secs(5))
        .await
        .unwrap();
    assert!(recorded.connect_errors.lock().is_empty());

    client.stop().await;
}
