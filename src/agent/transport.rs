//! One-call-one-connection WebSocket transport to the helper agent
//!
//! Every call opens a fresh `wss://` connection, drives the operation's
//! payload on the write side while a collector drains inbound messages into a
//! log buffer, and interprets the peer's close-frame text as the exit status:
//! `"0"` is success, `"127"` marks the helper script missing (the client
//! layer self-heals on that), anything else is a failure with the text kept
//! verbatim. Peer certificates are intentionally not verified — the agent
//! presents a self-signed cert on an internal channel and authentication is
//! the Basic credential, not the TLS identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use futures::SinkExt;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::operation::{Operation, UPLOAD_EOF_MARKER};

/// Close-frame text the agent sends for a missing command
pub const NOT_FOUND_EXIT_CODE: i32 = 127;

/// How long a canceled call waits for the agent to acknowledge the close
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Terminal status of one remote call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    Success,
    Failed,
}

/// Everything observed during one remote call
#[derive(Debug, Clone)]
pub struct ExecOutcome {
    pub status: ExecStatus,
    pub reason: String,
    /// Concatenation of every inbound message
    pub log: String,
    /// Raw close-frame text, empty if the connection died without one
    pub close_text: String,
    /// Close text parsed as an exit code, when numeric
    pub code: Option<i32>,
}

impl ExecOutcome {
    pub fn success(&self) -> bool {
        self.status == ExecStatus::Success
    }

    /// The agent reported the command itself missing
    pub fn command_not_found(&self) -> bool {
        self.code == Some(NOT_FOUND_EXIT_CODE)
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: ExecStatus::Failed,
            reason: reason.into(),
            log: String::new(),
            close_text: String::new(),
            code: None,
        }
    }

    /// Interpret a close-frame text per the agent's exit-code convention
    pub fn from_close(close_text: String, log: String) -> Self {
        let trimmed = close_text.trim();
        let code = trimmed.parse::<i32>().ok();

        if trimmed == "0" {
            Self {
                status: ExecStatus::Success,
                reason: "success".to_string(),
                log,
                close_text,
                code,
            }
        } else {
            let reason = if trimmed.is_empty() {
                "connection closed without a status".to_string()
            } else {
                trimmed.to_string()
            };
            Self {
                status: ExecStatus::Failed,
                reason,
                log,
                close_text,
                code,
            }
        }
    }
}

impl std::fmt::Display for ExecOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}, {}, {}", self.status, self.reason, self.log)
    }
}

/// One host's agent endpoint plus the credential for it
#[derive(Debug, Clone)]
pub struct AgentTarget {
    pub host: String,
    pub port: u16,
    /// Already base64-encoded Basic credential
    pub token: String,
}

impl AgentTarget {
    pub fn new(host: impl Into<String>, port: u16, token: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            token: token.into(),
        }
    }
}

/// A single raw remote call; the seam tests script against
#[async_trait]
pub trait AgentCall: Send + Sync {
    /// Run one operation over one fresh connection. Always returns; errors
    /// are folded into a failed outcome.
    async fn call(
        &self,
        target: &AgentTarget,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> ExecOutcome;
}

/// Production transport over tokio-tungstenite
pub struct WsAgentCall {
    tls: Arc<rustls::ClientConfig>,
}

impl Default for WsAgentCall {
    fn default() -> Self {
        Self::new()
    }
}

impl WsAgentCall {
    pub fn new() -> Self {
        Self {
            tls: insecure_client_config(),
        }
    }
}

#[async_trait]
impl AgentCall for WsAgentCall {
    async fn call(
        &self,
        target: &AgentTarget,
        op: &Operation,
        cancel: &CancellationToken,
    ) -> ExecOutcome {
        let url = match op.url(&target.host, target.port) {
            Ok(url) => url,
            Err(e) => return ExecOutcome::failed(format!("bad agent url: {}", e)),
        };

        let mut request = match url.as_str().into_client_request() {
            Ok(req) => req,
            Err(e) => return ExecOutcome::failed(format!("bad agent request: {}", e)),
        };
        let auth = match HeaderValue::from_str(&format!("Basic {}", target.token)) {
            Ok(value) => value,
            Err(e) => return ExecOutcome::failed(format!("bad agent token: {}", e)),
        };
        request.headers_mut().insert(AUTHORIZATION, auth);

        debug!("agent call {} -> {}", op.describe(), target.host);

        let connector = Connector::Rustls(self.tls.clone());
        let (stream, _) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return ExecOutcome::failed("canceled before connecting");
            }
            connected = connect_async_tls_with_config(request, None, false, Some(connector)) => {
                match connected {
                    Ok(pair) => pair,
                    Err(e) => return ExecOutcome::failed(format!("connect failed: {}", e)),
                }
            }
        };

        let (mut write, read) = stream.split();
        let mut collector = tokio::spawn(collect(read));

        // Write-side driver: uploads push their chunked payload plus the EOF
        // marker; commands and checks have nothing to send. The stop signal
        // interrupts the loop between sends.
        for chunk in op.upload_chunks() {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return close_and_drain(write, collector).await,
                sent = write.send(Message::binary(chunk.to_vec())) => {
                    if let Err(e) = sent {
                        collector.abort();
                        return ExecOutcome::failed(format!("send failed: {}", e));
                    }
                }
            }
        }
        if matches!(op, Operation::Upload { .. }) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return close_and_drain(write, collector).await,
                sent = write.send(Message::text(UPLOAD_EOF_MARKER)) => {
                    if let Err(e) = sent {
                        collector.abort();
                        return ExecOutcome::failed(format!("send EOF failed: {}", e));
                    }
                }
            }
        }

        tokio::select! {
            joined = &mut collector => finalize(joined),
            _ = cancel.cancelled() => close_and_drain(write, collector).await,
        }
    }
}

/// Canceled mid-call: tell the agent to close and give the collector a short
/// grace window to observe the peer's close frame
async fn close_and_drain(
    mut write: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>,
    mut collector: tokio::task::JoinHandle<Collected>,
) -> ExecOutcome {
    let _ = write.send(Message::Close(None)).await;
    match tokio::time::timeout(CLOSE_GRACE, &mut collector).await {
        Ok(joined) => finalize(joined),
        Err(_) => {
            collector.abort();
            ExecOutcome::failed("canceled before the agent acknowledged close")
        }
    }
}

#[derive(Default)]
struct Collected {
    log: String,
    close_text: Option<String>,
    failure: Option<String>,
}

/// Read-side collector: accumulates every inbound message and terminates on
/// the close frame
async fn collect(
    mut read: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
) -> Collected {
    let mut out = Collected::default();
    while let Some(message) = read.next().await {
        match message {
            Ok(Message::Text(text)) => {
                trace!("agent recv: {}", text);
                out.log.push_str(&text);
            }
            Ok(Message::Binary(bytes)) => {
                out.log.push_str(&String::from_utf8_lossy(&bytes));
            }
            Ok(Message::Close(frame)) => {
                out.close_text = Some(
                    frame
                        .map(|f| f.reason.to_string())
                        .unwrap_or_default(),
                );
                break;
            }
            Ok(_) => {}
            Err(e) => {
                out.failure = Some(e.to_string());
                break;
            }
        }
    }
    out
}

fn finalize(joined: Result<Collected, tokio::task::JoinError>) -> ExecOutcome {
    let collected = match joined {
        Ok(collected) => collected,
        Err(e) => return ExecOutcome::failed(format!("collector failed: {}", e)),
    };

    if let Some(close_text) = collected.close_text {
        return ExecOutcome::from_close(close_text, collected.log);
    }

    let mut outcome = ExecOutcome::failed(
        collected
            .failure
            .unwrap_or_else(|| "connection closed without a close frame".to_string()),
    );
    outcome.log = collected.log;
    outcome
}

/// Accept any peer certificate; the channel is authenticated by the Basic
/// credential, not TLS identity
#[derive(Debug)]
struct NoCertVerification(CryptoProvider);

impl ServerCertVerifier for NoCertVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn insecure_client_config() -> Arc<rustls::ClientConfig> {
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let config = rustls::ClientConfig::builder_with_provider(Arc::new(provider.clone()))
        .with_safe_default_protocol_versions()
        .expect("default TLS protocol versions")
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoCertVerification(provider)))
        .with_no_client_auth();
    Arc::new(config)
}
