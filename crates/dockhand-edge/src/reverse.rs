//! Reverse tunnel over TLS.
//!
//! The agent dials the tunnel server and keeps a control connection open.
//! Messages on it are JSON objects, one per line:
//!
//! ```text
//! agent  → server   {"type":"register","credentials":"..","remote_port":4000}
//! server → agent    {"type":"registered"} | {"type":"rejected","reason":".."}
//! server → agent    {"type":"connect","stream_id":7}
//! ```
//!
//! For every `connect` the agent opens a fresh TLS connection, sends
//! `{"type":"accept","stream_id":7,"credentials":".."}`, dials the local
//! agent API and copies bytes both ways until either side closes.
//!
//! The server certificate is not checked against any root store. It must
//! match the SHA-256 fingerprint carried in the edge key.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines, ReadBuf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dockhand_core::TunnelConfig;

use crate::error::TunnelError;
use crate::tunnel::{ActivityTimer, TunnelSession, TunnelTransport};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a closing session waits for its control task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// A message on the control or data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Register { credentials: String, remote_port: u16 },
    Registered,
    Rejected { reason: String },
    Connect { stream_id: u64 },
    Accept { stream_id: u64, credentials: String },
}

/// Opens reverse tunnels to the server named in the edge key.
#[derive(Debug, Clone)]
pub struct ReverseTunnelTransport {
    connect_timeout: Duration,
}

impl ReverseTunnelTransport {
    pub fn new() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    async fn register(
        &self,
        connector: &TlsConnector,
        config: &TunnelConfig,
    ) -> Result<TlsStream<TcpStream>, TunnelError> {
        let mut control = connect(connector, &config.server_address).await?;
        write_message(
            &mut control,
            &ControlMessage::Register {
                credentials: config.credentials.clone(),
                remote_port: config.remote_port,
            },
        )
        .await?;
        Ok(control)
    }
}

impl Default for ReverseTunnelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TunnelTransport for ReverseTunnelTransport {
    async fn open(
        &self,
        config: &TunnelConfig,
        activity: ActivityTimer,
    ) -> Result<Box<dyn TunnelSession>, TunnelError> {
        if config.remote_port == 0 {
            return Err(TunnelError::InvalidConfig("remote port must not be 0".to_string()));
        }
        let connector = pinned_connector(&config.server_fingerprint)?;

        let handshake = async {
            let control = self.register(&connector, config).await?;
            let (reader, writer) = tokio::io::split(control);
            let mut lines = BufReader::new(reader).lines();
            match read_message(&mut lines).await? {
                ControlMessage::Registered => Ok::<_, TunnelError>((lines, writer)),
                ControlMessage::Rejected { reason } => Err(TunnelError::Rejected(reason)),
                other => Err(TunnelError::Protocol(format!(
                    "expected registration answer, got {other:?}"
                ))),
            }
        };

        let (lines, writer) = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| TunnelError::Handshake {
                server: config.server_address.clone(),
                reason: format!("no answer within {:?}", self.connect_timeout),
            })??;

        debug!(server = %config.server_address, remote_port = config.remote_port, "registered with tunnel server");

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(serve_control(
            lines,
            writer,
            connector,
            config.clone(),
            activity,
            shutdown.clone(),
        ));

        Ok(Box::new(ReverseSession { shutdown, task }))
    }
}

struct ReverseSession {
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

#[async_trait]
impl TunnelSession for ReverseSession {
    fn is_alive(&self) -> bool {
        !self.shutdown.is_cancelled()
    }

    async fn close(self: Box<Self>) -> Result<(), TunnelError> {
        let ReverseSession { shutdown, task } = *self;
        shutdown.cancel();
        match tokio::time::timeout(CLOSE_TIMEOUT, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(TunnelError::Teardown(e.to_string())),
            Err(_) => Err(TunnelError::Teardown(
                "control channel did not stop in time".to_string(),
            )),
        }
    }
}

type ControlReader = Lines<BufReader<tokio::io::ReadHalf<TlsStream<TcpStream>>>>;
type ControlWriter = tokio::io::WriteHalf<TlsStream<TcpStream>>;

async fn serve_control(
    mut lines: ControlReader,
    mut writer: ControlWriter,
    connector: TlsConnector,
    config: TunnelConfig,
    activity: ActivityTimer,
    shutdown: CancellationToken,
) {
    loop {
        let line = tokio::select! {
            _ = shutdown.cancelled() => break,
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => match serde_json::from_str::<ControlMessage>(&line) {
                Ok(ControlMessage::Connect { stream_id }) => {
                    activity.touch();
                    let connector = connector.clone();
                    let config = config.clone();
                    let activity = activity.clone();
                    let shutdown = shutdown.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = relay_stream(&connector, &config, stream_id, &activity, shutdown).await {
                            warn!(stream_id, error = %e, "tunnel stream failed");
                        }
                    });
                }
                Ok(other) => debug!(message = ?other, "ignoring unexpected control message"),
                Err(e) => warn!(error = %e, "malformed control message"),
            },
            Ok(None) => {
                info!("tunnel server closed the control channel");
                break;
            }
            Err(e) => {
                warn!(error = %e, "control channel read failed");
                break;
            }
        }
    }

    shutdown.cancel();
    let _ = writer.shutdown().await;
}

async fn relay_stream(
    connector: &TlsConnector,
    config: &TunnelConfig,
    stream_id: u64,
    activity: &ActivityTimer,
    shutdown: CancellationToken,
) -> Result<(), TunnelError> {
    let mut remote = connect(connector, &config.server_address).await?;
    write_message(
        &mut remote,
        &ControlMessage::Accept {
            stream_id,
            credentials: config.credentials.clone(),
        },
    )
    .await?;

    let local = TcpStream::connect(&config.local_address).await?;
    activity.touch();

    let mut remote = Touching::new(remote, activity.clone());
    let mut local = Touching::new(local, activity.clone());
    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut remote, &mut local) => {
            let (inbound, outbound) = copied?;
            debug!(stream_id, inbound, outbound, "tunnel stream finished");
        }
        _ = shutdown.cancelled() => {
            debug!(stream_id, "tunnel stream cancelled");
        }
    }

    activity.touch();
    Ok(())
}

/// Stream wrapper that touches the activity timer on every non-empty read.
struct Touching<S> {
    inner: S,
    activity: ActivityTimer,
}

impl<S> Touching<S> {
    fn new(inner: S, activity: ActivityTimer) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Touching<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let polled = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(polled, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.activity.touch();
        }
        polled
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Touching<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }
}

async fn connect(connector: &TlsConnector, address: &str) -> Result<TlsStream<TcpStream>, TunnelError> {
    let handshake_err = |reason: String| TunnelError::Handshake {
        server: address.to_string(),
        reason,
    };

    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address)
        .trim_start_matches('[')
        .trim_end_matches(']');
    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| TunnelError::InvalidConfig(format!("invalid tunnel server host {host:?}: {e}")))?;

    let tcp = TcpStream::connect(address)
        .await
        .map_err(|e| handshake_err(e.to_string()))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| handshake_err(e.to_string()))
}

async fn write_message<W>(writer: &mut W, message: &ControlMessage) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_vec(message).map_err(|e| TunnelError::Protocol(e.to_string()))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_message<R>(lines: &mut Lines<R>) -> Result<ControlMessage, TunnelError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    match lines.next_line().await? {
        Some(line) => serde_json::from_str(&line)
            .map_err(|e| TunnelError::Protocol(format!("malformed message: {e}"))),
        None => Err(TunnelError::Protocol(
            "connection closed during registration".to_string(),
        )),
    }
}

/// Decode a hex SHA-256 fingerprint; colons, whitespace and case are ignored.
pub fn parse_fingerprint(fingerprint: &str) -> Result<[u8; 32], TunnelError> {
    let cleaned: String = fingerprint
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_ascii_lowercase();
    let bytes = hex::decode(&cleaned)
        .map_err(|e| TunnelError::InvalidConfig(format!("invalid server fingerprint: {e}")))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        TunnelError::InvalidConfig(format!(
            "server fingerprint must be 32 bytes, got {}",
            b.len()
        ))
    })
}

fn pinned_connector(fingerprint: &str) -> Result<TlsConnector, TunnelError> {
    let expected = parse_fingerprint(fingerprint)?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| TunnelError::InvalidConfig(format!("tls protocol version error: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(FingerprintVerifier { expected, provider }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Accepts exactly one server certificate, identified by its SHA-256.
#[derive(Debug)]
struct FingerprintVerifier {
    expected: [u8; 32],
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for FingerprintVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let actual = Sha256::digest(end_entity.as_ref());
        if actual.as_slice() == self.expected.as_slice() {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(format!(
                "server certificate fingerprint mismatch: got {}",
                hex::encode(actual)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}
