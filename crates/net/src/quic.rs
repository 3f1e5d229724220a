//! QUIC transport using quinn.
//!
//! Each connection carries one bidirectional stream opened by the server.
//! Frames on it are prefixed with a little-endian `u32` length. Endpoints use
//! self-signed certificates for development.

use crate::connection::{CloseCode, CloseReason};
use crate::protocol::{ALPN, DEFAULT_MAX_FRAME_BYTES};
use crate::transport::{Transport, TransportError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use quinn::{ClientConfig, Endpoint, ReadError, ReadExactError, RecvStream, SendStream, ServerConfig, VarInt};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, trace};

/// How long a reader waits for the connection close after the stream ends.
const CLOSE_LINGER: Duration = Duration::from_secs(1);

/// Frame pipe over a QUIC bidirectional stream.
pub struct QuicTransport {
    connection: quinn::Connection,
    send: Mutex<SendStream>,
    recv: Mutex<RecvStream>,
    max_frame_bytes: usize,
    closed: AtomicBool,
}

impl QuicTransport {
    /// Server side: open the protocol stream. The server speaks first, so the
    /// peer sees the stream as soon as the first frame is written.
    pub async fn open(connection: quinn::Connection, max_frame_bytes: usize) -> Result<Self> {
        let (send, recv) = connection
            .open_bi()
            .await
            .context("Failed to open bidirectional stream")?;
        Ok(Self::from_streams(connection, send, recv, max_frame_bytes))
    }

    /// Client side: accept the stream opened by the server.
    pub async fn accept(connection: quinn::Connection, max_frame_bytes: usize) -> Result<Self> {
        let (send, recv) = connection
            .accept_bi()
            .await
            .context("Failed to accept bidirectional stream")?;
        Ok(Self::from_streams(connection, send, recv, max_frame_bytes))
    }

    fn from_streams(
        connection: quinn::Connection,
        send: SendStream,
        recv: RecvStream,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            connection,
            send: Mutex::new(send),
            recv: Mutex::new(recv),
            max_frame_bytes: max_frame_bytes.min(u32::MAX as usize),
            closed: AtomicBool::new(false),
        }
    }

    async fn map_read(&self, err: ReadExactError) -> TransportError {
        match err {
            ReadExactError::FinishedEarly(_) => {
                // A finished stream usually means the close frame is in flight.
                let lost = tokio::time::timeout(CLOSE_LINGER, self.connection.closed()).await;
                self.closed.store(true, Ordering::Release);
                TransportError::Closed {
                    reason: lost.ok().as_ref().and_then(close_reason_of),
                }
            }
            ReadExactError::ReadError(ReadError::ConnectionLost(lost)) => {
                self.closed.store(true, Ordering::Release);
                TransportError::Closed {
                    reason: close_reason_of(&lost),
                }
            }
            other => TransportError::Read(other),
        }
    }
}

fn close_reason_of(err: &quinn::ConnectionError) -> Option<CloseReason> {
    match err {
        quinn::ConnectionError::ApplicationClosed(close) => {
            let code = CloseCode::from_code(close.error_code.into_inner())
                .unwrap_or(CloseCode::InternalError);
            Some(CloseReason::new(
                code,
                String::from_utf8_lossy(&close.reason).into_owned(),
            ))
        }
        _ => None,
    }
}

#[async_trait]
impl Transport for QuicTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        if frame.len() > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len: frame.len(),
                max: self.max_frame_bytes,
            });
        }
        let mut send = self.send.lock().await;
        // Length prefix, then payload.
        send.write_all(&(frame.len() as u32).to_le_bytes()).await?;
        send.write_all(&frame).await?;
        trace!("Sent {} byte frame to {}", frame.len(), self.peer());
        Ok(())
    }

    async fn receive(&self) -> Result<Vec<u8>, TransportError> {
        let mut recv = self.recv.lock().await;
        let mut len_bytes = [0u8; 4];
        if let Err(err) = recv.read_exact(&mut len_bytes).await {
            return Err(self.map_read(err).await);
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > self.max_frame_bytes {
            return Err(TransportError::FrameTooLarge {
                len,
                max: self.max_frame_bytes,
            });
        }
        let mut frame = vec![0u8; len];
        if let Err(err) = recv.read_exact(&mut frame).await {
            return Err(self.map_read(err).await);
        }
        trace!("Received {} byte frame from {}", len, self.peer());
        Ok(frame)
    }

    async fn close(&self, reason: &CloseReason) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connection.close(
            VarInt::from_u32(u32::from(reason.code.code())),
            reason.message.as_bytes(),
        );
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.connection.close_reason().is_some()
    }

    fn peer(&self) -> String {
        self.connection.remote_address().to_string()
    }

    fn max_frame_len(&self) -> Option<usize> {
        Some(self.max_frame_bytes)
    }
}

fn transport_config() -> Result<quinn::TransportConfig> {
    let mut transport = quinn::TransportConfig::default();
    transport.keep_alive_interval(Some(Duration::from_secs(5)));
    transport.max_idle_timeout(Some(Duration::from_secs(30).try_into()?));
    Ok(transport)
}

/// Listening endpoint for control connections.
pub struct ServerEndpoint {
    endpoint: Endpoint,
    addr: SocketAddr,
    max_frame_bytes: usize,
}

impl ServerEndpoint {
    /// Bind with a fresh self-signed certificate.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        Self::bind_with_limit(addr, DEFAULT_MAX_FRAME_BYTES)
    }

    /// Bind, capping frames at `max_frame_bytes`.
    pub fn bind_with_limit(addr: SocketAddr, max_frame_bytes: usize) -> Result<Self> {
        info!("Creating control endpoint on {}", addr);

        let _ = rustls::crypto::ring::default_provider().install_default();
        let (cert, key) = generate_self_signed_cert()?;

        let mut server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .context("Failed to build rustls ServerConfig")?;
        server_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = ServerConfig::with_crypto(Arc::new(
            quinn::crypto::rustls::QuicServerConfig::try_from(server_crypto)
                .context("Failed to create QuicServerConfig")?,
        ));
        server_config.transport_config(Arc::new(transport_config()?));

        let endpoint =
            Endpoint::server(server_config, addr).context("Failed to bind control endpoint")?;
        let addr = endpoint.local_addr()?;
        info!("Control endpoint bound to {}", addr);

        Ok(Self {
            endpoint,
            addr,
            max_frame_bytes,
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Wait for the next connection and open its protocol stream.
    ///
    /// Returns `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Result<QuicTransport>> {
        let incoming = self.endpoint.accept().await?;
        Some(
            async {
                let connection = incoming.await.context("Failed to accept connection")?;
                debug!("Accepted QUIC connection from {}", connection.remote_address());
                QuicTransport::open(connection, self.max_frame_bytes).await
            }
            .await,
        )
    }

    /// Stop accepting connections.
    pub fn close(&self) {
        self.endpoint.close(
            VarInt::from_u32(u32::from(CloseCode::GoingAway.code())),
            b"Server shutting down",
        );
    }

    /// Wait until every connection on the endpoint has finished closing.
    pub async fn wait_idle(&self) {
        self.endpoint.wait_idle().await;
    }
}

/// Outgoing endpoint used by clients and tests.
pub struct ClientEndpoint {
    endpoint: Endpoint,
}

impl ClientEndpoint {
    /// Client that accepts any server certificate (development only).
    pub fn new() -> Result<Self> {
        debug!("Creating client endpoint");

        let _ = rustls::crypto::ring::default_provider().install_default();
        let mut client_crypto = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
            .with_no_client_auth();
        client_crypto.alpn_protocols = vec![ALPN.to_vec()];

        let mut client_config = ClientConfig::new(Arc::new(
            quinn::crypto::rustls::QuicClientConfig::try_from(client_crypto)
                .context("Failed to create QuicClientConfig")?,
        ));
        client_config.transport_config(Arc::new(transport_config()?));

        let mut endpoint = Endpoint::client("0.0.0.0:0".parse()?)?;
        endpoint.set_default_client_config(client_config);
        Ok(Self { endpoint })
    }

    /// Connect and accept the server's protocol stream.
    pub async fn connect(&self, server_addr: SocketAddr) -> Result<QuicTransport> {
        info!("Connecting to control endpoint at {}", server_addr);
        let connection = self
            .endpoint
            .connect(server_addr, "localhost")
            .context("Failed to initiate connection")?
            .await
            .context("Failed to establish connection")?;
        QuicTransport::accept(connection, DEFAULT_MAX_FRAME_BYTES).await
    }

    /// Close the endpoint and all of its connections.
    pub fn close(&self) {
        self.endpoint.close(
            VarInt::from_u32(u32::from(CloseCode::Normal.code())),
            b"Client shutting down",
        );
    }
}

fn generate_self_signed_cert() -> Result<(CertificateDer<'static>, PrivateKeyDer<'static>)> {
    let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()])
        .context("Failed to generate certificate")?;
    let key = PrivateKeyDer::Pkcs8(cert.key_pair.serialize_der().into());
    Ok((CertificateDer::from(cert.cert), key))
}

/// Accepts every server certificate. Development only.
#[derive(Debug)]
struct SkipServerVerification;

impl rustls::client::danger::ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_cross_a_real_connection() {
        let server = ServerEndpoint::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
        let addr = server.local_addr();

        let server_task = tokio::spawn(async move {
            let transport = server.accept().await.expect("incoming").expect("accept");
            transport.send(b"hello client".to_vec()).await.expect("send");
            let reply = transport.receive().await.expect("receive");
            assert_eq!(reply, b"hello server");
            transport
                .close(&CloseReason::going_away("done"))
                .await;
            assert!(transport.is_closed());
            // Keep the endpoint alive until the close is delivered.
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let client = ClientEndpoint::new().expect("client");
        let transport = client.connect(addr).await.expect("connect");
        assert_eq!(transport.receive().await.expect("first frame"), b"hello client");
        transport.send(b"hello server".to_vec()).await.expect("send");

        match transport.receive().await {
            Err(TransportError::Closed { reason: Some(reason) }) => {
                assert_eq!(reason, CloseReason::going_away("done"));
            }
            Err(TransportError::Closed { reason: None }) => {}
            other => panic!("expected close, got {other:?}"),
        }
        server_task.await.expect("server task");
    }

    #[tokio::test]
    async fn oversized_frames_are_refused() {
        let server = ServerEndpoint::bind_with_limit("127.0.0.1:0".parse().unwrap(), 16).expect("bind");
        let addr = server.local_addr();
        let server_task = tokio::spawn(async move {
            let transport = server.accept().await.expect("incoming").expect("accept");
            let err = transport.send(vec![0u8; 17]).await.unwrap_err();
            assert!(matches!(err, TransportError::FrameTooLarge { len: 17, max: 16 }));
            transport.send(vec![1]).await.expect("small frame");
            tokio::time::sleep(Duration::from_millis(50)).await;
        });

        let client = ClientEndpoint::new().expect("client");
        let transport = client.connect(addr).await.expect("connect");
        assert_eq!(transport.receive().await.expect("frame"), vec![1]);
        server_task.await.expect("server task");
    }
}
