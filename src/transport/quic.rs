//! A QUIC-backed transport node.
//!
//! Peers are dialed over plain UDP addresses from a static address book; the
//! remote identity is authenticated by certificate pinning (the presented
//! certificate's SHA-256 must equal the dialed public key). DHT discovery and
//! NAT traversal stay outside this crate.

use std::{
    cell::{Cell, RefCell},
    collections::HashMap,
    fmt, io,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use quinn::{
    ClientConfig, Connection, Endpoint, EndpointConfig, IdleTimeout, RecvStream, SendStream,
    ServerConfig, TokioRuntime, TransportConfig, VarInt,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::{Firewall, KeyPair, PeerServer, PeerStream, PublicKey, Transport};

pub const KEEPALIVE_INTERVAL_PERIOD_MILLIS: u64 = 1000;
pub const MAX_IDLE_TIMEOUT_MILLIS: u32 = 4000;

/// Opening a bidirectional stream is invisible to the peer until data flows,
/// so each side of a fresh socket exchanges one marker byte.
const STREAM_OPEN_MARKER: u8 = 0x01;

fn other_error<E: std::fmt::Display>(error: E) -> io::Error {
    io::Error::new(io::ErrorKind::Other, error.to_string())
}

/// An encrypted transport node speaking QUIC. Each `connect` establishes a
/// fresh connection carrying a single bidirectional stream.
pub struct QuicTransport {
    endpoint: Endpoint,
    peers: RefCell<HashMap<PublicKey, SocketAddr>>,
    destroyed: Cell<bool>,
}

impl QuicTransport {
    /// Binds a UDP socket and creates the endpoint around it.
    pub fn new(bind_address: SocketAddr) -> io::Result<QuicTransport> {
        let socket = std::net::UdpSocket::bind(bind_address)?;
        let endpoint = Endpoint::new(EndpointConfig::default(), None, socket, Arc::new(TokioRuntime))?;

        Ok(QuicTransport {
            endpoint,
            peers: RefCell::new(HashMap::new()),
            destroyed: Cell::new(false),
        })
    }

    /// Records the UDP address a public key is reachable at.
    pub fn add_peer(&self, key: PublicKey, address: SocketAddr) {
        self.peers.borrow_mut().insert(key, address);
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.endpoint.local_addr()
    }
}

fn transport_config() -> TransportConfig {
    let mut config = TransportConfig::default();
    config.max_concurrent_uni_streams(0_u8.into());
    config.keep_alive_interval(Some(Duration::from_millis(KEEPALIVE_INTERVAL_PERIOD_MILLIS)));
    config.max_idle_timeout(Some(IdleTimeout::from(VarInt::from_u32(MAX_IDLE_TIMEOUT_MILLIS))));
    config
}

fn configure_client(expected: PublicKey) -> ClientConfig {
    let crypto = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(PinnedCertVerification::new(expected))
        .with_no_client_auth();

    let mut client_config = ClientConfig::new(Arc::new(crypto));
    client_config.transport_config(Arc::new(transport_config()));
    client_config
}

fn configure_server(keypair: &KeyPair) -> io::Result<ServerConfig> {
    let cert_chain = vec![rustls::Certificate(keypair.cert_der().to_vec())];
    let priv_key = rustls::PrivateKey(keypair.key_der().to_vec());

    let mut server_config = ServerConfig::with_single_cert(cert_chain, priv_key).map_err(other_error)?;
    server_config.transport_config(Arc::new(transport_config()));
    Ok(server_config)
}

impl Transport for QuicTransport {
    type Socket = QuicStream;
    type Server = QuicServer;

    async fn connect(&self, remote: &PublicKey, _keypair: &KeyPair) -> io::Result<Self::Socket> {
        if self.destroyed.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "node is destroyed"));
        }

        let address = self.peers.borrow().get(remote).copied().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no known address for peer {remote}"),
            )
        })?;

        let connecting = self
            .endpoint
            .connect_with(configure_client(*remote), address, "peerpipe")
            .map_err(other_error)?;
        let connection = connecting.await.map_err(other_error)?;

        let (mut send, recv) = connection.open_bi().await.map_err(other_error)?;
        AsyncWriteExt::write_all(&mut send, &[STREAM_OPEN_MARKER]).await?;

        Ok(QuicStream {
            send,
            recv,
            remote: Some(*remote),
            _connection: connection,
        })
    }

    async fn create_server(&self, firewall: Option<Firewall>) -> io::Result<Self::Server> {
        if self.destroyed.get() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "node is destroyed"));
        }

        Ok(QuicServer {
            endpoint: self.endpoint.clone(),
            firewall,
            listening: false,
        })
    }

    async fn destroy(&self) -> io::Result<()> {
        if self.destroyed.replace(true) {
            return Ok(());
        }

        self.endpoint.close(VarInt::from_u32(0), b"node destroyed");
        self.endpoint.wait_idle().await;
        Ok(())
    }
}

/// A single encrypted stream riding its own QUIC connection.
pub struct QuicStream {
    send: SendStream,
    recv: RecvStream,
    remote: Option<PublicKey>,
    _connection: Connection,
}

impl fmt::Debug for QuicStream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("QuicStream").field("remote", &self.remote).finish()
    }
}

impl PeerStream for QuicStream {
    fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote
    }
}

impl AsyncRead for QuicStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf) -> Poll<io::Result<()>> {
        Pin::new(&mut self.recv).poll_read(cx, buf)
    }
}

impl AsyncWrite for QuicStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.send).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.send).poll_shutdown(cx)
    }
}

pub struct QuicServer {
    endpoint: Endpoint,
    firewall: Option<Firewall>,
    listening: bool,
}

impl PeerServer for QuicServer {
    type Socket = QuicStream;

    async fn listen(&mut self, keypair: &KeyPair) -> io::Result<()> {
        self.endpoint.set_server_config(Some(configure_server(keypair)?));
        self.listening = true;
        Ok(())
    }

    async fn accept(&mut self) -> io::Result<Self::Socket> {
        if !self.listening {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "server is not listening"));
        }

        loop {
            let connecting = match self.endpoint.accept().await {
                Some(connecting) => connecting,
                None => return Err(io::Error::new(io::ErrorKind::BrokenPipe, "endpoint closed")),
            };

            // Clients do not present certificates, so inbound identity is
            // unavailable; the firewall decides on None.
            if let Some(firewall) = self.firewall.as_ref() {
                if !firewall(None) {
                    continue;
                }
            }

            let connection = match connecting.await {
                Ok(connection) => connection,
                Err(error) => {
                    tracing::debug!("inbound connection failed during handshake: {error}");
                    continue;
                }
            };

            let (send, mut recv) = match connection.accept_bi().await {
                Ok(streams) => streams,
                Err(error) => {
                    tracing::debug!("inbound connection closed before opening a stream: {error}");
                    continue;
                }
            };

            let mut marker = [0u8; 1];
            if let Err(error) = AsyncReadExt::read_exact(&mut recv, &mut marker).await {
                tracing::debug!("inbound stream ended before the open marker arrived: {error}");
                continue;
            }

            return Ok(QuicStream {
                send,
                recv,
                remote: None,
                _connection: connection,
            });
        }
    }

    async fn close(&mut self) -> io::Result<()> {
        self.endpoint.set_server_config(None);
        self.listening = false;
        Ok(())
    }
}

struct PinnedCertVerification {
    expected: PublicKey,
}

impl PinnedCertVerification {
    fn new(expected: PublicKey) -> Arc<Self> {
        Arc::new(PinnedCertVerification { expected })
    }
}

impl rustls::client::ServerCertVerifier for PinnedCertVerification {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        match PublicKey::from_cert_der(&end_entity.0) == self.expected {
            true => Ok(rustls::client::ServerCertVerified::assertion()),
            false => Err(rustls::Error::InvalidCertificate(
                rustls::CertificateError::ApplicationVerificationFailure,
            )),
        }
    }
}
