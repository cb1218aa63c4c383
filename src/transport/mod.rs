//! The encrypted transport capability consumed by tunnels and pools.
//!
//! Peer discovery, NAT traversal and the encrypted handshake itself are the
//! transport node's problem; this module only defines the seam. Two
//! implementations are provided: [`memory::MemoryTransport`] pairs peers
//! inside one process, [`quic::QuicTransport`] speaks QUIC with
//! certificate-pinned peer identities.

use std::{fmt, io, rc::Rc, str::FromStr};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::Error;

pub mod memory;
pub mod quic;

/// A peer identity: the SHA-256 of the peer's self-signed certificate in DER
/// form. Displayed and parsed as 64 hex characters.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PublicKey {
    pub const SIZE: usize = 32;

    /// Derives the public key identifying a certificate.
    pub fn from_cert_der(cert_der: &[u8]) -> Self {
        let digest = Sha256::digest(cert_der);
        let mut bytes = [0u8; Self::SIZE];
        bytes.copy_from_slice(&digest);
        PublicKey(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PublicKey({})", hex::encode(self.0))
    }
}

impl FromStr for PublicKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| Error::InvalidKey(s.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidKey(s.to_string()))?;
        Ok(PublicKey(bytes))
    }
}

/// A local identity: a self-signed certificate plus its private key. The
/// public key other peers dial and pin is [`KeyPair::public`].
#[derive(Clone)]
pub struct KeyPair {
    public: PublicKey,
    cert_der: Vec<u8>,
    key_der: Vec<u8>,
}

impl KeyPair {
    /// Generates a fresh identity.
    pub fn generate() -> io::Result<KeyPair> {
        let cert = rcgen::generate_simple_self_signed(vec!["peerpipe".into()])
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let cert_der = cert
            .serialize_der()
            .map_err(|error| io::Error::new(io::ErrorKind::Other, error))?;
        let key_der = cert.serialize_private_key_der();

        Ok(KeyPair {
            public: PublicKey::from_cert_der(&cert_der),
            cert_der,
            key_der,
        })
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "KeyPair({})", self.public)
    }
}

/// Decides whether an inbound connection is accepted. Receives the dialing
/// peer's public key when the transport knows it; inbound identity is best
/// effort and may legitimately be absent.
pub type Firewall = Box<dyn Fn(Option<&PublicKey>) -> bool>;

/// An established encrypted duplex stream to a peer.
pub trait PeerStream: AsyncRead + AsyncWrite + Unpin + 'static {
    /// The public key of the peer on the other end, when known. Inbound
    /// connections may not carry one.
    fn remote_public_key(&self) -> Option<PublicKey>;
}

/// A keypair-bound listener for inbound encrypted connections.
pub trait PeerServer {
    type Socket: PeerStream;

    /// Starts listening under the given identity. Resolves only once the
    /// server is reachable, or rejects on bind failure.
    async fn listen(&mut self, keypair: &KeyPair) -> io::Result<()>;

    /// Waits for the next inbound connection, handshake already complete.
    async fn accept(&mut self) -> io::Result<Self::Socket>;

    /// Stops listening. Established sockets are unaffected.
    async fn close(&mut self) -> io::Result<()>;
}

/// An encrypted transport node. `connect` resolves only after the handshake
/// with the remote peer completes, so a returned socket is always usable.
pub trait Transport {
    type Socket: PeerStream;
    type Server: PeerServer<Socket = Self::Socket>;

    async fn connect(&self, remote: &PublicKey, keypair: &KeyPair) -> io::Result<Self::Socket>;

    async fn create_server(&self, firewall: Option<Firewall>) -> io::Result<Self::Server>;

    /// Tears the node down. Errors are reported but callers shutting down are
    /// expected to swallow them.
    async fn destroy(&self) -> io::Result<()>;
}

/// A transport node handed to a tunnel controller, tagged with ownership.
///
/// An owned node is destroyed exactly once when the controller closes; a
/// shared node stays with the caller and is never destroyed by the controller.
pub struct NodeHandle<T> {
    node: Rc<T>,
    owned: bool,
}

impl<T> NodeHandle<T> {
    /// Wraps a node the controller should destroy at close time.
    pub fn owned(node: T) -> Self {
        NodeHandle {
            node: Rc::new(node),
            owned: true,
        }
    }

    /// Wraps a caller-owned node the controller must never destroy.
    pub fn shared(node: Rc<T>) -> Self {
        NodeHandle { node, owned: false }
    }

    pub fn node(&self) -> &Rc<T> {
        &self.node
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    pub(crate) fn into_parts(self) -> (Rc<T>, bool) {
        (self.node, self.owned)
    }
}
