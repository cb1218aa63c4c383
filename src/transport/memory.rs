//! An in-process transport: a hub pairs `connect` calls with registered
//! servers over [`tokio::io::duplex`] pipes. Used by the test suite and for
//! loopback composition; the "handshake" is instantaneous unless an artificial
//! latency is configured.

use std::{
    cell::RefCell,
    collections::HashMap,
    io,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll},
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

use super::{Firewall, KeyPair, PeerServer, PeerStream, PublicKey, Transport};

const PIPE_CAPACITY: usize = 64 * 1024;

struct Registration {
    tx: UnboundedSender<MemoryStream>,
    firewall: Option<Firewall>,
}

struct Hub {
    servers: HashMap<PublicKey, Registration>,
    destroyed: bool,
    connects: usize,
    destroys: usize,
}

/// An in-process transport node. Clones share the same hub, so one clone can
/// listen while another dials it.
#[derive(Clone)]
pub struct MemoryTransport {
    hub: Rc<RefCell<Hub>>,
    latency: Option<Duration>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        MemoryTransport {
            hub: Rc::new(RefCell::new(Hub {
                servers: HashMap::new(),
                destroyed: false,
                connects: 0,
                destroys: 0,
            })),
            latency: None,
        }
    }

    /// Makes every `connect` take at least `latency` before the handshake
    /// resolves, so close-during-dial races can be exercised.
    pub fn with_latency(latency: Duration) -> Self {
        MemoryTransport {
            latency: Some(latency),
            ..MemoryTransport::new()
        }
    }

    /// How many outbound connections completed a handshake on this hub.
    pub fn connect_count(&self) -> usize {
        self.hub.borrow().connects
    }

    /// How many times `destroy` ran on this hub.
    pub fn destroy_count(&self) -> usize {
        self.hub.borrow().destroys
    }
}

impl Default for MemoryTransport {
    fn default() -> Self {
        MemoryTransport::new()
    }
}

impl Transport for MemoryTransport {
    type Socket = MemoryStream;
    type Server = MemoryServer;

    async fn connect(&self, remote: &PublicKey, keypair: &KeyPair) -> io::Result<Self::Socket> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let hub = self.hub.borrow();
        if hub.destroyed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "node is destroyed"));
        }

        let registration = hub.servers.get(remote).ok_or_else(|| {
            io::Error::new(io::ErrorKind::ConnectionRefused, format!("no peer listening as {remote}"))
        })?;

        if let Some(firewall) = registration.firewall.as_ref() {
            if !firewall(Some(&keypair.public())) {
                return Err(io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "connection rejected by remote firewall",
                ));
            }
        }

        let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);
        let inbound = MemoryStream {
            io: server_io,
            remote: Some(keypair.public()),
        };

        registration.tx.send(inbound).map_err(|_| {
            io::Error::new(io::ErrorKind::ConnectionRefused, "remote server is gone")
        })?;

        drop(hub);
        self.hub.borrow_mut().connects += 1;

        Ok(MemoryStream {
            io: client_io,
            remote: Some(*remote),
        })
    }

    async fn create_server(&self, firewall: Option<Firewall>) -> io::Result<Self::Server> {
        if self.hub.borrow().destroyed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "node is destroyed"));
        }

        Ok(MemoryServer {
            hub: Rc::clone(&self.hub),
            firewall,
            key: None,
            rx: None,
        })
    }

    async fn destroy(&self) -> io::Result<()> {
        let mut hub = self.hub.borrow_mut();
        hub.destroyed = true;
        hub.destroys += 1;
        hub.servers.clear();
        Ok(())
    }
}

/// One side of an in-process encrypted stream.
#[derive(Debug)]
pub struct MemoryStream {
    io: DuplexStream,
    remote: Option<PublicKey>,
}

impl PeerStream for MemoryStream {
    fn remote_public_key(&self) -> Option<PublicKey> {
        self.remote
    }
}

impl AsyncRead for MemoryStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for MemoryStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

pub struct MemoryServer {
    hub: Rc<RefCell<Hub>>,
    firewall: Option<Firewall>,
    key: Option<PublicKey>,
    rx: Option<UnboundedReceiver<MemoryStream>>,
}

impl PeerServer for MemoryServer {
    type Socket = MemoryStream;

    async fn listen(&mut self, keypair: &KeyPair) -> io::Result<()> {
        let mut hub = self.hub.borrow_mut();
        if hub.destroyed {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "node is destroyed"));
        }

        let key = keypair.public();
        if hub.servers.contains_key(&key) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("a server is already listening as {key}"),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        hub.servers.insert(
            key,
            Registration {
                tx,
                firewall: self.firewall.take(),
            },
        );
        self.key = Some(key);
        self.rx = Some(rx);
        Ok(())
    }

    async fn accept(&mut self) -> io::Result<Self::Socket> {
        let rx = self
            .rx
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server is not listening"))?;

        rx.recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "server closed"))
    }

    async fn close(&mut self) -> io::Result<()> {
        if let Some(key) = self.key.take() {
            self.hub.borrow_mut().servers.remove(&key);
        }
        self.rx = None;
        Ok(())
    }
}
