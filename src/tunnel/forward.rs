//! Forward tunnel: local TCP connections are forwarded to a remote peer over
//! the encrypted transport.
//!
//! The accepted TCP socket is not read until the encrypted handshake
//! completes, so no data callbacks can fire before the remote leg is ready.
//! In pooled (gateway) mode sessions borrow sockets from a [`PeerPool`]
//! instead of dialing, and return them for reuse when the local side finishes
//! cleanly.

use std::{
    cell::{Cell, RefCell},
    io,
    net::{IpAddr, SocketAddr},
    rc::Rc,
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, mpsc::UnboundedReceiver, Notify},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    error::{is_benign, Error, Result},
    pool::PeerPool,
    transport::{KeyPair, NodeHandle, PeerStream, PublicKey, Transport},
    tunnel::{emit_error, pipe, registry_phase, Phase, Registry, SessionGuard, TunnelEvent},
};

pub struct ForwardTunnelOptions<T: Transport> {
    pub node: NodeHandle<T>,
    pub keypair: KeyPair,
    /// The peer every local connection is forwarded to.
    pub remote: PublicKey,
    /// Local TCP bind address. Port 0 requests an OS-assigned port; read it
    /// back through [`ForwardTunnel::listen_port`].
    pub host: String,
    pub port: u16,
    /// When set, sessions borrow pooled sockets instead of dialing a fresh
    /// connection per session.
    pub pool: Option<PeerPool<T>>,
}

/// Handle over a running forward tunnel.
pub struct ForwardTunnel<T: Transport> {
    registry: Rc<RefCell<Registry>>,
    node: Rc<T>,
    node_owned: Cell<bool>,
    close_notify: Rc<Notify>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
    listen_addr: SocketAddr,
}

enum Dial<T: Transport> {
    Direct { node: Rc<T>, keypair: KeyPair },
    Pooled(PeerPool<T>),
}

/// Binds the local TCP listener and returns the controller together with its
/// event stream. Resolves only after the bind succeeded, so the assigned
/// port is readable; rejects on bind failure.
pub async fn create_forward_tunnel<T>(
    options: ForwardTunnelOptions<T>,
) -> Result<(ForwardTunnel<T>, UnboundedReceiver<TunnelEvent>)>
where
    T: Transport + 'static,
{
    let (node, node_owned) = options.node.into_parts();

    let listener = TcpListener::bind((options.host.as_str(), options.port)).await?;
    let listen_addr = listener.local_addr()?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let registry = Registry::new(events_tx);
    let close_notify = Rc::new(Notify::new());

    let dial = Rc::new(match options.pool {
        Some(pool) => Dial::Pooled(pool),
        None => Dial::Direct {
            node: Rc::clone(&node),
            keypair: options.keypair,
        },
    });

    let accept_task = tokio::task::spawn_local(accept_loop(
        listener,
        Rc::clone(&registry),
        Rc::clone(&close_notify),
        dial,
        options.remote,
    ));

    let tunnel = ForwardTunnel {
        registry,
        node,
        node_owned: Cell::new(node_owned),
        close_notify,
        accept_task: RefCell::new(Some(accept_task)),
        listen_addr,
    };

    Ok((tunnel, events_rx))
}

impl<T: Transport> ForwardTunnel<T> {
    /// The exact number of sessions currently piping.
    pub fn connections(&self) -> usize {
        self.registry.borrow().connections
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn listen_host(&self) -> IpAddr {
        self.listen_addr.ip()
    }

    pub fn listen_port(&self) -> u16 {
        self.listen_addr.port()
    }

    /// Tears the tunnel down: stops accepting, destroys every tracked socket
    /// on both legs, and destroys the node if this controller owns it.
    /// Idempotent; teardown errors are swallowed.
    pub async fn close(&self) {
        {
            let mut registry = self.registry.borrow_mut();
            if registry.phase != Phase::Open {
                return;
            }
            registry.phase = Phase::Closing;
        }

        self.close_notify.notify_one();
        if let Some(task) = self.accept_task.borrow_mut().take() {
            let _ = task.await;
        }

        let sessions = self.registry.borrow_mut().drain_sessions();
        for session in sessions {
            session.abort();
            let _ = session.await;
        }

        if self.node_owned.replace(false) {
            let _ = self.node.destroy().await;
        }

        self.registry.borrow_mut().phase = Phase::Closed;
    }
}

async fn accept_loop<T: Transport + 'static>(
    listener: TcpListener,
    registry: Rc<RefCell<Registry>>,
    close_notify: Rc<Notify>,
    dial: Rc<Dial<T>>,
    remote: PublicKey,
) {
    loop {
        let tcp = tokio::select! {
            _ = close_notify.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((tcp, _from)) => tcp,
                Err(error) => {
                    emit_error(&registry, Error::Io(error));
                    continue;
                }
            },
        };

        if registry_phase(&registry) != Phase::Open {
            // Late accept during teardown: destroyed, never piped.
            continue;
        }

        let id = registry.borrow_mut().next_session_id();
        let handle = tokio::task::spawn_local({
            let registry = Rc::clone(&registry);
            let dial = Rc::clone(&dial);
            async move {
                run_session(Rc::clone(&registry), tcp, dial, remote).await;
                registry.borrow_mut().remove_session(id);
            }
        });
        registry.borrow_mut().insert_session(id, handle);
    }

    // Dropping the listener closes the TCP server.
}

async fn run_session<T: Transport + 'static>(
    registry: Rc<RefCell<Registry>>,
    tcp: TcpStream,
    dial: Rc<Dial<T>>,
    remote: PublicKey,
) {
    match dial.as_ref() {
        Dial::Direct { node, keypair } => run_direct_session(registry, tcp, Rc::clone(node), keypair, remote).await,
        Dial::Pooled(pool) => run_pooled_session(registry, tcp, pool, remote).await,
    }
}

async fn run_direct_session<T: Transport>(
    registry: Rc<RefCell<Registry>>,
    tcp: TcpStream,
    node: Rc<T>,
    keypair: &KeyPair,
    remote: PublicKey,
) {
    // The TCP socket stays unread until the handshake resolves.
    let peer = node.connect(&remote, keypair).await;

    if registry_phase(&registry) != Phase::Open {
        // Closed while dialing; both legs are dropped without piping.
        return;
    }

    let peer = match peer {
        Ok(peer) => peer,
        Err(source) => {
            emit_error(&registry, Error::PeerConnect(source));
            return;
        }
    };

    let mut guard = SessionGuard::new(Rc::clone(&registry));
    guard.mark_connected(peer.remote_public_key().or(Some(remote)));

    match pipe(tcp, peer).await {
        Ok((sent, received)) => debug!("session ended after {sent} bytes sent and {received} bytes received"),
        Err(error) if is_benign(&error) => debug!("session ended: {error}"),
        Err(error) => emit_error(&registry, Error::Io(error)),
    }
}

/// How long the remote direction may stay quiet, once the local side has
/// finished sending, before the exchange counts as complete.
const POOLED_SETTLE_GRACE: Duration = Duration::from_millis(200);

enum RemoteLeg {
    /// The exchange went quiet after local EOF; the socket is reusable.
    Settled,
    /// The remote closed the stream.
    Spent,
    Failed(io::Error),
}

async fn run_pooled_session<T: Transport + 'static>(
    registry: Rc<RefCell<Registry>>,
    tcp: TcpStream,
    pool: &PeerPool<T>,
    remote: PublicKey,
) {
    let socket = pool.acquire(&remote).await;

    if registry_phase(&registry) != Phase::Open {
        if let Ok(socket) = socket {
            socket.destroy();
            pool.release(&remote, socket);
        }
        return;
    }

    let socket = match socket {
        Ok(socket) => socket,
        Err(error) => {
            emit_error(&registry, error);
            return;
        }
    };

    let mut guard = SessionGuard::new(Rc::clone(&registry));
    guard.mark_connected(socket.remote_public_key().or(Some(remote)));

    let mut tcp = tcp;
    let (mut tcp_read, mut tcp_write) = tcp.split();
    let mut peer_write = socket.clone();
    let mut peer_read = socket.clone();
    let local_done = Cell::new(false);

    // The pooled socket is never shut down from this side; it goes back to
    // the pool unless the remote direction terminated it.
    let downstream = async {
        let mut buf = [0u8; 8 * 1024];
        loop {
            let read = match tokio::time::timeout(POOLED_SETTLE_GRACE, peer_read.read(&mut buf)).await {
                Ok(read) => read,
                Err(_) if local_done.get() => return RemoteLeg::Settled,
                Err(_) => continue,
            };

            match read {
                Ok(0) => return RemoteLeg::Spent,
                Ok(read) => {
                    if let Err(error) = tcp_write.write_all(&buf[..read]).await {
                        return RemoteLeg::Failed(error);
                    }
                }
                Err(error) => return RemoteLeg::Failed(error),
            }
        }
    };
    tokio::pin!(downstream);

    let reusable = tokio::select! {
        upstream = tokio::io::copy(&mut tcp_read, &mut peer_write) => match upstream {
            Ok(sent) => {
                debug!("local side finished after {sent} bytes sent");
                local_done.set(true);

                // The response may still be in flight after a local
                // half-close; keep the remote direction running until it
                // settles.
                match downstream.await {
                    RemoteLeg::Settled => true,
                    RemoteLeg::Spent => false,
                    RemoteLeg::Failed(error) => {
                        if !is_benign(&error) {
                            emit_error(&registry, Error::Io(error));
                        }
                        false
                    }
                }
            }
            Err(error) => {
                if !is_benign(&error) {
                    emit_error(&registry, Error::Io(error));
                }
                false
            }
        },
        outcome = &mut downstream => {
            match outcome {
                RemoteLeg::Spent => debug!("remote closed the pooled session"),
                RemoteLeg::Settled => {}
                RemoteLeg::Failed(error) if is_benign(&error) => debug!("pooled session ended: {error}"),
                RemoteLeg::Failed(error) => emit_error(&registry, Error::Io(error)),
            }
            false
        }
    };

    if !reusable {
        socket.destroy();
    }
    pool.release(&remote, socket);
}

#[cfg(test)]
mod tests {
    use std::{rc::Rc, time::Duration};

    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    };

    use crate::{
        pool::{PeerPool, PoolOptions},
        test_utils::{run_local, spawn_peer_echo, spawn_peer_echo_with_delay, spawn_tcp_echo},
        transport::{memory::MemoryTransport, KeyPair, NodeHandle},
        tunnel::{
            reverse::{create_reverse_tunnel, ReverseTunnelOptions},
            TunnelEvent,
        },
    };

    use super::{create_forward_tunnel, ForwardTunnelOptions};

    fn forward_options(
        transport: &MemoryTransport,
        remote: crate::PublicKey,
        pool: Option<PeerPool<MemoryTransport>>,
    ) -> ForwardTunnelOptions<MemoryTransport> {
        ForwardTunnelOptions {
            node: NodeHandle::shared(Rc::new(transport.clone())),
            keypair: KeyPair::generate().unwrap(),
            remote,
            host: "127.0.0.1".to_string(),
            port: 0,
            pool,
        }
    }

    #[test]
    fn ephemeral_port_is_read_back() {
        run_local(async {
            let transport = MemoryTransport::new();
            let remote = KeyPair::generate().unwrap().public();

            let (tunnel, _events) = create_forward_tunnel(forward_options(&transport, remote, None))
                .await
                .unwrap();

            assert_ne!(tunnel.listen_port(), 0);
            assert!(tunnel.listen_host().is_loopback());
            tunnel.close().await;
        });
    }

    #[test]
    fn end_to_end_through_both_tunnels() {
        run_local(async {
            // Handshake latency also proves bytes written before the remote
            // leg is ready are not read early and arrive intact.
            let transport = MemoryTransport::with_latency(Duration::from_millis(20));
            let server_keys = KeyPair::generate().unwrap();
            let (echo_addr, _echo) = spawn_tcp_echo().await;

            let (reverse, mut reverse_events) = create_reverse_tunnel(ReverseTunnelOptions {
                node: NodeHandle::shared(Rc::new(transport.clone())),
                keypair: server_keys.clone(),
                host: echo_addr.ip().to_string(),
                port: echo_addr.port(),
                firewall: None,
            })
            .await
            .unwrap();

            let (forward, mut forward_events) =
                create_forward_tunnel(forward_options(&transport, server_keys.public(), None))
                    .await
                    .unwrap();

            let mut client = TcpStream::connect(forward.listen_addr()).await.unwrap();
            client.write_all(b"ping pong").await.unwrap();
            let mut buf = [0u8; 9];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping pong");

            match forward_events.recv().await.unwrap() {
                TunnelEvent::Connect { active_connections, .. } => assert_eq!(active_connections, 1),
                other => panic!("expected Connect, got {other:?}"),
            }
            assert!(matches!(reverse_events.recv().await.unwrap(), TunnelEvent::Connect { .. }));

            drop(client);
            assert!(matches!(
                forward_events.recv().await.unwrap(),
                TunnelEvent::Disconnect { active_connections: 0 }
            ));
            assert!(matches!(
                reverse_events.recv().await.unwrap(),
                TunnelEvent::Disconnect { active_connections: 0 }
            ));

            assert_eq!(forward.connections(), 0);
            assert_eq!(reverse.connections(), 0);

            forward.close().await;
            reverse.close().await;
        });
    }

    #[test]
    fn double_close_destroys_an_owned_node_once() {
        run_local(async {
            let transport = MemoryTransport::new();
            let remote = KeyPair::generate().unwrap().public();

            let (tunnel, _events) = create_forward_tunnel(ForwardTunnelOptions {
                node: NodeHandle::owned(transport.clone()),
                keypair: KeyPair::generate().unwrap(),
                remote,
                host: "127.0.0.1".to_string(),
                port: 0,
                pool: None,
            })
            .await
            .unwrap();

            tunnel.close().await;
            tunnel.close().await;
            assert_eq!(transport.destroy_count(), 1);
        });
    }

    #[test]
    fn close_during_dial_never_connects() {
        run_local(async {
            let transport = MemoryTransport::with_latency(Duration::from_millis(50));
            let server_keys = KeyPair::generate().unwrap();
            spawn_peer_echo(transport.clone(), server_keys.clone()).await;

            let (tunnel, mut events) =
                create_forward_tunnel(forward_options(&transport, server_keys.public(), None))
                    .await
                    .unwrap();

            let mut client = TcpStream::connect(tunnel.listen_addr()).await.unwrap();
            client.write_all(b"early").await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;

            tunnel.close().await;
            assert_eq!(tunnel.connections(), 0);

            // The session never connected, so no events were emitted.
            assert!(events.try_recv().is_err());

            // The local leg was dropped; depending on unread buffered data
            // this surfaces as EOF or a reset.
            let mut buf = [0u8; 1];
            assert!(matches!(client.read(&mut buf).await, Ok(0) | Err(_)));
        });
    }

    #[test]
    fn dial_failure_emits_an_error() {
        run_local(async {
            let transport = MemoryTransport::new();
            let nobody = KeyPair::generate().unwrap().public();

            let (tunnel, mut events) = create_forward_tunnel(forward_options(&transport, nobody, None))
                .await
                .unwrap();

            let _client = TcpStream::connect(tunnel.listen_addr()).await.unwrap();

            match events.recv().await.unwrap() {
                TunnelEvent::Error(crate::Error::PeerConnect(_)) => {}
                other => panic!("expected PeerConnect error, got {other:?}"),
            }
            assert_eq!(tunnel.connections(), 0);
            tunnel.close().await;
        });
    }

    #[test]
    fn pooled_sessions_reuse_the_socket() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let remote = server_keys.public();
            spawn_peer_echo(transport.clone(), server_keys).await;

            let pool = PeerPool::new(
                Rc::new(transport.clone()),
                KeyPair::generate().unwrap(),
                PoolOptions::default(),
            );

            let (tunnel, mut events) =
                create_forward_tunnel(forward_options(&transport, remote, Some(pool.clone())))
                    .await
                    .unwrap();

            for round in 0..2u8 {
                let mut client = TcpStream::connect(tunnel.listen_addr()).await.unwrap();
                let payload = [b'a' + round; 4];
                client.write_all(&payload).await.unwrap();
                let mut buf = [0u8; 4];
                client.read_exact(&mut buf).await.unwrap();
                assert_eq!(buf, payload);

                assert!(matches!(events.recv().await.unwrap(), TunnelEvent::Connect { .. }));

                // Half-close from the local side ends the session cleanly.
                client.shutdown().await.unwrap();
                assert!(matches!(events.recv().await.unwrap(), TunnelEvent::Disconnect { .. }));
            }

            // Both sessions rode one pooled connection.
            assert_eq!(transport.connect_count(), 1);

            tunnel.close().await;
            pool.close();
        });
    }

    #[test]
    fn pooled_response_survives_local_half_close() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let remote = server_keys.public();
            spawn_peer_echo_with_delay(transport.clone(), server_keys, Duration::from_millis(50)).await;

            let pool = PeerPool::new(
                Rc::new(transport.clone()),
                KeyPair::generate().unwrap(),
                PoolOptions::default(),
            );

            let (tunnel, _events) =
                create_forward_tunnel(forward_options(&transport, remote, Some(pool.clone())))
                    .await
                    .unwrap();

            // The response is still in flight when the local side half-closes.
            let mut client = TcpStream::connect(tunnel.listen_addr()).await.unwrap();
            client.write_all(b"ping").await.unwrap();
            client.shutdown().await.unwrap();

            let mut buf = [0u8; 4];
            client.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"ping");

            tunnel.close().await;
            pool.close();
        });
    }
}
