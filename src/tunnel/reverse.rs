//! Reverse tunnel: peer-initiated encrypted connections are forwarded to a
//! local TCP service.
//!
//! Per accepted connection the session runs `accepted → dialing-local →
//! piping → closed`; a connection that arrives or resolves after the
//! controller closed is destroyed without being piped.

use std::{
    cell::{Cell, RefCell},
    rc::Rc,
};

use tokio::{
    net::TcpStream,
    sync::{mpsc, mpsc::UnboundedReceiver, Notify},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    error::{is_benign, Error, Result},
    transport::{Firewall, KeyPair, NodeHandle, PeerServer, PeerStream, Transport},
    tunnel::{emit_error, pipe, registry_phase, Phase, Registry, SessionGuard, TunnelEvent},
};

pub struct ReverseTunnelOptions<T> {
    pub node: NodeHandle<T>,
    pub keypair: KeyPair,
    /// Local TCP service the tunnel forwards inbound connections to.
    pub host: String,
    pub port: u16,
    /// Optional gate for inbound peers.
    pub firewall: Option<Firewall>,
}

/// Handle over a running reverse tunnel. Dropped sessions and repeated
/// `close` calls are both safe; see [`ReverseTunnel::close`].
pub struct ReverseTunnel<T: Transport> {
    registry: Rc<RefCell<Registry>>,
    node: Rc<T>,
    node_owned: Cell<bool>,
    close_notify: Rc<Notify>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
}

/// Creates a server bound to the keypair, starts listening, and returns the
/// controller together with its event stream. Rejects on listen failure.
pub async fn create_reverse_tunnel<T>(
    options: ReverseTunnelOptions<T>,
) -> Result<(ReverseTunnel<T>, UnboundedReceiver<TunnelEvent>)>
where
    T: Transport + 'static,
    T::Server: 'static,
{
    let (node, node_owned) = options.node.into_parts();

    let mut server = node.create_server(options.firewall).await?;
    server.listen(&options.keypair).await?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let registry = Registry::new(events_tx);
    let close_notify = Rc::new(Notify::new());
    let target = Rc::new((options.host, options.port));

    let accept_task = tokio::task::spawn_local(accept_loop(
        server,
        Rc::clone(&registry),
        Rc::clone(&close_notify),
        target,
    ));

    let tunnel = ReverseTunnel {
        registry,
        node,
        node_owned: Cell::new(node_owned),
        close_notify,
        accept_task: RefCell::new(Some(accept_task)),
    };

    Ok((tunnel, events_rx))
}

impl<T: Transport> ReverseTunnel<T> {
    /// The exact number of sessions currently piping.
    pub fn connections(&self) -> usize {
        self.registry.borrow().connections
    }

    /// Tears the tunnel down: stops accepting, destroys every tracked socket
    /// on both legs, closes the server, and destroys the node if this
    /// controller owns it. Idempotent; teardown errors are swallowed.
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

async fn accept_loop<Srv: PeerServer + 'static>(
    mut server: Srv,
    registry: Rc<RefCell<Registry>>,
    close_notify: Rc<Notify>,
    target: Rc<(String, u16)>,
) {
    loop {
        let peer = tokio::select! {
            _ = close_notify.notified() => break,
            incoming = server.accept() => match incoming {
                Ok(peer) => peer,
                Err(error) => {
                    emit_error(&registry, Error::Io(error));
                    break;
                }
            },
        };

        if registry_phase(&registry) != Phase::Open {
            // Late arrival during teardown: destroyed, never piped.
            continue;
        }

        let id = registry.borrow_mut().next_session_id();
        let handle = tokio::task::spawn_local({
            let registry = Rc::clone(&registry);
            let target = Rc::clone(&target);
            async move {
                run_session(Rc::clone(&registry), peer, target).await;
                registry.borrow_mut().remove_session(id);
            }
        });
        registry.borrow_mut().insert_session(id, handle);
    }

    let _ = server.close().await;
}

async fn run_session<S: PeerStream>(registry: Rc<RefCell<Registry>>, peer: S, target: Rc<(String, u16)>) {
    let remote = peer.remote_public_key();
    let tcp = TcpStream::connect((target.0.as_str(), target.1)).await;

    if registry_phase(&registry) != Phase::Open {
        // Closed while dialing; both legs are dropped without piping.
        return;
    }

    let tcp = match tcp {
        Ok(tcp) => tcp,
        Err(source) => {
            emit_error(
                &registry,
                Error::LocalConnect {
                    host: target.0.clone(),
                    port: target.1,
                    source,
                },
            );
            return;
        }
    };

    let mut guard = SessionGuard::new(Rc::clone(&registry));
    guard.mark_connected(remote);

    match pipe(peer, tcp).await {
        Ok((received, sent)) => debug!("session ended after {sent} bytes sent and {received} bytes received"),
        Err(error) if is_benign(&error) => debug!("session ended: {error}"),
        Err(error) => emit_error(&registry, Error::Io(error)),
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::{
        error::Error,
        test_utils::{run_local, spawn_tcp_echo, unused_tcp_port},
        transport::{memory::MemoryTransport, KeyPair, NodeHandle, Transport},
        tunnel::TunnelEvent,
    };

    use super::{create_reverse_tunnel, ReverseTunnelOptions};

    #[test]
    fn session_lifecycle_counts_and_events() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let client_keys = KeyPair::generate().unwrap();
            let (echo_addr, _echo) = spawn_tcp_echo().await;

            let (tunnel, mut events) = create_reverse_tunnel(ReverseTunnelOptions {
                node: NodeHandle::shared(Rc::new(transport.clone())),
                keypair: server_keys.clone(),
                host: echo_addr.ip().to_string(),
                port: echo_addr.port(),
                firewall: None,
            })
            .await
            .unwrap();

            let mut socket = transport.connect(&server_keys.public(), &client_keys).await.unwrap();
            socket.write_all(b"hello").await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"hello");

            match events.recv().await.unwrap() {
                TunnelEvent::Connect {
                    active_connections,
                    remote_public_key,
                } => {
                    assert_eq!(active_connections, 1);
                    assert_eq!(remote_public_key, Some(client_keys.public()));
                }
                other => panic!("expected Connect, got {other:?}"),
            }
            assert_eq!(tunnel.connections(), 1);

            drop(socket);
            match events.recv().await.unwrap() {
                TunnelEvent::Disconnect { active_connections } => assert_eq!(active_connections, 0),
                other => panic!("expected Disconnect, got {other:?}"),
            }
            assert_eq!(tunnel.connections(), 0);

            tunnel.close().await;
        });
    }

    #[test]
    fn local_dial_failure_destroys_the_peer_leg() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let client_keys = KeyPair::generate().unwrap();

            let (tunnel, mut events) = create_reverse_tunnel(ReverseTunnelOptions {
                node: NodeHandle::shared(Rc::new(transport.clone())),
                keypair: server_keys.clone(),
                host: "127.0.0.1".to_string(),
                port: unused_tcp_port().await,
                firewall: None,
            })
            .await
            .unwrap();

            let mut socket = transport.connect(&server_keys.public(), &client_keys).await.unwrap();

            // No connect event; exactly one error for the failed session.
            match events.recv().await.unwrap() {
                TunnelEvent::Error(Error::LocalConnect { .. }) => {}
                other => panic!("expected LocalConnect error, got {other:?}"),
            }
            assert_eq!(tunnel.connections(), 0);

            // The inbound leg was destroyed, so the client sees EOF.
            let mut buf = [0u8; 1];
            assert_eq!(socket.read(&mut buf).await.unwrap(), 0);

            tunnel.close().await;
        });
    }

    #[test]
    fn closed_tunnel_rejects_new_connections() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let client_keys = KeyPair::generate().unwrap();
            let (echo_addr, _echo) = spawn_tcp_echo().await;

            let (tunnel, _events) = create_reverse_tunnel(ReverseTunnelOptions {
                node: NodeHandle::shared(Rc::new(transport.clone())),
                keypair: server_keys.clone(),
                host: echo_addr.ip().to_string(),
                port: echo_addr.port(),
                firewall: None,
            })
            .await
            .unwrap();

            tunnel.close().await;
            assert_eq!(tunnel.connections(), 0);

            // The server is gone, so a late dial is refused outright.
            let error = transport.connect(&server_keys.public(), &client_keys).await.unwrap_err();
            assert_eq!(error.kind(), std::io::ErrorKind::ConnectionRefused);
        });
    }

    #[test]
    fn close_is_idempotent_and_destroys_an_owned_node_once() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let (echo_addr, _echo) = spawn_tcp_echo().await;

            let (tunnel, _events) = create_reverse_tunnel(ReverseTunnelOptions {
                node: NodeHandle::owned(transport.clone()),
                keypair: server_keys,
                host: echo_addr.ip().to_string(),
                port: echo_addr.port(),
                firewall: None,
            })
            .await
            .unwrap();

            tunnel.close().await;
            tunnel.close().await;
            assert_eq!(transport.destroy_count(), 1);
        });
    }

    #[test]
    fn shared_nodes_are_never_destroyed() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let (echo_addr, _echo) = spawn_tcp_echo().await;

            let (tunnel, _events) = create_reverse_tunnel(ReverseTunnelOptions {
                node: NodeHandle::shared(Rc::new(transport.clone())),
                keypair: server_keys,
                host: echo_addr.ip().to_string(),
                port: echo_addr.port(),
                firewall: None,
            })
            .await
            .unwrap();

            tunnel.close().await;
            assert_eq!(transport.destroy_count(), 0);
        });
    }

    #[test]
    fn close_settles_in_flight_sessions() {
        run_local(async {
            let transport = MemoryTransport::new();
            let server_keys = KeyPair::generate().unwrap();
            let client_keys = KeyPair::generate().unwrap();
            let (echo_addr, _echo) = spawn_tcp_echo().await;

            let (tunnel, mut events) = create_reverse_tunnel(ReverseTunnelOptions {
                node: NodeHandle::shared(Rc::new(transport.clone())),
                keypair: server_keys.clone(),
                host: echo_addr.ip().to_string(),
                port: echo_addr.port(),
                firewall: None,
            })
            .await
            .unwrap();

            let mut socket = transport.connect(&server_keys.public(), &client_keys).await.unwrap();
            socket.write_all(b"hi").await.unwrap();
            let mut buf = [0u8; 2];
            socket.read_exact(&mut buf).await.unwrap();

            assert!(matches!(events.recv().await.unwrap(), TunnelEvent::Connect { .. }));
            assert_eq!(tunnel.connections(), 1);

            tunnel.close().await;
            assert_eq!(tunnel.connections(), 0);
            match events.recv().await.unwrap() {
                TunnelEvent::Disconnect { active_connections } => assert_eq!(active_connections, 0),
                other => panic!("expected Disconnect, got {other:?}"),
            }
        });
    }
}
