//! Tunnel controllers bridging TCP sockets to encrypted peer sockets.
//!
//! A [reverse tunnel](reverse) forwards peer-initiated encrypted connections
//! to a local TCP service; a [forward tunnel](forward) forwards local TCP
//! connections to a remote peer. Both track per-session lifecycle and an
//! exact aggregate connection count, and report through a single typed event
//! channel.

use std::{cell::RefCell, collections::HashMap, io, rc::Rc};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    sync::mpsc::UnboundedSender,
    task::JoinHandle,
    try_join,
};

use crate::{error::Error, transport::PublicKey};

pub mod forward;
pub mod reverse;

/// Lifecycle notifications emitted by a tunnel controller.
///
/// Per session, `Connect` fires at most once, `Disconnect` fires at most once
/// and only after that session's `Connect`. `active_connections` carries the
/// exact live count after the transition, so 0→1 and 1→0 edges are observable
/// without per-connection bookkeeping on the consumer side.
#[derive(Debug)]
pub enum TunnelEvent {
    Connect {
        active_connections: usize,
        /// The peer on the other end, when the transport knows it.
        remote_public_key: Option<PublicKey>,
    },
    Disconnect {
        active_connections: usize,
    },
    /// A session-level failure. The tunnel itself keeps running; the consumer
    /// decides whether it is fatal.
    Error(Error),
}

/// Controller lifecycle. Checked after every suspension point so an in-flight
/// dial that raced a concurrent `close` never adopts fresh sockets.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Phase {
    Open,
    Closing,
    Closed,
}

/// State shared between a controller handle, its accept loop and its
/// sessions. All mutation happens synchronously on the single-threaded
/// runtime; no borrow is ever held across an await.
pub(crate) struct Registry {
    pub phase: Phase,
    pub connections: usize,
    next_id: u64,
    sessions: HashMap<u64, JoinHandle<()>>,
    events: UnboundedSender<TunnelEvent>,
}

impl Registry {
    pub fn new(events: UnboundedSender<TunnelEvent>) -> Rc<RefCell<Registry>> {
        Rc::new(RefCell::new(Registry {
            phase: Phase::Open,
            connections: 0,
            next_id: 0,
            sessions: HashMap::new(),
            events,
        }))
    }

    pub fn emit(&self, event: TunnelEvent) {
        // The consumer may have dropped the receiver; events are best effort.
        let _ = self.events.send(event);
    }

    pub fn next_session_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn insert_session(&mut self, id: u64, handle: JoinHandle<()>) {
        self.sessions.insert(id, handle);
    }

    pub fn remove_session(&mut self, id: u64) {
        self.sessions.remove(&id);
    }

    pub fn drain_sessions(&mut self) -> Vec<JoinHandle<()>> {
        self.sessions.drain().map(|(_, handle)| handle).collect()
    }
}

pub(crate) fn registry_phase(registry: &Rc<RefCell<Registry>>) -> Phase {
    registry.borrow().phase
}

pub(crate) fn emit_error(registry: &Rc<RefCell<Registry>>, error: Error) {
    registry.borrow().emit(TunnelEvent::Error(error));
}

/// Settles a session's accounting exactly once.
///
/// `mark_connected` increments the aggregate count and emits `Connect`; the
/// guard's `Drop` performs the matching decrement and `Disconnect`, which
/// also covers sessions aborted mid-pipe by `close`. A guard that never
/// connected settles nothing.
pub(crate) struct SessionGuard {
    registry: Rc<RefCell<Registry>>,
    connected: bool,
}

impl SessionGuard {
    pub fn new(registry: Rc<RefCell<Registry>>) -> Self {
        SessionGuard {
            registry,
            connected: false,
        }
    }

    pub fn mark_connected(&mut self, remote_public_key: Option<PublicKey>) {
        let mut registry = self.registry.borrow_mut();
        registry.connections += 1;
        self.connected = true;
        let active_connections = registry.connections;
        registry.emit(TunnelEvent::Connect {
            active_connections,
            remote_public_key,
        });
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.connected {
            return;
        }

        let mut registry = self.registry.borrow_mut();
        registry.connections -= 1;
        let active_connections = registry.connections;
        registry.emit(TunnelEvent::Disconnect { active_connections });
    }
}

/// Pipes two duplex streams into each other until both directions finish.
///
/// EOF on one side shuts down the other side's write half so half-close
/// propagates; an error on either side ends the join early and both streams
/// are dropped (destroyed) when the caller returns. Yields the byte counts
/// (a→b, b→a).
pub(crate) async fn pipe<A, B>(a: A, b: B) -> io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    try_join!(
        async {
            let sent = tokio::io::copy(&mut a_read, &mut b_write).await?;
            b_write.shutdown().await?;
            Ok::<u64, io::Error>(sent)
        },
        async {
            let received = tokio::io::copy(&mut b_read, &mut a_write).await?;
            a_write.shutdown().await?;
            Ok::<u64, io::Error>(received)
        },
    )
}
