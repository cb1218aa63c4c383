//! A keyed cache of reusable encrypted sockets.
//!
//! Sockets are indexed by the hex-encoded remote public key. Each key may
//! hold several entries, but an entry is handed out to at most one borrower
//! at a time: a concurrent `acquire` for a key whose entries are all busy
//! dials an independent connection instead of serializing unrelated sessions
//! through one socket. Idle entries are destroyed after a fixed timeout
//! unless reacquired first, or as soon as their remote closes while they
//! wait.

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
    io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf},
    task::JoinHandle,
};
use tracing::debug;

use crate::{
    error::{Error, Result},
    transport::{KeyPair, PeerStream, PublicKey, Transport},
};

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// How long a released socket may sit idle before it is destroyed.
    pub idle_timeout: Duration,

    /// Optional cap on concurrent connections per peer. When every entry for
    /// a key is busy and the cap is reached, `acquire` fails with
    /// [`Error::PeerBusy`] instead of dialing another socket. `None` keeps
    /// the availability-first behavior of dialing without bound.
    pub max_per_key: Option<usize>,
}

impl Default for PoolOptions {
    fn default() -> Self {
        PoolOptions {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_per_key: None,
        }
    }
}

struct PoolEntry<S> {
    id: u64,
    socket: PoolSocket<S>,
    busy: bool,
    /// Invariant: an idle entry always has a live watch task; a busy entry
    /// never does.
    idle_watch: Option<JoinHandle<()>>,
}

struct PoolInner<S> {
    closed: bool,
    next_id: u64,
    entries: HashMap<String, Vec<PoolEntry<S>>>,
}

impl<S: PeerStream> PoolInner<S> {
    /// Drops entries whose socket was destroyed underneath the pool, e.g. by
    /// a `close` racing a borrower.
    fn sweep(&mut self, key: &str) {
        if let Some(list) = self.entries.get_mut(key) {
            list.retain_mut(|entry| match entry.socket.is_destroyed() {
                true => {
                    if let Some(watch) = entry.idle_watch.take() {
                        watch.abort();
                    }
                    false
                }
                false => true,
            });

            if list.is_empty() {
                self.entries.remove(key);
            }
        }
    }
}

/// A pool of reusable encrypted sockets to remote peers.
pub struct PeerPool<T: Transport> {
    node: Rc<T>,
    keypair: KeyPair,
    options: PoolOptions,
    inner: Rc<RefCell<PoolInner<T::Socket>>>,
}

impl<T: Transport> Clone for PeerPool<T> {
    fn clone(&self) -> Self {
        PeerPool {
            node: Rc::clone(&self.node),
            keypair: self.keypair.clone(),
            options: self.options.clone(),
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: Transport + 'static> PeerPool<T> {
    pub fn new(node: Rc<T>, keypair: KeyPair, options: PoolOptions) -> Self {
        PeerPool {
            node,
            keypair,
            options,
            inner: Rc::new(RefCell::new(PoolInner {
                closed: false,
                next_id: 0,
                entries: HashMap::new(),
            })),
        }
    }

    /// Returns an idle pooled socket for `remote`, cancelling its idle watch,
    /// or dials a new connection when none is idle. Fails with
    /// [`Error::PoolClosed`] after [`PeerPool::close`].
    pub async fn acquire(&self, remote: &PublicKey) -> Result<PoolSocket<T::Socket>> {
        let key = remote.to_string();

        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                return Err(Error::PoolClosed);
            }

            inner.sweep(&key);
            if let Some(list) = inner.entries.get_mut(&key) {
                if let Some(entry) = list.iter_mut().find(|entry| !entry.busy) {
                    if let Some(watch) = entry.idle_watch.take() {
                        watch.abort();
                    }
                    entry.busy = true;
                    debug!("reusing pooled socket {} for {remote}", entry.id);
                    return Ok(entry.socket.clone());
                }

                if let Some(cap) = self.options.max_per_key {
                    if list.len() >= cap {
                        return Err(Error::PeerBusy(*remote));
                    }
                }
            }
        }

        // No idle entry; dial outside the borrow. The pool may close while
        // the handshake is in flight, in which case the fresh socket must not
        // be adopted.
        let socket = self
            .node
            .connect(remote, &self.keypair)
            .await
            .map_err(Error::PeerConnect)?;

        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            drop(socket);
            return Err(Error::PoolClosed);
        }

        let id = inner.next_id;
        inner.next_id += 1;
        let pooled = PoolSocket::new(id, socket);
        debug!("pooling new socket {id} for {remote}");

        inner.entries.entry(key).or_default().push(PoolEntry {
            id,
            socket: pooled.clone(),
            busy: true,
            idle_watch: None,
        });

        Ok(pooled)
    }

    /// Marks a previously acquired socket idle and schedules its eviction.
    ///
    /// A socket the pool no longer tracks (already evicted, or the pool is
    /// closed) is destroyed on the spot rather than leaked; a returned socket
    /// that already died is deregistered.
    pub fn release(&self, remote: &PublicKey, socket: PoolSocket<T::Socket>) {
        let key = remote.to_string();
        let mut inner = self.inner.borrow_mut();

        if inner.closed {
            socket.destroy();
            return;
        }

        let Some(list) = inner.entries.get_mut(&key) else {
            socket.destroy();
            return;
        };
        let Some(index) = list.iter().position(|entry| entry.socket.same_as(&socket)) else {
            socket.destroy();
            return;
        };

        if socket.is_destroyed() {
            list.remove(index);
            if list.is_empty() {
                inner.entries.remove(&key);
            }
            return;
        }

        let entry = &mut list[index];
        entry.busy = false;
        if let Some(watch) = entry.idle_watch.take() {
            watch.abort();
        }
        entry.idle_watch = Some(self.spawn_idle_watch(key.clone(), entry.id, entry.socket.clone()));
        debug!("socket {} for {remote} is idle", entry.id);
    }

    /// Waits out the idle window while watching the socket, so a remote that
    /// goes away deregisters the entry instead of being handed to the next
    /// borrower. Bytes that arrive while idle are stashed for that borrower.
    fn spawn_idle_watch(&self, key: String, id: u64, socket: PoolSocket<T::Socket>) -> JoinHandle<()> {
        let weak = Rc::downgrade(&self.inner);
        let idle_timeout = self.options.idle_timeout;

        tokio::task::spawn_local(async move {
            let mut reader = socket.clone();
            let mut buf = [0u8; 4096];

            let remote_closed = loop {
                tokio::select! {
                    _ = tokio::time::sleep(idle_timeout) => break false,
                    read = reader.read(&mut buf) => match read {
                        Ok(0) | Err(_) => break true,
                        Ok(read) => reader.stash(&buf[..read]),
                    }
                }
            };

            let Some(inner) = weak.upgrade() else { return };
            let mut inner = inner.borrow_mut();
            let Some(list) = inner.entries.get_mut(&key) else { return };
            let Some(index) = list.iter().position(|entry| entry.id == id && !entry.busy) else {
                return;
            };

            let entry = list.remove(index);
            entry.socket.destroy();
            match remote_closed {
                true => debug!("dropped idle socket {id}: remote closed"),
                false => debug!("evicted idle socket {id}"),
            }
            if list.is_empty() {
                inner.entries.remove(&key);
            }
        })
    }

    /// Destroys every pooled socket, busy or idle, and cancels all idle
    /// watches. Idempotent; subsequent `acquire` calls fail.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;

        for (_, list) in inner.entries.drain() {
            for mut entry in list {
                if let Some(watch) = entry.idle_watch.take() {
                    watch.abort();
                }
                entry.socket.destroy();
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }
}

struct PoolSocketState<S> {
    io: Option<S>,
    /// Bytes that arrived while the socket sat idle in the pool; served to
    /// the next borrower ahead of the stream itself.
    stash: Vec<u8>,
    remote: Option<PublicKey>,
}

/// A handle to a pooled encrypted socket.
///
/// Clones share the underlying stream, which lets the pool destroy a socket
/// that is currently handed out. After `destroy`, reads and writes fail with
/// [`io::ErrorKind::NotConnected`].
pub struct PoolSocket<S> {
    id: u64,
    state: Rc<RefCell<PoolSocketState<S>>>,
}

impl<S> Clone for PoolSocket<S> {
    fn clone(&self) -> Self {
        PoolSocket {
            id: self.id,
            state: Rc::clone(&self.state),
        }
    }
}

impl<S: PeerStream> PoolSocket<S> {
    fn new(id: u64, io: S) -> Self {
        let remote = io.remote_public_key();
        PoolSocket {
            id,
            state: Rc::new(RefCell::new(PoolSocketState {
                io: Some(io),
                stash: Vec::new(),
                remote,
            })),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drops the underlying stream. Idempotent; returns whether this call did
    /// the destroying.
    pub fn destroy(&self) -> bool {
        let mut state = self.state.borrow_mut();
        state.stash.clear();
        state.io.take().is_some()
    }

    fn stash(&self, data: &[u8]) {
        self.state.borrow_mut().stash.extend_from_slice(data);
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.borrow().io.is_none()
    }

    /// Whether two handles refer to the same pooled socket.
    pub fn same_as(&self, other: &PoolSocket<S>) -> bool {
        Rc::ptr_eq(&self.state, &other.state)
    }
}

impl<S> std::fmt::Debug for PoolSocket<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PoolSocket")
            .field("id", &self.id)
            .field("destroyed", &self.state.borrow().io.is_none())
            .finish()
    }
}

impl<S: PeerStream> PeerStream for PoolSocket<S> {
    fn remote_public_key(&self) -> Option<PublicKey> {
        self.state.borrow().remote
    }
}

fn destroyed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "pooled socket is destroyed")
}

impl<S: PeerStream> AsyncRead for PoolSocket<S> {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context, buf: &mut ReadBuf) -> Poll<io::Result<()>> {
        let mut state = self.state.borrow_mut();
        if !state.stash.is_empty() {
            let take = state.stash.len().min(buf.remaining());
            buf.put_slice(&state.stash[..take]);
            state.stash.drain(..take);
            return Poll::Ready(Ok(()));
        }

        match state.io.as_mut() {
            Some(io) => Pin::new(io).poll_read(cx, buf),
            None => Poll::Ready(Err(destroyed_error())),
        }
    }
}

impl<S: PeerStream> AsyncWrite for PoolSocket<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context, buf: &[u8]) -> Poll<io::Result<usize>> {
        let mut state = self.state.borrow_mut();
        match state.io.as_mut() {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(destroyed_error())),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let mut state = self.state.borrow_mut();
        match state.io.as_mut() {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Err(destroyed_error())),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context) -> Poll<io::Result<()>> {
        let mut state = self.state.borrow_mut();
        match state.io.as_mut() {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Err(destroyed_error())),
        }
    }
}
