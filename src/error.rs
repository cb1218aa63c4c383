use std::io;

use crate::transport::PublicKey;

/// The error type for tunnel and pool operations.
///
/// Session-level failures are never thrown from event-driven paths; they are
/// delivered through the [`TunnelEvent::Error`](crate::TunnelEvent::Error)
/// channel so callers have a single observation point regardless of which leg
/// of a session failed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// `acquire` was called on a pool after `close`.
    #[error("connection pool is closed")]
    PoolClosed,

    /// The pool's per-key connection cap was reached and every pooled socket
    /// for this peer is busy.
    #[error("peer {0} is at its connection limit")]
    PeerBusy(PublicKey),

    /// A string could not be parsed as a hex-encoded 32-byte public key.
    #[error("invalid public key: {0}")]
    InvalidKey(String),

    /// A reverse-tunnel session could not reach the local TCP service.
    #[error("could not connect to local service {host}:{port}: {source}")]
    LocalConnect {
        host: String,
        port: u16,
        source: io::Error,
    },

    /// A forward-tunnel session could not complete the encrypted handshake
    /// with the remote peer.
    #[error("could not reach remote peer: {0}")]
    PeerConnect(#[source] io::Error),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Whether an I/O error is a benign per-connection failure (peer reset, broken
/// pipe, premature close) rather than something worth surfacing.
///
/// Benign errors end the affected session through normal cleanup but never
/// tear down the whole tunnel or pool.
pub fn is_benign(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
