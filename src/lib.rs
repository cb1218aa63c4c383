//! Peer-to-peer encrypted TCP tunneling.
//!
//! Two endpoints identified by public keys establish authenticated, encrypted
//! duplex channels through a [`Transport`] node, then proxy TCP connections
//! bidirectionally: a [reverse tunnel](tunnel::reverse) forwards peer-initiated
//! connections to a local TCP service, a [forward tunnel](tunnel::forward)
//! forwards local TCP connections to a remote peer, and a [`PeerPool`]
//! multiplexes many short-lived sessions over reusable encrypted sockets.
//!
//! The crate is single-threaded by design: everything runs on a current-thread
//! Tokio runtime inside a [`tokio::task::LocalSet`], shared state is
//! `Rc`/`RefCell`, and all futures are `!Send`.

// Futures returned by the transport traits are intentionally !Send; the crate
// runs on a current-thread LocalSet.
#![allow(async_fn_in_trait)]

pub mod error;
pub mod pool;
pub mod shutdown;
pub mod transport;
pub mod tunnel;

pub use error::{is_benign, Error, Result};
pub use pool::{PeerPool, PoolOptions, PoolSocket};
pub use shutdown::ShutdownGuard;
pub use transport::{Firewall, KeyPair, NodeHandle, PeerServer, PeerStream, PublicKey, Transport};
pub use tunnel::{
    forward::{create_forward_tunnel, ForwardTunnel, ForwardTunnelOptions},
    reverse::{create_reverse_tunnel, ReverseTunnel, ReverseTunnelOptions},
    TunnelEvent,
};

#[cfg(test)]
pub(crate) mod test_utils;
