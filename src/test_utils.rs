//! Shared helpers for the test suites.

use std::{future::Future, net::SocketAddr, time::Duration};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    task::JoinHandle,
};

use crate::transport::{memory::MemoryTransport, KeyPair, PeerServer, Transport};

/// Runs a future on a fresh current-thread runtime inside a `LocalSet`, the
/// same environment the crate runs in for real.
pub fn run_local<F: Future>(future: F) -> F::Output {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();

    tokio::task::LocalSet::new().block_on(&runtime, future)
}

/// Binds a TCP echo server on an ephemeral loopback port.
pub async fn spawn_tcp_echo() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::task::spawn_local(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { break };
            tokio::task::spawn_local(async move {
                let (mut read, mut write) = stream.split();
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    });

    (addr, handle)
}

/// Registers an encrypted echo peer on the hub under the given identity.
pub async fn spawn_peer_echo(transport: MemoryTransport, keypair: KeyPair) -> JoinHandle<()> {
    let mut server = transport.create_server(None).await.unwrap();
    server.listen(&keypair).await.unwrap();

    tokio::task::spawn_local(async move {
        while let Ok(socket) = server.accept().await {
            tokio::task::spawn_local(async move {
                let (mut read, mut write) = tokio::io::split(socket);
                let _ = tokio::io::copy(&mut read, &mut write).await;
            });
        }
    })
}

/// Registers an encrypted echo peer that holds each chunk briefly before
/// echoing it back.
pub async fn spawn_peer_echo_with_delay(
    transport: MemoryTransport,
    keypair: KeyPair,
    delay: Duration,
) -> JoinHandle<()> {
    let mut server = transport.create_server(None).await.unwrap();
    server.listen(&keypair).await.unwrap();

    tokio::task::spawn_local(async move {
        while let Ok(socket) = server.accept().await {
            tokio::task::spawn_local(async move {
                let (mut read, mut write) = tokio::io::split(socket);
                let mut buf = [0u8; 8 * 1024];
                while let Ok(n) = read.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                    tokio::time::sleep(delay).await;
                    if write.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    })
}

/// Picks a loopback TCP port with nothing listening on it.
pub async fn unused_tcp_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}
