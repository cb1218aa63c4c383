use std::{env, future::Future, process::exit, rc::Rc};

use peerpipe::{
    create_forward_tunnel, create_reverse_tunnel, transport::quic::QuicTransport, ForwardTunnelOptions,
    KeyPair, NodeHandle, PeerPool, PoolOptions, Result, ReverseTunnelOptions, ShutdownGuard, Transport,
    TunnelEvent,
};
use tokio::{sync::mpsc::UnboundedReceiver, task::LocalSet};

use crate::args::{ArgumentsRequest, ConnectConfig, ServeConfig, StartupArguments, StartupMode};

mod args;

fn main() {
    let arguments = match args::parse_arguments(env::args()) {
        Err(err) => {
            eprintln!("{err}\n\nType 'peerpipe --help' for a help menu");
            exit(1);
        }
        Ok(arguments) => arguments,
    };

    let startup_args = match arguments {
        ArgumentsRequest::Version => {
            println!("{}", args::get_version_string());
            return;
        }
        ArgumentsRequest::Help => {
            println!("{}", args::get_help_string());
            return;
        }
        ArgumentsRequest::Run(startup_args) => startup_args,
    };

    let runtime_result = tokio::runtime::Builder::new_current_thread().enable_all().build();

    let result = match runtime_result {
        Ok(runtime) => LocalSet::new().block_on(&runtime, async_main(startup_args)),
        Err(err) => {
            eprintln!("Failed to start Tokio runtime: {err}");
            exit(1);
        }
    };

    if let Err(error) = result {
        eprintln!("Program finished with error: {error}");
        exit(1);
    }
}

async fn async_main(startup_args: StartupArguments) -> Result<()> {
    let default_filter = match startup_args.verbose {
        true => "peerpipe=debug",
        false => "peerpipe=warn",
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()))
        .init();

    match startup_args.startup_mode {
        StartupMode::Serve(config) => run_serve(config).await,
        StartupMode::Connect(config) => run_connect(config).await,
    }
}

async fn run_serve(config: ServeConfig) -> Result<()> {
    let keypair = KeyPair::generate()?;
    let node = QuicTransport::new(config.bind_address)?;
    let local_addr = node.local_addr()?;

    println!("Listening on UDP {local_addr}");
    println!("Your public key is: {}", keypair.public());
    println!(
        "Reach this service with: peerpipe connect {}@<your-ip>:{}",
        keypair.public(),
        local_addr.port()
    );

    let (tunnel, events) = create_reverse_tunnel(ReverseTunnelOptions {
        node: NodeHandle::owned(node),
        keypair,
        host: config.target_host.clone(),
        port: config.target_port,
        firewall: None,
    })
    .await?;

    println!(
        "Forwarding incoming connections to {}:{}",
        config.target_host, config.target_port
    );

    run_event_loop(events, tunnel.close()).await;
    Ok(())
}

async fn run_connect(config: ConnectConfig) -> Result<()> {
    let keypair = KeyPair::generate()?;
    let node = Rc::new(QuicTransport::new(config.bind_address)?);
    node.add_peer(config.remote, config.remote_address);

    let pool = match config.pooled {
        true => Some(PeerPool::new(Rc::clone(&node), keypair.clone(), PoolOptions::default())),
        false => None,
    };

    let (tunnel, events) = create_forward_tunnel(ForwardTunnelOptions {
        node: NodeHandle::shared(Rc::clone(&node)),
        keypair,
        remote: config.remote,
        host: config.listen_host.to_string(),
        port: config.listen_port,
        pool: pool.clone(),
    })
    .await?;

    println!("Listening on TCP {}", tunnel.listen_addr());
    println!("Forwarding connections to peer {}", config.remote);

    run_event_loop(events, tunnel.close()).await;
    if let Some(pool) = pool {
        pool.close();
    }
    let _ = node.destroy().await;
    Ok(())
}

/// Consumes tunnel events until Ctrl-C, then runs `close` while still
/// draining events; repeated signals during the drain hit the shutdown latch
/// and are absorbed. Status lines are edge triggered: only the 0→1 and 1→0
/// connection-count transitions are printed.
async fn run_event_loop(mut events: UnboundedReceiver<TunnelEvent>, close: impl Future<Output = ()>) {
    let shutdown = ShutdownGuard::new();
    tokio::pin!(close);
    let mut closed = false;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if shutdown.begin() {
                    println!("Shutting down");
                }
            }
            _ = &mut close, if shutdown.is_shutting_down() => {
                closed = true;
                break;
            }
            event = events.recv() => match event {
                Some(TunnelEvent::Connect { active_connections, remote_public_key }) => {
                    if active_connections == 1 {
                        match remote_public_key {
                            Some(key) => println!("Connection opened by {key}"),
                            None => println!("Connection opened"),
                        }
                    }
                }
                Some(TunnelEvent::Disconnect { active_connections }) => {
                    if active_connections == 0 {
                        println!("All connections closed");
                    }
                }
                Some(TunnelEvent::Error(error)) => eprintln!("Tunnel error: {error}"),
                None => break,
            }
        }
    }

    if !closed {
        close.await;
    }
}
