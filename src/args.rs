use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
};

use peerpipe::PublicKey;

/// The default UDP port a serving peer binds.
pub const DEFAULT_SERVE_PORT: u16 = 4747;

/// Gets a small string with this program's name and version.
pub fn get_version_string() -> String {
    format!(
        concat!(env!("CARGO_PKG_NAME"), " ", env!("CARGO_PKG_VERSION"), " ({} {})"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Gets a string with this program's help documentation.
pub fn get_help_string() -> &'static str {
    concat!(
        "Usage: peerpipe <mode> [options...]\n",
        "\n",
        "Modes:\n",
        "  serve <port | host:port>       Expose a local TCP service to peers that know\n",
        "                                 this instance's public key.\n",
        "  connect <key@address>          Bind a local TCP port and forward its\n",
        "                                 connections to the peer with that public key.\n",
        "\n",
        "Options:\n",
        "  -h, --help                     Display this help menu and exit\n",
        "  -V, --version                  Display version information and exit\n",
        "  -v, --verbose                  Enable debug logging\n",
        "  -b, --bind <address>           UDP address to bind (serve defaults to\n",
        "                                 0.0.0.0:4747, connect to an ephemeral port)\n",
        "  -p, --port <port>              Local TCP port to listen on (connect mode,\n",
        "                                 default 0 = OS-assigned)\n",
        "  -H, --host <ip>                Local TCP address to listen on (connect\n",
        "                                 mode, default 127.0.0.1)\n",
        "      --pooled                   Reuse encrypted sockets across sessions\n",
        "                                 instead of dialing one per connection\n",
    )
}

/// The result of parsing the program's arguments.
#[derive(Debug, PartialEq)]
pub enum ArgumentsRequest {
    /// Print the help menu to stdout and exit.
    Help,

    /// Print this program's version to stdout and exit.
    Version,

    /// Run with the provided arguments.
    Run(StartupArguments),
}

/// Specifies the information on how the program should run.
#[derive(Debug, PartialEq)]
pub struct StartupArguments {
    /// Whether to print additional information to stdout.
    pub verbose: bool,

    /// Whether to expose a local service or reach a remote one.
    pub startup_mode: StartupMode,
}

#[derive(Debug, PartialEq)]
pub enum StartupMode {
    Serve(ServeConfig),
    Connect(ConnectConfig),
}

/// Expose a local TCP service to peers (reverse tunnel).
#[derive(Debug, PartialEq)]
pub struct ServeConfig {
    pub target_host: String,
    pub target_port: u16,
    pub bind_address: SocketAddr,
}

/// Reach a remote peer's service from a local TCP port (forward tunnel).
#[derive(Debug, PartialEq)]
pub struct ConnectConfig {
    pub remote: PublicKey,
    pub remote_address: SocketAddr,
    pub listen_host: IpAddr,
    pub listen_port: u16,
    pub bind_address: SocketAddr,
    pub pooled: bool,
}

#[derive(Debug, PartialEq)]
pub enum ArgumentsError {
    UnknownArgument(String),
    MissingMode,
    UnknownMode(String),
    MissingTarget,
    InvalidTarget(String),
    MissingPeer,
    InvalidPeer(String),
    MissingValue(String),
    InvalidValue(String, String),
}

impl fmt::Display for ArgumentsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownArgument(arg) => write!(f, "Unknown argument: {arg}"),
            Self::MissingMode => write!(f, "No mode specified, expected 'serve' or 'connect'"),
            Self::UnknownMode(mode) => write!(f, "Unknown mode: {mode} (expected 'serve' or 'connect')"),
            Self::MissingTarget => write!(f, "Serve mode requires a target, either a port or host:port"),
            Self::InvalidTarget(target) => write!(f, "Invalid target: {target} (expected a port or host:port)"),
            Self::MissingPeer => write!(f, "Connect mode requires a peer, as public-key@address"),
            Self::InvalidPeer(peer) => write!(f, "Invalid peer: {peer} (expected public-key@address)"),
            Self::MissingValue(arg) => write!(f, "Expected a value after {arg}"),
            Self::InvalidValue(arg, value) => write!(f, "Invalid value for {arg}: {value}"),
        }
    }
}

fn parse_target(target: &str) -> Result<(String, u16), ArgumentsError> {
    if let Ok(port) = target.parse::<u16>() {
        return Ok(("127.0.0.1".to_string(), port));
    }

    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| ArgumentsError::InvalidTarget(target.to_string()))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| ArgumentsError::InvalidTarget(target.to_string()))?;

    match host.is_empty() {
        true => Err(ArgumentsError::InvalidTarget(target.to_string())),
        false => Ok((host.to_string(), port)),
    }
}

fn parse_peer(peer: &str) -> Result<(PublicKey, SocketAddr), ArgumentsError> {
    let (key, address) = peer
        .split_once('@')
        .ok_or_else(|| ArgumentsError::InvalidPeer(peer.to_string()))?;

    let key = key
        .parse::<PublicKey>()
        .map_err(|_| ArgumentsError::InvalidPeer(peer.to_string()))?;
    let address = address
        .parse::<SocketAddr>()
        .map_err(|_| ArgumentsError::InvalidPeer(peer.to_string()))?;

    Ok((key, address))
}

pub fn parse_arguments<T: Iterator<Item = String>>(mut args: T) -> Result<ArgumentsRequest, ArgumentsError> {
    let mut verbose = false;
    let mut mode = None;
    let mut target = None;
    let mut peer = None;
    let mut bind_address = None;
    let mut listen_host = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let mut listen_port = 0u16;
    let mut pooled = false;

    // Skip the program name.
    args.next();

    while let Some(arg) = args.next() {
        if arg.is_empty() {
            continue;
        } else if arg.eq("-h") || arg.eq_ignore_ascii_case("--help") {
            return Ok(ArgumentsRequest::Help);
        } else if arg.eq("-V") || arg.eq_ignore_ascii_case("--version") {
            return Ok(ArgumentsRequest::Version);
        } else if arg.eq("-v") || arg.eq_ignore_ascii_case("--verbose") {
            verbose = true;
        } else if arg.eq("-b") || arg.eq_ignore_ascii_case("--bind") {
            let value = args.next().ok_or(ArgumentsError::MissingValue(arg.clone()))?;
            let address = value
                .parse::<SocketAddr>()
                .map_err(|_| ArgumentsError::InvalidValue(arg, value))?;
            bind_address = Some(address);
        } else if arg.eq("-p") || arg.eq_ignore_ascii_case("--port") {
            let value = args.next().ok_or(ArgumentsError::MissingValue(arg.clone()))?;
            listen_port = value
                .parse::<u16>()
                .map_err(|_| ArgumentsError::InvalidValue(arg, value))?;
        } else if arg.eq("-H") || arg.eq_ignore_ascii_case("--host") {
            let value = args.next().ok_or(ArgumentsError::MissingValue(arg.clone()))?;
            listen_host = value
                .parse::<IpAddr>()
                .map_err(|_| ArgumentsError::InvalidValue(arg, value))?;
        } else if arg.eq_ignore_ascii_case("--pooled") {
            pooled = true;
        } else if mode.is_none() {
            match arg.as_str() {
                "serve" | "connect" => mode = Some(arg),
                _ => return Err(ArgumentsError::UnknownMode(arg)),
            }
        } else if mode.as_deref() == Some("serve") && target.is_none() {
            target = Some(arg);
        } else if mode.as_deref() == Some("connect") && peer.is_none() {
            peer = Some(arg);
        } else {
            return Err(ArgumentsError::UnknownArgument(arg));
        }
    }

    let startup_mode = match mode.as_deref() {
        None => return Err(ArgumentsError::MissingMode),
        Some("serve") => {
            let target = target.ok_or(ArgumentsError::MissingTarget)?;
            let (target_host, target_port) = parse_target(&target)?;
            StartupMode::Serve(ServeConfig {
                target_host,
                target_port,
                bind_address: bind_address
                    .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_SERVE_PORT)),
            })
        }
        Some(_) => {
            let peer = peer.ok_or(ArgumentsError::MissingPeer)?;
            let (remote, remote_address) = parse_peer(&peer)?;
            StartupMode::Connect(ConnectConfig {
                remote,
                remote_address,
                listen_host,
                listen_port,
                bind_address: bind_address.unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
                pooled,
            })
        }
    };

    Ok(ArgumentsRequest::Run(StartupArguments { verbose, startup_mode }))
}
