//! Command line and node configuration.

use {
    clap::Parser,
    dgi_core::{CoreError, NodeId, RemoteHost, Result, Timings},
    log::LevelFilter,
    std::path::PathBuf,
};

/// Distributed microgrid controller node.
#[derive(Debug, Parser)]
#[command(name = "dgi-node", about = "Distributed microgrid controller broker")]
pub struct Cli {
    /// Address to bind the datagram socket on.
    #[arg(long, default_value = "0.0.0.0")]
    pub address: String,

    /// Datagram port.
    #[arg(long, default_value_t = 1870)]
    pub port: u16,

    /// Statically configured peer, as host:port. Repeatable.
    #[arg(long = "add-host", value_name = "HOST:PORT")]
    pub add_host: Vec<String>,

    /// Logging verbosity, 0 (silent) through 7 (trace).
    #[arg(long, default_value_t = 3)]
    pub verbose: u8,

    /// Path to the timings file.
    #[arg(long)]
    pub timings: PathBuf,

    /// Optional path to a device table file.
    #[arg(long)]
    pub devices: Option<PathBuf>,
}

impl Cli {
    /// The level filter the chosen verbosity maps to.
    pub fn level_filter(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Off,
            1 => LevelFilter::Error,
            2 => LevelFilter::Warn,
            3 => LevelFilter::Info,
            4 | 5 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Resolved node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Bind address.
    pub address: String,
    /// Bind port.
    pub port: u16,
    /// This node's identifier and reachable address.
    pub me: NodeId,
    pub my_host: RemoteHost,
    /// Statically configured peers.
    pub peers: Vec<(NodeId, RemoteHost)>,
    /// The loaded timing table.
    pub timings: Timings,
}

impl NodeConfig {
    /// Build the node configuration from parsed arguments.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let timings = Timings::load(&cli.timings)?;
        let my_host = RemoteHost::new(cli.address.as_str(), cli.port);
        let me = NodeId::from_endpoint(&cli.address, cli.port);
        let mut peers = Vec::new();
        for spec in &cli.add_host {
            let (host, port) = parse_host_port(spec)?;
            peers.push((
                NodeId::from_endpoint(&host, port),
                RemoteHost::new(host, port),
            ));
        }
        Ok(NodeConfig {
            address: cli.address.clone(),
            port: cli.port,
            me,
            my_host,
            peers,
            timings,
        })
    }
}

/// Split a `host:port` peer specification.
pub fn parse_host_port(spec: &str) -> Result<(String, u16)> {
    let (host, port) = spec
        .rsplit_once(':')
        .ok_or_else(|| CoreError::Config(format!("bad peer spec '{spec}', want host:port")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| CoreError::Config(format!("bad port in peer spec '{spec}'")))?;
    if host.is_empty() {
        return Err(CoreError::Config(format!("empty host in peer spec '{spec}'")));
    }
    Ok((host.to_string(), port))
}
