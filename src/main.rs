use clap::{Arg, ArgMatches, Command};
use tracing::info;
use tracing_subscriber::EnvFilter;

use paravon::{Config, Node, ParavonError};

#[tokio::main]
async fn main() -> Result<(), ParavonError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches = Command::new("paravon")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Leaderless peer-to-peer key-value store")
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .help("Path to the JSON configuration file")
                .required(true),
        )
        .arg(Arg::new("node-id").long("node-id").help("Overrides the node id"))
        .arg(Arg::new("host").long("host").help("Overrides the bind host"))
        .arg(Arg::new("api-port").long("api-port").help("Overrides the client API port"))
        .arg(Arg::new("admin-port").long("admin-port").help("Overrides the admin API port"))
        .arg(Arg::new("peer-port").long("peer-port").help("Overrides the peer port"))
        .arg(
            Arg::new("seeds")
                .long("seeds")
                .help("Comma-separated seed peer addresses (host:port)"),
        )
        .arg(
            Arg::new("storage-path")
                .long("storage-path")
                .help("Overrides the storage directory"),
        )
        .get_matches();

    let path = matches
        .get_one::<String>("config")
        .ok_or_else(|| ParavonError::InvalidConfig("--config is required".to_string()))?;
    let mut config = Config::load(path)?;
    apply_overrides(&mut config, &matches)?;
    config.validate()?;

    info!(
        node = %config.node_id,
        n = config.replication_factor,
        w = config.write_quorum,
        r = config.read_quorum,
        "Starting Paravon"
    );

    system::preflight_check(&config.clone().into())?;

    let node = Node::new(config).await?;
    node.start().await
}

fn apply_overrides(config: &mut Config, matches: &ArgMatches) -> Result<(), ParavonError> {
    if let Some(node_id) = matches.get_one::<String>("node-id") {
        config.node_id = node_id.clone();
    }
    if let Some(host) = matches.get_one::<String>("host") {
        config.host = host.clone();
    }
    if let Some(port) = parse_port(matches, "api-port")? {
        config.api_port = port;
    }
    if let Some(port) = parse_port(matches, "admin-port")? {
        config.admin_port = port;
    }
    if let Some(port) = parse_port(matches, "peer-port")? {
        config.peer_port = port;
    }
    if let Some(seeds) = matches.get_one::<String>("seeds") {
        config.seeds = seeds
            .split(',')
            .map(str::trim)
            .filter(|seed| !seed.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(path) = matches.get_one::<String>("storage-path") {
        config.storage_path = path.into();
    }
    Ok(())
}

fn parse_port(matches: &ArgMatches, name: &str) -> Result<Option<u16>, ParavonError> {
    matches
        .get_one::<String>(name)
        .map(|raw| {
            raw.parse::<u16>()
                .map_err(|e| ParavonError::InvalidConfig(format!("Invalid {}: {}", name, e)))
        })
        .transpose()
}
