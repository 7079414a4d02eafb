/*
 * toyraft is the toyraft server. It takes configuration via a configuration
 * file and environment variables, then runs a Raft node replicating a simple
 * key/value state machine, with Raft peers on one TCP port (default 9705) and
 * clients on another (default 9605).
 */

#![warn(clippy::all)]

use std::collections::{BTreeMap, HashMap};

use serde_derive::{Deserialize, Serialize};
use toyraft::error::Result;
use toyraft::storage::FileStore;
use toyraft::{errinput, raft, Server};

fn main() -> Result<()> {
    let args = clap::command!()
        .arg(
            clap::Arg::new("config")
                .short('c')
                .long("config")
                .help("Configuration file path")
                .default_value("config/toyraft.yaml"),
        )
        .get_matches();
    let cfg = Config::new(args.get_one::<String>("config").unwrap().as_ref())?;

    let loglevel = cfg.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("toyraft");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    let path = std::path::Path::new(&cfg.data_dir);
    let log = raft::Log::new(Box::new(FileStore::new(path, cfg.id)?))?;

    let raft_listener = std::net::TcpListener::bind(&cfg.listen_raft)?;
    let client_listener = std::net::TcpListener::bind(&cfg.listen_client)?;

    // Runs until the process is killed; the shutdown channel stays open for
    // the process lifetime.
    let (_shutdown_tx, shutdown_rx) = crossbeam::channel::bounded(1);
    Server::new(cfg.id, cfg.peers, log, Box::new(Kv::new()))?.serve(
        raft_listener,
        client_listener,
        shutdown_rx,
    )
}

#[derive(Debug, Deserialize)]
struct Config {
    id: raft::NodeID,
    peers: HashMap<raft::NodeID, String>,
    listen_raft: String,
    listen_client: String,
    log_level: String,
    data_dir: String,
}

impl Config {
    fn new(file: &str) -> Result<Self> {
        Ok(config::Config::builder()
            .set_default("id", "1")?
            .set_default("listen_raft", "0.0.0.0:9705")?
            .set_default("listen_client", "0.0.0.0:9605")?
            .set_default("log_level", "info")?
            .set_default("data_dir", "data")?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("TOYRAFT"))
            .build()?
            .try_deserialize()?)
    }
}

/// A command for the key/value state machine, bincode-encoded.
#[derive(Debug, Serialize, Deserialize)]
enum Command {
    /// Stores a key/value pair.
    Set { key: String, value: String },
    /// Reads a key, failing if it does not exist. Reads go through the log
    /// like writes do, trading throughput for linearizability.
    Get { key: String },
}

/// A simple replicated key/value store.
struct Kv {
    data: BTreeMap<String, String>,
}

impl Kv {
    fn new() -> Self {
        Self { data: BTreeMap::new() }
    }
}

impl raft::State for Kv {
    fn apply(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        match toyraft::encoding::deserialize(command)? {
            Command::Set { key, value } => {
                self.data.insert(key, value);
                Ok(Vec::new())
            }
            Command::Get { key } => match self.data.get(&key) {
                Some(value) => Ok(value.clone().into_bytes()),
                None => errinput!("key {key} not found"),
            },
        }
    }
}
