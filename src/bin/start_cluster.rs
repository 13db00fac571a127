//! Runs a whole cluster in one process, one set of role threads per server.
//! Generates the reference topology, writes `configuration.json` next to it,
//! and exports `client_configuration.json` for the ledger client.
//!
//! You can run this binary as follows
//!     RUST_LOG=paxos_ledger=info cargo run --bin start_cluster -- <server_num> [host] [base_port]
//! or, to reuse an existing configuration file,
//!     RUST_LOG=paxos_ledger=info cargo run --bin start_cluster -- --config configuration.json

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate paxos_ledger;

use std::env;
use std::process;

use paxos_ledger::configurations::{
    default_configuration, load_configuration, write_client_configuration, write_configuration,
    ClusterConfig,
};
use paxos_ledger::node::start_node;

const CONFIGURATION_PATH: &str = "configuration.json";
const CLIENT_CONFIGURATION_PATH: &str = "client_configuration.json";

fn build_configuration(args: &[String]) -> paxos_ledger::Result<ClusterConfig> {
    if args.len() >= 3 && args[1] == "--config" {
        return load_configuration(&args[2]);
    }

    let server_num: usize = match args.get(1) {
        Some(raw) => raw.parse()?,
        None => 3,
    };
    let host = args.get(2).map(String::as_str).unwrap_or("127.0.0.1");
    let base_port: u16 = match args.get(3) {
        Some(raw) => raw.parse()?,
        None => 10_000,
    };
    let config = default_configuration(host, base_port, server_num);
    write_configuration(&config, CONFIGURATION_PATH)?;
    Ok(config)
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    let config = match build_configuration(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: cannot build configuration: {}", e);
            process::exit(1);
        }
    };
    if let Err(e) = write_client_configuration(&config, CLIENT_CONFIGURATION_PATH) {
        eprintln!("Error: cannot export client configuration: {}", e);
        process::exit(1);
    }

    let mut handles = Vec::new();
    for entry in &config.server_configuration_map.server_configuration_list {
        let server_id = entry.address.server_id;
        match start_node(&config, server_id) {
            Ok(handle) => handles.push(handle),
            Err(e) => {
                eprintln!("Error: cannot start server {}: {}", server_id, e);
                process::exit(1);
            }
        }
    }
    info!("cluster of {} servers started", handles.len());

    for handle in handles {
        handle.join();
    }
}
