//! Starts one server process (server, proposer, acceptor and learner roles)
//! from a cluster configuration file.
//!
//! You can run this binary as follows
//!     RUST_LOG=paxos_ledger=info cargo run --bin start_server -- <server_id> configuration.json
//! where <server_id> is the id of this server in the configuration.

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate paxos_ledger;

use std::env;
use std::process;

use paxos_ledger::configurations::load_configuration;
use paxos_ledger::node::start_node;

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    info!("{:?}", args);

    if args.len() != 3 {
        eprintln!("usage: start_server <server_id> <configuration.json>");
        process::exit(1);
    }

    let server_id: i32 = match args[1].parse() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Error: second argument is not a server id");
            process::exit(1);
        }
    };

    let config = match load_configuration(&args[2]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: cannot load configuration {}: {}", args[2], e);
            process::exit(1);
        }
    };

    match start_node(&config, server_id) {
        Ok(handle) => handle.join(),
        Err(e) => {
            eprintln!("Error: cannot start server {}: {}", server_id, e);
            process::exit(1);
        }
    }
}
