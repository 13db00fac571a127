//! An interactive ledger client. It loads the exported client configuration,
//! walks the server list until one answers, and the contacted server routes
//! the request to the current leader.
//!
//! You can run this binary as follows
//!     RUST_LOG=paxos_ledger=info cargo run --bin start_client -- [client_configuration.json]

extern crate env_logger;
#[macro_use]
extern crate log;
extern crate paxos_ledger;
extern crate serde_json;
#[macro_use]
extern crate text_io;

use std::env;
use std::io::{self, Write};
use std::process;
use std::time::Duration;

use serde_json::{json, Value};

use paxos_ledger::configurations::load_client_configuration;
use paxos_ledger::message::{Address, MSG_TYPE_CLIENT_REQUEST};
use paxos_ledger::net_node;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Tries every configured server in turn; the first reachable one forwards
/// to the leader for us.
fn send_request(servers: &[Address], data: Value) -> Option<Value> {
    let request = json!({ "msg_type": MSG_TYPE_CLIENT_REQUEST, "data": data }).to_string();
    for address in servers {
        match net_node::request(address, &request, REQUEST_TIMEOUT) {
            Ok(reply) => match serde_json::from_str(&reply) {
                Ok(reply) => return Some(reply),
                Err(e) => warn!("server {} sent a malformed reply: {}", address, e),
            },
            Err(e) => warn!("server {} unreachable: {}", address, e),
        }
    }
    None
}

fn show(reply: Option<Value>) {
    match reply {
        Some(reply) => println!("{}", serde_json::to_string_pretty(&reply).unwrap()),
        None => println!("no server answered, try again later"),
    }
}

fn prompt(label: &str) -> String {
    print!("{}: ", label);
    io::stdout().flush().expect("Could not flush stdout");
    read!()
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let path = args
        .get(1)
        .map(String::as_str)
        .unwrap_or("client_configuration.json");
    let config = match load_client_configuration(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: cannot load client configuration {}: {}", path, e);
            process::exit(1);
        }
    };
    let servers = config.server_address_list;
    println!("{} servers configured", servers.len());

    let mut session_id: Option<String> = None;
    loop {
        let command = prompt("command (register|login|submit|list|remove|quit)");
        match command.as_str() {
            "register" => {
                let account = prompt("account");
                let pswd = prompt("password");
                show(send_request(
                    &servers,
                    json!({ "eventType": "register", "account": account, "pswd": pswd }),
                ));
            }
            "login" => {
                let account = prompt("account");
                let pswd = prompt("password");
                let reply = send_request(
                    &servers,
                    json!({ "eventType": "login", "account": account, "pswd": pswd }),
                );
                if let Some(reply) = &reply {
                    if let Some(session) = reply["sessionId"].as_str() {
                        session_id = Some(session.to_string());
                    }
                }
                show(reply);
            }
            "submit" => {
                let session = match &session_id {
                    Some(session) => session.clone(),
                    None => {
                        println!("log in first");
                        continue;
                    }
                };
                let money: i64 = {
                    print!("money: ");
                    io::stdout().flush().expect("Could not flush stdout");
                    read!()
                };
                let record_type: i64 = {
                    print!("record type (0 expense, 1 income): ");
                    io::stdout().flush().expect("Could not flush stdout");
                    read!()
                };
                let description = prompt("description");
                let date_time = prompt("date (YYYY-MM-DD)");
                show(send_request(
                    &servers,
                    json!({
                        "eventType": "submitBooksRecord",
                        "sessionId": session,
                        "money": money,
                        "recordType": record_type,
                        "description": description,
                        "dateTime": date_time,
                    }),
                ));
            }
            "list" => match &session_id {
                Some(session) => show(send_request(
                    &servers,
                    json!({ "eventType": "getUserBooks", "sessionId": session }),
                )),
                None => println!("log in first"),
            },
            "remove" => {
                let session = match &session_id {
                    Some(session) => session.clone(),
                    None => {
                        println!("log in first");
                        continue;
                    }
                };
                let timestamp: u64 = {
                    print!("record timestamp: ");
                    io::stdout().flush().expect("Could not flush stdout");
                    read!()
                };
                // sic, wire spelling
                show(send_request(
                    &servers,
                    json!({
                        "eventType": "removeReocrd",
                        "sessionId": session,
                        "timestamp": timestamp,
                    }),
                ));
            }
            "quit" => break,
            other => println!("unknown command {:?}", other),
        }
    }
}
