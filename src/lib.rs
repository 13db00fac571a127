#[macro_use]
extern crate log;
extern crate net2;
extern crate serde;
#[macro_use]
extern crate serde_derive;
extern crate serde_json;
extern crate uuid;

pub mod net_node;
pub mod paxos;
pub mod server;
pub mod service;
pub mod node;
pub mod configurations;
pub mod message;

/// Boxed error used by every fallible operation in the crate.
pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T> = std::result::Result<T, Error>;
