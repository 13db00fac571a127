//! Builds and runs the roles of one server process: its acceptor, its
//! learner (ordinary or distinguished, per configuration), its server loop
//! and heartbeat, and the proposer the server drives on demand.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::configurations::ClusterConfig;
use crate::paxos::{Acceptor, DistinguishedLearner, Learner, Proposer, Runnable};
use crate::server::Server;
use crate::service::Service;
use crate::Result;

/// A running server process: the role threads plus the shared stop flag.
pub struct NodeHandle {
    server: Server,
    running: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl NodeHandle {
    /// The server role, e.g. to inspect the current leader.
    pub fn server(&self) -> &Server {
        &self.server
    }

    /// Cooperative shutdown: clears the running flag and joins the role
    /// loops; in-flight requests finish or time out.
    pub fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        for handle in self.threads {
            let _ = handle.join();
        }
    }

    /// Blocks until the role loops exit.
    pub fn join(self) {
        for handle in self.threads {
            let _ = handle.join();
        }
    }
}

/// Starts every role of the server `server_id` as configured and returns the
/// handle to stop them.
pub fn start_node(config: &ClusterConfig, server_id: i32) -> Result<NodeHandle> {
    let index = config.position_of(server_id)?;
    let map = &config.server_configuration_map;
    let server_entry = &map.server_configuration_list[index];
    let proposer_address = map.proposer_configuration_list[index].address.clone();
    let acceptor_address = map.acceptor_configuration_list[index].address.clone();
    let learner_entry = &map.learner_configuration_list[index];

    let running = Arc::new(AtomicBool::new(true));
    let timing = config.timing.clone();

    let mut acceptor = Acceptor::new(
        acceptor_address,
        config.distinguished_learner_addresses(),
        config.max_connections,
        timing.clone(),
        running.clone(),
    );
    let proposer = Proposer::new(
        proposer_address,
        config.acceptor_addresses(),
        timing.clone(),
        running.clone(),
    );
    let server = Server::new(
        server_entry.address.clone(),
        server_entry.credit_weight,
        proposer,
        acceptor.state(),
        Service::new(),
        config.max_connections,
        timing.clone(),
        running.clone(),
    );

    info!(
        "starting server {} (distinguished learner: {})",
        server_id, learner_entry.is_distinguished_learner
    );

    let mut threads = Vec::new();
    threads.push(thread::spawn(move || acceptor.run()));

    if learner_entry.is_distinguished_learner {
        let mut learner = DistinguishedLearner::new(
            learner_entry.address.clone(),
            server.clone(),
            config.ordinary_learner_addresses(),
            map.acceptor_configuration_list.len(),
            timing.clone(),
            running.clone(),
        );
        threads.push(thread::spawn(move || learner.run()));
    } else {
        let mut learner = Learner::new(
            learner_entry.address.clone(),
            server.clone(),
            timing,
            running.clone(),
        );
        threads.push(thread::spawn(move || learner.run()));
    }

    let mut server_loop = server.clone();
    threads.push(thread::spawn(move || server_loop.run()));

    Ok(NodeHandle {
        server,
        running,
        threads,
    })
}
