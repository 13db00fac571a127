//! The client-facing server role: accepts requests over TCP, answers
//! heartbeats, runs client events on the ledger when it is the leader and
//! forwards them verbatim otherwise, and watches the leader's liveness.

use std::io::Write;
use std::net::TcpStream;
use std::str;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value};

use crate::configurations::Timing;
use crate::message::{self, Address, Envelope, Leader, Message};
use crate::net_node;
use crate::paxos::{AcceptorState, Proposer, Runnable};
use crate::service::{self, Service};
use crate::Result;

#[derive(Default)]
struct LeaderState {
    leader: Option<Leader>,
    is_leader: bool,
}

/// The server role. Clones share one inner state, so the learner callback,
/// the heartbeat loop and the request handlers all see the same leader.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    local_address: Address,
    credit_weight: u32,
    leader_state: Mutex<LeaderState>,
    proposer: Proposer,
    acceptor_state: Arc<Mutex<AcceptorState>>,
    service: Service,
    max_connections: i32,
    timing: Timing,
    running: Arc<AtomicBool>,
}

impl Server {
    pub fn new(
        local_address: Address,
        credit_weight: u32,
        proposer: Proposer,
        acceptor_state: Arc<Mutex<AcceptorState>>,
        service: Service,
        max_connections: i32,
        timing: Timing,
        running: Arc<AtomicBool>,
    ) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                local_address,
                credit_weight,
                leader_state: Mutex::new(LeaderState::default()),
                proposer,
                acceptor_state,
                service,
                max_connections,
                timing,
                running,
            }),
        }
    }

    pub fn local_address(&self) -> &Address {
        &self.inner.local_address
    }

    fn server_id(&self) -> i32 {
        self.inner.local_address.server_id
    }

    pub fn leader(&self) -> Option<Leader> {
        self.inner.leader_state.lock().unwrap().leader.clone()
    }

    pub fn is_leader(&self) -> bool {
        self.inner.leader_state.lock().unwrap().is_leader
    }

    /// Installs or clears the leader. Learner callbacks and the leader-loss
    /// path are the only callers; the server never invents a leader itself.
    pub fn change_leader(&self, leader: Option<Leader>) {
        let mut state = self.inner.leader_state.lock().unwrap();
        state.is_leader = leader
            .as_ref()
            .map(|leader| leader.address == self.inner.local_address)
            .unwrap_or(false);
        state.leader = leader;
        match (&state.leader, state.is_leader) {
            (Some(_), true) => info!("[S={}] this server is now the leader", self.server_id()),
            (Some(leader), false) => info!(
                "[S={}] leader changed to {}",
                self.server_id(),
                leader.address
            ),
            (None, _) => info!("[S={}] leader cleared", self.server_id()),
        }
    }

    /// Asks the local proposer to stand for election. Refused while a round
    /// is already in flight.
    pub fn start_proposer(&self) -> bool {
        let started = self
            .inner
            .proposer
            .start_round(self.inner.local_address.clone(), self.inner.credit_weight);
        if started {
            info!("[S={}] submitted an election round", self.server_id());
        }
        started
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(self.inner.timing.tcp_idle()))?;
        stream.set_write_timeout(Some(self.inner.timing.tcp_idle()))?;
        let raw = net_node::recv_all(&mut stream)?;
        if raw.is_empty() {
            return Ok(());
        }
        let envelope = Envelope::decode(&raw)?;
        let reply = match envelope.msg_type {
            message::MSG_TYPE_HEARTBEAT => self.handle_heartbeat()?,
            message::MSG_TYPE_CLIENT_REQUEST => self.handle_client_request(&envelope, &raw)?,
            other => {
                warn!("[S={}] unknown message type {}", self.server_id(), other);
                json!({
                    "result": service::ERROR_CODE_UNKNOWN_MSG,
                    "error": "unknown message",
                })
                .to_string()
            }
        };
        stream.write_all(reply.as_bytes())?;
        Ok(())
    }

    fn handle_heartbeat(&self) -> Result<String> {
        Message::HeartbeatReply
            .into_envelope(self.inner.local_address.clone())
            .encode()
    }

    /// Client requests run on the leader. A follower forwards the raw
    /// envelope bytes untouched and relays whatever the leader answers; a
    /// forwarding failure closes the connection so the client retries
    /// elsewhere.
    fn handle_client_request(&self, envelope: &Envelope, raw: &[u8]) -> Result<String> {
        let (leader, is_leader) = {
            let state = self.inner.leader_state.lock().unwrap();
            (state.leader.clone(), state.is_leader)
        };
        let leader = match leader {
            Some(leader) => leader,
            None => {
                return Ok(json!({
                    "result": service::ERROR_CODE_NOT_LEADER,
                    "error": "no leader elected",
                })
                .to_string());
            }
        };
        if is_leader {
            let data = envelope.data.clone().unwrap_or(Value::Null);
            return Ok(self.inner.service.handle_event(&data).to_string());
        }
        debug!(
            "[S={}] forwarding client request to leader {}",
            self.server_id(),
            leader.address
        );
        match net_node::request(&leader.address, str::from_utf8(raw)?, self.inner.timing.tcp_idle())
        {
            Ok(reply) => Ok(reply),
            Err(e) => {
                warn!(
                    "[S={}] forward to leader {} failed: {}",
                    self.server_id(),
                    leader.address,
                    e
                );
                Err(e)
            }
        }
    }

    /// Follower-side liveness probe: heartbeat the leader every interval and
    /// accumulate the silence; past the loss threshold the leader counts as
    /// dead.
    pub fn run_heartbeat(&self) {
        let mut lost_ms: u64 = 0;
        while self.inner.running.load(Ordering::SeqCst) {
            let (leader, is_leader) = {
                let state = self.inner.leader_state.lock().unwrap();
                (state.leader.clone(), state.is_leader)
            };
            match leader {
                Some(leader) if !is_leader => {
                    if self.send_heartbeat(&leader.address) {
                        lost_ms = 0;
                    } else {
                        lost_ms += self.inner.timing.heartbeat_interval_ms;
                        warn!(
                            "[S={}] no heartbeat reply from leader ({} ms silent)",
                            self.server_id(),
                            lost_ms
                        );
                    }
                    if lost_ms >= self.inner.timing.leader_loss_threshold_ms {
                        lost_ms = 0;
                        self.handle_leader_loss();
                        continue;
                    }
                }
                _ => lost_ms = 0,
            }
            if !net_node::sleep_while_running(
                &self.inner.running,
                self.inner.timing.heartbeat_interval(),
            ) {
                return;
            }
        }
    }

    fn send_heartbeat(&self, leader: &Address) -> bool {
        let envelope = match Message::Heartbeat
            .into_envelope(self.inner.local_address.clone())
            .encode()
        {
            Ok(envelope) => envelope,
            Err(e) => {
                error!("[S={}] cannot encode heartbeat: {}", self.server_id(), e);
                return false;
            }
        };
        match net_node::request(leader, &envelope, self.inner.timing.tcp_idle()) {
            Ok(raw) => Envelope::decode(raw.as_bytes())
                .map(|reply| reply.msg_type == message::MSG_TYPE_HEARTBEAT_REPLY)
                .unwrap_or(false),
            Err(e) => {
                debug!("[S={}] heartbeat failed: {}", self.server_id(), e);
                false
            }
        }
    }

    /// The leader is gone: clear it, reset the local acceptor's accepted
    /// protocol (its promise stays monotone), give the other replicas time
    /// to notice the loss too, then stand for election.
    fn handle_leader_loss(&self) {
        warn!(
            "[S={}] leader lost, standing for re-election",
            self.server_id()
        );
        self.change_leader(None);
        self.inner.acceptor_state.lock().unwrap().accept_protocol = None;
        if !net_node::sleep_while_running(&self.inner.running, self.inner.timing.reelection_wait())
        {
            return;
        }
        self.start_proposer();
    }
}

impl Runnable for Server {
    fn run(&mut self) {
        let listener =
            match net_node::tcp_listener(&self.inner.local_address, self.inner.max_connections) {
                Ok(listener) => listener,
                Err(e) => {
                    error!(
                        "[S={}] cannot listen on {}: {}",
                        self.server_id(),
                        self.inner.local_address,
                        e
                    );
                    return;
                }
            };
        info!(
            "[S={}] server listening on {}",
            self.server_id(),
            self.inner.local_address
        );

        let heartbeat = self.clone();
        thread::spawn(move || heartbeat.run_heartbeat());

        if self.leader().is_none() {
            // Let the rest of the cluster bind its sockets first.
            net_node::sleep_while_running(
                &self.inner.running,
                self.inner.timing.election_startup_delay(),
            );
            if self.leader().is_none() {
                self.start_proposer();
            }
        }

        while self.inner.running.load(Ordering::SeqCst) {
            let stream = match net_node::accept_with_timeout(
                &listener,
                self.inner.timing.tcp_idle(),
                &self.inner.running,
            ) {
                Some(stream) => stream,
                None => continue,
            };
            let server = self.clone();
            thread::spawn(move || {
                if let Err(e) = server.handle_connection(stream) {
                    warn!("[S={}] dropping request: {}", server.server_id(), e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(id: i32) -> Address {
        Address::new("127.0.0.1", 11_000 + 10 * id as u16, id)
    }

    fn test_server(id: i32) -> Server {
        let running = Arc::new(AtomicBool::new(true));
        let proposer = Proposer::new(
            address(id),
            vec![address(0), address(1), address(2)],
            Timing::default(),
            running.clone(),
        );
        Server::new(
            address(id),
            100,
            proposer,
            Arc::new(Mutex::new(AcceptorState::default())),
            Service::new(),
            4,
            Timing::default(),
            running,
        )
    }

    fn client_envelope(data: Value) -> (Envelope, Vec<u8>) {
        let envelope = Envelope {
            msg_type: message::MSG_TYPE_CLIENT_REQUEST,
            from_address: None,
            data: Some(data),
        };
        let raw = envelope.encode().unwrap().into_bytes();
        (envelope, raw)
    }

    #[test]
    fn change_leader_derives_is_leader_from_own_address() {
        let server = test_server(0);
        assert_eq!(server.leader(), None);
        assert!(!server.is_leader());

        server.change_leader(Some(Leader {
            address: address(1),
        }));
        assert!(!server.is_leader());
        assert_eq!(server.leader().unwrap().address, address(1));

        server.change_leader(Some(Leader {
            address: address(0),
        }));
        assert!(server.is_leader());

        server.change_leader(None);
        assert!(!server.is_leader());
        assert_eq!(server.leader(), None);
    }

    #[test]
    fn client_request_without_leader_reports_no_leader() {
        let server = test_server(0);
        let (envelope, raw) = client_envelope(json!({ "eventType": "login" }));
        let reply = server.handle_client_request(&envelope, &raw).unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["result"], service::ERROR_CODE_NOT_LEADER);
    }

    #[test]
    fn leader_runs_client_requests_against_the_ledger() {
        let server = test_server(0);
        server.change_leader(Some(Leader {
            address: address(0),
        }));

        let (envelope, raw) = client_envelope(json!({
            "eventType": "register",
            "account": "alice",
            "pswd": "secret",
        }));
        let reply = server.handle_client_request(&envelope, &raw).unwrap();
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["result"], service::SUCCESS_CODE);
    }

    #[test]
    fn leader_loss_clears_accepted_protocol_but_not_promise() {
        let server = test_server(0);
        server.change_leader(Some(Leader {
            address: address(1),
        }));
        {
            let mut acceptor = server.inner.acceptor_state.lock().unwrap();
            acceptor.promise_pid = 700;
            acceptor.accept_protocol =
                Some(crate::message::Protocol::with_value(address(1), 700));
        }

        // Shut the running flag so the post-loss wait returns immediately.
        server.inner.running.store(false, Ordering::SeqCst);
        server.handle_leader_loss();

        assert_eq!(server.leader(), None);
        let acceptor = server.inner.acceptor_state.lock().unwrap();
        assert_eq!(acceptor.accept_protocol, None);
        assert_eq!(acceptor.promise_pid, 700);
    }
}
