//! The module that contains the Paxos roles: proposers drive election
//! rounds, acceptors arbitrate them, and learners deliver the chosen leader
//! to their local server. Only the leader's identity is agreed on; there is
//! no log replication.

use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use crate::configurations::Timing;
use crate::message::{
    self, AcceptNotice, AcceptReply, Address, ChosenNotice, Envelope, Leader, Message,
    PrepareReply, Protocol,
};
use crate::net_node;
use crate::server::Server;
use crate::Result;

/// Implement this trait if you are a role which needs to run in a loop,
/// receiving and sending messages, until its process stops.
pub trait Runnable {
    fn run(&mut self);
}

/// Smallest number of acceptors that constitutes a majority.
pub(crate) fn majority_of(count: usize) -> usize {
    count / 2 + 1
}

/// Two chosen protocols for the same value re-announce unless their pid
/// timestamps lie within this window. Without the window a replica that
/// re-elects the same leader could never inform a recovering peer.
const REANNOUNCE_WINDOW_MS: u64 = 10_000;

/// Promise/accept bookkeeping. Shared with the local server so it can reset
/// the accepted protocol on leader loss; the promise stays monotone.
#[derive(Debug, Default)]
pub struct AcceptorState {
    pub promise_pid: u64,
    pub accept_protocol: Option<Protocol>,
}

/// The struct representing the acceptor in the Paxos algorithm. Handles one
/// TCP message at a time, which keeps the promise/accept rules serialized.
pub struct Acceptor {
    local_address: Address,
    distinguished_learner_address_list: Vec<Address>,
    state: Arc<Mutex<AcceptorState>>,
    max_connections: i32,
    timing: Timing,
    running: Arc<AtomicBool>,
}

impl Acceptor {
    pub fn new(
        local_address: Address,
        distinguished_learner_address_list: Vec<Address>,
        max_connections: i32,
        timing: Timing,
        running: Arc<AtomicBool>,
    ) -> Self {
        Acceptor {
            local_address,
            distinguished_learner_address_list,
            state: Arc::new(Mutex::new(AcceptorState::default())),
            max_connections,
            timing,
            running,
        }
    }

    /// Handle to the promise/accept state, used by the local server.
    pub fn state(&self) -> Arc<Mutex<AcceptorState>> {
        self.state.clone()
    }

    /// Prepare: promise iff the pid is strictly above everything promised so
    /// far, and report the previously accepted protocol back.
    pub fn on_prepare(&self, protocol: &Protocol) -> PrepareReply {
        let mut state = self.state.lock().unwrap();
        if protocol.pid > state.promise_pid {
            state.promise_pid = protocol.pid;
            PrepareReply {
                protocol: state.accept_protocol.clone(),
                result: message::SUCCESS,
            }
        } else {
            PrepareReply {
                protocol: None,
                result: message::FAILED,
            }
        }
    }

    /// Accept: admit a pid at or above the promise, or a re-accept of the
    /// value already held at any pid. Every acceptance is reported to the
    /// distinguished learners.
    pub fn on_accept(&self, protocol: &Protocol) -> AcceptReply {
        if protocol.value.is_none() {
            return AcceptReply {
                result: message::FAILED,
            };
        }
        let accepted = {
            let mut state = self.state.lock().unwrap();
            let same_value = state
                .accept_protocol
                .as_ref()
                .map(|held| held.value == protocol.value)
                .unwrap_or(false);
            if protocol.pid >= state.promise_pid || same_value {
                state.promise_pid = state.promise_pid.max(protocol.pid);
                state.accept_protocol = Some(protocol.clone());
                true
            } else {
                false
            }
        };
        if accepted {
            info!(
                "[A={}] accepted protocol pid={} value={:?}",
                self.local_address.server_id,
                protocol.pid,
                protocol.value.as_ref().map(|a| a.server_id)
            );
            self.notify_distinguished_learners(protocol.clone());
            AcceptReply {
                result: message::SUCCESS,
            }
        } else {
            AcceptReply {
                result: message::FAILED,
            }
        }
    }

    fn notify_distinguished_learners(&self, accept_protocol: Protocol) {
        let notice = AcceptNotice {
            from_address: self.local_address.clone(),
            accept_protocol,
        };
        let targets = self.distinguished_learner_address_list.clone();
        thread::spawn(move || net_node::udp_send(&targets, &notice));
    }

    fn handle_connection(&self, mut stream: TcpStream) -> Result<()> {
        stream.set_read_timeout(Some(self.timing.tcp_idle()))?;
        stream.set_write_timeout(Some(self.timing.tcp_idle()))?;
        let raw = net_node::recv_all(&mut stream)?;
        if raw.is_empty() {
            return Ok(());
        }
        let envelope = Envelope::decode(&raw)?;
        let reply = match envelope.message()? {
            Message::Prepare(protocol) => {
                info!(
                    "[A={}] prepare pid={}",
                    self.local_address.server_id, protocol.pid
                );
                Message::PrepareReply(self.on_prepare(&protocol))
            }
            Message::Accept(protocol) => Message::AcceptReply(self.on_accept(&protocol)),
            other => {
                debug!(
                    "[A={}] unexpected message {:?}, ignoring",
                    self.local_address.server_id, other
                );
                return Ok(());
            }
        };
        let encoded = reply.into_envelope(self.local_address.clone()).encode()?;
        stream.write_all(encoded.as_bytes())?;
        Ok(())
    }
}

impl Runnable for Acceptor {
    fn run(&mut self) {
        let listener = match net_node::tcp_listener(&self.local_address, self.max_connections) {
            Ok(listener) => listener,
            Err(e) => {
                error!(
                    "[A={}] cannot listen on {}: {}",
                    self.local_address.server_id, self.local_address, e
                );
                return;
            }
        };
        info!(
            "[A={}] acceptor listening on {}",
            self.local_address.server_id, self.local_address
        );
        while self.running.load(Ordering::SeqCst) {
            let stream = match net_node::accept_with_timeout(
                &listener,
                self.timing.tcp_idle(),
                &self.running,
            ) {
                Some(stream) => stream,
                None => continue,
            };
            if let Err(e) = self.handle_connection(stream) {
                warn!(
                    "[A={}] dropping request: {}",
                    self.local_address.server_id, e
                );
            }
        }
    }
}

/// The struct representing the proposer in the Paxos algorithm: a one-round
/// state machine driven by the local server, at most one round in flight.
#[derive(Clone)]
pub struct Proposer {
    local_address: Address,
    acceptor_address_list: Vec<Address>,
    majority_of_acceptors: usize,
    in_round: Arc<AtomicBool>,
    timing: Timing,
    running: Arc<AtomicBool>,
}

impl Proposer {
    pub fn new(
        local_address: Address,
        acceptor_address_list: Vec<Address>,
        timing: Timing,
        running: Arc<AtomicBool>,
    ) -> Self {
        let majority_of_acceptors = majority_of(acceptor_address_list.len());
        Proposer {
            local_address,
            acceptor_address_list,
            majority_of_acceptors,
            in_round: Arc::new(AtomicBool::new(false)),
            timing,
            running,
        }
    }

    pub fn is_in_round(&self) -> bool {
        self.in_round.load(Ordering::SeqCst)
    }

    /// Starts a round proposing `server_address` as leader on a background
    /// thread. Refused while another round is active.
    pub fn start_round(&self, server_address: Address, credit_weight: u32) -> bool {
        if self
            .in_round
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let proposer = self.clone();
        thread::spawn(move || {
            proposer.run_round(server_address, credit_weight);
            proposer.in_round.store(false, Ordering::SeqCst);
        });
        true
    }

    /// One election: prepare until a majority promises, propose the selected
    /// value, retry with a fresh pid on rejection. The round ends when a
    /// majority accepts; installing the leader is the learners' job.
    fn run_round(&self, server_address: Address, credit_weight: u32) {
        while self.running.load(Ordering::SeqCst) {
            let pid = message::generate_pid(server_address.server_id, credit_weight);
            info!(
                "[P={}] entering prepare phase, pid={}",
                self.local_address.server_id, pid
            );
            let promised = self.prepare_phase(pid);
            if promised.len() < self.majority_of_acceptors {
                info!(
                    "[P={}] prepare pid={} rejected ({}/{} promised)",
                    self.local_address.server_id,
                    pid,
                    promised.len(),
                    self.majority_of_acceptors
                );
                if !net_node::sleep_while_running(&self.running, self.timing.prepare_retry_delay())
                {
                    return;
                }
                continue;
            }

            let protocol = select_value(&promised, &server_address, pid);
            info!(
                "[P={}] entering accept phase, pid={} value={:?}",
                self.local_address.server_id,
                pid,
                protocol.value.as_ref().map(|a| a.server_id)
            );
            if self.accept_phase(&protocol) {
                info!(
                    "[P={}] protocol accepted by a majority, pid={}",
                    self.local_address.server_id, pid
                );
                return;
            }
            info!(
                "[P={}] accept pid={} rejected, re-entering prepare phase",
                self.local_address.server_id, pid
            );
            if !net_node::sleep_while_running(&self.running, self.timing.accept_retry_delay()) {
                return;
            }
        }
    }

    /// Sends the prepare to every acceptor in parallel and keeps the replies
    /// that granted a promise.
    fn prepare_phase(&self, pid: u64) -> Vec<PrepareReply> {
        let envelope =
            Message::Prepare(Protocol::prepare(pid)).into_envelope(self.local_address.clone());
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "[P={}] cannot encode prepare: {}",
                    self.local_address.server_id, e
                );
                return Vec::new();
            }
        };
        net_node::broadcast(
            &self.acceptor_address_list,
            &payload,
            self.timing.prepare_response_wait(),
        )
        .into_iter()
        .filter_map(|raw| raw.and_then(|raw| decode_prepare_reply(&raw)))
        .filter(|reply| reply.result == message::SUCCESS)
        .collect()
    }

    fn accept_phase(&self, protocol: &Protocol) -> bool {
        let envelope =
            Message::Accept(protocol.clone()).into_envelope(self.local_address.clone());
        let payload = match envelope.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!(
                    "[P={}] cannot encode accept: {}",
                    self.local_address.server_id, e
                );
                return false;
            }
        };
        let accepted = net_node::broadcast(
            &self.acceptor_address_list,
            &payload,
            self.timing.accept_response_wait(),
        )
        .into_iter()
        .filter_map(|raw| raw.and_then(|raw| decode_accept_reply(&raw)))
        .filter(|reply| reply.result == message::SUCCESS)
        .count();
        accepted >= self.majority_of_acceptors
    }
}

/// Picks the value for the accept phase: if any promise carried a previously
/// accepted protocol, the one with the highest pid wins and its value is
/// re-proposed under the new pid; otherwise the proposer's own server
/// address goes forward.
fn select_value(promised: &[PrepareReply], server_address: &Address, pid: u64) -> Protocol {
    let prior = promised
        .iter()
        .filter_map(|reply| reply.protocol.as_ref())
        .max_by_key(|protocol| protocol.pid);
    match prior {
        Some(previous) => Protocol {
            value: previous.value.clone(),
            pid,
        },
        None => Protocol::with_value(server_address.clone(), pid),
    }
}

fn decode_prepare_reply(raw: &str) -> Option<PrepareReply> {
    match Envelope::decode(raw.as_bytes()).and_then(|envelope| envelope.message()) {
        Ok(Message::PrepareReply(reply)) => Some(reply),
        Ok(other) => {
            debug!("unexpected prepare reply {:?}, ignoring", other);
            None
        }
        Err(e) => {
            warn!("malformed prepare reply: {}", e);
            None
        }
    }
}

fn decode_accept_reply(raw: &str) -> Option<AcceptReply> {
    match Envelope::decode(raw.as_bytes()).and_then(|envelope| envelope.message()) {
        Ok(Message::AcceptReply(reply)) => Some(reply),
        Ok(other) => {
            debug!("unexpected accept reply {:?}, ignoring", other);
            None
        }
        Err(e) => {
            warn!("malformed accept reply: {}", e);
            None
        }
    }
}

/// The struct representing an ordinary learner: it waits for chosen-protocol
/// notices and installs the leader on its local server.
pub struct Learner {
    local_address: Address,
    server: Server,
    timing: Timing,
    running: Arc<AtomicBool>,
}

impl Learner {
    pub fn new(
        local_address: Address,
        server: Server,
        timing: Timing,
        running: Arc<AtomicBool>,
    ) -> Self {
        Learner {
            local_address,
            server,
            timing,
            running,
        }
    }
}

impl Runnable for Learner {
    fn run(&mut self) {
        let socket = match net_node::udp_listener(&self.local_address, self.timing.udp_idle()) {
            Ok(socket) => socket,
            Err(e) => {
                error!(
                    "[L={}] cannot listen on {}: {}",
                    self.local_address.server_id, self.local_address, e
                );
                return;
            }
        };
        info!(
            "[L={}] learner listening on {}",
            self.local_address.server_id, self.local_address
        );
        let mut buffer = [0u8; 2048];
        while self.running.load(Ordering::SeqCst) {
            let n = match socket.recv_from(&mut buffer) {
                Ok((n, _)) => n,
                Err(ref e) if is_idle_timeout(e) => continue,
                Err(e) => {
                    warn!("[L={}] receive failed: {}", self.local_address.server_id, e);
                    continue;
                }
            };
            let notice: ChosenNotice = match serde_json::from_slice(&buffer[..n]) {
                Ok(notice) => notice,
                Err(e) => {
                    warn!(
                        "[L={}] malformed datagram, dropping: {}",
                        self.local_address.server_id, e
                    );
                    continue;
                }
            };
            match notice.chosen_protocol.value {
                Some(address) => {
                    info!(
                        "[L={}] chosen protocol from {}: leader is {}",
                        self.local_address.server_id, notice.from_address, address
                    );
                    self.server.change_leader(Some(Leader { address }));
                }
                None => warn!(
                    "[L={}] chosen protocol without value, dropping",
                    self.local_address.server_id
                ),
            }
        }
    }
}

/// A learner in charge: it aggregates the acceptors' accepted protocols,
/// detects when one gains majority support, installs the leader locally and
/// fans the chosen protocol out to the ordinary learners.
pub struct DistinguishedLearner {
    local_address: Address,
    server: Server,
    learner_address_list: Vec<Address>,
    majority_of_acceptors: usize,
    accepted_by_acceptor: HashMap<i32, Protocol>,
    chosen: Option<Protocol>,
    timing: Timing,
    running: Arc<AtomicBool>,
}

impl DistinguishedLearner {
    pub fn new(
        local_address: Address,
        server: Server,
        learner_address_list: Vec<Address>,
        acceptor_num: usize,
        timing: Timing,
        running: Arc<AtomicBool>,
    ) -> Self {
        DistinguishedLearner {
            local_address,
            server,
            learner_address_list,
            majority_of_acceptors: majority_of(acceptor_num),
            accepted_by_acceptor: HashMap::new(),
            chosen: None,
            timing,
            running,
        }
    }

    /// Records the acceptor's latest accepted protocol and reports the newly
    /// chosen protocol when a majority of acceptors currently hold it. A
    /// repeat of the current choice within the re-announce window returns
    /// None so the learners are not notified again.
    fn handle_accept_notice(
        &mut self,
        from_address: Address,
        accept_protocol: Protocol,
    ) -> Option<Protocol> {
        self.accepted_by_acceptor
            .insert(from_address.server_id, accept_protocol.clone());
        let count = self
            .accepted_by_acceptor
            .values()
            .filter(|held| **held == accept_protocol)
            .count();
        if count < self.majority_of_acceptors {
            return None;
        }
        if let Some(chosen) = &self.chosen {
            let newer = chosen.pid_millis().max(accept_protocol.pid_millis());
            let older = chosen.pid_millis().min(accept_protocol.pid_millis());
            if chosen.value == accept_protocol.value && newer - older < REANNOUNCE_WINDOW_MS {
                self.chosen = Some(accept_protocol);
                return None;
            }
        }
        self.chosen = Some(accept_protocol.clone());
        Some(accept_protocol)
    }

    fn announce(&self, chosen: Protocol) {
        if let Some(address) = chosen.value.clone() {
            self.server.change_leader(Some(Leader { address }));
        }
        let notice = ChosenNotice {
            from_address: self.local_address.clone(),
            chosen_protocol: chosen,
        };
        net_node::udp_send(&self.learner_address_list, &notice);
    }
}

impl Runnable for DistinguishedLearner {
    fn run(&mut self) {
        let socket = match net_node::udp_listener(&self.local_address, self.timing.udp_idle()) {
            Ok(socket) => socket,
            Err(e) => {
                error!(
                    "[DL={}] cannot listen on {}: {}",
                    self.local_address.server_id, self.local_address, e
                );
                return;
            }
        };
        info!(
            "[DL={}] distinguished learner listening on {}",
            self.local_address.server_id, self.local_address
        );
        let mut buffer = [0u8; 2048];
        while self.running.load(Ordering::SeqCst) {
            let n = match socket.recv_from(&mut buffer) {
                Ok((n, _)) => n,
                Err(ref e) if is_idle_timeout(e) => continue,
                Err(e) => {
                    warn!(
                        "[DL={}] receive failed: {}",
                        self.local_address.server_id, e
                    );
                    continue;
                }
            };
            let notice: AcceptNotice = match serde_json::from_slice(&buffer[..n]) {
                Ok(notice) => notice,
                Err(e) => {
                    warn!(
                        "[DL={}] malformed datagram, dropping: {}",
                        self.local_address.server_id, e
                    );
                    continue;
                }
            };
            debug!(
                "[DL={}] acceptor {} accepted pid={}",
                self.local_address.server_id, notice.from_address, notice.accept_protocol.pid
            );
            if let Some(chosen) = self.handle_accept_notice(notice.from_address, notice.accept_protocol)
            {
                info!(
                    "[DL={}] protocol chosen, pid={} leader={:?}",
                    self.local_address.server_id,
                    chosen.pid,
                    chosen.value.as_ref().map(|a| a.server_id)
                );
                self.announce(chosen);
            }
        }
    }
}

fn is_idle_timeout(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
    )
}
