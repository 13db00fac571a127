//! A module that contains the typed cluster configuration, the loader for the
//! per-process JSON file, the reference topology generator and the export of
//! the sibling file handed to clients.
//!
//! The JSON keys (`SERVER_NUM`, `isDistinguisheLearner`, ...) are part of the
//! external interface and are preserved exactly.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::message::Address;
use crate::Result;

fn default_credit_weight() -> u32 {
    100
}

/// One slot of a role list in `server_configuration_map`. The
/// distinguished-learner flag only matters in the learner list, the credit
/// weight only in the server list; both default away elsewhere.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AddressEntry {
    pub address: Address,
    // sic, wire spelling
    #[serde(rename = "isDistinguisheLearner", default)]
    pub is_distinguished_learner: bool,
    #[serde(rename = "creditWeight", default = "default_credit_weight")]
    pub credit_weight: u32,
}

impl AddressEntry {
    fn plain(address: Address) -> Self {
        AddressEntry {
            address,
            is_distinguished_learner: false,
            credit_weight: default_credit_weight(),
        }
    }
}

/// Four parallel role lists, indexed by server position.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ServerConfigurationMap {
    pub server_configuration_list: Vec<AddressEntry>,
    pub proposer_configuration_list: Vec<AddressEntry>,
    pub acceptor_configuration_list: Vec<AddressEntry>,
    pub learner_configuration_list: Vec<AddressEntry>,
}

/// The per-process configuration file.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    #[serde(rename = "SERVER_NUM")]
    pub server_num: usize,
    #[serde(rename = "ACCEPTOR_SOCKET_SERVER_MAX_CONNECTIONS")]
    pub max_connections: i32,
    pub server_configuration_map: ServerConfigurationMap,
    #[serde(default)]
    pub timing: Timing,
}

/// The sibling file exported for clients: any listed server accepts requests
/// and forwards them to the leader.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClientConfiguration {
    pub server_address_list: Vec<Address>,
    #[serde(rename = "SERVER_NUM")]
    pub server_num: usize,
}

/// Every socket and scheduling delay in one place, in milliseconds. All
/// fields are optional in the configuration file and default to the values
/// below.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Timing {
    /// How long the proposer waits for prepare replies.
    pub prepare_response_wait_ms: u64,
    /// How long the proposer waits for accept replies.
    pub accept_response_wait_ms: u64,
    /// Delay before re-entering the prepare phase after a prepare rejection.
    pub prepare_retry_delay_ms: u64,
    /// Delay before re-entering the prepare phase after an accept rejection.
    pub accept_retry_delay_ms: u64,
    /// Idle timeout of the learner UDP sockets.
    pub udp_idle_ms: u64,
    /// Idle timeout of the TCP accept loops, also used as the per-request
    /// socket timeout.
    pub tcp_idle_ms: u64,
    /// Interval between heartbeats from a follower to the leader.
    pub heartbeat_interval_ms: u64,
    /// Accumulated heartbeat silence after which the leader counts as lost.
    /// Must stay above the worst-case election time plus one heartbeat
    /// interval, or elections storm.
    pub leader_loss_threshold_ms: u64,
    /// Wait between observing leader loss and standing for re-election, so
    /// the other replicas observe the loss too.
    pub reelection_wait_ms: u64,
    /// Wait before the very first election, so the cluster's sockets are up.
    pub election_startup_delay_ms: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Timing {
            prepare_response_wait_ms: 5_000,
            accept_response_wait_ms: 5_000,
            prepare_retry_delay_ms: 5_000,
            accept_retry_delay_ms: 5_000,
            udp_idle_ms: 5_000,
            tcp_idle_ms: 5_000,
            heartbeat_interval_ms: 10_000,
            leader_loss_threshold_ms: 30_000,
            reelection_wait_ms: 10_000,
            election_startup_delay_ms: 5_000,
        }
    }
}

impl Timing {
    pub fn prepare_response_wait(&self) -> Duration {
        Duration::from_millis(self.prepare_response_wait_ms)
    }

    pub fn accept_response_wait(&self) -> Duration {
        Duration::from_millis(self.accept_response_wait_ms)
    }

    pub fn prepare_retry_delay(&self) -> Duration {
        Duration::from_millis(self.prepare_retry_delay_ms)
    }

    pub fn accept_retry_delay(&self) -> Duration {
        Duration::from_millis(self.accept_retry_delay_ms)
    }

    pub fn udp_idle(&self) -> Duration {
        Duration::from_millis(self.udp_idle_ms)
    }

    pub fn tcp_idle(&self) -> Duration {
        Duration::from_millis(self.tcp_idle_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn reelection_wait(&self) -> Duration {
        Duration::from_millis(self.reelection_wait_ms)
    }

    pub fn election_startup_delay(&self) -> Duration {
        Duration::from_millis(self.election_startup_delay_ms)
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.server_num == 0 {
            return Err("SERVER_NUM must be positive".into());
        }
        let map = &self.server_configuration_map;
        let lists = [
            ("server_configuration_list", &map.server_configuration_list),
            ("proposer_configuration_list", &map.proposer_configuration_list),
            ("acceptor_configuration_list", &map.acceptor_configuration_list),
            ("learner_configuration_list", &map.learner_configuration_list),
        ];
        for (name, list) in lists.iter() {
            if list.len() != self.server_num {
                return Err(format!(
                    "{} holds {} entries, expected SERVER_NUM = {}",
                    name,
                    list.len(),
                    self.server_num
                )
                .into());
            }
        }
        if !map
            .learner_configuration_list
            .iter()
            .any(|entry| entry.is_distinguished_learner)
        {
            return Err("at least one learner must be distinguished".into());
        }
        Ok(())
    }

    /// Position of `server_id` in the parallel role lists.
    pub fn position_of(&self, server_id: i32) -> Result<usize> {
        self.server_configuration_map
            .server_configuration_list
            .iter()
            .position(|entry| entry.address.server_id == server_id)
            .ok_or_else(|| format!("serverId {} is not configured", server_id).into())
    }

    pub fn server_addresses(&self) -> Vec<Address> {
        addresses(&self.server_configuration_map.server_configuration_list)
    }

    pub fn acceptor_addresses(&self) -> Vec<Address> {
        addresses(&self.server_configuration_map.acceptor_configuration_list)
    }

    pub fn distinguished_learner_addresses(&self) -> Vec<Address> {
        self.server_configuration_map
            .learner_configuration_list
            .iter()
            .filter(|entry| entry.is_distinguished_learner)
            .map(|entry| entry.address.clone())
            .collect()
    }

    pub fn ordinary_learner_addresses(&self) -> Vec<Address> {
        self.server_configuration_map
            .learner_configuration_list
            .iter()
            .filter(|entry| !entry.is_distinguished_learner)
            .map(|entry| entry.address.clone())
            .collect()
    }
}

fn addresses(entries: &[AddressEntry]) -> Vec<Address> {
    entries.iter().map(|entry| entry.address.clone()).collect()
}

/// Number of distinguished learners for a cluster of `server_num`: a quarter
/// of the servers, rounded up, never fewer than one.
pub fn distinguished_count(server_num: usize) -> usize {
    ((server_num + 3) / 4).max(1)
}

/// Builds the reference topology: for base port B and serverId i, the server
/// listens on B+10i, the proposer is B+10i+1 (outbound only), the acceptor
/// B+10i+2 and the learner B+10i+3. The first ⌈N/4⌉ learners are marked
/// distinguished.
pub fn create_address_configuration(
    host: &str,
    base_port: u16,
    server_num: usize,
) -> ServerConfigurationMap {
    let distinguished = distinguished_count(server_num);
    let mut server_configuration_list = Vec::with_capacity(server_num);
    let mut proposer_configuration_list = Vec::with_capacity(server_num);
    let mut acceptor_configuration_list = Vec::with_capacity(server_num);
    let mut learner_configuration_list = Vec::with_capacity(server_num);
    for i in 0..server_num {
        let port = base_port + 10 * i as u16;
        let id = i as i32;
        server_configuration_list.push(AddressEntry::plain(Address::new(host, port, id)));
        proposer_configuration_list.push(AddressEntry::plain(Address::new(host, port + 1, id)));
        acceptor_configuration_list.push(AddressEntry::plain(Address::new(host, port + 2, id)));
        let mut learner = AddressEntry::plain(Address::new(host, port + 3, id));
        learner.is_distinguished_learner = i < distinguished;
        learner_configuration_list.push(learner);
    }
    ServerConfigurationMap {
        server_configuration_list,
        proposer_configuration_list,
        acceptor_configuration_list,
        learner_configuration_list,
    }
}

/// A full configuration for `server_num` servers on one host.
pub fn default_configuration(host: &str, base_port: u16, server_num: usize) -> ClusterConfig {
    ClusterConfig {
        server_num,
        max_connections: (server_num * 2) as i32,
        server_configuration_map: create_address_configuration(host, base_port, server_num),
        timing: Timing::default(),
    }
}

/// Reads and validates the per-process configuration file. Callers treat a
/// failure as fatal to the process.
pub fn load_configuration<P: AsRef<Path>>(path: P) -> Result<ClusterConfig> {
    let raw = fs::read_to_string(path)?;
    let config: ClusterConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}

pub fn write_configuration<P: AsRef<Path>>(config: &ClusterConfig, path: P) -> Result<()> {
    fs::write(path, serde_json::to_string_pretty(config)?)?;
    Ok(())
}

/// Exports the address file the client picks servers from.
pub fn write_client_configuration<P: AsRef<Path>>(config: &ClusterConfig, path: P) -> Result<()> {
    let client = ClientConfiguration {
        server_address_list: config.server_addresses(),
        server_num: config.server_num,
    };
    fs::write(path, serde_json::to_string_pretty(&client)?)?;
    Ok(())
}

pub fn load_client_configuration<P: AsRef<Path>>(path: P) -> Result<ClientConfiguration> {
    let raw = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_topology_ports_and_distinguished_slots() {
        let config = default_configuration("127.0.0.1", 10_000, 10);
        config.validate().unwrap();
        assert_eq!(distinguished_count(10), 3);

        let map = &config.server_configuration_map;
        for i in 0..10 {
            let base = 10_000 + 10 * i as u16;
            assert_eq!(map.server_configuration_list[i].address.port, base);
            assert_eq!(map.proposer_configuration_list[i].address.port, base + 1);
            assert_eq!(map.acceptor_configuration_list[i].address.port, base + 2);
            assert_eq!(map.learner_configuration_list[i].address.port, base + 3);
            assert_eq!(map.server_configuration_list[i].address.server_id, i as i32);
            assert_eq!(
                map.learner_configuration_list[i].is_distinguished_learner,
                i < 3
            );
        }
        assert_eq!(config.distinguished_learner_addresses().len(), 3);
        assert_eq!(config.ordinary_learner_addresses().len(), 7);
    }

    #[test]
    fn single_server_cluster_still_has_a_distinguished_learner() {
        let config = default_configuration("127.0.0.1", 9_000, 1);
        config.validate().unwrap();
        assert_eq!(config.distinguished_learner_addresses().len(), 1);
    }

    #[test]
    fn configuration_json_round_trip_keeps_external_keys() {
        let config = default_configuration("127.0.0.1", 10_000, 4);
        let encoded = serde_json::to_string(&config).unwrap();
        assert!(encoded.contains("\"SERVER_NUM\""));
        assert!(encoded.contains("\"ACCEPTOR_SOCKET_SERVER_MAX_CONNECTIONS\""));
        assert!(encoded.contains("\"isDistinguisheLearner\""));
        assert!(encoded.contains("\"serverId\""));

        let decoded: ClusterConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, config);
    }

    #[test]
    fn timing_defaults_apply_when_absent() {
        let config = default_configuration("127.0.0.1", 10_000, 2);
        let encoded = serde_json::json!({
            "SERVER_NUM": config.server_num,
            "ACCEPTOR_SOCKET_SERVER_MAX_CONNECTIONS": config.max_connections,
            "server_configuration_map": config.server_configuration_map,
        })
        .to_string();
        let decoded: ClusterConfig = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.timing, Timing::default());
        assert_eq!(decoded.timing.heartbeat_interval_ms, 10_000);
        assert_eq!(decoded.timing.leader_loss_threshold_ms, 30_000);
    }

    #[test]
    fn validation_rejects_truncated_lists_and_missing_distinguished() {
        let mut config = default_configuration("127.0.0.1", 10_000, 3);
        config
            .server_configuration_map
            .acceptor_configuration_list
            .pop();
        assert!(config.validate().is_err());

        let mut config = default_configuration("127.0.0.1", 10_000, 3);
        for entry in &mut config
            .server_configuration_map
            .learner_configuration_list
        {
            entry.is_distinguished_learner = false;
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn client_configuration_export_round_trips() {
        let config = default_configuration("127.0.0.1", 11_000, 3);
        let path = std::env::temp_dir().join("paxos_ledger_client_configuration_test.json");
        write_client_configuration(&config, &path).unwrap();
        let client = load_client_configuration(&path).unwrap();
        assert_eq!(client.server_num, 3);
        assert_eq!(client.server_address_list, config.server_addresses());
        let _ = fs::remove_file(path);
    }
}
