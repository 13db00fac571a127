//! A module which contains the definition of the messages the cluster roles
//! exchange, and the proposal-number generator.
//!
//! Every TCP message is a JSON [`Envelope`] tagged with `msg_type`; the UDP
//! notices exchanged between acceptors and learners are standalone JSON
//! datagrams. There is no framing: readers drain the connection until the
//! peer closes or a short read signals end-of-message.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

use crate::Result;

/// Result code carried by acceptor replies when a request is granted.
pub const SUCCESS: i64 = 0;
/// Result code carried by acceptor replies when a request is refused.
pub const FAILED: i64 = 1;

pub const MSG_TYPE_PROPOSER_PREPARE: u8 = 0;
pub const MSG_TYPE_PROPOSER_ACCEPT: u8 = 1;
pub const MSG_TYPE_ACCEPTOR_PREPARE_REPLY: u8 = 2;
pub const MSG_TYPE_ACCEPTOR_ACCEPT_REPLY: u8 = 3;
pub const MSG_TYPE_CLIENT_REQUEST: u8 = 4;
pub const MSG_TYPE_HEARTBEAT: u8 = 6;
pub const MSG_TYPE_HEARTBEAT_REPLY: u8 = 7;

/// Where one role of one server listens. `server_id` is stable for the
/// cluster's lifetime; two addresses are equal iff all three fields match.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub host: String,
    pub port: u16,
    #[serde(rename = "serverId")]
    pub server_id: i32,
}

impl Address {
    pub fn new(host: &str, port: u16, server_id: i32) -> Self {
        Address {
            host: host.to_string(),
            port,
            server_id,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.server_id)
    }
}

/// The serverId suffix occupies the last five decimal digits of a pid.
const PID_SERVER_ID_SPAN: u64 = 100_000;

/// A proposal: the server address being put forward as leader, under a
/// totally ordered proposal number. Prepare-phase proposals carry no value
/// yet, so `value` is optional on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Protocol {
    #[serde(default)]
    pub value: Option<Address>,
    pub pid: u64,
}

impl Protocol {
    /// A value-less proposal for the prepare phase.
    pub fn prepare(pid: u64) -> Self {
        Protocol { value: None, pid }
    }

    pub fn with_value(value: Address, pid: u64) -> Self {
        Protocol {
            value: Some(value),
            pid,
        }
    }

    /// The millisecond timestamp prefix the pid was generated from.
    pub fn pid_millis(&self) -> u64 {
        self.pid / PID_SERVER_ID_SPAN
    }
}

/// Builds an 18-digit proposal number: a 13-digit millisecond timestamp,
/// biased downward by `100 * (100 - credit_weight)` ms, followed by the
/// 5-digit zero-padded serverId. A less trusted server therefore loses
/// same-millisecond ties. Requires reasonably synchronized clocks.
pub fn generate_pid(server_id: i32, credit_weight: u32) -> u64 {
    let weight = u64::from(credit_weight.max(1).min(100));
    let millis = now_millis() - 100 * (100 - weight);
    millis * PID_SERVER_ID_SPAN + server_id as u64
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// The currently elected leader, as every server tracks it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Leader {
    pub address: Address,
}

/// The JSON envelope every TCP message travels in. Client requests may omit
/// `from_address`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Envelope {
    pub msg_type: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_address: Option<Address>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Payload of `PROPOSER_PREPARE` and `PROPOSER_ACCEPT`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolPayload {
    pub protocol: Protocol,
}

/// Payload of `ACCEPTOR_PREPARE_REPLY`: the previously accepted protocol (or
/// null) plus the grant/refuse result.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PrepareReply {
    #[serde(default)]
    pub protocol: Option<Protocol>,
    pub result: i64,
}

/// Payload of `ACCEPTOR_ACCEPT_REPLY`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcceptReply {
    pub result: i64,
}

/// An enum which contains all types of messages the roles exchange over TCP,
/// one variant per `msg_type` tag.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Prepare(Protocol),
    Accept(Protocol),
    PrepareReply(PrepareReply),
    AcceptReply(AcceptReply),
    ClientRequest(Value),
    Heartbeat,
    HeartbeatReply,
}

impl Message {
    pub fn msg_type(&self) -> u8 {
        match self {
            Message::Prepare(_) => MSG_TYPE_PROPOSER_PREPARE,
            Message::Accept(_) => MSG_TYPE_PROPOSER_ACCEPT,
            Message::PrepareReply(_) => MSG_TYPE_ACCEPTOR_PREPARE_REPLY,
            Message::AcceptReply(_) => MSG_TYPE_ACCEPTOR_ACCEPT_REPLY,
            Message::ClientRequest(_) => MSG_TYPE_CLIENT_REQUEST,
            Message::Heartbeat => MSG_TYPE_HEARTBEAT,
            Message::HeartbeatReply => MSG_TYPE_HEARTBEAT_REPLY,
        }
    }

    pub fn into_envelope(self, from_address: Address) -> Envelope {
        let msg_type = self.msg_type();
        let data = match self {
            Message::Prepare(protocol) | Message::Accept(protocol) => {
                serde_json::to_value(ProtocolPayload { protocol }).ok()
            }
            Message::PrepareReply(reply) => serde_json::to_value(reply).ok(),
            Message::AcceptReply(reply) => serde_json::to_value(reply).ok(),
            Message::ClientRequest(data) => Some(data),
            Message::Heartbeat | Message::HeartbeatReply => None,
        };
        Envelope {
            msg_type,
            from_address: Some(from_address),
            data,
        }
    }
}

impl Envelope {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &[u8]) -> Result<Envelope> {
        Ok(serde_json::from_slice(raw)?)
    }

    /// Interprets the envelope as a typed [`Message`].
    pub fn message(&self) -> Result<Message> {
        match self.msg_type {
            MSG_TYPE_PROPOSER_PREPARE => {
                let payload: ProtocolPayload = self.payload()?;
                Ok(Message::Prepare(payload.protocol))
            }
            MSG_TYPE_PROPOSER_ACCEPT => {
                let payload: ProtocolPayload = self.payload()?;
                Ok(Message::Accept(payload.protocol))
            }
            MSG_TYPE_ACCEPTOR_PREPARE_REPLY => Ok(Message::PrepareReply(self.payload()?)),
            MSG_TYPE_ACCEPTOR_ACCEPT_REPLY => Ok(Message::AcceptReply(self.payload()?)),
            MSG_TYPE_CLIENT_REQUEST => Ok(Message::ClientRequest(
                self.data.clone().unwrap_or(Value::Null),
            )),
            MSG_TYPE_HEARTBEAT => Ok(Message::Heartbeat),
            MSG_TYPE_HEARTBEAT_REPLY => Ok(Message::HeartbeatReply),
            other => Err(format!("unknown msg_type {}", other).into()),
        }
    }

    fn payload<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        let data = self
            .data
            .clone()
            .ok_or_else(|| format!("message type {} carries no data", self.msg_type))?;
        Ok(serde_json::from_value(data)?)
    }
}

/// UDP notice an acceptor sends to every distinguished learner after
/// accepting a protocol.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AcceptNotice {
    pub from_address: Address,
    pub accept_protocol: Protocol,
}

/// UDP notice a distinguished learner fans out once a protocol is chosen.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ChosenNotice {
    pub from_address: Address,
    // sic, wire spelling
    #[serde(rename = "choosen_protocol")]
    pub chosen_protocol: Protocol,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(id: i32) -> Address {
        Address::new("127.0.0.1", 10_000 + 10 * id as u16, id)
    }

    #[test]
    fn envelope_round_trip() {
        let messages = vec![
            Message::Prepare(Protocol::prepare(170_000_000_000_000_007)),
            Message::Accept(Protocol::with_value(address(0), 170_000_000_000_000_007)),
            Message::PrepareReply(PrepareReply {
                protocol: Some(Protocol::with_value(address(2), 42)),
                result: SUCCESS,
            }),
            Message::PrepareReply(PrepareReply {
                protocol: None,
                result: FAILED,
            }),
            Message::AcceptReply(AcceptReply { result: SUCCESS }),
            Message::ClientRequest(serde_json::json!({ "eventType": "login" })),
            Message::Heartbeat,
            Message::HeartbeatReply,
        ];
        for message in messages {
            let envelope = message.clone().into_envelope(address(1));
            let encoded = envelope.encode().unwrap();
            let decoded = Envelope::decode(encoded.as_bytes()).unwrap();
            assert_eq!(decoded, envelope);
            assert_eq!(decoded.message().unwrap(), message);
        }
    }

    #[test]
    fn client_request_without_from_address_decodes() {
        let raw = r#"{"msg_type":4,"data":{"eventType":"register","account":"a","pswd":"b"}}"#;
        let envelope = Envelope::decode(raw.as_bytes()).unwrap();
        assert_eq!(envelope.from_address, None);
        match envelope.message().unwrap() {
            Message::ClientRequest(data) => assert_eq!(data["eventType"], "register"),
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[test]
    fn unknown_msg_type_is_rejected() {
        let raw = r#"{"msg_type":42}"#;
        let envelope = Envelope::decode(raw.as_bytes()).unwrap();
        assert!(envelope.message().is_err());
    }

    #[test]
    fn chosen_notice_uses_wire_spelling() {
        let notice = ChosenNotice {
            from_address: address(0),
            chosen_protocol: Protocol::with_value(address(1), 7),
        };
        let encoded = serde_json::to_string(&notice).unwrap();
        assert!(encoded.contains("choosen_protocol"));
        let decoded: ChosenNotice = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, notice);
    }

    #[test]
    fn pid_embeds_server_id_and_orders_by_credit() {
        let pid = generate_pid(7, 100);
        assert_eq!(pid % 100_000, 7);
        assert_eq!(pid.to_string().len(), 18);

        // The low-credit pid is generated first, so the clock can only help
        // the high-credit one.
        let low_credit = generate_pid(1, 50);
        let high_credit = generate_pid(0, 100);
        assert!(low_credit < high_credit);
    }

    #[test]
    fn pid_prefix_recovers_millis() {
        let pid = generate_pid(3, 100);
        let protocol = Protocol::prepare(pid);
        assert_eq!(protocol.pid_millis(), pid / 100_000);
    }

    #[test]
    fn protocol_equality_covers_value_and_pid() {
        let a = Protocol::with_value(address(0), 1);
        let b = Protocol::with_value(address(0), 1);
        let c = Protocol::with_value(address(0), 2);
        let d = Protocol::with_value(address(1), 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }
}
