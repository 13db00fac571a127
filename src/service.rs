//! The ledger application the elected leader runs client events against:
//! account registration, session-based login, and per-user balance records.
//!
//! The store lives in process behind a mutex. A database-backed deployment
//! only has to keep [`Service::handle_event`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::message::now_millis;

/// Shared success code for every event reply.
pub const SUCCESS_CODE: i64 = 0;
pub const ERROR_CODE_NOT_LOGIN: i64 = 1;
pub const ERROR_CODE_UNKNOWN_MSG: i64 = 2;
pub const ERROR_CODE_NOT_LEADER: i64 = 3;
pub const ERROR_CODE_ACCOUNT_NOT_EXISTS: i64 = 4;
pub const ERROR_CODE_PSWD_NOT_MATCH: i64 = 5;
pub const ERROR_CODE_ACCOUNT_EXISTS: i64 = 6;
pub const ERROR_CODE_RECORD_NOT_EXISTS: i64 = 7;

#[derive(Debug, Clone)]
struct User {
    account: String,
    pswd: String,
}

/// A user's running balance, reported back on `getUserBooks`.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct Balance {
    account: String,
    balance: i64,
    update_timestamp: u64,
    create_timestamp: u64,
}

/// One income/expense entry of a user's ledger.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
struct RecordItem {
    money: i64,
    record_type: i64,
    description: String,
    date_time: String,
    timestamp: u64,
}

#[derive(Default)]
struct Store {
    users: HashMap<String, User>,
    // sessionId -> account
    sessions: HashMap<String, String>,
    balances: HashMap<String, Balance>,
    // newest record first, per account
    records: HashMap<String, Vec<RecordItem>>,
}

impl Store {
    fn balance_entry(&mut self, account: &str) -> &mut Balance {
        let now = now_millis();
        self.balances
            .entry(account.to_string())
            .or_insert_with(|| Balance {
                account: account.to_string(),
                balance: 0,
                update_timestamp: now,
                create_timestamp: now,
            })
    }
}

/// The ledger the leader applies `CLIENT_REQUEST` payloads to, one event at
/// a time.
#[derive(Clone, Default)]
pub struct Service {
    store: Arc<Mutex<Store>>,
}

impl Service {
    pub fn new() -> Self {
        Service::default()
    }

    /// Runs one client event and builds the JSON reply that goes back to the
    /// client as-is.
    pub fn handle_event(&self, data: &Value) -> Value {
        match data.get("eventType").and_then(Value::as_str) {
            Some("register") => self.register(data),
            Some("login") => self.login(data),
            Some("submitBooksRecord") => self.submit_books_record(data),
            Some("getUserBooks") => self.get_user_books(data),
            // sic, wire spelling
            Some("removeReocrd") => self.remove_record(data),
            _ => json!({
                "result": ERROR_CODE_UNKNOWN_MSG,
                "error": "unknown event type",
            }),
        }
    }

    fn register(&self, data: &Value) -> Value {
        let (account, pswd) = match credentials(data) {
            Some(credentials) => credentials,
            None => return malformed_event(),
        };
        let mut store = self.store.lock().unwrap();
        if store.users.contains_key(&account) {
            return json!({
                "result": ERROR_CODE_ACCOUNT_EXISTS,
                "error": "account already exists",
            });
        }
        store.users.insert(
            account.clone(),
            User {
                account: account.clone(),
                pswd,
            },
        );
        store.balance_entry(&account);
        json!({ "result": SUCCESS_CODE, "info": "account registered" })
    }

    fn login(&self, data: &Value) -> Value {
        let (account, pswd) = match credentials(data) {
            Some(credentials) => credentials,
            None => return malformed_event(),
        };
        let mut store = self.store.lock().unwrap();
        let user = match store.users.get(&account) {
            Some(user) => user,
            None => {
                return json!({
                    "result": ERROR_CODE_ACCOUNT_NOT_EXISTS,
                    "error": "account does not exist",
                });
            }
        };
        if user.pswd != pswd {
            return json!({
                "result": ERROR_CODE_PSWD_NOT_MATCH,
                "error": "account or password wrong",
            });
        }
        let account = user.account.clone();
        let session_id = Uuid::new_v4().to_string();
        store.sessions.insert(session_id.clone(), account.clone());
        json!({
            "result": SUCCESS_CODE,
            "info": "logged in",
            "sessionId": session_id,
            "account": account,
        })
    }

    fn submit_books_record(&self, data: &Value) -> Value {
        let mut store = self.store.lock().unwrap();
        let account = match session_account(&store, data) {
            Some(account) => account,
            None => return not_logged_in(),
        };
        let money = data.get("money").and_then(Value::as_i64);
        let record_type = data.get("recordType").and_then(Value::as_i64);
        let description = data.get("description").and_then(Value::as_str);
        let date_time = data.get("dateTime").and_then(Value::as_str);
        let (money, record_type, description, date_time) =
            match (money, record_type, description, date_time) {
                (Some(m), Some(r), Some(d), Some(t)) => (m, r, d.to_string(), t.to_string()),
                _ => return malformed_event(),
            };

        let record = RecordItem {
            money,
            record_type,
            description,
            date_time,
            timestamp: now_millis(),
        };
        store
            .records
            .entry(account.clone())
            .or_insert_with(Vec::new)
            .insert(0, record);
        let now = now_millis();
        let balance = store.balance_entry(&account);
        balance.balance += money;
        balance.update_timestamp = now;
        json!({ "result": SUCCESS_CODE, "info": "record submitted" })
    }

    fn get_user_books(&self, data: &Value) -> Value {
        let mut store = self.store.lock().unwrap();
        let account = match session_account(&store, data) {
            Some(account) => account,
            None => return not_logged_in(),
        };
        let records = store.records.get(&account).cloned().unwrap_or_default();
        let balance = store.balance_entry(&account).clone();
        json!({
            "result": SUCCESS_CODE,
            "records": records,
            "balance": balance,
        })
    }

    fn remove_record(&self, data: &Value) -> Value {
        let mut store = self.store.lock().unwrap();
        let account = match session_account(&store, data) {
            Some(account) => account,
            None => return not_logged_in(),
        };
        let timestamp = match data.get("timestamp").and_then(Value::as_u64) {
            Some(timestamp) => timestamp,
            None => return malformed_event(),
        };
        let removed = match store.records.get_mut(&account) {
            Some(records) => match records.iter().position(|r| r.timestamp == timestamp) {
                Some(position) => Some(records.remove(position)),
                None => None,
            },
            None => None,
        };
        match removed {
            Some(record) => {
                let now = now_millis();
                let balance = store.balance_entry(&account);
                balance.balance -= record.money;
                balance.update_timestamp = now;
                json!({ "result": SUCCESS_CODE, "info": "record removed" })
            }
            None => json!({
                "result": ERROR_CODE_RECORD_NOT_EXISTS,
                "error": "no such record",
            }),
        }
    }
}

fn credentials(data: &Value) -> Option<(String, String)> {
    let account = data.get("account").and_then(Value::as_str)?;
    let pswd = data.get("pswd").and_then(Value::as_str)?;
    Some((account.to_string(), pswd.to_string()))
}

fn session_account(store: &Store, data: &Value) -> Option<String> {
    let session_id = data.get("sessionId").and_then(Value::as_str)?;
    store.sessions.get(session_id).cloned()
}

fn not_logged_in() -> Value {
    json!({ "result": ERROR_CODE_NOT_LOGIN, "error": "not logged in" })
}

fn malformed_event() -> Value {
    json!({ "result": ERROR_CODE_UNKNOWN_MSG, "error": "malformed event" })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login(service: &Service, account: &str, pswd: &str) -> Value {
        service.handle_event(&json!({
            "eventType": "login",
            "account": account,
            "pswd": pswd,
        }))
    }

    fn session(service: &Service) -> String {
        service.handle_event(&json!({
            "eventType": "register",
            "account": "alice",
            "pswd": "secret",
        }));
        login(service, "alice", "secret")["sessionId"]
            .as_str()
            .unwrap()
            .to_string()
    }

    #[test]
    fn register_then_login() {
        let service = Service::new();
        let reply = service.handle_event(&json!({
            "eventType": "register",
            "account": "alice",
            "pswd": "secret",
        }));
        assert_eq!(reply["result"], SUCCESS_CODE);

        let again = service.handle_event(&json!({
            "eventType": "register",
            "account": "alice",
            "pswd": "other",
        }));
        assert_eq!(again["result"], ERROR_CODE_ACCOUNT_EXISTS);

        assert_eq!(
            login(&service, "bob", "secret")["result"],
            ERROR_CODE_ACCOUNT_NOT_EXISTS
        );
        assert_eq!(
            login(&service, "alice", "wrong")["result"],
            ERROR_CODE_PSWD_NOT_MATCH
        );
        let ok = login(&service, "alice", "secret");
        assert_eq!(ok["result"], SUCCESS_CODE);
        assert_eq!(ok["account"], "alice");
        assert!(ok["sessionId"].as_str().unwrap().len() > 0);
    }

    #[test]
    fn records_update_the_balance() {
        let service = Service::new();
        let session = session(&service);

        for money in &[120, -30] {
            let reply = service.handle_event(&json!({
                "eventType": "submitBooksRecord",
                "sessionId": session,
                "money": money,
                "recordType": 0,
                "description": "groceries",
                "dateTime": "2023-11-14 09:00",
            }));
            assert_eq!(reply["result"], SUCCESS_CODE);
        }

        let books = service.handle_event(&json!({
            "eventType": "getUserBooks",
            "sessionId": session,
        }));
        assert_eq!(books["result"], SUCCESS_CODE);
        assert_eq!(books["balance"]["balance"], 90);
        assert_eq!(books["balance"]["account"], "alice");
        let records = books["records"].as_array().unwrap();
        assert_eq!(records.len(), 2);
        // Newest first.
        assert_eq!(records[0]["money"], -30);
        assert_eq!(records[1]["money"], 120);
    }

    #[test]
    fn remove_record_restores_the_balance() {
        let service = Service::new();
        let session = session(&service);
        service.handle_event(&json!({
            "eventType": "submitBooksRecord",
            "sessionId": session,
            "money": 75,
            "recordType": 1,
            "description": "salary",
            "dateTime": "2023-11-14 09:00",
        }));
        let books = service.handle_event(&json!({
            "eventType": "getUserBooks",
            "sessionId": session,
        }));
        let timestamp = books["records"][0]["timestamp"].as_u64().unwrap();

        // sic, wire spelling
        let removed = service.handle_event(&json!({
            "eventType": "removeReocrd",
            "sessionId": session,
            "timestamp": timestamp,
        }));
        assert_eq!(removed["result"], SUCCESS_CODE);

        let again = service.handle_event(&json!({
            "eventType": "removeReocrd",
            "sessionId": session,
            "timestamp": timestamp,
        }));
        assert_eq!(again["result"], ERROR_CODE_RECORD_NOT_EXISTS);

        let books = service.handle_event(&json!({
            "eventType": "getUserBooks",
            "sessionId": session,
        }));
        assert_eq!(books["balance"]["balance"], 0);
        assert_eq!(books["records"].as_array().unwrap().len(), 0);
    }

    #[test]
    fn session_is_required_for_ledger_events() {
        let service = Service::new();
        for event in &["submitBooksRecord", "getUserBooks", "removeReocrd"] {
            let reply = service.handle_event(&json!({
                "eventType": event,
                "sessionId": "bogus",
                "timestamp": 1,
            }));
            assert_eq!(reply["result"], ERROR_CODE_NOT_LOGIN);
        }
    }

    #[test]
    fn unknown_event_type_is_reported() {
        let service = Service::new();
        let reply = service.handle_event(&json!({ "eventType": "transmogrify" }));
        assert_eq!(reply["result"], ERROR_CODE_UNKNOWN_MSG);
        let reply = service.handle_event(&json!({ "money": 1 }));
        assert_eq!(reply["result"], ERROR_CODE_UNKNOWN_MSG);
    }
}
