//! Replicated log entries.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde::Serialize;

use crate::membership::Member;
use crate::membership::Membership;
use crate::AppData;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::SessionId;

/// The base of the wire id space reserved for built-in entry types.
///
/// Registry ids 256–415 are reserved for the framework; the on-disk record
/// stores `id - ENTRY_ID_BASE` in its single type byte.
pub const ENTRY_ID_BASE: u16 = 256;

/// Wire ids of the built-in entry types.
pub const NOOP_ID: u16 = 256;
pub const REGISTER_ID: u16 = 257;
pub const KEEP_ALIVE_ID: u16 = 258;
pub const COMMAND_ID: u16 = 259;
pub const QUERY_ID: u16 = 260;
pub const CONFIGURATION_ID: u16 = 261;
pub const UNREGISTER_ID: u16 = 262;
/// The id of the skip record a compacted-out slot leaves behind.
pub const SKIP_ID: u16 = 415;

/// A replicated log entry.
///
/// Every entry records the leader clock (`timestamp`, milliseconds) at the
/// time it was appended, so the log clock used for session expiry advances
/// on every kind of entry, heartbeat no-ops included.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry<D: AppData> {
    pub log_id: LogId,
    pub timestamp: u64,
    #[serde(bound = "D: AppData")]
    pub payload: EntryPayload<D>,
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload<D: AppData> {
    /// An empty payload committed by a new cluster leader.
    NoOp,
    /// Creates a session; the entry's index *is* the session id.
    Register(RegisterEntry),
    /// Renews a session and acknowledges command & event sequences.
    KeepAlive(KeepAliveEntry),
    /// Closes a session cleanly.
    Unregister(UnregisterEntry),
    /// A mutating application operation.
    #[serde(bound = "D: AppData")]
    Command(OperationEntry<D>),
    /// A read operation, recorded for linearizable reads at a log point.
    #[serde(bound = "D: AppData")]
    Query(OperationEntry<D>),
    /// A cluster reconfiguration.
    Configuration(ConfigurationEntry),
}

/// The body of a Register entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterEntry {
    /// The client chosen connection id events are pushed to.
    pub connection: u64,
    /// The session timeout requested by the client, in milliseconds.
    /// Zero requests the cluster default.
    pub timeout: u64,
}

/// The body of a KeepAlive entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveEntry {
    pub session: SessionId,
    /// Acknowledges command responses up to and including this sequence.
    pub command_sequence: u64,
    /// Acknowledges received events up to and including this sequence.
    pub event_sequence: u64,
}

/// The body of an Unregister entry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterEntry {
    pub session: SessionId,
}

/// The body of a Command or Query entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry<D: AppData> {
    pub session: SessionId,
    pub sequence: u64,
    #[serde(bound = "D: AppData")]
    pub operation: D,
}

/// The body of a Configuration entry. The membership version this entry
/// establishes is the entry's own index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub active: BTreeMap<NodeId, Member>,
    pub passive: BTreeMap<NodeId, Member>,
}

impl ConfigurationEntry {
    pub fn from_membership(membership: &Membership) -> Self {
        Self {
            active: membership.active.clone(),
            passive: membership.passive.clone(),
        }
    }

    /// Build the membership view this entry establishes when stored at `index`.
    pub fn to_membership(&self, index: u64) -> Membership {
        Membership {
            version: index,
            active: self.active.clone(),
            passive: self.passive.clone(),
        }
    }
}

impl<D: AppData> Entry<D> {
    /// The session this entry touches, if any.
    pub fn session(&self) -> Option<SessionId> {
        match &self.payload {
            EntryPayload::NoOp | EntryPayload::Configuration(_) => None,
            EntryPayload::Register(_) => Some(self.log_id.index),
            EntryPayload::KeepAlive(e) => Some(e.session),
            EntryPayload::Unregister(e) => Some(e.session),
            EntryPayload::Command(e) | EntryPayload::Query(e) => Some(e.session),
        }
    }

    /// The wire id of this entry's variant.
    pub fn wire_id(&self) -> u16 {
        match &self.payload {
            EntryPayload::NoOp => NOOP_ID,
            EntryPayload::Register(_) => REGISTER_ID,
            EntryPayload::KeepAlive(_) => KEEP_ALIVE_ID,
            EntryPayload::Unregister(_) => UNREGISTER_ID,
            EntryPayload::Command(_) => COMMAND_ID,
            EntryPayload::Query(_) => QUERY_ID,
            EntryPayload::Configuration(_) => CONFIGURATION_ID,
        }
    }

    /// The on-disk type byte of this entry's variant.
    pub(crate) fn wire_tag(&self) -> u8 {
        (self.wire_id() - ENTRY_ID_BASE) as u8
    }

    /// Encode the entry body (everything besides length, term and type,
    /// which the record framing carries) for storage.
    pub(crate) fn encode_body(&self) -> Result<Vec<u8>, serde_json::Error> {
        match &self.payload {
            EntryPayload::NoOp => serde_json::to_vec(&self.timestamp),
            EntryPayload::Register(e) => serde_json::to_vec(&(self.timestamp, e)),
            EntryPayload::KeepAlive(e) => serde_json::to_vec(&(self.timestamp, e)),
            EntryPayload::Unregister(e) => serde_json::to_vec(&(self.timestamp, e)),
            EntryPayload::Command(e) => serde_json::to_vec(&(self.timestamp, e)),
            EntryPayload::Query(e) => serde_json::to_vec(&(self.timestamp, e)),
            EntryPayload::Configuration(e) => serde_json::to_vec(&(self.timestamp, e)),
        }
    }

    /// Decode an entry from its framing metadata and stored body.
    pub(crate) fn decode(log_id: LogId, tag: u8, body: &[u8]) -> Result<Self, serde_json::Error> {
        let id = ENTRY_ID_BASE + tag as u16;
        let (timestamp, payload) = match id {
            NOOP_ID => (serde_json::from_slice::<u64>(body)?, EntryPayload::NoOp),
            REGISTER_ID => {
                let (ts, e) = serde_json::from_slice::<(u64, RegisterEntry)>(body)?;
                (ts, EntryPayload::Register(e))
            }
            KEEP_ALIVE_ID => {
                let (ts, e) = serde_json::from_slice::<(u64, KeepAliveEntry)>(body)?;
                (ts, EntryPayload::KeepAlive(e))
            }
            UNREGISTER_ID => {
                let (ts, e) = serde_json::from_slice::<(u64, UnregisterEntry)>(body)?;
                (ts, EntryPayload::Unregister(e))
            }
            COMMAND_ID => {
                let (ts, e) = serde_json::from_slice::<(u64, OperationEntry<D>)>(body)?;
                (ts, EntryPayload::Command(e))
            }
            QUERY_ID => {
                let (ts, e) = serde_json::from_slice::<(u64, OperationEntry<D>)>(body)?;
                (ts, EntryPayload::Query(e))
            }
            CONFIGURATION_ID => {
                let (ts, e) = serde_json::from_slice::<(u64, ConfigurationEntry)>(body)?;
                (ts, EntryPayload::Configuration(e))
            }
            other => {
                return Err(serde::de::Error::custom(format!("unknown entry wire id {}", other)));
            }
        };
        Ok(Self {
            log_id,
            timestamp,
            payload,
        })
    }
}

impl<D: AppData> MessageSummary for Entry<D> {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl<D: AppData> MessageSummary for &[std::sync::Arc<Entry<D>>] {
    fn summary(&self) -> String {
        self.iter().map(|e| e.summary()).collect::<Vec<_>>().join(",")
    }
}

impl<D: AppData> MessageSummary for EntryPayload<D> {
    fn summary(&self) -> String {
        match self {
            EntryPayload::NoOp => "no-op".to_string(),
            EntryPayload::Register(e) => format!("register: connection {}", e.connection),
            EntryPayload::KeepAlive(e) => {
                format!("keep-alive: session {}, cmd {}, evt {}", e.session, e.command_sequence, e.event_sequence)
            }
            EntryPayload::Unregister(e) => format!("unregister: session {}", e.session),
            EntryPayload::Command(e) => format!("command: session {}, seq {}", e.session, e.sequence),
            EntryPayload::Query(e) => format!("query: session {}, seq {}", e.session, e.sequence),
            EntryPayload::Configuration(e) => {
                format!("configuration: active {:?}, passive {:?}", e.active.keys(), e.passive.keys())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_round_trips_commands() {
        let entry: Entry<String> = Entry {
            log_id: LogId::new(3, 17),
            timestamp: 42_000,
            payload: EntryPayload::Command(OperationEntry {
                session: 4,
                sequence: 9,
                operation: "PUT k=v".to_string(),
            }),
        };
        let body = entry.encode_body().unwrap();
        let decoded = Entry::<String>::decode(entry.log_id, entry.wire_tag(), &body).unwrap();
        assert_eq!(decoded, entry);
    }

    #[test]
    fn codec_round_trips_configuration() {
        let membership = Membership::seed(vec![Member::new(1, "a"), Member::new(2, "b")]);
        let entry: Entry<String> = Entry {
            log_id: LogId::new(1, 5),
            timestamp: 1,
            payload: EntryPayload::Configuration(ConfigurationEntry::from_membership(&membership)),
        };
        let body = entry.encode_body().unwrap();
        let decoded = Entry::<String>::decode(entry.log_id, entry.wire_tag(), &body).unwrap();
        assert_eq!(decoded, entry);
        match decoded.payload {
            EntryPayload::Configuration(c) => {
                assert_eq!(c.to_membership(5).version, 5);
                assert_eq!(c.to_membership(5).active.len(), 2);
            }
            _ => panic!("wrong payload"),
        }
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let res = Entry::<String>::decode(LogId::new(1, 1), 99, b"0");
        assert!(res.is_err());
    }

    #[test]
    fn register_session_is_its_own_index() {
        let entry: Entry<String> = Entry {
            log_id: LogId::new(1, 8),
            timestamp: 0,
            payload: EntryPayload::Register(RegisterEntry {
                connection: 77,
                timeout: 0,
            }),
        };
        assert_eq!(entry.session(), Some(8));
    }
}
