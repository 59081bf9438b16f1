//! Wire messages: the literal `"KIND arg"` text framing from spec §6,
//! plus the three fixed topic shapes agents and the coordinator publish
//! on.
//!
//! Grounded on `original_source/app/helpers/message_types.py` (the six
//! kinds) and `helpers/mqtt_manager.py` (the exact "topic + payload"
//! shape each `publish_*` method builds). The UTIL/VALUE JSON payload
//! shapes borrow `knhk-consensus::network::PeerMessage`'s pattern of a
//! small typed struct handed to `serde_json`, rather than serializing
//! the whole enum generically — the wire format is intentionally the
//! original's ad hoc text framing, not a structured envelope.

use crate::domain::{Cost, ValueIndex};
use crate::topology::AgentId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `DCOP/<agent_id>`: coordinator-to-agent and peer-to-agent traffic.
pub fn agent_topic(id: AgentId) -> String {
    format!("DCOP/{id}")
}

/// `DCOP/SERVER/`: agent-to-coordinator leaf reports and urgent requests.
pub const SERVER_TOPIC: &str = "DCOP/SERVER/";

/// `DCOP/SERVER/ROOT`: root-election bids.
pub const SERVER_ROOT_TOPIC: &str = "DCOP/SERVER/ROOT";

/// One row of a UTIL tensor on the wire: the list-of-tuples
/// representation spec §4.4 mandates because it is self-describing —
/// each row is a value-index per variable in `vars` order, followed by
/// the combined cost at that assignment.
pub type UtilRow = Vec<Cost>;

/// The `UTIL <json>` payload: `{"vars":[<id>,...],"data":<rows>}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UtilPayload {
    /// Variables the tensor is indexed over, leading (own) axis first.
    pub vars: Vec<AgentId>,
    /// One row per surviving assignment combination.
    pub data: Vec<UtilRow>,
}

/// The `VALUES <json>` payload: `{"<id>":<value_index>,...}` — every
/// ancestor value an agent (or the coordinator) needs to pick its own.
pub type ValuesPayload = HashMap<AgentId, ValueIndex>;

/// The six wire message kinds from spec §6, plus the root-election bid
/// carried on `DCOP/SERVER/ROOT` (present in the topic table but outside
/// the six literal kinds, since it is coordinator-facing only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// `ON` — trigger a round.
    On,
    /// `ROOT_<n>` — broadcast the elected root id.
    Root(AgentId),
    /// `CHILD <n>` — DFS token claiming the sender as a tree child.
    Child(AgentId),
    /// `PSEUDO <n>` — DFS pseudo-edge from the sender.
    Pseudo(AgentId),
    /// `UTIL <json>` — a UTIL tensor sent up the pseudo-tree.
    Util(UtilPayload),
    /// `VALUES <json>` — chosen values sent down the pseudo-tree, or a
    /// leaf's final report to the coordinator.
    Values(ValuesPayload),
    /// `URGT_<n>` — urgent preemption request.
    Urgent(AgentId),
}

/// A DFS token: the original pushes `CHILD`/`PSEUDO` into the same
/// inbox and dispatches on the parsed kind (`dfs_manager.py`); this
/// crate keeps that pairing as one mailbox item type instead of two
/// separate per-kind queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfsToken {
    /// `CHILD <n>` — sender claims this agent as its DFS child.
    Child(AgentId),
    /// `PSEUDO <n>` — sender claims this agent as a pseudo-parent.
    Pseudo(AgentId),
}

/// A root-election bid: `"<id>:<score>"` on `DCOP/SERVER/ROOT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootBid {
    pub id: AgentId,
    pub score: u64,
}

impl RootBid {
    pub fn encode(&self) -> String {
        format!("{}:{}", self.id, self.score)
    }

    pub fn decode(raw: &str) -> Result<Self, String> {
        let (id, score) = raw
            .split_once(':')
            .ok_or_else(|| format!("malformed bid: {raw:?}"))?;
        Ok(RootBid {
            id: id.parse().map_err(|e| format!("bad bid id {id:?}: {e}"))?,
            score: score.parse().map_err(|e| format!("bad bid score {score:?}: {e}"))?,
        })
    }
}

impl Message {
    /// Render to the literal wire string.
    pub fn encode(&self) -> Result<String, String> {
        Ok(match self {
            Message::On => "ON".to_string(),
            Message::Root(id) => format!("ROOT_{id}"),
            Message::Child(id) => format!("CHILD {id}"),
            Message::Pseudo(id) => format!("PSEUDO {id}"),
            Message::Util(payload) => {
                format!("UTIL {}", serde_json::to_string(payload).map_err(|e| e.to_string())?)
            }
            Message::Values(payload) => {
                format!("VALUES {}", serde_json::to_string(payload).map_err(|e| e.to_string())?)
            }
            Message::Urgent(id) => format!("URGT_{id}"),
        })
    }

    /// Parse a literal wire string into a typed message.
    pub fn decode(raw: &str) -> Result<Self, String> {
        if raw == "ON" {
            return Ok(Message::On);
        }
        if let Some(rest) = raw.strip_prefix("ROOT_") {
            return parse_id(rest).map(Message::Root);
        }
        if let Some(rest) = raw.strip_prefix("URGT_") {
            return parse_id(rest).map(Message::Urgent);
        }
        if let Some(rest) = raw.strip_prefix("CHILD ") {
            return parse_id(rest).map(Message::Child);
        }
        if let Some(rest) = raw.strip_prefix("PSEUDO ") {
            return parse_id(rest).map(Message::Pseudo);
        }
        if let Some(rest) = raw.strip_prefix("UTIL ") {
            let payload: UtilPayload = serde_json::from_str(rest).map_err(|e| e.to_string())?;
            return Ok(Message::Util(payload));
        }
        if let Some(rest) = raw.strip_prefix("VALUES ") {
            let payload: ValuesPayload = serde_json::from_str(rest).map_err(|e| e.to_string())?;
            return Ok(Message::Values(payload));
        }
        Err(format!("unrecognized message: {raw:?}"))
    }
}

fn parse_id(raw: &str) -> Result<AgentId, String> {
    raw.parse().map_err(|e| format!("bad agent id {raw:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn on_round_trips() {
        assert_eq!(Message::decode(&Message::On.encode().unwrap()).unwrap(), Message::On);
    }

    #[test]
    fn root_broadcast_round_trips() {
        let msg = Message::Root(7);
        assert_eq!(msg.encode().unwrap(), "ROOT_7");
        assert_eq!(Message::decode("ROOT_7").unwrap(), msg);
    }

    #[test]
    fn child_and_pseudo_use_space_separator() {
        assert_eq!(Message::Child(3).encode().unwrap(), "CHILD 3");
        assert_eq!(Message::Pseudo(3).encode().unwrap(), "PSEUDO 3");
        assert_eq!(Message::decode("CHILD 3").unwrap(), Message::Child(3));
        assert_eq!(Message::decode("PSEUDO 3").unwrap(), Message::Pseudo(3));
    }

    #[test]
    fn urgent_uses_underscore_separator() {
        assert_eq!(Message::Urgent(9).encode().unwrap(), "URGT_9");
        assert_eq!(Message::decode("URGT_9").unwrap(), Message::Urgent(9));
    }

    #[test]
    fn util_payload_round_trips_through_json() {
        let msg = Message::Util(UtilPayload {
            vars: vec![1, 2],
            data: vec![vec![0, 0, 5], vec![0, 1, 3]],
        });
        let encoded = msg.encode().unwrap();
        assert!(encoded.starts_with("UTIL {"));
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn values_payload_round_trips_through_json() {
        let mut payload = ValuesPayload::new();
        payload.insert(1, 0);
        payload.insert(2, 16);
        let msg = Message::Values(payload);
        let encoded = msg.encode().unwrap();
        assert!(encoded.starts_with("VALUES {"));
        assert_eq!(Message::decode(&encoded).unwrap(), msg);
    }

    #[test]
    fn malformed_message_is_rejected() {
        assert!(Message::decode("GARBAGE").is_err());
        assert!(Message::decode("ROOT_notanumber").is_err());
    }

    #[test]
    fn bid_encodes_as_colon_pair() {
        let bid = RootBid { id: 4, score: 7 };
        assert_eq!(bid.encode(), "4:7");
        assert_eq!(RootBid::decode("4:7").unwrap(), bid);
        assert!(RootBid::decode("4").is_err());
    }
}
