//! The `MessagingAdapter` seam and its in-process `LocalBus`
//! implementation.
//!
//! Grounded on `knhk-consensus::network::NetworkNode`'s `DashMap`-backed
//! mailboxes, generalized from P2P gossip broadcast/unicast to the
//! topic-keyed per-kind inboxes the original's `mqtt_manager.py` /
//! `managers/*_manager.py` `has_*_msg()` polling helpers describe. The
//! real publish/subscribe broker's wire transport is an external
//! collaborator (non-goal); `LocalBus` exists so engine code can be
//! tested and run single-process without assuming any particular
//! transport.

use crate::message::{DfsToken, Message, UtilPayload, ValuesPayload, SERVER_ROOT_TOPIC, SERVER_TOPIC};
use crate::topology::AgentId;
use crate::{DpopError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Who a topic resolves to: a specific agent's inbox, or the
/// coordinator's (the `DCOP/SERVER/*` topics both feed this one
/// recipient).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Recipient {
    /// A room or zone agent.
    Agent(AgentId),
    /// The round coordinator.
    Coordinator,
}

/// A FIFO, unbounded-capacity, bounded-memory-by-usage mailbox: a
/// `Mutex<VecDeque<T>>` paired with a `Notify` for async wake-up,
/// matching the teacher's `parking_lot` + `DashMap` concurrency idiom
/// rather than introducing a channel crate it doesn't use.
#[derive(Debug)]
struct Mailbox<T> {
    queue: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for Mailbox<T> {
    fn default() -> Self {
        Mailbox {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }
}

impl<T> Mailbox<T> {
    fn push(&self, item: T) {
        self.queue.lock().push_back(item);
        self.notify.notify_one();
    }

    fn try_pop(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    async fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.try_pop() {
            return Some(item);
        }
        let wait = self.notify.notified();
        tokio::select! {
            _ = wait => self.try_pop(),
            _ = tokio::time::sleep(timeout) => None,
        }
    }

    fn len(&self) -> usize {
        self.queue.lock().len()
    }
}

/// Running per-round message count and average payload size, grounded
/// on `knhk-consensus::network::NetworkStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MailboxStats {
    /// Messages received since the stats were last cleared.
    pub received_count: usize,
    /// Average payload size in bytes, 0.0 if nothing has been received.
    pub average_payload_bytes: f64,
}

#[derive(Debug, Default)]
struct StatsTracker {
    count: Mutex<usize>,
    total_bytes: Mutex<u64>,
}

impl StatsTracker {
    fn record(&self, bytes: usize) {
        *self.count.lock() += 1;
        *self.total_bytes.lock() += bytes as u64;
    }

    fn snapshot(&self) -> MailboxStats {
        let count = *self.count.lock();
        let total = *self.total_bytes.lock();
        MailboxStats {
            received_count: count,
            average_payload_bytes: if count == 0 { 0.0 } else { total as f64 / count as f64 },
        }
    }

    fn clear(&self) {
        *self.count.lock() = 0;
        *self.total_bytes.lock() = 0;
    }
}

#[derive(Debug, Default)]
struct Mailboxes {
    list_msgs_waiting: Mailbox<String>,
    child_msgs: Mailbox<DfsToken>,
    util_msgs: Mailbox<UtilPayload>,
    value_msgs: Mailbox<ValuesPayload>,
    urgent_msgs: Mailbox<AgentId>,
    stats: StatsTracker,
}

/// External transport seam: one publish primitive and the five per-kind
/// inboxes spec §4.1 describes. A real broker-backed adapter and
/// `LocalBus` both implement this the same way, so engine code never
/// assumes a particular transport.
#[async_trait]
pub trait MessagingAdapter: Send + Sync {
    /// Publish `payload` on `topic`. Fire-and-forget: the adapter does
    /// not guarantee delivery, but must not drop locally queued messages
    /// across a round unless explicitly cleared.
    async fn publish(&self, topic: &str, payload: &str) -> Result<()>;

    /// Non-blocking dequeue of a waiting `ON`/`ROOT_<n>`/`PSEUDO <n>`
    /// message, or a root-election bid, for `recipient`.
    fn try_recv_list_msg(&self, recipient: Recipient) -> Option<String>;
    /// Bounded wait for [`try_recv_list_msg`].
    async fn recv_list_msg_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<String>;

    /// Non-blocking dequeue of a `CHILD <n>` or `PSEUDO <n>` DFS token.
    fn try_recv_child(&self, recipient: Recipient) -> Option<DfsToken>;
    /// Bounded wait for [`try_recv_child`].
    async fn recv_child_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<DfsToken>;

    /// Non-blocking dequeue of a `UTIL <json>` payload.
    fn try_recv_util(&self, recipient: Recipient) -> Option<UtilPayload>;
    /// Bounded wait for [`try_recv_util`].
    async fn recv_util_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<UtilPayload>;

    /// Non-blocking dequeue of a `VALUES <json>` payload.
    fn try_recv_value(&self, recipient: Recipient) -> Option<ValuesPayload>;
    /// Bounded wait for [`try_recv_value`].
    async fn recv_value_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<ValuesPayload>;

    /// Non-blocking dequeue of an urgent preemption request's sender id.
    fn try_recv_urgent(&self, recipient: Recipient) -> Option<AgentId>;
    /// Bounded wait for [`try_recv_urgent`].
    async fn recv_urgent_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<AgentId>;

    /// Snapshot this round's message count and average payload size for
    /// `recipient`.
    fn stats(&self, recipient: Recipient) -> MailboxStats;

    /// Clear `recipient`'s stats counters at the start of a new round.
    fn clear_stats(&self, recipient: Recipient);
}

/// In-process implementation: registered agents and the coordinator
/// publish directly into each other's mailboxes. Used for tests and
/// single-process simulation.
#[derive(Debug, Clone, Default)]
pub struct LocalBus {
    mailboxes: Arc<DashMap<Recipient, Arc<Mailboxes>>>,
}

impl LocalBus {
    /// Construct an empty bus.
    pub fn new() -> Self {
        LocalBus::default()
    }

    /// Pre-register a recipient so publishes targeting it before it has
    /// ever received anything still find a mailbox.
    pub fn register(&self, recipient: Recipient) {
        self.mailboxes.entry(recipient).or_default();
    }

    fn mailboxes_for(&self, recipient: Recipient) -> Arc<Mailboxes> {
        self.mailboxes.entry(recipient).or_default().clone()
    }

    fn topic_recipient(topic: &str) -> Result<Recipient> {
        if topic == SERVER_TOPIC || topic == SERVER_ROOT_TOPIC {
            return Ok(Recipient::Coordinator);
        }
        let id_str = topic.strip_prefix("DCOP/").ok_or_else(|| DpopError::MalformedMessage {
            raw: topic.to_string(),
            reason: "unrecognized topic prefix".to_string(),
        })?;
        id_str
            .parse::<AgentId>()
            .map(Recipient::Agent)
            .map_err(|e| DpopError::MalformedMessage {
                raw: topic.to_string(),
                reason: format!("topic agent id: {e}"),
            })
    }
}

#[async_trait]
impl MessagingAdapter for LocalBus {
    async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        let recipient = Self::topic_recipient(topic)?;
        let mailboxes = self.mailboxes_for(recipient);
        mailboxes.stats.record(payload.len());

        if topic == SERVER_ROOT_TOPIC {
            debug!(?recipient, topic, "root bid queued");
            mailboxes.list_msgs_waiting.push(payload.to_string());
            return Ok(());
        }

        match Message::decode(payload) {
            Ok(Message::On) | Ok(Message::Root(_)) => {
                mailboxes.list_msgs_waiting.push(payload.to_string());
            }
            Ok(Message::Child(id)) => mailboxes.child_msgs.push(DfsToken::Child(id)),
            Ok(Message::Pseudo(id)) => mailboxes.child_msgs.push(DfsToken::Pseudo(id)),
            Ok(Message::Util(p)) => mailboxes.util_msgs.push(p),
            Ok(Message::Values(p)) => mailboxes.value_msgs.push(p),
            Ok(Message::Urgent(id)) => mailboxes.urgent_msgs.push(id),
            Err(reason) => {
                warn!(topic, payload, reason, "dropping malformed message");
                return Err(DpopError::MalformedMessage { raw: payload.to_string(), reason });
            }
        }
        Ok(())
    }

    fn try_recv_list_msg(&self, recipient: Recipient) -> Option<String> {
        self.mailboxes_for(recipient).list_msgs_waiting.try_pop()
    }

    async fn recv_list_msg_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<String> {
        self.mailboxes_for(recipient).list_msgs_waiting.pop_timeout(timeout).await
    }

    fn try_recv_child(&self, recipient: Recipient) -> Option<DfsToken> {
        self.mailboxes_for(recipient).child_msgs.try_pop()
    }

    async fn recv_child_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<DfsToken> {
        self.mailboxes_for(recipient).child_msgs.pop_timeout(timeout).await
    }

    fn try_recv_util(&self, recipient: Recipient) -> Option<UtilPayload> {
        self.mailboxes_for(recipient).util_msgs.try_pop()
    }

    async fn recv_util_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<UtilPayload> {
        self.mailboxes_for(recipient).util_msgs.pop_timeout(timeout).await
    }

    fn try_recv_value(&self, recipient: Recipient) -> Option<ValuesPayload> {
        self.mailboxes_for(recipient).value_msgs.try_pop()
    }

    async fn recv_value_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<ValuesPayload> {
        self.mailboxes_for(recipient).value_msgs.pop_timeout(timeout).await
    }

    fn try_recv_urgent(&self, recipient: Recipient) -> Option<AgentId> {
        self.mailboxes_for(recipient).urgent_msgs.try_pop()
    }

    async fn recv_urgent_timeout(&self, recipient: Recipient, timeout: Duration) -> Option<AgentId> {
        self.mailboxes_for(recipient).urgent_msgs.pop_timeout(timeout).await
    }

    fn stats(&self, recipient: Recipient) -> MailboxStats {
        self.mailboxes_for(recipient).stats.snapshot()
    }

    fn clear_stats(&self, recipient: Recipient) {
        self.mailboxes_for(recipient).stats.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::agent_topic;

    #[tokio::test]
    async fn on_and_root_land_in_list_msgs_waiting() {
        let bus = LocalBus::new();
        bus.publish(&agent_topic(1), "ON").await.unwrap();
        bus.publish(&agent_topic(1), "ROOT_1").await.unwrap();
        assert_eq!(bus.try_recv_list_msg(Recipient::Agent(1)), Some("ON".to_string()));
        assert_eq!(bus.try_recv_list_msg(Recipient::Agent(1)), Some("ROOT_1".to_string()));
        assert_eq!(bus.try_recv_list_msg(Recipient::Agent(1)), None);
    }

    #[tokio::test]
    async fn child_and_pseudo_share_the_dfs_token_mailbox() {
        let bus = LocalBus::new();
        bus.publish(&agent_topic(2), "CHILD 5").await.unwrap();
        bus.publish(&agent_topic(2), "PSEUDO 6").await.unwrap();
        assert_eq!(bus.try_recv_child(Recipient::Agent(2)), Some(DfsToken::Child(5)));
        assert_eq!(bus.try_recv_child(Recipient::Agent(2)), Some(DfsToken::Pseudo(6)));
    }

    #[tokio::test]
    async fn root_bid_and_urgent_route_to_coordinator() {
        let bus = LocalBus::new();
        bus.publish(SERVER_ROOT_TOPIC, "4:7").await.unwrap();
        bus.publish(SERVER_TOPIC, "URGT_4").await.unwrap();
        assert_eq!(bus.try_recv_list_msg(Recipient::Coordinator), Some("4:7".to_string()));
        assert_eq!(bus.try_recv_urgent(Recipient::Coordinator), Some(4));
    }

    #[tokio::test]
    async fn recv_timeout_returns_none_when_nothing_arrives() {
        let bus = LocalBus::new();
        let got = bus.recv_child_timeout(Recipient::Agent(9), Duration::from_millis(20)).await;
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn malformed_publish_is_rejected_and_not_queued() {
        let bus = LocalBus::new();
        let err = bus.publish(&agent_topic(1), "GARBAGE").await;
        assert!(err.is_err());
        assert_eq!(bus.try_recv_list_msg(Recipient::Agent(1)), None);
    }

    #[tokio::test]
    async fn stats_track_count_and_average_size() {
        let bus = LocalBus::new();
        bus.publish(&agent_topic(1), "ON").await.unwrap();
        bus.publish(&agent_topic(1), "ROOT_1").await.unwrap();
        let stats = bus.stats(Recipient::Agent(1));
        assert_eq!(stats.received_count, 2);
        assert!(stats.average_payload_bytes > 0.0);
        bus.clear_stats(Recipient::Agent(1));
        assert_eq!(bus.stats(Recipient::Agent(1)), MailboxStats::default());
    }
}
