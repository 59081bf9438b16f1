//! Per-agent round driver: sequence DFS pseudo-tree construction, UTIL
//! propagation, and VALUE propagation for one room or zone.
//!
//! Grounded on `original_source/app/dpop.py`'s `Dpop.run()` (DFS, then
//! UTIL, then VALUE, in that fixed order every round) and
//! `knhk-consensus/src/pbft.rs`/`hotstuff.rs`'s pattern of a node struct
//! owning its protocol state across phase methods.

use crate::config::DpopConfig;
use crate::dfs::{DfsStatus, PseudoTree};
use crate::domain::ValueIndex;
use crate::message::{agent_topic, Message, RootBid, ValuesPayload, SERVER_ROOT_TOPIC};
use crate::topology::{Area, AgentId, Topology};
use crate::transport::{MessagingAdapter, Recipient};
use crate::{util_engine, value_engine, DpopError, Phase, Result};

/// A frozen copy of this agent's area state, taken at round start.
///
/// Spec §5's "snapshot-on-round-start" concurrency model: a concurrent
/// device-event feed may keep mutating the live [`Area`] (arrivals,
/// clock ticks) while a round is in flight. Every cost this round
/// evaluates reads from the snapshot, not the live area, so the round's
/// result is reproducible from the state it actually started with.
#[derive(Debug, Clone)]
pub struct RoundSnapshot {
    area: Area,
}

/// One room or zone agent: owns its live [`Area`] state and drives it
/// through a round when asked.
#[derive(Debug, Clone)]
pub struct Agent {
    area: Area,
    cfg: DpopConfig,
}

impl Agent {
    /// Build an agent over `area`, configured by `cfg`.
    pub fn new(area: Area, cfg: DpopConfig) -> Self {
        Agent { area, cfg }
    }

    /// This agent's id.
    pub fn id(&self) -> AgentId {
        self.area.id
    }

    /// Read-only access to the live area, e.g. for an external
    /// device-event feed to inspect before mutating it.
    pub fn area(&self) -> &Area {
        &self.area
    }

    /// Mutable access to the live area — the device-event feed's only
    /// entry point. Never touched by an in-flight round, which reads
    /// only its own [`RoundSnapshot`].
    pub fn area_mut(&mut self) -> &mut Area {
        &mut self.area
    }

    /// Freeze the live area into this round's snapshot.
    pub fn begin_round(&self) -> RoundSnapshot {
        RoundSnapshot { area: self.area.clone() }
    }

    /// Run one full round to completion: wait for `ON`, wait for the
    /// coordinator's elected root, build the pseudo-tree, propagate
    /// UTIL, propagate VALUE, then fold the chosen value back into the
    /// live area. Returns this agent's chosen index and the full
    /// assignment map it forwarded.
    pub async fn run_round(
        &mut self,
        topology: &Topology,
        messaging: &dyn MessagingAdapter,
    ) -> Result<(ValueIndex, ValuesPayload)> {
        let own_id = self.id();
        let snapshot = self.begin_round();

        self.await_on(messaging).await?;
        self.publish_bid(topology, messaging).await?;
        let elected = self.await_root(messaging).await?;

        let tree = self.build_pseudo_tree(elected, topology, messaging).await?;
        let join = util_engine::do_util_propagation(own_id, &snapshot.area, &tree, &self.cfg, messaging).await?;
        let (index, values) = value_engine::do_value_propagation(own_id, &tree, &join, &self.cfg, messaging).await?;

        self.area.previous_v = self.area.current_v;
        self.area.current_v = self.cfg.domain.value(index);

        Ok((index, values))
    }

    async fn await_on(&self, messaging: &dyn MessagingAdapter) -> Result<()> {
        let own_id = self.id();
        let raw = messaging
            .recv_list_msg_timeout(Recipient::Agent(own_id), self.cfg.timeout)
            .await
            .ok_or(DpopError::Timeout { phase: Phase::Dfs, agent: own_id })?;
        match Message::decode(&raw) {
            Ok(Message::On) => Ok(()),
            _ => Err(DpopError::MalformedMessage { raw, reason: "expected ON".to_string() }),
        }
    }

    /// Publish this agent's root-election bid: its raw topology degree,
    /// scored against priority coordinator-side (spec §4.6). Mirrors
    /// `mqtt_manager.py: publish_root_msg`.
    async fn publish_bid(&self, topology: &Topology, messaging: &dyn MessagingAdapter) -> Result<()> {
        let bid = RootBid { id: self.id(), score: topology.degree(self.id()) as u64 };
        messaging.publish(SERVER_ROOT_TOPIC, &bid.encode()).await
    }

    async fn await_root(&self, messaging: &dyn MessagingAdapter) -> Result<AgentId> {
        let own_id = self.id();
        let raw = messaging
            .recv_list_msg_timeout(Recipient::Agent(own_id), self.cfg.timeout)
            .await
            .ok_or(DpopError::Timeout { phase: Phase::Dfs, agent: own_id })?;
        match Message::decode(&raw) {
            Ok(Message::Root(elected)) => Ok(elected),
            _ => Err(DpopError::MalformedMessage { raw, reason: "expected ROOT_<n>".to_string() }),
        }
    }

    async fn build_pseudo_tree(
        &self,
        elected: AgentId,
        topology: &Topology,
        messaging: &dyn MessagingAdapter,
    ) -> Result<PseudoTree> {
        let own_id = self.id();
        let mut tree = PseudoTree::new(own_id);
        let outbound = tree.set_root(elected, topology);
        send_all(messaging, outbound).await?;

        while tree.status() != DfsStatus::Done {
            let token = messaging
                .recv_child_timeout(Recipient::Agent(own_id), self.cfg.timeout)
                .await
                .ok_or(DpopError::Timeout { phase: Phase::Dfs, agent: own_id })?;
            let outbound = tree.handle_token(token, topology);
            send_all(messaging, outbound).await?;
        }

        Ok(tree)
    }
}

async fn send_all(messaging: &dyn MessagingAdapter, outbound: Vec<(AgentId, Message)>) -> Result<()> {
    for (to, msg) in outbound {
        let encoded = msg.encode().map_err(|reason| DpopError::MalformedMessage { raw: format!("{msg:?}"), reason })?;
        messaging.publish(&agent_topic(to), &encoded).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Device;
    use crate::transport::LocalBus;
    use std::time::Duration;

    fn fast_cfg() -> DpopConfig {
        let mut cfg = DpopConfig::default();
        cfg.timeout = Duration::from_millis(200);
        cfg
    }

    #[tokio::test]
    async fn isolated_root_picks_a_value_from_its_own_local_costs() {
        let mut area = Area::new_room(1, None, None, None);
        area.upsert_device(Device::new(1, 0, false));
        let cfg = fast_cfg();
        let mut agent = Agent::new(area, cfg.clone());
        let topo = Topology::from_areas(&[agent.area().clone()]);

        let bus = LocalBus::new();
        bus.publish(&agent_topic(1), "ON").await.unwrap();
        bus.publish(&agent_topic(1), &Message::Root(1).encode().unwrap()).await.unwrap();

        let (index, values) = agent.run_round(&topo, &bus).await.unwrap();
        assert_eq!(values[&1], index);
        assert_eq!(agent.area().current_v, cfg.domain.value(index));

        // root never sends UTIL/VALUES anywhere but does report to the coordinator.
        let reported = bus.try_recv_value(Recipient::Coordinator).expect("leaf-root reports to coordinator");
        assert_eq!(reported[&1], index);
    }

    #[tokio::test]
    async fn two_node_chain_synchronizes_through_c3() {
        let cfg = fast_cfg();
        let mut room1 = Area::new_room(1, None, Some(2), None);
        room1.upsert_device(Device::new(1, 0, false));
        let mut room2 = Area::new_room(2, Some(1), None, None);
        room2.upsert_device(Device::new(1, 0, false));

        let mut agent1 = Agent::new(room1, cfg.clone());
        let mut agent2 = Agent::new(room2, cfg.clone());
        let topo = Topology::from_areas(&[agent1.area().clone(), agent2.area().clone()]);

        let bus = LocalBus::new();
        for &id in &[1u64, 2] {
            bus.publish(&agent_topic(id), "ON").await.unwrap();
            bus.publish(&agent_topic(id), &Message::Root(1).encode().unwrap()).await.unwrap();
        }

        let (r1, r2) = tokio::join!(agent1.run_round(&topo, &bus), agent2.run_round(&topo, &bus));
        let (index1, _) = r1.unwrap();
        let (_, values2) = r2.unwrap();
        assert_eq!(values2[&1], index1);
        assert_eq!(values2[&2], values2[&1]); // both critical-free rooms settle on the same call time
    }

    #[tokio::test]
    async fn missing_on_times_out() {
        let cfg = fast_cfg();
        let mut agent = Agent::new(Area::new_room(1, None, None, None), cfg);
        let topo = Topology::from_areas(&[agent.area().clone()]);
        let bus = LocalBus::new();

        let err = agent.run_round(&topo, &bus).await.unwrap_err();
        assert!(matches!(err, DpopError::Timeout { phase: Phase::Dfs, agent: 1 }));
    }
}
