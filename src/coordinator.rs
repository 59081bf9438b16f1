//! The round coordinator: triggers a round, elects the pseudo-tree root,
//! collects every agent's final assignment, tracks per-agent priority,
//! and can force a critical agent to root for exactly one round.
//!
//! Grounded on `original_source/app/threads/starter.py` (`run`,
//! `choose_root`, `manage_priorities`) and `threads/urgt_starter.py`
//! (`UrgentStarter.choose_root`'s one-shot `critical_root_chosen`
//! override), with the shape of an owned, no-singleton struct borrowed
//! from `knhk-consensus::validator::ValidatorSet`.

use crate::config::DpopConfig;
use crate::domain::ValueIndex;
use crate::message::{agent_topic, Message, RootBid, ValuesPayload, SERVER_TOPIC};
use crate::topology::AgentId;
use crate::transport::{MessagingAdapter, Recipient};
use crate::{DpopError, Phase, Result};
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::{info, warn};

/// Sentinel coordinator-side "agent" id used when a [`DpopError::Timeout`]
/// can't be attributed to one specific agent (e.g. root election never
/// completing) — `starter.py` uses the same zero value as its own
/// "no root chosen yet" default, since 0 is never a real room id.
const COORDINATOR_SENTINEL: AgentId = 0;

/// One round's outcome: who was elected root, every agent's final value
/// index, and the priority table after this round's update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundReport {
    /// The pseudo-tree root this round ran under.
    pub elected_root: AgentId,
    /// Every agent's chosen domain index, ordered by descending priority
    /// (ties broken by ascending agent id) — spec §4.6 step 5.
    pub assignments: Vec<(AgentId, ValueIndex)>,
    /// Priority after this round's update, keyed by agent id.
    pub priorities: HashMap<AgentId, u64>,
}

/// Drives rounds for a fixed set of agents. Owns the priority and
/// last-result bookkeeping `starter.py`'s `Starter` keeps as instance
/// state — no global/singleton state, one `Coordinator` per monitored
/// fleet.
#[derive(Debug, Clone)]
pub struct Coordinator {
    agents: Vec<AgentId>,
    cfg: DpopConfig,
    priorities: HashMap<AgentId, u64>,
    last_index: HashMap<AgentId, ValueIndex>,
    forced_root: Option<AgentId>,
    /// Set for the one round a forced root preempts, cleared right after
    /// that round completes — lets a caller driving [`Coordinator::run`]
    /// tell an urgent, out-of-schedule round apart from a routine one.
    paused: bool,
}

impl Coordinator {
    /// Build a coordinator over `agents`, every priority starting at 0
    /// and every last-known index at the domain's infinity sentinel.
    pub fn new(agents: Vec<AgentId>, cfg: DpopConfig) -> Self {
        let infinity_index = cfg.domain.infinity_index();
        let priorities = agents.iter().map(|&a| (a, 0)).collect();
        let last_index = agents.iter().map(|&a| (a, infinity_index)).collect();
        Coordinator { agents, cfg, priorities, last_index, forced_root: None, paused: false }
    }

    /// Whether the in-flight (or most recently completed) round was an
    /// urgent preemption rather than a routine scheduled one.
    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Accept an urgent preemption request naming `agent` as the next
    /// forced root, rejecting (and logging) an id outside the configured
    /// agent set. Shared by [`Self::absorb_urgent_requests`] and the
    /// out-of-schedule listener branch of [`Self::run`].
    fn accept_urgent(&mut self, agent: AgentId) {
        if !self.agents.contains(&agent) {
            warn!(error = %DpopError::UnknownUrgentRoot { agent }, "ignoring urgent preemption request");
            return;
        }
        self.forced_root = Some(agent);
        self.paused = true;
    }

    /// Drain any urgent preemption requests queued since the last round,
    /// remembering the most recent one to force as root next round.
    /// Mirrors `UrgentStarter`'s `critical_root_chosen`, set externally
    /// whenever a critical device's `URGT_<n>` reaches the coordinator.
    fn absorb_urgent_requests(&mut self, messaging: &dyn MessagingAdapter) {
        while let Some(agent) = messaging.try_recv_urgent(Recipient::Coordinator) {
            self.accept_urgent(agent);
        }
    }

    async fn elect_root(&self, messaging: &dyn MessagingAdapter) -> Result<AgentId> {
        let mut bids: Vec<RootBid> = Vec::new();
        while bids.len() < self.agents.len() {
            let raw = messaging
                .recv_list_msg_timeout(Recipient::Coordinator, self.cfg.timeout)
                .await
                .ok_or(DpopError::Timeout { phase: Phase::Dfs, agent: COORDINATOR_SENTINEL })?;
            let bid = RootBid::decode(&raw).map_err(|reason| DpopError::MalformedMessage { raw, reason })?;
            bids.push(bid);
        }

        let mut elected = bids[0].id;
        let mut best_score = 0u64;
        for bid in &bids {
            let priority = self.priorities.get(&bid.id).copied().unwrap_or(0);
            let score = bid.score + 2 * priority;
            if score > best_score {
                best_score = score;
                elected = bid.id;
            }
        }
        Ok(elected)
    }

    fn update_priorities(&mut self, received: &ValuesPayload) {
        let urgt_time = self.cfg.urgt_time;
        for (&agent, &new_index) in received {
            let old_index = self.last_index.get(&agent).copied().unwrap_or_else(|| self.cfg.domain.infinity_index());
            let old_value = self.cfg.domain.value(old_index);
            let new_value = self.cfg.domain.value(new_index);
            if old_value <= urgt_time && new_value < urgt_time {
                *self.priorities.entry(agent).or_insert(0) += 1;
            } else {
                self.priorities.insert(agent, 0);
            }
            self.last_index.insert(agent, new_index);
        }
    }

    /// Run one full round: broadcast `ON`, elect (or force) a root,
    /// broadcast `ROOT_<n>`, wait for every agent's final assignment,
    /// then update priorities for the next round's bid scoring.
    pub async fn run_round(&mut self, messaging: &dyn MessagingAdapter) -> Result<RoundReport> {
        info!(agents = self.agents.len(), "round start");
        for &agent in &self.agents {
            messaging.publish(&agent_topic(agent), "ON").await?;
        }

        self.absorb_urgent_requests(messaging);
        let forced = self.forced_root.take();
        let elected = match forced {
            Some(forced) => {
                info!(agent = forced, "urgent preemption forces root for this round");
                forced
            }
            None => self.elect_root(messaging).await?,
        };

        for &agent in &self.agents {
            let encoded = Message::Root(elected)
                .encode()
                .map_err(|reason| DpopError::MalformedMessage { raw: "ROOT".to_string(), reason })?;
            messaging.publish(&agent_topic(agent), &encoded).await?;
        }

        let mut received = ValuesPayload::new();
        while received.len() < self.agents.len() {
            let partial = messaging
                .recv_value_timeout(Recipient::Coordinator, self.cfg.timeout)
                .await
                .ok_or(DpopError::Timeout { phase: Phase::Value, agent: elected })?;
            received.extend(partial);
        }

        let prior_priority = forced.map(|agent| self.priorities.get(&agent).copied().unwrap_or(0));
        self.update_priorities(&received);
        if let (Some(forced_agent), Some(prior)) = (forced, prior_priority) {
            // a forced root's priority must strictly increase even when the
            // normal reset-to-0 rule would otherwise apply to it this round.
            let doubled = prior.max(1) * 2;
            self.priorities
                .entry(forced_agent)
                .and_modify(|p| *p = (*p).max(doubled))
                .or_insert(doubled);
        }

        let mut assignments: Vec<(AgentId, ValueIndex)> = received.into_iter().collect();
        assignments.sort_by(|(id_a, _), (id_b, _)| {
            let pri_a = self.priorities.get(id_a).copied().unwrap_or(0);
            let pri_b = self.priorities.get(id_b).copied().unwrap_or(0);
            pri_b.cmp(&pri_a).then(id_a.cmp(id_b))
        });

        info!(root = elected, "round complete");
        self.paused = false;

        Ok(RoundReport { elected_root: elected, assignments, priorities: self.priorities.clone() })
    }

    /// Drive rounds forever at period `cfg.t_round`, until `shutdown`
    /// reports `true`. A separate-in-spirit urgent listener races the
    /// inter-round sleep via `tokio::select!`: an urgent request arriving
    /// mid-sleep cuts the wait short and the next round runs with that
    /// agent forced as root, exactly as if it had arrived on schedule.
    pub async fn run(
        &mut self,
        messaging: &dyn MessagingAdapter,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<Vec<RoundReport>> {
        let mut reports = Vec::new();
        loop {
            if *shutdown.borrow() {
                return Ok(reports);
            }

            reports.push(self.run_round(messaging).await?);

            tokio::select! {
                _ = tokio::time::sleep(self.cfg.t_round) => {}
                urgent = messaging.recv_urgent_timeout(Recipient::Coordinator, self.cfg.t_round) => {
                    if let Some(agent) = urgent {
                        self.accept_urgent(agent);
                    }
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        return Ok(reports);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalBus;
    use std::time::Duration;

    fn fast_cfg() -> DpopConfig {
        let mut cfg = DpopConfig::default();
        cfg.timeout = Duration::from_millis(200);
        cfg
    }

    async fn publish_bid(bus: &LocalBus, id: AgentId, score: u64) {
        bus.publish(crate::message::SERVER_ROOT_TOPIC, &RootBid { id, score }.encode()).await.unwrap();
    }

    async fn publish_values(bus: &LocalBus, entries: &[(AgentId, ValueIndex)]) {
        let mut payload = ValuesPayload::new();
        for &(id, idx) in entries {
            payload.insert(id, idx);
        }
        bus.publish(SERVER_TOPIC, &Message::Values(payload).encode().unwrap()).await.unwrap();
    }

    #[tokio::test]
    async fn highest_bid_wins_with_no_priority_yet() {
        let bus = LocalBus::new();
        let mut coordinator = Coordinator::new(vec![1, 2, 3], fast_cfg());

        publish_bid(&bus, 1, 2).await;
        publish_bid(&bus, 2, 5).await;
        publish_bid(&bus, 3, 3).await;
        publish_values(&bus, &[(1, 16), (2, 16), (3, 16)]).await;

        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.elected_root, 2);
    }

    #[tokio::test]
    async fn priority_accumulates_on_repeated_urgency_and_resets_otherwise() {
        let bus = LocalBus::new();
        let mut coordinator = Coordinator::new(vec![1, 2], fast_cfg());

        // round 1: agent 1 reports an urgent value (index 0 < urgt_time's index),
        // but its prior last_index defaults to infinity (not <= urgt_time), so no bump yet.
        publish_bid(&bus, 1, 1).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 0), (2, 16)]).await;
        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.priorities[&1], 0);

        // round 2: agent 1 stays urgent (old <= urgt_time and new < urgt_time) -> priority bumps.
        publish_bid(&bus, 1, 1).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 0), (2, 16)]).await;
        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.priorities[&1], 1);

        // round 3: agent 1 recovers (back to the infinity index) -> priority resets.
        publish_bid(&bus, 1, 1).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 16), (2, 16)]).await;
        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.priorities[&1], 0);
    }

    #[tokio::test]
    async fn urgent_preemption_forces_root_for_exactly_one_round() {
        let bus = LocalBus::new();
        let mut coordinator = Coordinator::new(vec![1, 2], fast_cfg());

        bus.publish(SERVER_TOPIC, &Message::Urgent(2).encode().unwrap()).await.unwrap();

        // agent 2's bid is deliberately the weaker one; forcing should still pick it.
        publish_bid(&bus, 1, 9).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 16), (2, 16)]).await;
        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.elected_root, 2);

        // next round: no urgent request pending, normal election applies.
        publish_bid(&bus, 1, 9).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 16), (2, 16)]).await;
        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.elected_root, 1);
    }

    #[tokio::test]
    async fn unknown_urgent_agent_is_ignored() {
        let bus = LocalBus::new();
        let mut coordinator = Coordinator::new(vec![1, 2], fast_cfg());
        bus.publish(SERVER_TOPIC, &Message::Urgent(99).encode().unwrap()).await.unwrap();

        publish_bid(&bus, 1, 9).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 16), (2, 16)]).await;
        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.elected_root, 1); // falls back to normal election
    }

    #[tokio::test]
    async fn forced_root_priority_strictly_increases_even_when_reset_rule_would_zero_it() {
        let bus = LocalBus::new();
        let mut coordinator = Coordinator::new(vec![1, 2], fast_cfg());

        bus.publish(SERVER_TOPIC, &Message::Urgent(2).encode().unwrap()).await.unwrap();
        publish_bid(&bus, 1, 9).await;
        publish_bid(&bus, 2, 1).await;
        // agent 2's prior last_index defaults to infinity; update_priorities
        // would normally reset it to 0 on this report.
        publish_values(&bus, &[(1, 16), (2, 0)]).await;

        let report = coordinator.run_round(&bus).await.unwrap();
        assert_eq!(report.elected_root, 2);
        assert!(report.priorities[&2] > 0, "forced root's priority must strictly increase");
    }

    #[tokio::test]
    async fn assignments_are_ordered_by_descending_priority() {
        let bus = LocalBus::new();
        let mut coordinator = Coordinator::new(vec![1, 2, 3], fast_cfg());

        publish_bid(&bus, 1, 1).await;
        publish_bid(&bus, 2, 1).await;
        publish_bid(&bus, 3, 1).await;
        publish_values(&bus, &[(1, 16), (2, 0), (3, 0)]).await;
        coordinator.run_round(&bus).await.unwrap();

        publish_bid(&bus, 1, 1).await;
        publish_bid(&bus, 2, 1).await;
        publish_bid(&bus, 3, 1).await;
        publish_values(&bus, &[(1, 16), (2, 0), (3, 0)]).await;
        let report = coordinator.run_round(&bus).await.unwrap();

        // agents 2 and 3 both accumulated priority 1 this round (tied, ascending
        // id); agent 1 stayed at 0 and sorts last.
        let ids: Vec<AgentId> = report.assignments.iter().map(|&(id, _)| id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn run_executes_one_round_then_stops_on_shutdown() {
        let bus = LocalBus::new();
        let mut cfg = fast_cfg();
        cfg.t_round = Duration::from_millis(50);
        let mut coordinator = Coordinator::new(vec![1, 2], cfg);
        let (tx, rx) = watch::channel(false);

        publish_bid(&bus, 1, 9).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 16), (2, 16)]).await;

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            tx.send(true).unwrap();
        });

        let reports = coordinator.run(&bus, rx).await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].elected_root, 1);
    }

    #[tokio::test]
    async fn run_urgent_request_during_sleep_forces_next_round_root() {
        let bus = LocalBus::new();
        let mut cfg = fast_cfg();
        cfg.t_round = Duration::from_millis(300);
        let mut coordinator = Coordinator::new(vec![1, 2], cfg);
        let (tx, rx) = watch::channel(false);

        // round 1: normal election, agent 1 wins on bid strength alone.
        publish_bid(&bus, 1, 9).await;
        publish_bid(&bus, 2, 1).await;
        publish_values(&bus, &[(1, 16), (2, 16)]).await;

        let bus_for_task = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(15)).await;
            bus_for_task.publish(SERVER_TOPIC, &Message::Urgent(2).encode().unwrap()).await.unwrap();
            let mut payload = ValuesPayload::new();
            payload.insert(1, 16);
            payload.insert(2, 16);
            bus_for_task.publish(SERVER_TOPIC, &Message::Values(payload).encode().unwrap()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            tx.send(true).unwrap();
        });

        let reports = coordinator.run(&bus, rx).await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].elected_root, 1);
        assert_eq!(reports[1].elected_root, 2); // urgent preemption forced round 2's root
    }

    use proptest::prelude::*;

    proptest! {
        /// priority resets to 0 whenever a reported value is at or above
        /// the urgent threshold, regardless of what it was before.
        #[test]
        fn priority_resets_whenever_new_value_is_at_or_above_urgent_threshold(
            new_index in 0usize..17,
            prior_priority in 0u64..20,
        ) {
            let cfg = DpopConfig::default();
            let mut coordinator = Coordinator::new(vec![1], cfg.clone());
            coordinator.priorities.insert(1, prior_priority);
            let mut received = ValuesPayload::new();
            received.insert(1, new_index);
            coordinator.update_priorities(&received);
            if cfg.domain.value(new_index) >= cfg.urgt_time {
                prop_assert_eq!(coordinator.priorities[&1], 0);
            }
        }
    }
}
