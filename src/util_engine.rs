//! Bottom-up UTIL propagation: combine children's UTIL tensors, fold in
//! this agent's relation with its parent and pseudo-parents, add its own
//! private costs, then project itself out and forward the result.
//!
//! Grounded on `original_source/app/helpers/managers/util_manager.py`
//! (`do_util_propagation`, `get_util_matrix_from_childen`,
//! `get_utility_matrix_for`, `add_my_utility_in`, `project`). The
//! original sends the finished UTIL payload to the parent from inside
//! `value_manager.py`'s `do_value_propagation` — nothing happens between
//! that send and the JOIN computation it depends on, so this port moves
//! the send into the phase that actually computes it, matching this
//! crate's DFS/UTIL/VALUE phase split.

use crate::config::DpopConfig;
use crate::constraint::{c3_neighbors_sync, local_cost_vector};
use crate::dfs::PseudoTree;
use crate::domain::Cost;
use crate::message::{agent_topic, Message};
use crate::tensor::UtilityTensor;
use crate::topology::{AgentId, Area};
use crate::transport::{MessagingAdapter, Recipient};
use crate::{DpopError, Phase, Result};

/// Run this agent's UTIL phase to completion: wait on every child's
/// payload, fold in the parent/pseudo-parent relations and this area's
/// own private costs, and (unless this agent is root) send the
/// projected result up. Returns the full, un-projected JOIN tensor —
/// [`crate::value_engine`] needs it to pick this agent's own value.
pub async fn do_util_propagation(
    own_id: AgentId,
    area: &Area,
    tree: &PseudoTree,
    cfg: &DpopConfig,
    messaging: &dyn MessagingAdapter,
) -> Result<UtilityTensor> {
    let mut join: Option<UtilityTensor> = None;

    for _ in 0..tree.children_id().len() {
        let payload = messaging
            .recv_util_timeout(Recipient::Agent(own_id), cfg.timeout)
            .await
            .ok_or(DpopError::Timeout { phase: Phase::Util, agent: own_id })?;
        let child_tensor = UtilityTensor::from_payload(&payload, cfg.domain.len(), cfg.max_tree_rank);
        join = Some(match join {
            None => child_tensor,
            Some(existing) => UtilityTensor::combine(&existing, &child_tensor, cfg.max_tree_rank)?,
        });
    }

    if let Some(parent) = tree.parent_id() {
        join = Some(combine_with_relation(join, own_id, parent, cfg)?);
        for &pseudo_parent in tree.pseudo_parents_id() {
            join = Some(combine_with_relation(join, own_id, pseudo_parent, cfg)?);
        }
    }

    let mut join = ensure_own_var(join, own_id, cfg)?;
    join = join.add_own_costs(own_id, &local_cost_vector(area, cfg));

    if let Some(parent) = tree.parent_id() {
        let util = join.project(own_id);
        let encoded = Message::Util(util.to_payload())
            .encode()
            .map_err(|reason| DpopError::MalformedMessage { raw: "UTIL".to_string(), reason })?;
        messaging.publish(&agent_topic(parent), &encoded).await?;
    }

    Ok(join)
}

/// Fold in the pairwise C3 relation with `other_id`, unless it's already
/// present in `join` (some other ancestor's edge already accounts for
/// it) — mirrors `get_utility_matrix_for`'s early return.
fn combine_with_relation(
    join: Option<UtilityTensor>,
    own_id: AgentId,
    other_id: AgentId,
    cfg: &DpopConfig,
) -> Result<UtilityTensor> {
    if let Some(existing) = &join {
        if existing.vars().contains(&other_id) {
            return Ok(join.unwrap());
        }
    }
    let relation = sync_tensor(own_id, other_id, cfg);
    match join {
        None => Ok(relation),
        Some(existing) => UtilityTensor::combine(&relation, &existing, cfg.max_tree_rank),
    }
}

/// Guarantee `own_id` is one of `join`'s variables before private costs
/// fold in — needed when no child and no parent relation ever mentioned
/// it (an isolated root). Mirrors `add_my_utility_in`'s `if R is None`.
fn ensure_own_var(join: Option<UtilityTensor>, own_id: AgentId, cfg: &DpopConfig) -> Result<UtilityTensor> {
    let zeros = vec![0 as Cost; cfg.domain.len()];
    match join {
        Some(j) if j.vars().contains(&own_id) => Ok(j),
        Some(j) => UtilityTensor::combine(&UtilityTensor::local(own_id, zeros), &j, cfg.max_tree_rank),
        None => Ok(UtilityTensor::local(own_id, zeros)),
    }
}

fn sync_tensor(own_id: AgentId, other_id: AgentId, cfg: &DpopConfig) -> UtilityTensor {
    let domain = cfg.domain.as_slice();
    let n = domain.len();
    let mut data = vec![0 as Cost; n * n];
    for i in 0..n {
        for j in 0..n {
            data[i * n + j] = c3_neighbors_sync(domain[i], domain[j], cfg);
        }
    }
    UtilityTensor::Dense { vars: vec![own_id, other_id], shape: vec![n, n], data }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DfsToken, UtilPayload};
    use crate::topology::Topology;
    use crate::transport::LocalBus;

    #[tokio::test]
    async fn isolated_root_seeds_its_own_local_costs() {
        let cfg = DpopConfig::default();
        let area = Area::new_room(1, None, None, None); // no devices
        let topo = Topology::from_areas(&[area.clone()]);
        let mut tree = PseudoTree::new(1);
        tree.set_root(1, &topo);

        let bus = LocalBus::new();
        let join = do_util_propagation(1, &area, &tree, &cfg, &bus).await.unwrap();

        assert_eq!(join.vars(), &[1]);
        let expected = local_cost_vector(&area, &cfg);
        for (i, &cost) in expected.iter().enumerate() {
            assert_eq!(join.get(&[i]), cost);
        }
        // root never sends UTIL anywhere.
        assert_eq!(bus.stats(Recipient::Coordinator).received_count, 0);
    }

    #[tokio::test]
    async fn leaf_combines_parent_relation_and_reports_up() {
        let cfg = DpopConfig::default();
        let topo = Topology::from_areas(&[
            Area::new_room(1, None, Some(2), None),
            Area::new_room(2, Some(1), None, None),
        ]);
        let area2 = Area::new_room(2, Some(1), None, None);

        let mut tree2 = PseudoTree::new(2);
        tree2.set_root(1, &topo); // not root
        tree2.handle_token(DfsToken::Child(1), &topo); // parent=1, leaf, backtracks

        let bus = LocalBus::new();
        let join = do_util_propagation(2, &area2, &tree2, &cfg, &bus).await.unwrap();

        assert!(join.vars().contains(&1));
        assert!(join.vars().contains(&2));

        let payload = bus.try_recv_util(Recipient::Agent(1)).expect("leaf sends UTIL to its parent");
        assert_eq!(payload.vars, vec![1]);
    }

    #[tokio::test]
    async fn root_combines_every_childs_payload() {
        let cfg = DpopConfig::default();
        let area1 = Area::new_room(1, Some(2), Some(3), None);
        let topo = Topology::from_areas(&[
            area1.clone(),
            Area::new_room(2, Some(1), None, None),
            Area::new_room(3, Some(1), None, None),
        ]);
        let mut tree1 = PseudoTree::new(1);
        tree1.set_root(1, &topo);
        // force both 2 and 3 to be real children for this test's purpose.
        tree1.handle_token(DfsToken::Child(2), &topo);
        tree1.handle_token(DfsToken::Child(3), &topo);
        assert_eq!(tree1.children_id(), &[2, 3]);

        let bus = LocalBus::new();
        bus.publish(
            &agent_topic(1),
            &Message::Util(UtilPayload { vars: vec![1], data: vec![vec![0, 3]] }).encode().unwrap(),
        )
        .await
        .unwrap();
        bus.publish(
            &agent_topic(1),
            &Message::Util(UtilPayload { vars: vec![1], data: vec![vec![0, 4]] }).encode().unwrap(),
        )
        .await
        .unwrap();

        let join = do_util_propagation(1, &area1, &tree1, &cfg, &bus).await.unwrap();
        assert!(join.vars().contains(&1));
        // root: no UTIL ever sent out.
        assert_eq!(bus.stats(Recipient::Coordinator).received_count, 0);
    }
}
