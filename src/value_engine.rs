//! Top-down VALUE propagation: pick this agent's own best value given
//! its ancestors' already-chosen values (or, gracefully, without them),
//! then forward the growing assignment map to children and, if this
//! agent is a leaf, to the coordinator.
//!
//! Grounded on `original_source/app/helpers/managers/value_manager.py`
//! (`do_value_propagation`, `get_index_of_best_value_with`). Unlike the
//! original, a missing or late parent VALUES message does not hang this
//! agent forever: it degrades to picking a value as if the unresolved
//! ancestors weren't part of the join yet (§ Open Question resolution,
//! DESIGN.md), since waiting indefinitely on a peer that may never
//! report would otherwise stall the whole subtree under it.

use crate::config::DpopConfig;
use crate::dfs::PseudoTree;
use crate::domain::{Cost, ValueIndex};
use crate::message::{agent_topic, Message, ValuesPayload, SERVER_TOPIC};
use crate::tensor::UtilityTensor;
use crate::topology::AgentId;
use crate::transport::{MessagingAdapter, Recipient};
use crate::{DpopError, Phase, Result};
use tracing::warn;

/// Run this agent's VALUE phase to completion. Returns the index this
/// agent chose and the full assignment map (including this agent's own
/// entry) that was forwarded onward.
pub async fn do_value_propagation(
    own_id: AgentId,
    tree: &PseudoTree,
    join: &UtilityTensor,
    cfg: &DpopConfig,
    messaging: &dyn MessagingAdapter,
) -> Result<(ValueIndex, ValuesPayload)> {
    let mut values = match tree.parent_id() {
        None => ValuesPayload::new(),
        Some(_) => messaging
            .recv_value_timeout(Recipient::Agent(own_id), cfg.timeout)
            .await
            .unwrap_or_else(|| {
                warn!(agent = own_id, "no VALUES from parent in time; deciding without it");
                ValuesPayload::new()
            }),
    };

    let index = best_index(join, &values, own_id, cfg.domain.len());
    values.insert(own_id, index);

    for &child in tree.children_id() {
        let encoded = encode_values(&values)?;
        messaging.publish(&agent_topic(child), &encoded).await?;
    }
    if tree.is_leaf() {
        let encoded = encode_values(&values)?;
        messaging.publish(SERVER_TOPIC, &encoded).await?;
    }

    Ok((index, values))
}

fn encode_values(values: &ValuesPayload) -> Result<String> {
    Message::Values(values.clone())
        .encode()
        .map_err(|reason| DpopError::MalformedMessage { raw: "VALUES".to_string(), reason })
}

/// The largest domain index minimizing `join`'s cost once every
/// variable this agent doesn't yet have an answer for is projected away
/// — resolves the tie-break Open Question uniformly, root included
/// (`value_manager.py`'s 1-D and N-D branches both pick the *last*
/// matching index; DESIGN.md #1).
fn best_index(join: &UtilityTensor, values: &ValuesPayload, own_id: AgentId, domain_len: usize) -> ValueIndex {
    let mut reduced = join.clone();
    for &var in join.vars() {
        if var != own_id && !values.contains_key(&var) {
            reduced = reduced.project(var);
        }
    }

    let other_vars: Vec<AgentId> = reduced.vars().iter().copied().filter(|&v| v != own_id).collect();
    let known_idx: Vec<ValueIndex> = other_vars.iter().map(|v| values[v]).collect();

    let mut best_cost = Cost::MAX;
    let mut best_index = 0;
    for i in 0..domain_len {
        let mut full = vec![0usize; reduced.rank()];
        let mut k = 0;
        for (pos, &v) in reduced.vars().iter().enumerate() {
            full[pos] = if v == own_id {
                i
            } else {
                let idx = known_idx[k];
                k += 1;
                idx
            };
        }
        let cost = reduced.get(&full);
        if cost <= best_cost {
            best_cost = cost;
            best_index = i;
        }
    }
    best_index
}
