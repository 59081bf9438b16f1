//! The five pure constraint functions and their aggregation into a local
//! cost table, grounded on
//! `original_source/app/helpers/constraint_manager.py`.
//!
//! C1, C2, C4, and C5 are private constraints: each area evaluates them
//! against only its own state. C3 is the lone constraint with an edge in
//! the factor graph — it is evaluated pairwise between neighbors and is
//! never folded into `local_cost`.

use crate::config::DpopConfig;
use crate::domain::{saturating_cost_sum, Cost};
use crate::topology::{Area, AreaBody};

/// C1 — an area with no devices can never justify a call: every finite
/// value costs infinity.
pub fn c1_no_devices(area: &Area, vi: Cost, cfg: &DpopConfig) -> Cost {
    if area.has_no_devices() && vi < cfg.infinity {
        cfg.infinity
    } else {
        0
    }
}

/// C2 — a critical area must call immediately (any nonzero value is
/// infinitely costly); otherwise picking a value later than the area's
/// own most urgent device costs 1.
pub fn c2_device_status(area: &Area, vi: Cost, cfg: &DpopConfig) -> Cost {
    if area.is_in_critical_state() {
        if vi > 0 {
            cfg.infinity
        } else {
            0
        }
    } else {
        let min_end_of_prog = area.min_end_of_prog();
        if min_end_of_prog <= cfg.urgt_time && vi > min_end_of_prog {
            1
        } else {
            0
        }
    }
}

/// C3 — the only inter-agent constraint: desynchronized neighbor values
/// cost 1, matching values cost 0, and values within the synchronization
/// window but not equal cost 1.
pub fn c3_neighbors_sync(vi: Cost, vj: Cost, cfg: &DpopConfig) -> Cost {
    let diff = vi.abs_diff(vj);
    if diff <= cfg.t_synchro && diff != 0 {
        1
    } else {
        0
    }
}

/// C4 — an area overdue for a human visit must not defer past the
/// urgency threshold.
pub fn c4_last_intervention(area: &Area, vi: Cost, cfg: &DpopConfig) -> Cost {
    if area.is_tau_too_high() && vi > cfg.urgt_time {
        cfg.infinity
    } else {
        0
    }
}

/// C5 — a quiet area (nothing urgent, not overdue) is nudged away from
/// the infinity sentinel, since picking "never call" costs 1 when there
/// is nothing actually preventing a normal check-in.
pub fn c5_nothing_to_report(area: &Area, vi: Cost, cfg: &DpopConfig) -> Cost {
    if !area.is_in_critical_state()
        && area.min_end_of_prog() > cfg.urgt_time
        && area.tau < cfg.three_hours
        && vi < cfg.infinity
    {
        1
    } else {
        0
    }
}

/// Sum of C1, C2, C4, and C5 for `vi` — the private cost a room owes
/// independent of any neighbor's assignment. A zone instead aggregates
/// its child rooms' C2/C4/C5 (`zone_aggregate_cost`): a zone has no
/// devices or tau of its own to evaluate C1/C4 against directly, only
/// the rooms it exclusively owns.
pub fn local_cost(area: &Area, vi: Cost, cfg: &DpopConfig) -> Cost {
    match &area.body {
        AreaBody::Room { .. } => saturating_cost_sum([
            c1_no_devices(area, vi, cfg),
            c2_device_status(area, vi, cfg),
            c4_last_intervention(area, vi, cfg),
            c5_nothing_to_report(area, vi, cfg),
        ]),
        AreaBody::Zone { rooms } => zone_aggregate_cost(rooms, vi, cfg),
    }
}

/// Zone private cost: any critical child room forces an immediate call
/// (`vi == 0` is free, anything else costs infinity); otherwise the
/// saturating sum of C2+C4+C5 evaluated per child room.
fn zone_aggregate_cost(rooms: &[Area], vi: Cost, cfg: &DpopConfig) -> Cost {
    if rooms.iter().any(Area::is_in_critical_state) {
        return if vi == 0 { 0 } else { cfg.infinity };
    }
    saturating_cost_sum(rooms.iter().flat_map(|room| {
        [c2_device_status(room, vi, cfg), c4_last_intervention(room, vi, cfg), c5_nothing_to_report(room, vi, cfg)]
    }))
}

/// Private local cost for every value in the domain, in domain order —
/// the per-area vector UTIL propagation starts from.
pub fn local_cost_vector(area: &Area, cfg: &DpopConfig) -> Vec<Cost> {
    cfg.domain.as_slice().iter().map(|&vi| local_cost(area, vi, cfg)).collect()
}
