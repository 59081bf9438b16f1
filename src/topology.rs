//! Topology model: monitored areas (rooms and zones), devices, and the
//! neighbor adjacency agents use to run the pseudo-tree construction.
//!
//! Grounded on `original_source/app/model/{monitoring_area,room,zone,
//! device}.py`. Agents never hold references to other agents (DESIGN
//! NOTES §9) — only ids; a [`Topology`] snapshot is the one place degree
//! lookups for *other* agents happen, since the DFS builder needs to sort
//! not-yet-visited neighbors by degree.

use crate::domain::{Cost, INFINITY};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identifies one agent (room or zone) in the topology.
pub type AgentId = u64;

/// A connected device reporting into its owning area.
///
/// Created/destroyed by the external event simulator (non-goal); this
/// crate only needs to read its two fields and provide the mutation
/// points the simulator calls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device identifier, unique within its owning area.
    pub id: u64,
    /// Minutes until the device's current program completes, clipped to
    /// [`INFINITY`].
    pub end_of_prog: Cost,
    /// Whether the device is self-reporting a critical condition.
    pub is_in_critic: bool,
}

impl Device {
    /// Construct a device, clipping `end_of_prog` to the domain ceiling.
    pub fn new(id: u64, end_of_prog: Cost, is_in_critic: bool) -> Self {
        Device {
            id,
            end_of_prog: end_of_prog.min(INFINITY),
            is_in_critic,
        }
    }
}

/// The body of an [`Area`]: either the device list of a room, or the
/// child rooms a zone aggregates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum AreaBody {
    /// A room directly owns devices.
    Room { devices: Vec<Device> },
    /// A zone exclusively owns a set of rooms (spec §3 invariant).
    Zone { rooms: Vec<Area> },
}

/// One monitored area: a room, or a zone aggregating rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Area {
    /// Agent identifier.
    pub id: AgentId,
    /// Left neighbor back-reference, if any.
    pub left: Option<AgentId>,
    /// Right neighbor back-reference, if any.
    pub right: Option<AgentId>,
    /// Front neighbor back-reference, if any.
    pub front: Option<AgentId>,
    /// Minutes elapsed since the last human visit.
    pub tau: u32,
    /// This area's currently chosen time-to-call value.
    pub current_v: Cost,
    /// The value chosen in the previous round.
    pub previous_v: Cost,
    /// Devices (room) or child rooms (zone).
    pub body: AreaBody,
}

impl Area {
    /// Build a room with no devices yet.
    pub fn new_room(id: AgentId, left: Option<AgentId>, right: Option<AgentId>, front: Option<AgentId>) -> Self {
        Area {
            id,
            left,
            right,
            front,
            tau: 0,
            current_v: 0,
            previous_v: 0,
            body: AreaBody::Room { devices: Vec::new() },
        }
    }

    /// Build a zone owning `rooms` exclusively.
    pub fn new_zone(
        id: AgentId,
        left: Option<AgentId>,
        right: Option<AgentId>,
        front: Option<AgentId>,
        rooms: Vec<Area>,
    ) -> Self {
        Area {
            id,
            left,
            right,
            front,
            tau: 0,
            current_v: 0,
            previous_v: 0,
            body: AreaBody::Zone { rooms },
        }
    }

    /// Whether this area is a zone.
    pub fn is_zone(&self) -> bool {
        matches!(self.body, AreaBody::Zone { .. })
    }

    /// Up to three neighbor ids, in left/right/front order.
    pub fn neighbor_ids(&self) -> Vec<AgentId> {
        [self.left, self.right, self.front]
            .into_iter()
            .flatten()
            .collect()
    }

    /// Number of neighbors (0..=3).
    pub fn degree(&self) -> usize {
        self.neighbor_ids().len()
    }

    /// Room: true iff the device list is empty. Zone: true iff *any*
    /// child room has no devices — preserved verbatim from
    /// `zone.py: has_no_devices`, which is not "all rooms empty" despite
    /// the name; this is the original's behavior, kept faithfully.
    pub fn has_no_devices(&self) -> bool {
        match &self.body {
            AreaBody::Room { devices } => devices.is_empty(),
            AreaBody::Zone { rooms } => rooms.iter().any(Area::has_no_devices),
        }
    }

    /// True iff at least one device (room) or child room (zone) is
    /// reporting a critical condition.
    pub fn is_in_critical_state(&self) -> bool {
        match &self.body {
            AreaBody::Room { devices } => devices.iter().any(|d| d.is_in_critic),
            AreaBody::Zone { rooms } => rooms.iter().any(Area::is_in_critical_state),
        }
    }

    /// Minimum `end_of_prog` across devices (room) or child rooms (zone),
    /// `INFINITY` if there is nothing to report on.
    pub fn min_end_of_prog(&self) -> Cost {
        match &self.body {
            AreaBody::Room { devices } => devices.iter().map(|d| d.end_of_prog).min().unwrap_or(INFINITY),
            AreaBody::Zone { rooms } => rooms.iter().map(Area::min_end_of_prog).min().unwrap_or(INFINITY),
        }
    }

    /// C4's overdue-intervention predicate. Only meaningful for rooms:
    /// a zone's aggregate cost is computed per-room (spec §4.2), never
    /// against the zone's own tau/device count.
    ///
    /// Resolves the "is_tau_too_high" Open Question: the two clauses are
    /// ORed, "hits as soon as either fires" (DESIGN.md #3).
    pub fn is_tau_too_high(&self) -> bool {
        let AreaBody::Room { devices } = &self.body else {
            return false;
        };
        let n = devices.len();
        (n > 5 && self.tau > 180) || (n >= 1 && self.tau > 210)
    }

    /// Zone only: ids of child rooms that need a human visit — overdue,
    /// critical, or drifting outside the synchronization window of the
    /// zone's own chosen value. Mirrors `zone.py:
    /// get_room_who_need_intervention`.
    pub fn rooms_needing_intervention(&self, t_synchro: Cost) -> Vec<AgentId> {
        let AreaBody::Zone { rooms } = &self.body else {
            return Vec::new();
        };
        rooms
            .iter()
            .filter(|r| {
                r.is_tau_too_high()
                    || r.is_in_critical_state()
                    || r.min_end_of_prog() < self.current_v.saturating_add(t_synchro)
            })
            .map(|r| r.id)
            .collect()
    }

    /// Room only: add or replace a device by id. No-op on a zone — route
    /// through the owning room instead.
    pub fn upsert_device(&mut self, device: Device) {
        if let AreaBody::Room { devices } = &mut self.body {
            if let Some(existing) = devices.iter_mut().find(|d| d.id == device.id) {
                *existing = device;
            } else {
                devices.push(device);
            }
        }
    }

    /// Room only: drop a device by id.
    pub fn remove_device(&mut self, device_id: u64) {
        if let AreaBody::Room { devices } = &mut self.body {
            devices.retain(|d| d.id != device_id);
        }
    }

    /// Advance the area's clock by `minutes`: increments `tau`, ages
    /// every device's `end_of_prog`, and resets `tau` to 0 if a device's
    /// program just completed (reached `INFINITY`) — mirrors
    /// `monitoring_area.py: increment_time`.
    pub fn advance_clock(&mut self, minutes: u32) {
        self.tau += minutes;
        match &mut self.body {
            AreaBody::Room { devices } => {
                for d in devices.iter_mut() {
                    let before = d.end_of_prog;
                    d.end_of_prog = d.end_of_prog.saturating_sub(minutes);
                    if before < INFINITY && d.end_of_prog == 0 {
                        // program completed this tick
                        self.tau = 0;
                    }
                }
            }
            AreaBody::Zone { rooms } => {
                for r in rooms.iter_mut() {
                    r.advance_clock(minutes);
                }
            }
        }
    }
}

/// A read-only snapshot of the communication graph's neighbor adjacency,
/// built once from every [`Area`]'s own neighbor ids.
///
/// The DFS builder needs the *degree* of neighbors it hasn't visited yet
/// to sort `open`; since agents otherwise hold only ids, this is the one
/// shared lookup table a round's coordinator hands every agent.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    neighbors: HashMap<AgentId, Vec<AgentId>>,
}

impl Topology {
    /// Build adjacency from a flat list of areas (zones' child rooms are
    /// not part of the inter-agent graph; only top-level areas are).
    pub fn from_areas(areas: &[Area]) -> Self {
        let mut neighbors = HashMap::new();
        for area in areas {
            neighbors.insert(area.id, area.neighbor_ids());
        }
        Topology { neighbors }
    }

    /// Degree of `id`, or 0 if unknown.
    pub fn degree(&self, id: AgentId) -> usize {
        self.neighbors.get(&id).map_or(0, Vec::len)
    }

    /// All neighbors of `id` except `exclude`, sorted by descending
    /// degree, ties broken by ascending agent id (spec §4.3).
    pub fn neighbors_sorted_desc_excluding(&self, id: AgentId, exclude: Option<AgentId>) -> Vec<AgentId> {
        let mut ids: Vec<AgentId> = self
            .neighbors
            .get(&id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|&n| Some(n) != exclude)
            .collect();
        ids.sort_by(|a, b| self.degree(*b).cmp(&self.degree(*a)).then(a.cmp(b)));
        ids
    }

    /// Confirm every neighbor relation is symmetric (spec §3 invariant).
    pub fn validate_symmetric(&self) -> Result<(), String> {
        for (&id, peers) in &self.neighbors {
            for &peer in peers {
                let back = self.neighbors.get(&peer).ok_or_else(|| format!("unknown neighbor {peer} of {id}"))?;
                if !back.contains(&id) {
                    return Err(format!("asymmetric edge: {id} -> {peer} has no reverse"));
                }
            }
        }
        Ok(())
    }
}
