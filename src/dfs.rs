//! Pseudo-tree construction: a single DFS token walks the static
//! neighbor graph, assigning parent/child/pseudo-parent/pseudo-child
//! roles as it goes.
//!
//! Grounded on `original_source/app/helpers/managers/dfs_manager.py`
//! (`generate_dfs`, `generate_dfs_with_others_agents`, `choose_root`),
//! with neighbor ordering resolved against
//! `model/monitoring_area.py::get_neighbors_id_sorted[_except]`
//! (degree-descending). The source's `sorted(..., reverse=True)` over a
//! dict isn't guaranteed stable across equal degrees, so this port adds
//! an explicit ascending-id tie-break to make the resulting tree shape
//! deterministic (DESIGN.md #4).

use crate::message::{DfsToken, Message};
use crate::topology::{AgentId, Topology};

/// Where this agent's pseudo-tree role currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DfsStatus {
    /// Waiting for the coordinator's `ROOT_<n>` broadcast.
    AwaitingRoot,
    /// Root is known; the DFS token may still pass through this agent.
    Building,
    /// This agent's role (parent/children/pseudo-*) is final.
    Done,
}

/// One agent's view of the pseudo-tree under construction.
#[derive(Debug, Clone)]
pub struct PseudoTree {
    own_id: AgentId,
    status: DfsStatus,
    is_root: bool,
    parent_id: Option<AgentId>,
    children_id: Vec<AgentId>,
    pseudo_children_id: Vec<AgentId>,
    pseudo_parents_id: Vec<AgentId>,
    open_neighbors_id: Option<Vec<AgentId>>,
}

impl PseudoTree {
    /// Start a fresh build for `own_id`, before the root is known.
    pub fn new(own_id: AgentId) -> Self {
        PseudoTree {
            own_id,
            status: DfsStatus::AwaitingRoot,
            is_root: false,
            parent_id: None,
            children_id: Vec::new(),
            pseudo_children_id: Vec::new(),
            pseudo_parents_id: Vec::new(),
            open_neighbors_id: None,
        }
    }

    /// Whether this agent was elected root.
    pub fn is_root(&self) -> bool {
        self.is_root
    }

    /// Whether this agent's UTIL has no children to wait on.
    pub fn is_leaf(&self) -> bool {
        self.children_id.is_empty()
    }

    /// Current construction status.
    pub fn status(&self) -> DfsStatus {
        self.status
    }

    /// This agent's DFS parent, if it isn't the root.
    pub fn parent_id(&self) -> Option<AgentId> {
        self.parent_id
    }

    /// DFS tree children.
    pub fn children_id(&self) -> &[AgentId] {
        &self.children_id
    }

    /// Pseudo-children: neighbors that tried to claim this agent as
    /// their DFS child after it was already spoken for.
    pub fn pseudo_children_id(&self) -> &[AgentId] {
        &self.pseudo_children_id
    }

    /// Pseudo-parents: ancestors this agent shares an edge with but
    /// that aren't its direct DFS parent.
    pub fn pseudo_parents_id(&self) -> &[AgentId] {
        &self.pseudo_parents_id
    }

    /// Apply the coordinator's root-election result. Returns the
    /// outbound `CHILD` message the (now known) root sends its first
    /// neighbor, if any.
    pub fn set_root(&mut self, elected: AgentId, topology: &Topology) -> Vec<(AgentId, Message)> {
        self.is_root = elected == self.own_id;
        self.status = DfsStatus::Building;

        let mut outbound = Vec::new();
        if self.is_root {
            let mut open = topology.neighbors_sorted_desc_excluding(self.own_id, None);
            if open.is_empty() {
                self.status = DfsStatus::Done;
            } else {
                let first = open.remove(0);
                self.children_id.push(first);
                self.open_neighbors_id = Some(open);
                outbound.push((first, Message::Child(self.own_id)));
            }
        }
        outbound
    }

    /// Handle one incoming DFS token, returning any outbound messages
    /// this agent now needs to send.
    pub fn handle_token(&mut self, token: DfsToken, topology: &Topology) -> Vec<(AgentId, Message)> {
        let mut outbound = Vec::new();

        if self.open_neighbors_id.is_none() {
            // First time this agent is visited: the sender becomes its parent.
            let sender = match token {
                DfsToken::Child(id) | DfsToken::Pseudo(id) => id,
            };
            self.open_neighbors_id = Some(topology.neighbors_sorted_desc_excluding(self.own_id, Some(sender)));
            self.parent_id = Some(sender);
        } else {
            match token {
                DfsToken::Child(sender) if self.open_contains(sender) => {
                    self.pseudo_children_id.push(sender);
                    self.remove_open(sender);
                    outbound.push((sender, Message::Pseudo(self.own_id)));
                    return outbound; // does not advance the fringe
                }
                DfsToken::Pseudo(sender) => {
                    if let Some(pos) = self.children_id.iter().position(|&c| c == sender) {
                        self.children_id.remove(pos);
                    }
                    self.pseudo_parents_id.push(sender);
                }
                DfsToken::Child(_) => {
                    // a backtrack bounce from an already-assigned child: fall through
                }
            }
        }

        let open = self.open_neighbors_id.as_mut().expect("open set above");
        if open.is_empty() {
            self.status = DfsStatus::Done;
            if !self.is_root {
                outbound.push((self.parent_id.expect("non-root has a parent"), Message::Child(self.own_id)));
            }
        } else {
            let next = open.remove(0);
            self.children_id.push(next);
            outbound.push((next, Message::Child(self.own_id)));
        }

        outbound
    }

    fn open_contains(&self, id: AgentId) -> bool {
        self.open_neighbors_id.as_ref().is_some_and(|o| o.contains(&id))
    }

    fn remove_open(&mut self, id: AgentId) {
        if let Some(open) = self.open_neighbors_id.as_mut() {
            if let Some(pos) = open.iter().position(|&n| n == id) {
                open.remove(pos);
            }
        }
    }
}
