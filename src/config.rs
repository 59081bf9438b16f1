//! Engine configuration.
//!
//! An external loader (non-goal: reading TOML/env is not this crate's
//! job) populates a `DpopConfig` and hands it to the coordinator/agents.
//! Defaults mirror `original_source/app/helpers/constants.py`.

use crate::domain::{Domain, DEFAULT_DOMAIN, INFINITY};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// All tunable knobs listed in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpopConfig {
    /// The shared discrete domain every agent picks a value from.
    pub domain: Domain,
    /// Saturating cost ceiling. Must equal `domain`'s last value.
    pub infinity: u32,
    /// Minutes below which a call is considered urgent.
    pub urgt_time: u32,
    /// Neighbor synchronization window (C3).
    pub t_synchro: u32,
    /// Overdue-intervention threshold (C4/C5).
    pub three_hours: u32,
    /// Bounded wait per DFS/UTIL/VALUE phase.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// Period between coordinator rounds.
    #[serde(with = "duration_secs")]
    pub t_round: Duration,
    /// Cardinality cap on a UTIL tensor's rank before a round aborts.
    pub max_tree_rank: usize,
    /// Expected number of room agents (topology sizing hint).
    pub nb_rooms: usize,
    /// Expected number of zone agents (topology sizing hint).
    pub nb_zones: usize,
}

impl Default for DpopConfig {
    fn default() -> Self {
        DpopConfig {
            domain: Domain::default(),
            infinity: INFINITY,
            urgt_time: 30,
            t_synchro: 30,
            three_hours: 180,
            timeout: Duration::from_secs(60),
            t_round: Duration::from_secs(120),
            max_tree_rank: 6,
            nb_rooms: 10,
            nb_zones: 0,
        }
    }
}

impl DpopConfig {
    /// Validate cross-field constraints that `serde` alone can't express.
    pub fn validate(&self) -> Result<(), String> {
        if self.domain.is_empty() {
            return Err("domain must not be empty".to_string());
        }
        if self.domain.value(self.domain.infinity_index()) != self.infinity {
            return Err(format!(
                "domain's last value ({}) must equal `infinity` ({})",
                self.domain.value(self.domain.infinity_index()),
                self.infinity
            ));
        }
        if self.max_tree_rank == 0 {
            return Err("max_tree_rank must be at least 1".to_string());
        }
        if self.t_synchro > self.infinity {
            return Err("t_synchro cannot exceed infinity".to_string());
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
