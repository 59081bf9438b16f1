//! DPOP Engine — Distributed Constraint Optimization for Hospital Monitoring
//!
//! A hospital floor's rooms and zones cooperate to pick a shared
//! "time-to-call" value each round via the Dynamic Programming
//! Optimization Protocol: a pseudo-tree is built over the static
//! room/zone adjacency, UTIL tensors propagate bottom-up, and VALUE
//! assignments propagate top-down, producing the guaranteed global
//! optimum under a fixed message schedule.
//!
//! # Architecture
//!
//! - **Topology**: rooms, zones, and devices ([`topology`]) plus the
//!   private/pairwise constraint functions agents evaluate against
//!   their own state ([`constraint`]).
//! - **Messaging**: the wire message kinds and topic shapes broker
//!   traffic travels on ([`message`]), and the `MessagingAdapter` seam
//!   plus its in-process `LocalBus` test implementation ([`transport`]).
//! - **DPOP phases**: pseudo-tree construction ([`dfs`]), UTIL
//!   propagation ([`util_engine`]) over the tensor representation
//!   ([`tensor`]), and VALUE propagation ([`value_engine`]).
//! - **Orchestration**: the per-agent round driver ([`agent`]) and the
//!   round coordinator — root election, priorities, urgent preemption
//!   ([`coordinator`]).

#![warn(missing_docs)]

pub mod agent;
pub mod config;
pub mod constraint;
pub mod coordinator;
pub mod dfs;
pub mod domain;
pub mod message;
pub mod tensor;
pub mod topology;
pub mod transport;
pub mod util_engine;
pub mod value_engine;

pub use agent::Agent;
pub use config::DpopConfig;
pub use coordinator::{Coordinator, RoundReport};
pub use domain::{Cost, Domain, ValueIndex, INFINITY};
pub use message::Message;
pub use topology::{Area, AgentId, Device, Topology};
pub use transport::{LocalBus, MessagingAdapter};

use thiserror::Error;

/// Engine version, read from the crate manifest.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// The phase a round was in when an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Pseudo-tree construction.
    Dfs,
    /// Bottom-up UTIL propagation.
    Util,
    /// Top-down VALUE propagation.
    Value,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Dfs => write!(f, "dfs"),
            Phase::Util => write!(f, "util"),
            Phase::Value => write!(f, "value"),
        }
    }
}

/// Errors the engine can raise. Mirrors the shape of
/// `knhk_consensus::ConsensusError`: one variant per recoverable or
/// fatal condition, each carrying enough context to log usefully.
#[derive(Debug, Error)]
pub enum DpopError {
    /// A phase wait exceeded its configured timeout. Recovered by the
    /// round loop, logged as a warning.
    #[error("agent {agent} timed out waiting in {phase} phase")]
    Timeout {
        /// The phase that timed out.
        phase: Phase,
        /// The agent that was waiting.
        agent: AgentId,
    },

    /// A wire message failed to parse. The message is dropped.
    #[error("malformed message {raw:?}: {reason}")]
    MalformedMessage {
        /// The raw wire string that failed to decode.
        raw: String,
        /// Why decoding failed.
        reason: String,
    },

    /// A UTIL tensor would exceed the configured rank cap. Fatal to the
    /// round; round state resets.
    #[error("tensor rank {rank} exceeds cap {max}")]
    TensorRankOverflow {
        /// The rank that would have been allocated.
        rank: usize,
        /// The configured cap.
        max: usize,
    },

    /// Both operands of a tensor combine were absent (no children and
    /// no own utility). Treated as a zero tensor.
    #[error("cannot combine two absent tensors")]
    AbsentCombinedWithAbsent,

    /// The coordinator received an urgent preemption request naming an
    /// agent it has no record of. Ignored.
    #[error("urgent preemption request from unknown agent {agent}")]
    UnknownUrgentRoot {
        /// The unrecognized agent id.
        agent: AgentId,
    },

    /// The transport disconnected. Propagates out of the worker loop;
    /// restarting the worker is an external supervisor's job.
    #[error("broker disconnected: {0}")]
    BrokerDisconnected(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, DpopError>;

/// Kinds of structured log entry the engine emits, mapped to `tracing`
/// levels. The crate never writes files directly; an external
/// subscriber renders these as the append-only JSON-lines log (spec §6,
/// non-goal: the log sink itself).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    /// A round-local state transition.
    State,
    /// General informational event.
    Info,
    /// Pseudo-tree construction event.
    Dfs,
    /// UTIL propagation event.
    Util,
    /// VALUE propagation event.
    Value,
    /// Final per-round assignment report.
    Results,
    /// Miscellaneous lifecycle event.
    Event,
    /// A critical device condition or urgent preemption.
    Critical,
}

impl LogKind {
    /// The `tracing` level this kind maps to.
    pub fn level(&self) -> tracing::Level {
        match self {
            LogKind::Critical => tracing::Level::ERROR,
            LogKind::State | LogKind::Dfs | LogKind::Util | LogKind::Value => tracing::Level::DEBUG,
            LogKind::Info | LogKind::Results | LogKind::Event => tracing::Level::INFO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_display_is_lowercase() {
        assert_eq!(Phase::Dfs.to_string(), "dfs");
        assert_eq!(Phase::Util.to_string(), "util");
        assert_eq!(Phase::Value.to_string(), "value");
    }

    #[test]
    fn critical_logs_map_to_error_level() {
        assert_eq!(LogKind::Critical.level(), tracing::Level::ERROR);
        assert_eq!(LogKind::Results.level(), tracing::Level::INFO);
        assert_eq!(LogKind::Dfs.level(), tracing::Level::DEBUG);
    }

    #[test]
    fn timeout_error_message_names_phase_and_agent() {
        let err = DpopError::Timeout { phase: Phase::Util, agent: 3 };
        assert_eq!(err.to_string(), "agent 3 timed out waiting in util phase");
    }
}
