//! Fault model: node state transitions and reachability.
//!
//! Two independent kinds of partition exist. A node-level PARTITION isolates
//! one identity from everyone and is cleared by UNPARTITION or RESTART. A
//! pairwise partition severs two addresses from each other and survives
//! restarts of either side, because it models the network between them
//! rather than the hosts.

use std::collections::HashSet;

use crate::types::{Alteration, NodeState};

use super::node::SimNode;

/// What the dispatcher must do to apply an alteration to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Idempotent request; nothing changes.
    Unchanged,
    /// Active → Partitioned.
    Isolate,
    /// Partitioned → Active.
    Rejoin,
    /// Live → Shutdown.
    Kill,
    /// Kill the identity if still live, then register a fresh one.
    Reincarnate,
}

/// Transition table for a single node identity.
pub(crate) fn transition(state: NodeState, alteration: Alteration) -> Transition {
    match (state, alteration) {
        (_, Alteration::Restart) => Transition::Reincarnate,
        (NodeState::Shutdown, _) => Transition::Unchanged,
        (_, Alteration::Shutdown) => Transition::Kill,
        (NodeState::Active, Alteration::Partition) => Transition::Isolate,
        (NodeState::Partitioned, Alteration::Unpartition) => Transition::Rejoin,
        (NodeState::Partitioned, Alteration::Partition)
        | (NodeState::Active, Alteration::Unpartition) => Transition::Unchanged,
    }
}

/// Address pairs that cannot reach each other.
#[derive(Debug, Default)]
pub(crate) struct SeveredPairs {
    pairs: HashSet<(String, String)>,
}

impl SeveredPairs {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn key(a: &str, b: &str) -> (String, String) {
        if a <= b {
            (a.to_string(), b.to_string())
        } else {
            (b.to_string(), a.to_string())
        }
    }

    /// Sever or heal the link between `a` and `b`. Idempotent; returns
    /// whether anything changed.
    pub(crate) fn set(&mut self, a: &str, b: &str, severed: bool) -> bool {
        let key = Self::key(a, b);
        if severed {
            self.pairs.insert(key)
        } else {
            self.pairs.remove(&key)
        }
    }

    pub(crate) fn contains(&self, a: &str, b: &str) -> bool {
        self.pairs.contains(&Self::key(a, b))
    }
}

/// Why an operation between two nodes cannot proceed right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PathFault {
    /// One endpoint is dead.
    Dead,
    /// Both endpoints live but cut off from each other.
    Unreachable,
}

/// Check whether an operation from `origin` can reach `target`.
pub(crate) fn check_path(
    origin: &SimNode,
    target: &SimNode,
    severed: &SeveredPairs,
) -> Result<(), PathFault> {
    if !origin.is_live() || !target.is_live() {
        return Err(PathFault::Dead);
    }
    let isolated = origin.state == NodeState::Partitioned || target.state == NodeState::Partitioned;
    if isolated || severed.contains(&origin.name, &target.name) {
        return Err(PathFault::Unreachable);
    }
    Ok(())
}
