//! Identifiers and small value types shared by the engine and the handles.

use std::fmt;

/// Identity of one generation of a simulated node.
///
/// Ids are handed out from a monotonically increasing counter and never
/// reused: a RESTART produces a new id bound to the same address, while the
/// old id stays pinned to its dead generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u64);

impl NodeId {
    /// Raw arena index of this identity.
    pub fn index(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node#{}", self.0)
    }
}

/// Identifier of one side of a simulated connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub(crate) u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Identifier of a virtual timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub(crate) u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

/// Whether a node dials out or accepts connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Dials servers.
    Client,
    /// Listens and accepts.
    Server,
}

/// Lifecycle state of a node identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    /// Reachable and accepting operations.
    Active,
    /// Unreachable from every other node; queued operations are kept.
    Partitioned,
    /// Dead. Terminal for this identity.
    Shutdown,
}

impl NodeState {
    /// True unless the identity is dead.
    pub fn is_live(&self) -> bool {
        !matches!(self, NodeState::Shutdown)
    }
}

/// A fault-injection command applied to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Alteration {
    /// Kill the node: fail its operations, close its accept queue.
    Shutdown,
    /// Isolate the node from every other node.
    Partition,
    /// Lift a node-level partition.
    Unpartition,
    /// Kill the current identity and bring up a fresh one at the same address.
    Restart,
}

impl fmt::Display for Alteration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Alteration::Shutdown => "SHUTDOWN",
            Alteration::Partition => "PARTITION",
            Alteration::Unpartition => "UNPARTITION",
            Alteration::Restart => "RESTART",
        };
        f.write_str(name)
    }
}

/// Address of a simulated endpoint.
///
/// `addr()` is the name the node registered under; `network()` is the
/// configured network name. `Display` prints the address only, `url()` the
/// `network://addr` form used in logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SimAddr {
    network: String,
    name: String,
    role: Role,
}

impl SimAddr {
    pub(crate) fn new(network: &str, name: &str, role: Role) -> Self {
        Self {
            network: network.to_string(),
            name: name.to_string(),
            role,
        }
    }

    /// Network name, `"simnet"` by default.
    pub fn network(&self) -> &str {
        &self.network
    }

    /// Address the endpoint is bound to.
    pub fn addr(&self) -> &str {
        &self.name
    }

    /// Role of the node behind this address.
    pub fn role(&self) -> Role {
        self.role
    }

    /// True when the address belongs to a dialing node.
    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    /// `network://addr`.
    pub fn url(&self) -> String {
        format!("{}://{}", self.network, self.name)
    }
}

impl fmt::Display for SimAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Snapshot of one node identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    /// Identity of this generation.
    pub id: NodeId,
    /// Registered name, which is also the address.
    pub name: String,
    /// Client or server.
    pub role: Role,
    /// Lifecycle state.
    pub state: NodeState,
    /// How many RESTARTs preceded this identity at the same address.
    pub generation: u32,
}

/// Point-in-time view of the dispatcher's state.
///
/// Queue counts only include operations whose caller is still waiting;
/// abandoned entries are pruned before the snapshot is taken.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SimNetMetrics {
    /// Every identity ever registered, oldest first.
    pub nodes: Vec<NodeInfo>,
    /// Connection sides that have not been torn down.
    pub connections: usize,
    /// SENDs waiting for a matching READ.
    pub queued_sends: usize,
    /// READs waiting for a matching SEND.
    pub queued_reads: usize,
    /// Timers armed but not yet fired or discarded.
    pub armed_timers: usize,
    /// SEND/READ pairs matched so far.
    pub matched: u64,
    /// Timers fired so far.
    pub timers_fired: u64,
    /// Operations failed because a node was shut down or restarted.
    pub failed_by_alteration: u64,
    /// Queued operations dropped because their caller gave up.
    pub abandoned: u64,
}

impl SimNetMetrics {
    /// Latest identity registered under `name`.
    pub fn node(&self, name: &str) -> Option<&NodeInfo> {
        self.nodes.iter().rev().find(|node| node.name == name)
    }
}
