//! Node registry: an arena of node identities.
//!
//! Every registration or RESTART appends a new [`SimNode`] whose [`NodeId`]
//! is its arena index. The address map always points at the latest
//! generation; older generations stay in the arena, pinned to their dead
//! state, so a stale id can never observe a restarted node as live.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::network::SimConn;
use crate::types::{ConnId, NodeId, NodeInfo, NodeState, Role, SimAddr};

/// One generation of a simulated host.
#[derive(Debug)]
pub(crate) struct SimNode {
    pub(crate) id: NodeId,
    pub(crate) name: String,
    pub(crate) role: Role,
    pub(crate) state: NodeState,
    pub(crate) generation: u32,
    /// Cancelled when this identity dies.
    pub(crate) halt: CancellationToken,
    /// Where newly dialed server-side connections are pushed.
    pub(crate) accept_tx: Option<mpsc::UnboundedSender<SimConn>>,
    /// The receiving end, until a listener claims it.
    pub(crate) accept_rx: Option<mpsc::UnboundedReceiver<SimConn>>,
    /// Connection sides anchored on this node.
    pub(crate) conns: BTreeSet<ConnId>,
    /// Set once a listener or a dialing client owns this identity. Identities
    /// created by RESTART start unclaimed.
    pub(crate) claimed: bool,
}

impl SimNode {
    pub(crate) fn is_live(&self) -> bool {
        self.state.is_live()
    }

    pub(crate) fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            name: self.name.clone(),
            role: self.role,
            state: self.state,
            generation: self.generation,
        }
    }

    /// True when a listener claimed this server identity and has since been
    /// dropped without closing it.
    pub(crate) fn listener_dropped(&self) -> bool {
        self.claimed
            && self.accept_rx.is_none()
            && self.accept_tx.as_ref().is_some_and(|tx| tx.is_closed())
    }

    /// Give a live server identity a fresh accept queue for a new listener.
    pub(crate) fn reopen_accept(&mut self) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.accept_tx = Some(tx);
        self.accept_rx = Some(rx);
        self.claimed = false;
    }

    pub(crate) fn addr(&self, network: &str) -> SimAddr {
        SimAddr::new(network, &self.name, self.role)
    }
}

/// Arena of every node identity the simulation has ever seen.
#[derive(Debug, Default)]
pub(crate) struct NodeRegistry {
    nodes: Vec<SimNode>,
    by_addr: HashMap<String, NodeId>,
}

impl NodeRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a fresh identity at `name`, superseding any previous one.
    pub(crate) fn register(&mut self, name: &str, role: Role, parent: &CancellationToken) -> NodeId {
        let id = NodeId(self.nodes.len() as u64);
        let generation = self
            .latest(name)
            .map(|previous| previous.generation + 1)
            .unwrap_or(0);

        let (accept_tx, accept_rx) = match role {
            Role::Server => {
                let (tx, rx) = mpsc::unbounded_channel();
                (Some(tx), Some(rx))
            }
            Role::Client => (None, None),
        };

        self.nodes.push(SimNode {
            id,
            name: name.to_string(),
            role,
            state: NodeState::Active,
            generation,
            halt: parent.child_token(),
            accept_tx,
            accept_rx,
            conns: BTreeSet::new(),
            claimed: false,
        });
        self.by_addr.insert(name.to_string(), id);
        id
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&SimNode> {
        self.nodes.get(id.0 as usize)
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(id.0 as usize)
    }

    /// Latest identity registered at `addr`.
    pub(crate) fn resolve(&self, addr: &str) -> Option<NodeId> {
        self.by_addr.get(addr).copied()
    }

    pub(crate) fn latest(&self, addr: &str) -> Option<&SimNode> {
        self.resolve(addr).and_then(|id| self.get(id))
    }

    /// True when `id` is the identity the address currently resolves to.
    pub(crate) fn is_current(&self, id: NodeId) -> bool {
        self.get(id)
            .is_some_and(|node| self.resolve(&node.name) == Some(id))
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &SimNode> {
        self.nodes.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut SimNode> {
        self.nodes.iter_mut()
    }
}
