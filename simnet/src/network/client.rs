//! Simulated clients.

use std::sync::Mutex;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{SimNetError, SimNetResult};
use crate::sim::{lock, SimNetwork};
use crate::timer::Timer;
use crate::types::{Alteration, NodeId, SimAddr};

use super::conn::SimConn;

#[derive(Debug, Default)]
struct ClientState {
    node: Option<(NodeId, CancellationToken)>,
    local: Option<SimAddr>,
    remote: Option<SimAddr>,
}

/// A client that dials simulated servers.
///
/// The first successful dial registers the client's node; later dials
/// reuse it, so every connection of one client shares its faults.
#[derive(Debug)]
pub struct SimClient {
    network: SimNetwork,
    name: String,
    halt: CancellationToken,
    state: Mutex<ClientState>,
}

impl SimClient {
    pub(crate) fn new(network: SimNetwork, name: String) -> Self {
        let halt = network.handle().halt().child_token();
        Self {
            network,
            name,
            halt,
            state: Mutex::new(ClientState::default()),
        }
    }

    /// Address the client dials from.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node identity, once the client has dialed.
    pub fn node(&self) -> Option<NodeId> {
        lock(&self.state).node.as_ref().map(|(node, _)| *node)
    }

    /// Connect to the server listening at `addr`.
    ///
    /// Fails with [`SimNetError::Refused`] when nothing listens there,
    /// [`SimNetError::Shutdown`] when either side is down or the client is
    /// closed, and [`SimNetError::Partitioned`] when the server is
    /// unreachable.
    ///
    /// # Panics
    ///
    /// Panics if `addr` is empty.
    #[instrument(skip(self), fields(client = %self.name))]
    pub async fn dial(&self, addr: &str) -> SimNetResult<SimConn> {
        assert!(!addr.is_empty(), "dial requires a server address");
        if self.halt.is_cancelled() {
            return Err(SimNetError::Shutdown);
        }
        let known = self.node();
        let registered = tokio::select! {
            registered = self.network.register_client(&self.name, addr, known) => registered?,
            _ = self.halt.cancelled() => return Err(SimNetError::Shutdown),
        };

        let mut state = lock(&self.state);
        state.node = Some((registered.node, registered.halt));
        state.local = Some(registered.addr);
        state.remote = Some(registered.conn.remote_addr().clone());
        debug!(node = %registered.node, conn = %registered.conn.id(), "dialed");
        Ok(registered.conn)
    }

    /// Close the client: pending and future dials fail, and its node is
    /// shut down. Idempotent.
    pub async fn close(&self) -> SimNetResult<()> {
        self.halt.cancel();
        let node = self.node();
        let Some(node) = node else {
            return Ok(());
        };
        match self.network.alter_node(node, Alteration::Shutdown).await {
            Ok(_) | Err(SimNetError::Shutdown) => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Arm a timer anchored to this client's node.
    ///
    /// Fails with [`SimNetError::NotRegistered`] before the first dial.
    pub fn new_timer(&self, duration: Duration) -> SimNetResult<Timer> {
        let node = lock(&self.state).node.clone();
        let (node, halt) = node.ok_or(SimNetError::NotRegistered)?;
        self.network.arm_timer(node, &halt, duration)
    }

    /// Address of the client's node, once dialed.
    pub fn local_addr(&self) -> Option<SimAddr> {
        lock(&self.state).local.clone()
    }

    /// Address of the most recently dialed server.
    pub fn remote_addr(&self) -> Option<SimAddr> {
        lock(&self.state).remote.clone()
    }
}
