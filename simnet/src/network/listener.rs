//! Simulated servers and their listeners.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{SimNetError, SimNetResult};
use crate::sim::{lock, SimNetwork};
use crate::timer::Timer;
use crate::types::{Alteration, NodeId, SimAddr};

use super::conn::SimConn;
use super::traits::Listener;

#[derive(Debug, Clone)]
struct Bound {
    node: NodeId,
    halt: CancellationToken,
}

/// A server that has not necessarily started listening yet.
#[derive(Debug)]
pub struct SimServer {
    network: SimNetwork,
    name: String,
    bound: Mutex<Option<Bound>>,
}

impl SimServer {
    pub(crate) fn new(network: SimNetwork, name: String) -> Self {
        Self {
            network,
            name,
            bound: Mutex::new(None),
        }
    }

    /// Address this server listens at.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Node identity of the current listener, if any.
    pub fn node(&self) -> Option<NodeId> {
        lock(&self.bound).as_ref().map(|bound| bound.node)
    }

    /// Register this server with the dispatcher and start accepting.
    ///
    /// Listening at an address whose identity was shut down creates a new
    /// identity; after a RESTART the fresh identity is adopted. Fails with
    /// [`SimNetError::AddressInUse`] if a live listener already owns the
    /// address.
    #[instrument(skip(self), fields(name = %self.name))]
    pub async fn listen(&self) -> SimNetResult<SimListener> {
        let registered = self.network.register_server(&self.name).await?;
        *lock(&self.bound) = Some(Bound {
            node: registered.node,
            halt: registered.halt.clone(),
        });
        debug!(node = %registered.node, "listening");
        Ok(SimListener {
            node: registered.node,
            addr: registered.addr,
            halt: registered.halt,
            accept: tokio::sync::Mutex::new(registered.accept),
            network: self.network.clone(),
        })
    }

    /// Shut the server's node down. A no-op before `listen()`.
    pub async fn close(&self) -> SimNetResult<()> {
        let bound = lock(&self.bound).clone();
        match bound {
            Some(bound) => shut_down(&self.network, bound.node).await,
            None => Ok(()),
        }
    }

    /// Arm a timer anchored to this server's node.
    ///
    /// Fails with [`SimNetError::NotRegistered`] before `listen()`.
    pub fn new_timer(&self, duration: Duration) -> SimNetResult<Timer> {
        let bound = lock(&self.bound).clone().ok_or(SimNetError::NotRegistered)?;
        self.network.arm_timer(bound.node, &bound.halt, duration)
    }
}

/// The accepting end of a listening server.
///
/// Dropping it without `close()` stops accepting but leaves the node and its
/// accepted connections running; the next `listen()` at the address takes
/// the node back.
#[derive(Debug)]
pub struct SimListener {
    node: NodeId,
    addr: SimAddr,
    halt: CancellationToken,
    accept: tokio::sync::Mutex<mpsc::UnboundedReceiver<SimConn>>,
    network: SimNetwork,
}

impl SimListener {
    /// Node identity behind this listener.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Arm a timer anchored to this listener's node.
    pub fn new_timer(&self, duration: Duration) -> SimNetResult<Timer> {
        self.network.arm_timer(self.node, &self.halt, duration)
    }
}

#[async_trait]
impl Listener for SimListener {
    type Conn = SimConn;

    async fn accept(&self) -> SimNetResult<SimConn> {
        let mut queue = self.accept.lock().await;
        tokio::select! {
            biased;
            _ = self.halt.cancelled() => Err(SimNetError::Shutdown),
            conn = queue.recv() => conn.ok_or(SimNetError::Shutdown),
        }
    }

    fn addr(&self) -> SimAddr {
        self.addr.clone()
    }

    async fn close(&self) -> SimNetResult<()> {
        shut_down(&self.network, self.node).await
    }
}

/// SHUTDOWN one identity; closing something already gone is not an error.
async fn shut_down(network: &SimNetwork, node: NodeId) -> SimNetResult<()> {
    match network.alter_node(node, Alteration::Shutdown).await {
        Ok(_) | Err(SimNetError::Shutdown) => Ok(()),
        Err(err) => Err(err),
    }
}
