//! Virtual timers.
//!
//! A timer belongs to a node and fires on the simulation clock. Firing is a
//! latch: once the dispatcher delivers the fire instant, every current and
//! future `wait()` sees it.

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{SimNetError, SimNetResult};
use crate::sim::ops::Request;
use crate::sim::SimHandle;
use crate::types::{NodeId, TimerId};

/// A one-shot timer armed on the virtual clock.
///
/// Created by [`SimServer::new_timer`](crate::SimServer::new_timer) or
/// [`SimClient::new_timer`](crate::SimClient::new_timer). Cloning yields
/// another handle to the same timer.
#[derive(Debug, Clone)]
pub struct Timer {
    id: TimerId,
    node: NodeId,
    deadline: Instant,
    fired: watch::Receiver<Option<Instant>>,
    node_halt: CancellationToken,
    handle: SimHandle,
}

impl Timer {
    pub(crate) fn new(
        id: TimerId,
        node: NodeId,
        deadline: Instant,
        fired: watch::Receiver<Option<Instant>>,
        node_halt: CancellationToken,
        handle: SimHandle,
    ) -> Self {
        Self {
            id,
            node,
            deadline,
            fired,
            node_halt,
            handle,
        }
    }

    /// Identifier of this timer.
    pub fn id(&self) -> TimerId {
        self.id
    }

    /// Node the timer is anchored to.
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Instant the timer is due.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True once the dispatcher has fired the timer.
    pub fn has_fired(&self) -> bool {
        self.fired.borrow().is_some()
    }

    /// Fire instant, if the timer has fired.
    pub fn fired_at(&self) -> Option<Instant> {
        *self.fired.borrow()
    }

    /// Wait for the timer to fire and return the fire instant.
    ///
    /// Fails with [`SimNetError::Shutdown`] if the owning node or the
    /// simulation goes down first, and with [`SimNetError::Discarded`] if the
    /// timer is discarded.
    pub async fn wait(&self) -> SimNetResult<Instant> {
        let mut fired = self.fired.clone();
        let outcome = fired.wait_for(Option::is_some).await.map(|at| *at);
        match outcome {
            Ok(Some(at)) => Ok(at),
            _ if self.node_halt.is_cancelled() || self.handle.halt().is_cancelled() => {
                Err(SimNetError::Shutdown)
            }
            _ => Err(SimNetError::Discarded),
        }
    }

    /// Disarm the timer. Returns true if it was still armed, false if it had
    /// already fired, was already discarded, or the simulation is gone.
    pub async fn discard(&self) -> bool {
        let id = self.id;
        self.handle
            .call(|reply| Request::DiscardTimer { id, reply })
            .await
            .unwrap_or(false)
    }

    /// Disarm without waiting for the answer.
    pub(crate) fn discard_detached(&self) {
        let (reply, _) = tokio::sync::oneshot::channel();
        let _ = self.handle.submit(Request::DiscardTimer { id: self.id, reply });
    }

    /// A receiver that resolves when the timer fires.
    pub(crate) fn subscribe(&self) -> watch::Receiver<Option<Instant>> {
        self.fired.clone()
    }
}
