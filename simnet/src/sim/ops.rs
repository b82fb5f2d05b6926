//! Operation records and the dispatcher's request mailbox.
//!
//! Every interaction with the simulated network is submitted as a
//! [`Request`] on a single ordered channel. SENDs, READs and timer arms are
//! carried as a [`Mop`]; each kind owns the channel its result is delivered
//! on, so the dispatcher can resolve it exactly once and the caller can give
//! up without the dispatcher having to know.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{SimNetError, SimNetResult};
use crate::message::Message;
use crate::network::SimConn;
use crate::types::{Alteration, ConnId, NodeId, NodeInfo, SimAddr, SimNetMetrics, TimerId};

/// Where a SEND's completion goes. `None` for fire-and-forget EOFs and for
/// data whose writer has already been acknowledged.
pub(crate) type SendDone = Option<oneshot::Sender<SimNetResult<()>>>;

/// Where a READ's message goes.
pub(crate) type ReadDone = oneshot::Sender<SimNetResult<Message>>;

/// Fields common to every operation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MopHeader {
    pub(crate) origin: NodeId,
    pub(crate) target: NodeId,
    pub(crate) created: Instant,
    /// Caller-side deadline in force when the operation was submitted.
    pub(crate) deadline: Option<Instant>,
}

impl MopHeader {
    pub(crate) fn new(origin: NodeId, target: NodeId, deadline: Option<Instant>) -> Self {
        Self {
            origin,
            target,
            created: Instant::now(),
            deadline,
        }
    }
}

/// A write waiting to be matched.
#[derive(Debug)]
pub(crate) struct SendMop {
    pub(crate) header: MopHeader,
    pub(crate) conn: ConnId,
    pub(crate) msg: Message,
    pub(crate) done: SendDone,
}

impl SendMop {
    /// True when the writer stopped waiting before being acknowledged.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.done.as_ref().is_some_and(|done| done.is_closed())
    }

    /// Complete the writer, if it is still attached.
    pub(crate) fn resolve(&mut self, result: SimNetResult<()>) {
        if let Some(done) = self.done.take() {
            let _ = done.send(result);
        }
    }

    /// Acknowledge the writer ahead of delivery. Returns false when the
    /// writer already gave up, in which case the data must not be delivered.
    pub(crate) fn acknowledge(&mut self) -> bool {
        match self.done.take() {
            Some(done) => done.send(Ok(())).is_ok(),
            None => true,
        }
    }
}

/// A read waiting to be matched.
#[derive(Debug)]
pub(crate) struct ReadMop {
    pub(crate) header: MopHeader,
    pub(crate) conn: ConnId,
    pub(crate) done: ReadDone,
}

impl ReadMop {
    pub(crate) fn is_abandoned(&self) -> bool {
        self.done.is_closed()
    }

    /// Hand `msg` to the reader. Gives the message back if the reader is gone.
    pub(crate) fn deliver(self, msg: Message) -> Result<(), Message> {
        match self.done.send(Ok(msg)) {
            Ok(()) => Ok(()),
            Err(Ok(msg)) => Err(msg),
            Err(Err(_)) => Ok(()),
        }
    }

    pub(crate) fn fail(self, err: SimNetError) {
        let _ = self.done.send(Err(err));
    }
}

/// A timer to arm on the virtual clock.
#[derive(Debug)]
pub(crate) struct TimerMop {
    pub(crate) header: MopHeader,
    pub(crate) id: TimerId,
    pub(crate) fire_at: Instant,
    pub(crate) fire: watch::Sender<Option<Instant>>,
}

/// An operation submitted to the dispatcher.
#[derive(Debug)]
pub(crate) enum Mop {
    Send(SendMop),
    Read(ReadMop),
    Timer(TimerMop),
}

/// Which node an alteration addresses.
#[derive(Debug, Clone)]
pub(crate) enum AlterTarget {
    /// Whatever identity the address currently resolves to.
    Host(String),
    /// One specific identity, possibly stale.
    Node(NodeId),
}

/// A listener's claim on a server identity.
#[derive(Debug)]
pub(crate) struct ServerRegistered {
    pub(crate) node: NodeId,
    pub(crate) addr: SimAddr,
    pub(crate) halt: CancellationToken,
    pub(crate) accept: mpsc::UnboundedReceiver<SimConn>,
}

/// A dial request.
#[derive(Debug)]
pub(crate) struct ClientRegistration {
    pub(crate) name: String,
    pub(crate) server_addr: String,
    /// Identity from a previous dial, reused so every connection of one
    /// client shares its fate.
    pub(crate) node: Option<NodeId>,
    pub(crate) reply: oneshot::Sender<SimNetResult<ClientRegistered>>,
}

/// The client end of a freshly dialed connection.
#[derive(Debug)]
pub(crate) struct ClientRegistered {
    pub(crate) node: NodeId,
    pub(crate) addr: SimAddr,
    pub(crate) halt: CancellationToken,
    pub(crate) conn: SimConn,
}

/// The dispatcher's mailbox.
#[derive(Debug)]
pub(crate) enum Request {
    RegisterServer {
        name: String,
        reply: oneshot::Sender<SimNetResult<ServerRegistered>>,
    },
    RegisterClient(ClientRegistration),
    Op(Mop),
    DiscardTimer {
        id: TimerId,
        reply: oneshot::Sender<bool>,
    },
    Alter {
        target: AlterTarget,
        alteration: Alteration,
        reply: oneshot::Sender<SimNetResult<NodeInfo>>,
    },
    Sever {
        a: String,
        b: String,
        severed: bool,
        reply: oneshot::Sender<()>,
    },
    Metrics {
        reply: oneshot::Sender<SimNetMetrics>,
    },
}
