//! The dispatcher: one task that owns every queue of the simulated network.
//!
//! Nothing outside this module ever touches node, connection or timer state.
//! Handles submit [`Request`]s on an ordered channel and wait on the
//! per-operation reply channel, so all matching happens in submission order
//! and the outcome of a run depends only on that order and on the virtual
//! clock.
//!
//! ## Matching
//!
//! Each connection side keeps two FIFO queues: `inbox` holds SENDs from the
//! peer that no READ has consumed yet, `readers` holds READs issued on this
//! side that no SEND has satisfied yet. At most one of them is non-empty at
//! any time (ignoring entries whose caller gave up, which are skipped when
//! popped). A match acknowledges the writer first and then hands the message
//! to the reader; if the reader vanished in between, the message goes back to
//! the front of the inbox already acknowledged, so it is neither lost nor
//! duplicated.

use std::collections::{HashMap, VecDeque};
use std::future;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, trace, warn};

use crate::error::{SimNetError, SimNetResult};
use crate::message::Message;
use crate::network::{ConnEnds, SimConn};
use crate::types::{Alteration, ConnId, NodeId, NodeInfo, NodeState, Role, SimNetMetrics};

use super::faults::{self, PathFault, SeveredPairs, Transition};
use super::node::{NodeRegistry, SimNode};
use super::ops::{
    AlterTarget, ClientRegistered, ClientRegistration, Mop, ReadMop, Request, SendMop,
    ServerRegistered, TimerMop,
};
use super::timers::TimerQueue;
use super::world::SimHandle;

/// One side of a connection.
#[derive(Debug)]
struct ConnState {
    peer: ConnId,
    local: NodeId,
    /// SENDs from the peer waiting for a READ on this side.
    inbox: VecDeque<SendMop>,
    /// READs on this side waiting for a SEND from the peer.
    readers: VecDeque<ReadMop>,
    /// The peer sent its end-of-stream marker.
    peer_eof: bool,
    /// This side sent its end-of-stream marker.
    closed: bool,
}

impl ConnState {
    fn new(peer: ConnId, local: NodeId) -> Self {
        Self {
            peer,
            local,
            inbox: VecDeque::new(),
            readers: VecDeque::new(),
            peer_eof: false,
            closed: false,
        }
    }

    fn next_reader(&mut self, abandoned: &mut u64) -> Option<ReadMop> {
        while let Some(reader) = self.readers.pop_front() {
            if !reader.is_abandoned() {
                return Some(reader);
            }
            *abandoned += 1;
        }
        None
    }

    fn next_send(&mut self, abandoned: &mut u64) -> Option<SendMop> {
        while let Some(send) = self.inbox.pop_front() {
            if !send.is_abandoned() {
                return Some(send);
            }
            *abandoned += 1;
        }
        None
    }

    /// Drop entries whose caller gave up.
    fn prune(&mut self) -> u64 {
        let before = self.inbox.len() + self.readers.len();
        self.inbox.retain(|send| !send.is_abandoned());
        self.readers.retain(|reader| !reader.is_abandoned());
        (before - self.inbox.len() - self.readers.len()) as u64
    }

    /// Resolve everything queued on this side with `err`. Returns how many
    /// callers were still waiting.
    fn fail_all(&mut self, err: &SimNetError) -> u64 {
        let mut failed = 0;
        for reader in self.readers.drain(..) {
            if !reader.is_abandoned() {
                failed += 1;
            }
            reader.fail(err.clone());
        }
        for mut send in self.inbox.drain(..) {
            if send.done.as_ref().is_some_and(|done| !done.is_closed()) {
                failed += 1;
            }
            send.resolve(Err(err.clone()));
        }
        failed
    }
}

#[derive(Debug, Default)]
struct Counters {
    matched: u64,
    timers_fired: u64,
    failed_by_alteration: u64,
    abandoned: u64,
}

/// Owner of all simulated network state.
#[derive(Debug)]
pub(crate) struct Dispatcher {
    handle: SimHandle,
    requests: mpsc::UnboundedReceiver<Request>,
    halt: CancellationToken,
    network: String,
    max_message_size: usize,
    nodes: NodeRegistry,
    conns: HashMap<ConnId, ConnState>,
    timers: TimerQueue,
    severed: SeveredPairs,
    next_conn: u64,
    next_serial: u64,
    counters: Counters,
}

impl Dispatcher {
    pub(crate) fn new(handle: SimHandle, requests: mpsc::UnboundedReceiver<Request>) -> Self {
        let halt = handle.halt().clone();
        let network = handle.config().network_name.clone();
        let max_message_size = handle.config().max_message_size;
        Self {
            handle,
            requests,
            halt,
            network,
            max_message_size,
            nodes: NodeRegistry::new(),
            conns: HashMap::new(),
            timers: TimerQueue::new(),
            severed: SeveredPairs::new(),
            next_conn: 0,
            next_serial: 0,
            counters: Counters::default(),
        }
    }

    /// Serve requests until the simulation halts.
    #[instrument(skip_all, name = "dispatcher", fields(network = %self.network))]
    pub(crate) async fn run(mut self) {
        debug!("dispatcher started");
        let halt = self.halt.clone();
        loop {
            self.fire_due_timers(Instant::now());
            let next_deadline = self.timers.next_deadline();

            tokio::select! {
                biased;
                _ = halt.cancelled() => break,
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request),
                    None => break,
                },
                _ = sleep_until(next_deadline) => {}
            }
        }
        self.teardown();
    }

    fn handle(&mut self, request: Request) {
        match request {
            Request::RegisterServer { name, reply } => {
                let result = self.register_server(&name);
                if let Err(Ok(unclaimed)) = reply.send(result) {
                    // The listener gave up before seeing its claim.
                    if let Some(node) = self.nodes.get_mut(unclaimed.node) {
                        node.accept_rx = Some(unclaimed.accept);
                        node.claimed = false;
                    }
                }
            }
            Request::RegisterClient(registration) => self.register_client(registration),
            Request::Op(Mop::Send(op)) => self.handle_send(op),
            Request::Op(Mop::Read(op)) => self.handle_read(op),
            Request::Op(Mop::Timer(op)) => self.arm_timer(op),
            Request::DiscardTimer { id, reply } => {
                let was_armed = self.timers.discard(id);
                trace!(timer = %id, was_armed, "timer discarded");
                let _ = reply.send(was_armed);
            }
            Request::Alter {
                target,
                alteration,
                reply,
            } => {
                let _ = reply.send(self.alter(target, alteration));
            }
            Request::Sever {
                a,
                b,
                severed,
                reply,
            } => {
                let changed = self.severed.set(&a, &b, severed);
                debug!(a = %a, b = %b, severed, changed, "link updated");
                let _ = reply.send(());
            }
            Request::Metrics { reply } => {
                let _ = reply.send(self.metrics());
            }
        }
    }

    fn register_server(&mut self, name: &str) -> SimNetResult<ServerRegistered> {
        let (id, reclaim) = match self.nodes.latest(name) {
            Some(node) if node.is_live() => {
                let reclaim = node.role == Role::Server && node.listener_dropped();
                if node.role != Role::Server || (node.claimed && !reclaim) {
                    return Err(SimNetError::AddressInUse(name.to_string()));
                }
                (node.id, reclaim)
            }
            _ => (self.nodes.register(name, Role::Server, &self.halt), false),
        };

        let node = self.nodes.get_mut(id).ok_or(SimNetError::NotRegistered)?;
        if reclaim {
            // Connections already accepted keep running on this identity.
            debug!(node = %id, name, "reclaiming identity of a dropped listener");
            node.reopen_accept();
        }
        let accept = node
            .accept_rx
            .take()
            .ok_or_else(|| SimNetError::AddressInUse(name.to_string()))?;
        node.claimed = true;
        debug!(node = %id, name, generation = node.generation, "server listening");
        Ok(ServerRegistered {
            node: id,
            addr: node.addr(&self.network),
            halt: node.halt.clone(),
            accept,
        })
    }

    fn register_client(&mut self, registration: ClientRegistration) {
        let ClientRegistration {
            name,
            server_addr,
            node,
            reply,
        } = registration;
        let result = self.connect(&name, &server_addr, node);
        if let Err(err) = &result {
            debug!(client = %name, server = %server_addr, %err, "dial failed");
        }
        // If the dialer gave up, dropping the connection closes it.
        let _ = reply.send(result);
    }

    fn connect(
        &mut self,
        name: &str,
        server_addr: &str,
        known: Option<NodeId>,
    ) -> SimNetResult<ClientRegistered> {
        let server = match self.nodes.latest(server_addr) {
            Some(node) if node.role == Role::Server => node.id,
            _ => return Err(SimNetError::Refused(server_addr.to_string())),
        };

        let client = match known {
            Some(id) => id,
            None => match self.nodes.latest(name) {
                Some(node) if node.is_live() => {
                    if node.role != Role::Client || node.claimed {
                        return Err(SimNetError::AddressInUse(name.to_string()));
                    }
                    node.id
                }
                _ => self.nodes.register(name, Role::Client, &self.halt),
            },
        };

        self.check_path(client, server)?;

        let client_id = ConnId(self.next_conn);
        let server_id = ConnId(self.next_conn + 1);
        self.next_conn += 2;

        let client_closed = CancellationToken::new();
        let server_closed = CancellationToken::new();

        let (client_addr, client_halt) = {
            let node = self.nodes.get(client).ok_or(SimNetError::NotRegistered)?;
            (node.addr(&self.network), node.halt.clone())
        };
        let (server_sim_addr, server_halt, accept_tx) = {
            let node = self.nodes.get(server).ok_or(SimNetError::Shutdown)?;
            (node.addr(&self.network), node.halt.clone(), node.accept_tx.clone())
        };

        let server_conn = SimConn::new(
            self.handle.clone(),
            ConnEnds {
                id: server_id,
                local_node: server,
                remote_node: client,
                local_addr: server_sim_addr.clone(),
                remote_addr: client_addr.clone(),
                node_halt: server_halt,
                local_closed: server_closed.clone(),
                remote_closed: client_closed.clone(),
            },
        );
        let Some(accept_tx) = accept_tx else {
            server_conn.disarm();
            return Err(SimNetError::Shutdown);
        };
        if let Err(mpsc::error::SendError(orphan)) = accept_tx.send(server_conn) {
            orphan.disarm();
            return Err(SimNetError::Refused(server_addr.to_string()));
        }

        self.conns.insert(client_id, ConnState::new(server_id, client));
        self.conns.insert(server_id, ConnState::new(client_id, server));
        if let Some(node) = self.nodes.get_mut(client) {
            node.conns.insert(client_id);
            node.claimed = true;
        }
        if let Some(node) = self.nodes.get_mut(server) {
            node.conns.insert(server_id);
        }

        let conn = SimConn::new(
            self.handle.clone(),
            ConnEnds {
                id: client_id,
                local_node: client,
                remote_node: server,
                local_addr: client_addr.clone(),
                remote_addr: server_sim_addr,
                node_halt: client_halt.clone(),
                local_closed: client_closed,
                remote_closed: server_closed,
            },
        );
        debug!(
            client = name,
            server = server_addr,
            client_conn = %client_id,
            server_conn = %server_id,
            "connection established"
        );
        Ok(ClientRegistered {
            node: client,
            addr: client_addr,
            halt: client_halt,
            conn,
        })
    }

    fn path_error(fault: PathFault, target: &SimNode) -> SimNetError {
        match fault {
            PathFault::Dead => SimNetError::Shutdown,
            PathFault::Unreachable => SimNetError::Partitioned(target.name.clone()),
        }
    }

    fn check_path(&self, origin: NodeId, target: NodeId) -> SimNetResult<()> {
        let (Some(from), Some(to)) = (self.nodes.get(origin), self.nodes.get(target)) else {
            return Err(SimNetError::Shutdown);
        };
        faults::check_path(from, to, &self.severed).map_err(|fault| Self::path_error(fault, to))
    }

    /// Validate a SEND and return the connection side it targets.
    fn admit_send(&self, op: &SendMop) -> SimNetResult<ConnId> {
        let conn = self.conns.get(&op.conn).ok_or_else(|| {
            warn!(conn = %op.conn, "send on unknown connection");
            SimNetError::ClosedConnection
        })?;
        self.check_path(op.header.origin, op.header.target)?;
        if op.msg.len() > self.max_message_size {
            return Err(SimNetError::MessageTooLong {
                len: op.msg.len(),
                max: self.max_message_size,
            });
        }
        if conn.closed {
            return Err(SimNetError::ClosedConnection);
        }
        match self.conns.get(&conn.peer) {
            Some(peer) if !peer.closed => Ok(conn.peer),
            _ => Err(SimNetError::Eof),
        }
    }

    fn handle_send(&mut self, mut op: SendMop) {
        if op.msg.is_eof() {
            self.close_side(op.conn);
            op.resolve(Ok(()));
            return;
        }

        let peer = match self.admit_send(&op) {
            Ok(peer) => peer,
            Err(err) => {
                trace!(conn = %op.conn, %err, "send rejected");
                op.resolve(Err(err));
                return;
            }
        };

        self.next_serial += 1;
        op.msg.stamp(self.next_serial);

        let Some(state) = self.conns.get_mut(&peer) else {
            op.resolve(Err(SimNetError::Eof));
            return;
        };
        loop {
            let Some(reader) = state.next_reader(&mut self.counters.abandoned) else {
                trace!(
                    conn = %peer,
                    serial = op.msg.serial(),
                    len = op.msg.len(),
                    deadline = ?op.header.deadline,
                    "send queued"
                );
                state.inbox.push_back(op);
                return;
            };
            if !op.acknowledge() {
                self.counters.abandoned += 1;
                state.readers.push_front(reader);
                return;
            }
            let msg = std::mem::take(&mut op.msg);
            let serial = msg.serial();
            match reader.deliver(msg) {
                Ok(()) => {
                    self.counters.matched += 1;
                    trace!(conn = %peer, serial, "send matched waiting read");
                    return;
                }
                Err(msg) => {
                    self.counters.abandoned += 1;
                    op.msg = msg;
                }
            }
        }
    }

    fn admit_read(&self, op: &ReadMop) -> SimNetResult<()> {
        let conn = self.conns.get(&op.conn).ok_or_else(|| {
            warn!(conn = %op.conn, "read on unknown connection");
            SimNetError::ClosedConnection
        })?;
        self.check_path(op.header.origin, op.header.target)?;
        if conn.closed {
            return Err(SimNetError::Eof);
        }
        Ok(())
    }

    fn handle_read(&mut self, op: ReadMop) {
        if let Err(err) = self.admit_read(&op) {
            trace!(conn = %op.conn, %err, "read rejected");
            op.fail(err);
            return;
        }
        let Some(state) = self.conns.get_mut(&op.conn) else {
            op.fail(SimNetError::ClosedConnection);
            return;
        };

        while let Some(mut send) = state.next_send(&mut self.counters.abandoned) {
            if !send.acknowledge() {
                self.counters.abandoned += 1;
                continue;
            }
            let msg = std::mem::take(&mut send.msg);
            let serial = msg.serial();
            match op.deliver(msg) {
                Ok(()) => {
                    self.counters.matched += 1;
                    trace!(
                        conn = %send.conn,
                        serial,
                        waited = ?send.header.created.elapsed(),
                        "read matched queued send"
                    );
                }
                Err(msg) => {
                    // Reader vanished; keep the data for the next one.
                    self.counters.abandoned += 1;
                    send.msg = msg;
                    state.inbox.push_front(send);
                }
            }
            return;
        }

        if state.peer_eof {
            let _ = op.deliver(Message::eof());
            return;
        }
        state.readers.push_back(op);
    }

    /// Mark one side closed, fail what can no longer complete and let the
    /// peer observe end-of-stream once its queued data is drained.
    fn close_side(&mut self, id: ConnId) {
        let Some(state) = self.conns.get_mut(&id) else {
            return;
        };
        if state.closed {
            return;
        }
        state.closed = true;
        state.fail_all(&SimNetError::Eof);
        let peer = state.peer;
        debug!(conn = %id, "side closed");

        let peer_closed = match self.conns.get_mut(&peer) {
            Some(peer_state) => {
                peer_state.peer_eof = true;
                // Readers only wait when the inbox is empty, so nothing is
                // left to deliver ahead of the EOF.
                for reader in peer_state.readers.drain(..) {
                    let _ = reader.deliver(Message::eof());
                }
                peer_state.closed
            }
            None => true,
        };
        if peer_closed {
            self.remove_pair(id, peer);
        }
    }

    fn remove_pair(&mut self, a: ConnId, b: ConnId) {
        for id in [a, b] {
            if let Some(state) = self.conns.remove(&id) {
                if let Some(node) = self.nodes.get_mut(state.local) {
                    node.conns.remove(&id);
                }
            }
        }
        trace!(a = %a, b = %b, "connection torn down");
    }

    fn arm_timer(&mut self, op: TimerMop) {
        let node = op.header.origin;
        if !self.nodes.get(node).is_some_and(SimNode::is_live) {
            // Dropping the fire channel wakes the waiter, which reports shutdown.
            trace!(timer = %op.id, %node, "timer on dead node dropped");
            return;
        }
        trace!(timer = %op.id, %node, "timer armed");
        self.timers.arm(op.id, node, op.fire_at, op.fire);
    }

    fn fire_due_timers(&mut self, now: Instant) {
        for (id, timer) in self.timers.pop_due(now) {
            timer.fire.send_replace(Some(now));
            self.counters.timers_fired += 1;
            trace!(timer = %id, node = %timer.node, "timer fired");
        }
    }

    fn alter(&mut self, target: AlterTarget, alteration: Alteration) -> SimNetResult<NodeInfo> {
        let id = match target {
            AlterTarget::Host(addr) => self
                .nodes
                .resolve(&addr)
                .ok_or(SimNetError::UnknownHost(addr))?,
            AlterTarget::Node(id) => id,
        };
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| SimNetError::UnknownHost(id.to_string()))?;
        let step = faults::transition(node.state, alteration);
        let (name, role) = (node.name.clone(), node.role);
        debug!(node = %id, name = %name, %alteration, ?step, "altering node");

        match step {
            Transition::Unchanged => {}
            Transition::Isolate => node.state = NodeState::Partitioned,
            Transition::Rejoin => node.state = NodeState::Active,
            Transition::Kill => self.shutdown_node(id),
            Transition::Reincarnate => {
                self.shutdown_node(id);
                if self.nodes.is_current(id) {
                    let fresh = self.nodes.register(&name, role, &self.halt);
                    debug!(old = %id, new = %fresh, name = %name, "node restarted");
                    return self.info(fresh);
                }
                // Stale identity: whatever is current at the address wins.
                let current = self.nodes.resolve(&name).unwrap_or(id);
                return self.info(current);
            }
        }
        self.info(id)
    }

    fn info(&self, id: NodeId) -> SimNetResult<NodeInfo> {
        self.nodes
            .get(id)
            .map(SimNode::info)
            .ok_or_else(|| SimNetError::UnknownHost(id.to_string()))
    }

    /// Kill one identity: fail everything it originated or is targeted by.
    fn shutdown_node(&mut self, id: NodeId) {
        let Some(node) = self.nodes.get_mut(id) else {
            return;
        };
        if !node.is_live() {
            return;
        }
        node.state = NodeState::Shutdown;
        node.halt.cancel();
        node.accept_tx = None;
        let unclaimed = node.accept_rx.take();
        let anchored: Vec<ConnId> = node.conns.iter().copied().collect();

        let err = SimNetError::Shutdown;
        let mut failed = 0;
        for conn in anchored {
            let peer = self.conns.get(&conn).map(|state| state.peer);
            for side in std::iter::once(conn).chain(peer) {
                if let Some(state) = self.conns.get_mut(&side) {
                    failed += state.fail_all(&err);
                }
            }
        }
        failed += self.timers.drop_node(id) as u64;
        self.counters.failed_by_alteration += failed;
        // Connections nobody accepted close themselves as they drop.
        drop(unclaimed);
        debug!(node = %id, failed, "node shut down");
    }

    fn metrics(&mut self) -> SimNetMetrics {
        for state in self.conns.values_mut() {
            self.counters.abandoned += state.prune();
        }
        SimNetMetrics {
            nodes: self.nodes.iter().map(SimNode::info).collect(),
            connections: self.conns.len(),
            queued_sends: self.conns.values().map(|state| state.inbox.len()).sum(),
            queued_reads: self.conns.values().map(|state| state.readers.len()).sum(),
            armed_timers: self.timers.len(),
            matched: self.counters.matched,
            timers_fired: self.counters.timers_fired,
            failed_by_alteration: self.counters.failed_by_alteration,
            abandoned: self.counters.abandoned,
        }
    }

    /// Resolve everything still pending once the simulation halts.
    fn teardown(&mut self) {
        let err = SimNetError::Shutdown;
        let failed: u64 = self
            .conns
            .values_mut()
            .map(|state| state.fail_all(&err))
            .sum();
        self.conns.clear();
        self.timers.clear();
        for node in self.nodes.iter_mut() {
            node.accept_tx = None;
        }
        self.requests.close();
        let mut dropped = 0;
        while self.requests.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!(dropped, "requests discarded at shutdown");
        }
        debug!(failed, "dispatcher stopped");
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
