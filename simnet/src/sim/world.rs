//! The simulated network handle and its boot/shutdown lifecycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::SimNetConfig;
use crate::error::{SimNetError, SimNetResult};
use crate::network::{SimClient, SimServer};
use crate::timer::Timer;
use crate::types::{Alteration, NodeId, NodeInfo, SimNetMetrics, TimerId};

use super::dispatcher::Dispatcher;
use super::ops::{
    AlterTarget, ClientRegistered, ClientRegistration, Mop, MopHeader, Request, ServerRegistered,
    TimerMop,
};

/// Far enough in the future to never fire within a simulation run.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Lock a std mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `now + duration` on the virtual clock, saturating far in the future.
pub(crate) fn deadline_after(duration: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(duration)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Crate-internal submission side of the dispatcher.
///
/// Cheap to clone; every connection, listener and timer holds one.
#[derive(Debug, Clone)]
pub(crate) struct SimHandle {
    requests: mpsc::UnboundedSender<Request>,
    halt: CancellationToken,
    config: Arc<SimNetConfig>,
    timer_ids: Arc<AtomicU64>,
}

impl SimHandle {
    /// Enqueue a request without waiting for it.
    pub(crate) fn submit(&self, request: Request) -> SimNetResult<()> {
        if self.halt.is_cancelled() {
            return Err(SimNetError::Shutdown);
        }
        self.requests
            .send(request)
            .map_err(|_| SimNetError::Shutdown)
    }

    /// Submit a request and wait for the dispatcher's reply.
    pub(crate) async fn call<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> Request,
    ) -> SimNetResult<T> {
        let (reply, response) = oneshot::channel();
        self.submit(request(reply))?;
        tokio::select! {
            response = response => response.map_err(|_| SimNetError::Shutdown),
            _ = self.halt.cancelled() => Err(SimNetError::Shutdown),
        }
    }

    pub(crate) fn config(&self) -> &SimNetConfig {
        &self.config
    }

    pub(crate) fn halt(&self) -> &CancellationToken {
        &self.halt
    }

    /// Arm a timer owned by `node` that fires at `fire_at`.
    pub(crate) fn arm_timer(
        &self,
        node: NodeId,
        node_halt: &CancellationToken,
        fire_at: Instant,
    ) -> SimNetResult<Timer> {
        let id = TimerId(self.timer_ids.fetch_add(1, Ordering::Relaxed));
        let (fire, fired) = watch::channel(None);
        self.submit(Request::Op(Mop::Timer(TimerMop {
            header: MopHeader::new(node, node, None),
            id,
            fire_at,
            fire,
        })))?;
        Ok(Timer::new(
            id,
            node,
            fire_at,
            fired,
            node_halt.clone(),
            self.clone(),
        ))
    }
}

#[derive(Debug)]
struct Inner {
    handle: SimHandle,
    /// Dispatcher built by `new`, moved onto a task by the first `boot`.
    pending: Mutex<Option<Dispatcher>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// A deterministic in-process network.
///
/// Construction does not need a runtime; the dispatcher task is spawned on
/// the current tokio runtime the first time a server listens, a client dials
/// or a fault is injected. Under a paused runtime
/// (`#[tokio::test(start_paused = true)]`) every deadline and timer runs on
/// virtual time.
///
/// ```rust
/// use simnet::{Listener, SimNetwork};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> simnet::SimNetResult<()> {
/// let net = SimNetwork::new();
/// let listener = net.new_server("srv").listen().await?;
/// let client = net.new_client("cli");
///
/// let conn = client.dial("srv").await?;
/// let accepted = listener.accept().await?;
///
/// let mut buf = [0u8; 4];
/// let (written, read) = tokio::join!(conn.write_all(b"ping"), accepted.read(&mut buf));
/// written?;
/// assert_eq!(&buf[..read?], b"ping");
///
/// net.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SimNetwork {
    inner: Arc<Inner>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl SimNetwork {
    /// A network with the default configuration.
    pub fn new() -> Self {
        Self::build(SimNetConfig::default())
    }

    /// A network with a custom configuration.
    pub fn new_with_config(config: SimNetConfig) -> SimNetResult<Self> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: SimNetConfig) -> Self {
        let (requests, mailbox) = mpsc::unbounded_channel();
        let handle = SimHandle {
            requests,
            halt: CancellationToken::new(),
            config: Arc::new(config),
            timer_ids: Arc::new(AtomicU64::new(0)),
        };
        let dispatcher = Dispatcher::new(handle.clone(), mailbox);
        Self {
            inner: Arc::new(Inner {
                handle,
                pending: Mutex::new(Some(dispatcher)),
                task: Mutex::new(None),
            }),
        }
    }

    /// Spawn the dispatcher if it is not running yet.
    ///
    /// Idempotent. Fails with [`SimNetError::Shutdown`] once the network has
    /// been shut down. Must be called from within a tokio runtime.
    pub fn boot(&self) -> SimNetResult<()> {
        if self.is_shutdown() {
            return Err(SimNetError::Shutdown);
        }
        let pending = lock(&self.inner.pending).take();
        if let Some(dispatcher) = pending {
            let task = tokio::spawn(dispatcher.run());
            *lock(&self.inner.task) = Some(task);
            debug!(network = %self.config().network_name, "dispatcher booted");
        }
        Ok(())
    }

    /// Active configuration.
    pub fn config(&self) -> &SimNetConfig {
        self.inner.handle.config()
    }

    /// Current instant on the simulation clock.
    pub fn now(&self) -> Instant {
        Instant::now()
    }

    /// True once [`shutdown`](Self::shutdown) has been called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.handle.halt().is_cancelled()
    }

    /// Handle for a server that will listen at `name`.
    pub fn new_server(&self, name: impl Into<String>) -> SimServer {
        SimServer::new(self.clone(), name.into())
    }

    /// Handle for a client that will dial from `name`.
    pub fn new_client(&self, name: impl Into<String>) -> SimClient {
        SimClient::new(self.clone(), name.into())
    }

    /// Apply a fault to whatever identity `addr` currently resolves to.
    ///
    /// Returns the identity now current at that address: the fresh one after
    /// a RESTART, the altered one otherwise.
    #[instrument(skip(self))]
    pub async fn alter_host(&self, addr: &str, alteration: Alteration) -> SimNetResult<NodeInfo> {
        let target = AlterTarget::Host(addr.to_string());
        self.call(|reply| Request::Alter {
            target,
            alteration,
            reply,
        })
        .await?
    }

    /// Apply a fault to one specific identity, which may be stale.
    #[instrument(skip(self))]
    pub async fn alter_node(&self, node: NodeId, alteration: Alteration) -> SimNetResult<NodeInfo> {
        self.call(|reply| Request::Alter {
            target: AlterTarget::Node(node),
            alteration,
            reply,
        })
        .await?
    }

    /// Sever the link between two addresses in both directions.
    ///
    /// Operations already queued between them are kept; new ones fail with
    /// [`SimNetError::Partitioned`]. The cut survives restarts of either side.
    pub async fn partition_pair(&self, a: &str, b: &str) -> SimNetResult<()> {
        self.sever(a, b, true).await
    }

    /// Undo [`partition_pair`](Self::partition_pair). Idempotent.
    pub async fn heal_partition(&self, a: &str, b: &str) -> SimNetResult<()> {
        self.sever(a, b, false).await
    }

    async fn sever(&self, a: &str, b: &str, severed: bool) -> SimNetResult<()> {
        let (a, b) = (a.to_string(), b.to_string());
        self.call(|reply| Request::Sever {
            a,
            b,
            severed,
            reply,
        })
        .await
    }

    /// Snapshot of nodes, queues and counters.
    pub async fn metrics(&self) -> SimNetResult<SimNetMetrics> {
        self.call(|reply| Request::Metrics { reply }).await
    }

    /// Halt the simulation and wait for the dispatcher to resolve everything
    /// still pending with [`SimNetError::Shutdown`]. Idempotent.
    pub async fn shutdown(&self) {
        self.inner.handle.halt().cancel();
        let never_booted = lock(&self.inner.pending).take();
        drop(never_booted);
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(%err, "dispatcher task failed");
            }
        }
    }

    pub(crate) fn handle(&self) -> &SimHandle {
        &self.inner.handle
    }

    async fn call<T>(&self, request: impl FnOnce(oneshot::Sender<T>) -> Request) -> SimNetResult<T> {
        self.boot()?;
        self.inner.handle.call(request).await
    }

    pub(crate) async fn register_server(&self, name: &str) -> SimNetResult<ServerRegistered> {
        let name = name.to_string();
        self.call(|reply| Request::RegisterServer { name, reply })
            .await?
    }

    pub(crate) async fn register_client(
        &self,
        name: &str,
        server_addr: &str,
        node: Option<NodeId>,
    ) -> SimNetResult<ClientRegistered> {
        let (name, server_addr) = (name.to_string(), server_addr.to_string());
        self.call(|reply| {
            Request::RegisterClient(ClientRegistration {
                name,
                server_addr,
                node,
                reply,
            })
        })
        .await?
    }

    /// Arm a timer owned by `node`, firing `duration` from now.
    pub(crate) fn arm_timer(
        &self,
        node: NodeId,
        node_halt: &CancellationToken,
        duration: Duration,
    ) -> SimNetResult<Timer> {
        self.boot()?;
        self.inner
            .handle
            .arm_timer(node, node_halt, deadline_after(duration))
    }
}
