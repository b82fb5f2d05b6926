//! # simnet
//!
//! A deterministic, in-process network simulator for testing distributed
//! code without sockets.
//!
//! Servers listen at plain string addresses, clients dial them, and the
//! resulting connections behave like stream sockets: partial reads, capped
//! writes, deadlines and end-of-stream. Instead of a kernel, a single
//! dispatcher task owns every queue and matches writes to reads in the order
//! they were submitted, so a run is reproducible given the same sequence of
//! calls.
//!
//! ## Core Components
//!
//! - [`SimNetwork`]: the network; spawns the dispatcher and injects faults
//! - [`SimServer`] / [`SimListener`]: listening and accepting
//! - [`SimClient`]: dialing
//! - [`SimConn`]: one side of a connection, also usable through
//!   `tokio::io::AsyncRead` / `AsyncWrite`
//! - [`Timer`]: one-shot timers on the virtual clock
//!
//! ## Time
//!
//! Deadlines and timers use tokio's clock. Run tests with
//! `#[tokio::test(start_paused = true)]` and the runtime advances straight to
//! the next timer whenever every task is idle, so a one-second timeout costs
//! no wall-clock time.
//!
//! ## Fault Injection
//!
//! | Fault | Call | Effect |
//! |-------|------|--------|
//! | SHUTDOWN | [`SimNetwork::alter_host`] | node's queued ops fail with `Shutdown`; terminal for that identity |
//! | PARTITION | [`SimNetwork::alter_host`] | node unreachable from everyone; queued ops kept |
//! | UNPARTITION | [`SimNetwork::alter_host`] | lifts a node partition |
//! | RESTART | [`SimNetwork::alter_host`] | SHUTDOWN, then a fresh identity at the same address |
//! | Link cut | [`SimNetwork::partition_pair`] | two addresses cannot reach each other |
//!
//! ## Quick Start
//!
//! ```rust
//! use simnet::{Listener, SimNetwork};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> simnet::SimNetResult<()> {
//! let net = SimNetwork::new();
//! let listener = net.new_server("srv").listen().await?;
//!
//! let conn = net.new_client("cli").dial("srv").await?;
//! let server_side = listener.accept().await?;
//!
//! // A write completes only once a read consumes it.
//! let (written, msg) = tokio::join!(conn.write_all(b"hello"), server_side.read_message());
//! written?;
//! assert_eq!(msg?.payload(), b"hello");
//!
//! conn.close()?;
//! assert!(server_side.read_message().await.is_err());
//!
//! net.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod config;
pub mod error;
mod message;
pub mod network;
mod sim;
mod timer;
mod types;

// Configuration
pub use config::{SimNetConfig, DEFAULT_NETWORK_NAME, MAX_MESSAGE, USER_MAX_PAYLOAD};

// Errors
pub use error::{SimNetError, SimNetResult};

// Network
pub use network::{Listener, SimClient, SimConn, SimListener, SimServer};
pub use sim::SimNetwork;

// Values
pub use message::Message;
pub use timer::Timer;
pub use types::{
    Alteration, ConnId, NodeId, NodeInfo, NodeState, Role, SimAddr, SimNetMetrics, TimerId,
};
