//! Trait seam for code that accepts connections.
//!
//! Production code written against [`Listener`] can be driven by the
//! simulated network in tests and by a real socket listener elsewhere.

use async_trait::async_trait;

use crate::error::SimNetResult;
use crate::types::SimAddr;

/// A bound endpoint that hands out inbound connections.
#[async_trait]
pub trait Listener {
    /// Connection type produced by [`accept`](Self::accept).
    type Conn;

    /// Wait for the next inbound connection.
    async fn accept(&self) -> SimNetResult<Self::Conn>;

    /// Address this listener is bound to.
    fn addr(&self) -> SimAddr;

    /// Stop listening. Idempotent.
    async fn close(&self) -> SimNetResult<()>;
}
