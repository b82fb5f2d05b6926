//! Connection-level handles: servers, listeners, clients and connections.

mod client;
mod conn;
mod listener;
mod traits;

pub use client::SimClient;
pub use conn::SimConn;
pub use listener::{SimListener, SimServer};
pub use traits::Listener;

pub(crate) use conn::ConnEnds;
