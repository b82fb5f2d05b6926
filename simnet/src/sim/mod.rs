//! Simulation engine: the dispatcher and the state it owns.

mod dispatcher;
mod faults;
mod node;
pub(crate) mod ops;
mod timers;
mod world;

pub use world::SimNetwork;

pub(crate) use world::{lock, SimHandle};
