//! Event-driven burn orchestration.
//!
//! Split into the event vocabulary every producer thread speaks
//! ([`events`]) and the state machine plus live engine that consume it
//! ([`machine`]).

pub(crate) mod events;
mod machine;

pub use machine::{factory, BurnEngine};
