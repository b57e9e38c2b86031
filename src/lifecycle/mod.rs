//! Install/activate lifecycle of a cache generation and the outbox drain triggers.
//!
//! A generation moves `installing -> installed -> activating -> active` and
//! becomes `redundant` once a newer generation activates. Activation deletes
//! every cache region that doesn't belong to the current generation.

mod controller;
mod state;

pub use controller::{Controller, ControllerOptions};
pub use state::GenerationRegistry;
