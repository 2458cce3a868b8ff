//! Serving with live rebinding.
//!
//! [`BoundServer`] owns the current `{address, listener, registry}` and moves
//! all three when `server.addr` changes. [`ListenAddr`] normalizes configured
//! addresses and derives what gets advertised.

mod addr;
mod bound;
mod listener;
mod registrar;

pub use addr::ListenAddr;
pub use bound::{BoundServer, Phase, RebindOutcome, ServerOptions};
pub use registrar::{NoServices, Registrar};
