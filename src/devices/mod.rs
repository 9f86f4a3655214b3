//! Device logic.
//!
//! Per-device field semantics are left to dedicated implementations; the
//! [`Mirror`] stands in for every address and copies decoded messages into
//! its state as-is.

pub mod mirror;

pub use mirror::{Mirror, MirrorCall};

use crate::gateway::ModuleParts;
use crate::module::{Module, ModuleRuntime};
use crate::schema::Message;

/// Default module factory: a [`Mirror`] for every address.
pub fn create_module(address: u8, first: &Message, parts: ModuleParts) -> Option<Box<dyn Module>> {
    tracing::info!(
        address = %format!("0x{:02x}", address),
        message = first.name(),
        "creating mirror module"
    );
    let ModuleParts {
        registry,
        timer,
        outbound,
    } = parts;
    Some(Box::new(ModuleRuntime::new(
        Mirror::default(),
        address,
        registry,
        timer,
        outbound,
    )))
}
