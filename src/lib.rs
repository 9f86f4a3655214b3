//! # Velbus Gateway
//!
//! Core of a gateway for the Velbus home-automation bus: raw bus frames are
//! decoded into typed, bit-packed messages and handed to a per-address module
//! runtime that keeps observable state and fires time-based actions.
//!
//! ## Features
//!
//! - **Declarative bitfield codec**: schemas built from typed fields (UInt,
//!   Enum, Bitmap, Bool, Temperature) packed MSB-first
//! - **Variant resolution**: one command byte may carry several layouts, told
//!   apart by data length in a validated registry
//! - **Module runtimes**: one actor per bus address with a delayed-call
//!   scheduler driving a single timer
//! - **State sync**: every state change is published as JSON patch operations
//!
//! ## Quick Start
//!
//! ```rust
//! use velbus_gateway::messages::builtin_registry;
//! use velbus_gateway::protocol::Frame;
//!
//! let registry = builtin_registry()?;
//!
//! // 0xED with five data bytes is the VMB6IN status
//! let frame = Frame::new(0x21, 0xed, &[0x05, 0x00, 0x00, 0x00])?;
//! let message = registry.decode(&frame)?;
//! assert_eq!(message.name(), "ModuleStatus6IN");
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - [`bits`], [`field`] - bit cursor and primitive field codecs
//! - [`schema`], [`registry`], [`messages`] - message layouts and the
//!   `(command, length)` decision table
//! - [`patch`] - state tree emitting patch operations
//! - [`scheduler`] - delayed-call queue and timer state machine
//! - [`module`] - per-address runtime and request routes
//! - [`gateway`] - event loop tying frames, timers and requests together
//! - [`devices`] - device logic plugged into runtimes
//! - [`wire`] - JSON-lines protocol of the `velgate` daemon

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::missing_errors_doc)]

pub mod bits;
pub mod config;
pub mod devices;
pub mod field;
pub mod gateway;
pub mod logging;
pub mod messages;
pub mod module;
pub mod patch;
pub mod protocol;
pub mod registry;
pub mod scheduler;
pub mod schema;
pub mod wire;

// Re-export main public types for convenience
pub use field::{Bitmap, CodecError, EnumValue, FieldType, FieldValue};
pub use gateway::{Gateway, GatewayRequest, StatePatch};
pub use module::{Module, ModuleLogic, ModuleRuntime, Reply, Verb};
pub use patch::{PatchOp, StateTree};
pub use protocol::{Frame, OutboundFrame};
pub use registry::{DecodeError, MessageRegistry, RegistryBuilder};
pub use scheduler::{DelayedCall, FireTime, Scheduler};
pub use schema::{Message, MessageSchema, SchemaError};
