//! Server-side object graph and link data-plane for a multimedia pipeline
//! daemon.
//!
//! This crate is the "core" of such a daemon: the typed-object registry
//! that publishes nodes, ports and links as [`global::Global`]s; the
//! per-client [`resource::Resource`] binding protocol; and the [`link::Link`]
//! state machine that negotiates a format between an output port and an
//! input port and relays buffers between them once active.
//!
//! Everything that mediates the wire protocol, loads node plugins, or
//! drives the actual poll/eventfd main loop lives outside this crate; see
//! [`core::LoopHandle`] for the boundary this crate expects a host to
//! supply.

pub mod access;
pub mod buffer;
pub mod client;
pub mod core;
pub mod error;
pub mod format;
pub mod global;
pub mod ids;
pub mod link;
pub mod negotiate;
pub mod node;
pub mod port;
pub mod resource;
pub mod signal;

pub use crate::core::{Core, Interest, LoopHandle, NullLoopHandle};
pub use error::{Error, Result};
