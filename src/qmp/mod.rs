//! QMP machine-protocol client.
//!
//! Implements the JSON-based command/response/event protocol used to control
//! the hypervisor process:
//!
//! ```text
//! hypervisor stdout ──► transport::read_loop ──► QmpClient::feed
//!                                                   │ greeting  ──► qmp_capabilities ──► connected
//!                                                   │ return/error ──► FIFO pending queue
//!                                                   │ event     ──► broadcast subscribers
//! QmpClient::execute ──► writer channel ──► transport::write_loop ──► hypervisor stdin
//! ```
//!
//! The grammar is transport-agnostic; this crate carries it over subprocess
//! stdio.

pub mod client;
pub mod messages;
pub mod transport;

pub use client::QmpClient;
pub use messages::{ClientError, EventTimestamp, QmpError, QmpEvent};
