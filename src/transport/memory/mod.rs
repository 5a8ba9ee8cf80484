// src/transport/memory/mod.rs

//! In-memory transport implementation.
//!
//! This module provides a pure in-process broker and an implementation of
//! the domain-level `Transport` trait over it. It is intended primarily for
//! testing, local execution, and as a reference for transport semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory transport defines the **reference behavior** for the
//! transport layer. Other transports are expected to approximate it as
//! closely as their brokers allow and to document any deviations.
//!
//! - Once `basic_consume()` returns, ready messages on the queue are deliverable.
//! - Message delivery is deterministic within a single process.
//! - Connection loss can be injected (`disconnect_all`, `refuse_connections`).

mod broker;
mod transport;

pub use broker::{BrokerStats, MemoryBroker};
pub use transport::{create_transport, create_transport_with_broker};
