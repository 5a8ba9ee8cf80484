//! Transport implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Transport` trait. Broker client libraries are hidden behind feature
//! flags and exposed only through constructor functions.
//!
//! Domain code must not depend on transport-specific types.

mod amqp;
mod memory;

#[cfg(feature = "transport_lapin")]
pub use amqp::create_lapin_transport;

pub use memory::{
    //
    create_transport as create_memory_transport,
    create_transport_with_broker as create_memory_transport_with_broker,
    BrokerStats,
    MemoryBroker,
};
