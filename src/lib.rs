//! Reliable task, message and event delivery over AMQP-style brokers
//!
//! This library provides the broker backend of a distributed task system:
//! publishing tasks to named queues, consuming them with bounded
//! concurrency, routing results back to the caller (plain or streamed),
//! and raw message and event fan-out. Physical connections are shared
//! between backends and survive broker restarts and failover.
//!

// Import all sub modules once...
mod backend;
mod backend_builder;
mod broker_url;
mod config;
mod connection;
mod domain;
mod macros;
mod retry;
mod serializer;
mod transport;

mod error;
mod ids;
pub mod models;

use std::sync::{Mutex, MutexGuard};

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use backend::{Backend, EventHandler, MessageHandler, ResultStream, TaskHandler};
pub use backend_builder::BackendBuilder;

pub use config::{BackendConfig, QueueType, ResultQueueMode};
pub use retry::{BackoffConfig, ErrorFilter, RetryDelays, RetryPolicy};

pub use broker_url::BrokerUrl;
pub use connection::{CallbackFn, CallbackKind, ConnectionRegistry, SharedConnection};

pub use error::{BackendError, Result};
pub use ids::TaskId;
pub use models::{Event, Message, TaskData, TaskError, TaskErrorKind, TaskInstance, TaskResult};
pub use serializer::{JsonSerializer, Serializer, SerializerPtr};

pub use transport::{
    //
    create_memory_transport,
    create_memory_transport_with_broker,
    BrokerStats,
    MemoryBroker,
};

#[cfg(feature = "transport_lapin")]
pub use transport::create_lapin_transport;

// --- public re-exports
pub use domain::{
    //
    Channel,
    ChannelPtr,
    Connection,
    ConnectionPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    ExchangeKind,
    ExchangeSpec,
    MessageProperties,
    Publish,
    QueueArguments,
    QueueSpec,
    Transport,
    TransportPtr,
    DIRECT_REPLY_TO,
};

/// Transport selected by the enabled features.
///
/// With `transport_lapin` this is a real AMQP client; otherwise the
/// process-wide in-memory broker.
pub fn create_transport(config: &BackendConfig) -> TransportPtr {
    // ---
    #[cfg(feature = "transport_lapin")]
    {
        create_lapin_transport(config.verify_ssl)
    }

    // Fallback / default
    #[cfg(not(feature = "transport_lapin"))]
    {
        let _ = config;
        create_memory_transport()
    }
}

/// Acquire mutex guard, ignoring poisoning
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
