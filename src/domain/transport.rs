// src/domain/transport.rs

//! Transport domain abstractions.
//!
//! This module defines the broker interface used by the connection and
//! backend layers: a [`Transport`] opens [`Connection`]s, a connection opens
//! multiplexed [`Channel`]s, and a channel carries the AMQP-style verbs
//! (declare, bind, publish, consume, ack, cancel).
//!
//! Nothing here refers to a concrete client library. Per-call timeouts,
//! retries and reconnection are handled by the layers above; a transport
//! only reports failures, classifying transient ones as
//! [`BackendError::TransportRetryable`](crate::BackendError::TransportRetryable).
//!
//! Concrete implementations of this interface live under `src/transport/`.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{BrokerUrl, QueueType, Result};

/// Name of the broker's direct reply-to pseudo queue.
pub const DIRECT_REPLY_TO: &str = "amq.rabbitmq.reply-to";

/// Exchange routing behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Optional `x-*` queue arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-queue-type`
    pub queue_type: Option<QueueType>,
    /// `x-max-priority`
    pub max_priority: Option<u8>,
    /// `x-expires`: queue removed after being unused this long.
    pub expires: Option<Duration>,
}

/// Queue declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    // ---
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub arguments: QueueArguments,
}

impl QueueSpec {
    /// Non-durable, non-exclusive queue without arguments.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: false,
            auto_delete: false,
            exclusive: false,
            arguments: QueueArguments::default(),
        }
    }
}

/// Basic message properties.
///
/// Only the properties the backend reads or writes are modelled.
/// `expiration` keeps the AMQP wire form (milliseconds as a string).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    // ---
    /// 2 = persistent
    pub delivery_mode: Option<u8>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: Option<u64>,
    pub expiration: Option<String>,
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn with_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.expiration = ttl.map(|d| d.as_millis().to_string());
        self
    }

    /// Message TTL decoded from `expiration`.
    pub fn ttl(&self) -> Option<Duration> {
        self.expiration
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
    }
}

/// Outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub exchange: String,
    pub routing_key: String,
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// Inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    // ---
    /// Channel-scoped tag passed back to [`Channel::basic_ack`].
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Bytes,
    pub properties: MessageProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Broker considers deliveries acknowledged on send.
    pub no_ack: bool,
    /// Broker generates a tag when `None`.
    pub consumer_tag: Option<String>,
}

/// Handle returned from a successful `basic_consume`.
///
/// The inbox closes when the consumer is cancelled, its channel closes, or
/// its queue is deleted.
pub struct ConsumerHandle {
    // ---
    pub consumer_tag: String,

    /// Deliveries for this consumer, in broker order.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// Broker connection factory.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show explicit
/// lifetimes and a boxed `Future`. Consumers should treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    // ---
    /// Short name for logs ("memory", "lapin").
    fn name(&self) -> &str;

    /// Open one physical connection to `url`.
    ///
    /// `timeout` bounds the handshake. Refused or timed out connects are
    /// reported as retryable.
    async fn connect(&self, url: &BrokerUrl, timeout: Option<Duration>) -> Result<ConnectionPtr>;
}

/// One physical broker connection.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    // ---
    fn is_closed(&self) -> bool;

    /// Open a new multiplexed channel.
    async fn channel(&self) -> Result<ChannelPtr>;

    /// Resolves once the connection is closing, voluntarily or not.
    async fn closing(&self);

    async fn close(&self) -> Result<()>;
}

/// A multiplexed channel on a [`Connection`].
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    // ---
    fn channel_id(&self) -> u64;

    fn is_closed(&self) -> bool;

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()>;

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<()>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    async fn queue_delete(&self, queue: &str) -> Result<()>;

    /// Limit unacknowledged deliveries on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<()>;

    async fn basic_publish(&self, publish: Publish) -> Result<()>;

    async fn basic_consume(&self, queue: &str, options: ConsumeOptions) -> Result<ConsumerHandle>;

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()>;

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Shared transport pointer.
///
/// This is an `Arc<dyn Transport>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Used to erase concrete transport types behind a stable domain interface.
pub type TransportPtr = Arc<dyn Transport>;

pub type ConnectionPtr = Arc<dyn Connection>;

pub type ChannelPtr = Arc<dyn Channel>;

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_expiration_wire_form() {
        // ---
        let props = MessageProperties::default().with_ttl(Some(Duration::from_secs(2)));
        assert_eq!(props.expiration.as_deref(), Some("2000"));
        assert_eq!(props.ttl(), Some(Duration::from_secs(2)));

        let props = MessageProperties::default().with_ttl(None);
        assert_eq!(props.ttl(), None);
    }
}
