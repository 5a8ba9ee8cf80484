//! AMQP transport implementation using `lapin`.
//!
//! Maps the domain `Transport` / `Connection` / `Channel` traits onto lapin
//! connections and channels.
//!
//! ## Concurrency model
//!
//! lapin connections and channels are internally synchronized handles, so
//! every domain call goes straight to lapin. Each `basic_consume` spawns one
//! forwarding task that drains the lapin consumer stream into the domain
//! inbox and ends when the stream ends or the inbox is dropped.
//!
//! ## Connection behavior
//!
//! The connection is established eagerly in `connect()`, bounded by the
//! handshake timeout when one is given. Broker- or network-initiated
//! failures are reported by lapin through `Connection::on_error`, which
//! resolves `closing()`; the layers above treat that as connection loss.
//!
//! ## Scope and limitations
//!
//! - Publisher confirms are not enabled; `basic_publish` completes once
//!   lapin has accepted the frame.
//! - Only string-valued headers are carried through `MessageProperties`.
//! - `verify_ssl = false` is not honored; TLS uses lapin's default
//!   connector. The mismatch is logged at connect time.

use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicCancelOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
        QueueDeleteOptions,
    },
    protocol::{AMQPError, AMQPErrorKind},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties,
    ConnectionProperties,
};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    BackendError,
    BrokerUrl,
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
    QueueSpec,
    Result,
    Transport,
    TransportPtr,
};

/// Broker soft errors (NOT_FOUND, PRECONDITION_FAILED, ACCESS_REFUSED, ...)
/// reject the request itself and are final. I/O failures, hard errors and
/// invalid connection or channel state are transient.
fn map_err(what: &str, err: lapin::Error) -> BackendError {
    // ---
    let message = format!("amqp: {what} failed: {err}");
    match err.kind() {
        lapin::ErrorKind::ProtocolError(amqp) if is_soft(amqp) => BackendError::Transport(message),
        _ => BackendError::TransportRetryable(message),
    }
}

fn is_soft(err: &AMQPError) -> bool {
    matches!(err.kind(), AMQPErrorKind::Soft(_))
}

async fn with_timeout<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    // ---
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| BackendError::Timeout)?,
        None => fut.await,
    }
}

/// lapin-backed transport.
struct LapinTransport {
    verify_ssl: bool,
}

#[async_trait::async_trait]
impl Transport for LapinTransport {
    // ---
    fn name(&self) -> &str {
        "lapin"
    }

    async fn connect(&self, url: &BrokerUrl, timeout: Option<Duration>) -> Result<ConnectionPtr> {
        // ---
        if !self.verify_ssl && url.scheme() == "amqps" {
            log_warn!("amqp: verify_ssl=false is not supported, certificates are verified");
        }
        log_info!("Connecting to AMQP broker: {url:?}");

        let connect = async {
            lapin::Connection::connect(url.as_str(), ConnectionProperties::default())
                .await
                .map_err(|e| map_err("connect", e))
        };
        let connection = with_timeout(timeout, connect).await.map_err(|e| {
            log_error!("{e}");
            e
        })?;

        let closing = CancellationToken::new();
        {
            let closing = closing.clone();
            connection.on_error(move |err| {
                log_warn!("amqp: connection error: {err}");
                closing.cancel();
            });
        }

        log_info!("Connected to AMQP broker");
        Ok(Arc::new(LapinConnection {
            connection,
            closing,
        }))
    }
}

struct LapinConnection {
    connection: lapin::Connection,
    closing: CancellationToken,
}

#[async_trait::async_trait]
impl Connection for LapinConnection {
    // ---
    fn is_closed(&self) -> bool {
        self.closing.is_cancelled() || !self.connection.status().connected()
    }

    async fn channel(&self) -> Result<ChannelPtr> {
        // ---
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| map_err("channel creation", e))?;
        Ok(Arc::new(LapinChannel { channel }))
    }

    async fn closing(&self) {
        self.closing.cancelled().await
    }

    async fn close(&self) -> Result<()> {
        // ---
        self.closing.cancel();
        if self.connection.status().connected() {
            self.connection
                .close(200, "Normal shutdown".into())
                .await
                .map_err(|e| map_err("connection close", e))?;
        }
        Ok(())
    }
}

struct LapinChannel {
    channel: lapin::Channel,
}

fn to_lapin_properties(props: MessageProperties) -> BasicProperties {
    // ---
    let mut out = BasicProperties::default();
    if let Some(mode) = props.delivery_mode {
        out = out.with_delivery_mode(mode);
    }
    if let Some(id) = props.message_id {
        out = out.with_message_id(id.into());
    }
    if let Some(id) = props.correlation_id {
        out = out.with_correlation_id(id.into());
    }
    if let Some(ts) = props.timestamp {
        out = out.with_timestamp(ts);
    }
    if let Some(exp) = props.expiration {
        out = out.with_expiration(exp.into());
    }
    if let Some(priority) = props.priority {
        out = out.with_priority(priority);
    }
    if let Some(reply_to) = props.reply_to {
        out = out.with_reply_to(reply_to.into());
    }
    if !props.headers.is_empty() {
        let mut headers = FieldTable::default();
        for (k, v) in props.headers {
            headers.insert(k.into(), AMQPValue::LongString(LongString::from(v)));
        }
        out = out.with_headers(headers);
    }
    out
}

fn from_lapin_properties(props: &BasicProperties) -> MessageProperties {
    // ---
    let short = |v: &Option<ShortString>| v.as_ref().map(|s| s.as_str().to_string());

    let mut headers = std::collections::BTreeMap::new();
    if let Some(table) = props.headers() {
        for (k, v) in table.inner() {
            let value = match v {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(k.as_str().to_string(), value);
        }
    }

    MessageProperties {
        delivery_mode: *props.delivery_mode(),
        message_id: short(props.message_id()),
        correlation_id: short(props.correlation_id()),
        timestamp: *props.timestamp(),
        expiration: short(props.expiration()),
        priority: *props.priority(),
        reply_to: short(props.reply_to()),
        headers,
    }
}

fn queue_arguments(spec: &QueueSpec) -> FieldTable {
    // ---
    let mut args = FieldTable::default();
    if let Some(queue_type) = spec.arguments.queue_type {
        args.insert(
            "x-queue-type".into(),
            AMQPValue::LongString(LongString::from(queue_type.as_str())),
        );
    }
    if let Some(max) = spec.arguments.max_priority {
        args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
    }
    if let Some(expires) = spec.arguments.expires {
        let ms = u32::try_from(expires.as_millis()).unwrap_or(u32::MAX);
        args.insert("x-expires".into(), AMQPValue::LongUInt(ms));
    }
    args
}

#[async_trait::async_trait]
impl Channel for LapinChannel {
    // ---
    fn channel_id(&self) -> u64 {
        u64::from(self.channel.id())
    }

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }

    async fn exchange_declare(&self, spec: &ExchangeSpec) -> Result<()> {
        // ---
        let kind = match spec.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..ExchangeDeclareOptions::default()
        };
        self.channel
            .exchange_declare(spec.name.as_str().into(), kind, options, FieldTable::default())
            .await
            .map_err(|e| map_err("exchange declare", e))
    }

    async fn queue_declare(&self, spec: &QueueSpec) -> Result<()> {
        // ---
        let options = QueueDeclareOptions {
            passive: false,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };
        self.channel
            .queue_declare(spec.name.as_str().into(), options, queue_arguments(spec))
            .await
            .map_err(|e| map_err("queue declare", e))?;

        log_debug!("amqp: declared queue {}", spec.name);
        Ok(())
    }

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        // ---
        self.channel
            .queue_bind(
                queue.into(),
                exchange.into(),
                routing_key.into(),
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_err("queue bind", e))
    }

    async fn queue_delete(&self, queue: &str) -> Result<()> {
        // ---
        self.channel
            .queue_delete(queue.into(), QueueDeleteOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| map_err("queue delete", e))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<()> {
        // ---
        self.channel
            .basic_qos(prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| map_err("basic qos", e))
    }

    async fn basic_publish(&self, publish: Publish) -> Result<()> {
        // ---
        self.channel
            .basic_publish(
                publish.exchange.as_str().into(),
                publish.routing_key.as_str().into(),
                BasicPublishOptions::default(),
                &publish.body,
                to_lapin_properties(publish.properties),
            )
            .await
            .map(|_| ())
            .map_err(|e| map_err("publish", e))
    }

    async fn basic_consume(&self, queue: &str, options: ConsumeOptions) -> Result<ConsumerHandle> {
        // ---
        let consume_options = BasicConsumeOptions {
            no_ack: options.no_ack,
            ..BasicConsumeOptions::default()
        };
        let consumer = self
            .channel
            .basic_consume(
                queue.into(),
                options.consumer_tag.unwrap_or_default().as_str().into(),
                consume_options,
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_err("consume", e))?;

        let consumer_tag = consumer.tag().as_str().to_string();
        let (tx, inbox) = mpsc::unbounded_channel();

        let queue = queue.to_string();
        tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        let delivery = Delivery {
                            delivery_tag: delivery.delivery_tag,
                            exchange: delivery.exchange.as_str().to_string(),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            redelivered: delivery.redelivered,
                            properties: from_lapin_properties(&delivery.properties),
                            body: delivery.data.into(),
                        };
                        if tx.send(delivery).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("amqp: consumer error on {queue}: {e}");
                        break;
                    }
                }
            }
            log_debug!("amqp: consumer task ended for queue {queue}");
        });

        Ok(ConsumerHandle {
            consumer_tag,
            inbox,
        })
    }

    async fn basic_ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| map_err("ack", e))
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> Result<()> {
        // ---
        self.channel
            .basic_cancel(consumer_tag.into(), BasicCancelOptions::default())
            .await
            .map_err(|e| map_err("cancel", e))
    }

    async fn close(&self) -> Result<()> {
        // ---
        if !self.channel.status().connected() {
            return Ok(());
        }
        self.channel
            .close(200, "Normal shutdown".into())
            .await
            .map_err(|e| map_err("channel close", e))
    }
}

/// Creates a lapin-based AMQP transport.
///
/// No connection is made until `connect()` is called.
pub fn create_transport(verify_ssl: bool) -> TransportPtr {
    Arc::new(LapinTransport { verify_ssl })
}
