// src/transport/memory/broker.rs

//! Process-local AMQP-style broker.
//!
//! Holds exchanges, queues, connections, channels and consumers behind one
//! mutex. Every operation is applied synchronously; deliveries are pushed
//! into the consumers' unbounded inboxes while the lock is held, so the
//! observable order is the order of calls.

use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_info,
    BackendError,
    BrokerUrl,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    ExchangeKind,
    ExchangeSpec,
    MessageProperties,
    Publish,
    QueueSpec,
    Result,
    DIRECT_REPLY_TO,
};

/// Counters observed by tests.
#[derive(Debug, Clone, Default)]
pub struct BrokerStats {
    // ---
    pub connect_attempts: usize,
    pub connects: usize,
    /// Host of every successful connect, in order.
    pub connected_hosts: Vec<String>,
    pub exchange_declares: HashMap<String, usize>,
    pub queue_declares: HashMap<String, usize>,
    pub queue_binds: HashMap<String, usize>,
    pub queue_deletes: HashMap<String, usize>,
    pub publishes: usize,
    pub acks: usize,
    pub cancels: usize,
}

impl BrokerStats {
    pub fn declares(&self, queue: &str) -> usize {
        self.queue_declares.get(queue).copied().unwrap_or(0)
    }

    pub fn binds(&self, queue: &str) -> usize {
        self.queue_binds.get(queue).copied().unwrap_or(0)
    }

    pub fn deletes(&self, queue: &str) -> usize {
        self.queue_deletes.get(queue).copied().unwrap_or(0)
    }
}

/// Shared in-memory broker.
///
/// All memory transports created over the same broker see the same
/// topology, exactly as clients of one real broker would.
///
/// # ⚠️  Testing Only - Subject to Change
///
/// The inspection and fault-injection methods exist for `mom-taskq`'s own
/// tests and may change without a deprecation cycle.
///
/// # Example
///
/// ```
/// # use mom_taskq::MemoryBroker;
/// let broker = MemoryBroker::new();
/// broker.refuse_connections(2);
/// assert_eq!(broker.open_connections(), 0);
/// ```
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    next_id: u64,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    connections: HashMap<u64, ConnState>,
    channels: HashMap<u64, ChannelState>,
    consumers: HashMap<String, ConsumerState>,
    refuse: u32,
    down_hosts: HashSet<String>,
    stats: BrokerStats,
}

struct ExchangeState {
    kind: ExchangeKind,
    /// (queue, binding key)
    bindings: Vec<(String, String)>,
}

struct QueueState {
    messages: VecDeque<Queued>,
    consumers: Vec<String>,
    next: usize,
}

struct Queued {
    exchange: String,
    routing_key: String,
    body: Bytes,
    properties: MessageProperties,
    redelivered: bool,
    expires_at: Option<Instant>,
}

struct ConnState {
    closing: CancellationToken,
    channels: HashSet<u64>,
}

struct ChannelState {
    conn_id: u64,
    prefetch: u16,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Queued)>,
    consumers: HashSet<String>,
    direct_reply: Option<String>,
}

struct ConsumerState {
    queue: String,
    channel_id: u64,
    no_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

static GLOBAL_BROKER: OnceLock<Arc<MemoryBroker>> = OnceLock::new();

impl MemoryBroker {
    /// Create a new, empty broker.
    pub fn new() -> Arc<Self> {
        // ---
        Arc::new(Self {
            state: Mutex::new(BrokerState::default()),
        })
    }

    /// Process-global broker used by [`create_memory_transport`](crate::create_memory_transport).
    pub fn global() -> Arc<Self> {
        GLOBAL_BROKER.get_or_init(MemoryBroker::new).clone()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        lock_ignore_poison(&self.state)
    }

    pub fn stats(&self) -> BrokerStats {
        self.lock().stats.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.consumers.len())
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock().queues.contains_key(queue)
    }

    /// Ready (undelivered, unexpired) messages in `queue`.
    pub fn queue_len(&self, queue: &str) -> usize {
        // ---
        let mut state = self.lock();
        match state.queues.get_mut(queue) {
            Some(q) => {
                q.drop_expired(Instant::now());
                q.messages.len()
            }
            None => 0,
        }
    }

    /// Drop every open connection as if the network failed.
    ///
    /// Unacknowledged deliveries go back to their queues, marked redelivered.
    pub fn disconnect_all(&self) {
        // ---
        let mut state = self.lock();
        let ids: Vec<u64> = state.connections.keys().copied().collect();
        log_info!("memory broker: dropping {} connection(s)", ids.len());
        for id in ids {
            state.close_connection(id);
        }
    }

    /// Refuse the next `count` connection attempts.
    pub fn refuse_connections(&self, count: u32) {
        self.lock().refuse = count;
    }

    /// Refuse connections to `host` until brought back up.
    pub fn set_host_down(&self, host: &str, down: bool) {
        // ---
        let mut state = self.lock();
        if down {
            state.down_hosts.insert(host.to_string());
        } else {
            state.down_hosts.remove(host);
        }
    }

    // --- transport-facing operations

    pub(crate) fn connect(&self, url: &BrokerUrl) -> Result<(u64, CancellationToken)> {
        // ---
        let mut state = self.lock();
        state.stats.connect_attempts += 1;

        let host = url.host().to_string();
        if state.refuse > 0 || state.down_hosts.contains(&host) {
            state.refuse = state.refuse.saturating_sub(1);
            return Err(BackendError::TransportRetryable(format!(
                "connection refused: {host}"
            )));
        }

        let id = state.next_id();
        let closing = CancellationToken::new();
        state.connections.insert(
            id,
            ConnState {
                closing: closing.clone(),
                channels: HashSet::new(),
            },
        );
        state.stats.connects += 1;
        state.stats.connected_hosts.push(host);
        log_debug!("memory broker: connection {id} opened");

        Ok((id, closing))
    }

    pub(crate) fn close_connection(&self, conn_id: u64) {
        self.lock().close_connection(conn_id);
    }

    pub(crate) fn open_channel(&self, conn_id: u64) -> Result<u64> {
        // ---
        let mut state = self.lock();
        if !state.connections.contains_key(&conn_id) {
            return Err(BackendError::TransportRetryable(format!(
                "connection {conn_id} closed"
            )));
        }

        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                conn_id,
                prefetch: 0,
                next_tag: 0,
                unacked: BTreeMap::new(),
                consumers: HashSet::new(),
                direct_reply: None,
            },
        );
        if let Some(conn) = state.connections.get_mut(&conn_id) {
            conn.channels.insert(id);
        }
        Ok(id)
    }

    pub(crate) fn channel_open(&self, channel_id: u64) -> bool {
        self.lock().channels.contains_key(&channel_id)
    }

    pub(crate) fn close_channel(&self, channel_id: u64) {
        self.lock().close_channel(channel_id);
    }

    pub(crate) fn exchange_declare(&self, channel_id: u64, spec: &ExchangeSpec) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;
        *state
            .stats
            .exchange_declares
            .entry(spec.name.clone())
            .or_default() += 1;
        state
            .exchanges
            .entry(spec.name.clone())
            .or_insert_with(|| ExchangeState {
                kind: spec.kind,
                bindings: Vec::new(),
            });
        Ok(())
    }

    pub(crate) fn queue_declare(&self, channel_id: u64, spec: &QueueSpec) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;
        *state
            .stats
            .queue_declares
            .entry(spec.name.clone())
            .or_default() += 1;
        state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| QueueState {
                messages: VecDeque::new(),
                consumers: Vec::new(),
                next: 0,
            });
        Ok(())
    }

    pub(crate) fn queue_bind(
        &self,
        channel_id: u64,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;
        if !state.queues.contains_key(queue) {
            return Err(BackendError::Transport(format!("no queue '{queue}'")));
        }
        let Some(ex) = state.exchanges.get_mut(exchange) else {
            return Err(BackendError::Transport(format!("no exchange '{exchange}'")));
        };

        let binding = (queue.to_string(), routing_key.to_string());
        if !ex.bindings.contains(&binding) {
            ex.bindings.push(binding);
        }
        *state.stats.queue_binds.entry(queue.to_string()).or_default() += 1;
        Ok(())
    }

    pub(crate) fn queue_delete(&self, channel_id: u64, queue: &str) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;
        *state.stats.queue_deletes.entry(queue.to_string()).or_default() += 1;

        if let Some(q) = state.queues.remove(queue) {
            for tag in q.consumers {
                state.remove_consumer(&tag);
            }
        }
        for ex in state.exchanges.values_mut() {
            ex.bindings.retain(|(q, _)| q != queue);
        }
        Ok(())
    }

    pub(crate) fn basic_qos(&self, channel_id: u64, prefetch_count: u16) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;
        if let Some(ch) = state.channels.get_mut(&channel_id) {
            ch.prefetch = prefetch_count;
        }
        Ok(())
    }

    pub(crate) fn basic_publish(&self, channel_id: u64, publish: Publish) -> Result<()> {
        self.lock().publish(channel_id, publish)
    }

    pub(crate) fn basic_consume(
        &self,
        channel_id: u64,
        queue: &str,
        options: ConsumeOptions,
    ) -> Result<ConsumerHandle> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;

        let consumer_tag = match options.consumer_tag {
            Some(tag) => tag,
            None => format!("amq.ctag-{}", state.next_id()),
        };
        if state.consumers.contains_key(&consumer_tag) {
            return Err(BackendError::Transport(format!(
                "consumer tag '{consumer_tag}' in use"
            )));
        }

        let direct = queue == DIRECT_REPLY_TO;
        if direct && !options.no_ack {
            return Err(BackendError::Transport(
                "direct reply-to consumer must be no-ack".into(),
            ));
        }
        if !direct && !state.queues.contains_key(queue) {
            return Err(BackendError::Transport(format!("no queue '{queue}'")));
        }

        let (tx, inbox) = mpsc::unbounded_channel();
        state.consumers.insert(
            consumer_tag.clone(),
            ConsumerState {
                queue: queue.to_string(),
                channel_id,
                no_ack: options.no_ack,
                tx,
            },
        );
        if let Some(ch) = state.channels.get_mut(&channel_id) {
            ch.consumers.insert(consumer_tag.clone());
            if direct {
                ch.direct_reply = Some(consumer_tag.clone());
            }
        }
        if !direct {
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.push(consumer_tag.clone());
            }
            state.dispatch(queue);
        }

        Ok(ConsumerHandle {
            consumer_tag,
            inbox,
        })
    }

    pub(crate) fn basic_ack(&self, channel_id: u64, delivery_tag: u64) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;

        let acked = state
            .channels
            .get_mut(&channel_id)
            .and_then(|ch| ch.unacked.remove(&delivery_tag));
        let Some((queue, _)) = acked else {
            return Err(BackendError::Transport(format!(
                "unknown delivery tag {delivery_tag}"
            )));
        };

        state.stats.acks += 1;
        state.dispatch(&queue);
        Ok(())
    }

    pub(crate) fn basic_cancel(&self, channel_id: u64, consumer_tag: &str) -> Result<()> {
        // ---
        let mut state = self.lock();
        state.check_channel(channel_id)?;
        state.stats.cancels += 1;
        state.remove_consumer(consumer_tag);
        Ok(())
    }
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn check_channel(&self, channel_id: u64) -> Result<()> {
        // ---
        if self.channels.contains_key(&channel_id) {
            Ok(())
        } else {
            Err(BackendError::TransportRetryable(format!(
                "channel {channel_id} closed"
            )))
        }
    }

    fn close_connection(&mut self, conn_id: u64) {
        // ---
        let Some(conn) = self.connections.remove(&conn_id) else {
            return;
        };
        for channel_id in conn.channels {
            self.close_channel(channel_id);
        }
        conn.closing.cancel();
        log_debug!("memory broker: connection {conn_id} closed");
    }

    fn close_channel(&mut self, channel_id: u64) {
        // ---
        let Some(ch) = self.channels.remove(&channel_id) else {
            return;
        };
        if let Some(conn) = self.connections.get_mut(&ch.conn_id) {
            conn.channels.remove(&channel_id);
        }
        for tag in &ch.consumers {
            self.remove_consumer(tag);
        }

        // Requeue in reverse so the oldest delivery ends up first.
        let mut touched = HashSet::new();
        for (_, (queue, mut msg)) in ch.unacked.into_iter().rev() {
            if let Some(q) = self.queues.get_mut(&queue) {
                msg.redelivered = true;
                q.messages.push_front(msg);
                touched.insert(queue);
            }
        }
        for queue in touched {
            self.dispatch(&queue);
        }
    }

    fn remove_consumer(&mut self, consumer_tag: &str) {
        // ---
        let Some(consumer) = self.consumers.remove(consumer_tag) else {
            return;
        };
        if let Some(ch) = self.channels.get_mut(&consumer.channel_id) {
            ch.consumers.remove(consumer_tag);
            if ch.direct_reply.as_deref() == Some(consumer_tag) {
                ch.direct_reply = None;
            }
        }
        if let Some(q) = self.queues.get_mut(&consumer.queue) {
            q.consumers.retain(|t| t != consumer_tag);
            if q.next >= q.consumers.len() {
                q.next = 0;
            }
        }
    }

    fn publish(&mut self, channel_id: u64, publish: Publish) -> Result<()> {
        // ---
        self.check_channel(channel_id)?;
        let Publish {
            exchange,
            routing_key,
            body,
            mut properties,
        } = publish;

        if properties.reply_to.as_deref() == Some(DIRECT_REPLY_TO) {
            let has_consumer = self
                .channels
                .get(&channel_id)
                .is_some_and(|ch| ch.direct_reply.is_some());
            if !has_consumer {
                return Err(BackendError::Transport(
                    "direct reply-to consumer does not exist on this channel".into(),
                ));
            }
            properties.reply_to = Some(format!("{DIRECT_REPLY_TO}.{channel_id}"));
        }
        self.stats.publishes += 1;

        let expires_at = properties.ttl().map(|ttl| Instant::now() + ttl);
        let msg = Queued {
            exchange,
            routing_key,
            body,
            properties,
            redelivered: false,
            expires_at,
        };

        if msg.exchange.is_empty() {
            if let Some(target) = msg
                .routing_key
                .strip_prefix(DIRECT_REPLY_TO)
                .and_then(|rest| rest.strip_prefix('.'))
                .and_then(|id| id.parse::<u64>().ok())
            {
                self.deliver_direct(target, msg);
                return Ok(());
            }
            let queue = msg.routing_key.clone();
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_back(msg);
                self.dispatch(&queue);
            }
            return Ok(());
        }

        let Some(ex) = self.exchanges.get(&msg.exchange) else {
            return Err(BackendError::Transport(format!(
                "no exchange '{}'",
                msg.exchange
            )));
        };

        let mut targets: Vec<String> = Vec::new();
        for (queue, key) in &ex.bindings {
            let hit = match ex.kind {
                ExchangeKind::Topic => topic_matches(key, &msg.routing_key),
                ExchangeKind::Direct => *key == msg.routing_key,
                ExchangeKind::Fanout => true,
            };
            if hit && !targets.contains(queue) {
                targets.push(queue.clone());
            }
        }

        for queue in targets {
            if let Some(q) = self.queues.get_mut(&queue) {
                q.messages.push_back(msg.duplicate());
            }
            self.dispatch(&queue);
        }
        Ok(())
    }

    fn deliver_direct(&mut self, channel_id: u64, msg: Queued) {
        // ---
        let Some(ch) = self.channels.get_mut(&channel_id) else {
            log_debug!("memory broker: direct reply to closed channel {channel_id} dropped");
            return;
        };
        let Some(consumer) = ch
            .direct_reply
            .as_ref()
            .and_then(|tag| self.consumers.get(tag))
        else {
            return;
        };

        ch.next_tag += 1;
        let _ = consumer.tx.send(msg.into_delivery(ch.next_tag));
    }

    /// Push ready messages of `queue` to consumers with spare prefetch.
    fn dispatch(&mut self, queue: &str) {
        // ---
        let BrokerState {
            queues,
            consumers,
            channels,
            ..
        } = self;

        let Some(q) = queues.get_mut(queue) else {
            return;
        };

        loop {
            q.drop_expired(Instant::now());
            if q.messages.is_empty() || q.consumers.is_empty() {
                return;
            }

            let n = q.consumers.len();
            let chosen = (0..n).map(|i| (q.next + i) % n).find(|&idx| {
                let Some(c) = consumers.get(&q.consumers[idx]) else {
                    return false;
                };
                channels.get(&c.channel_id).is_some_and(|ch| {
                    c.no_ack || ch.prefetch == 0 || ch.unacked.len() < usize::from(ch.prefetch)
                })
            });
            let Some(idx) = chosen else {
                return;
            };
            q.next = (idx + 1) % n;

            let tag = q.consumers[idx].clone();
            let Some(consumer) = consumers.get(&tag) else {
                return;
            };
            let Some(ch) = channels.get_mut(&consumer.channel_id) else {
                return;
            };
            let Some(msg) = q.messages.pop_front() else {
                return;
            };

            ch.next_tag += 1;
            let delivery_tag = ch.next_tag;
            if consumer.tx.send(msg.to_delivery(delivery_tag)).is_err() {
                // Inbox dropped: forget the consumer, keep the message.
                q.messages.push_front(msg);
                q.consumers.remove(idx);
                ch.consumers.remove(&tag);
                consumers.remove(&tag);
                if q.next >= q.consumers.len() {
                    q.next = 0;
                }
                continue;
            }
            if !consumer.no_ack {
                ch.unacked.insert(delivery_tag, (queue.to_string(), msg));
            }
        }
    }
}

impl QueueState {
    fn drop_expired(&mut self, now: Instant) {
        self.messages
            .retain(|m| m.expires_at.map_or(true, |at| at > now));
    }
}

impl Queued {
    fn duplicate(&self) -> Self {
        Self {
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            body: self.body.clone(),
            properties: self.properties.clone(),
            redelivered: self.redelivered,
            expires_at: self.expires_at,
        }
    }

    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        self.duplicate().into_delivery(delivery_tag)
    }

    fn into_delivery(self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange,
            routing_key: self.routing_key,
            redelivered: self.redelivered,
            body: self.body,
            properties: self.properties,
        }
    }
}

/// AMQP topic matching: `*` is exactly one word, `#` zero or more.
pub(crate) fn topic_matches(pattern: &str, key: &str) -> bool {
    // ---
    fn walk(p: &[&str], k: &[&str]) -> bool {
        match p.split_first() {
            None => k.is_empty(),
            Some((&"#", rest)) => (0..=k.len()).any(|i| walk(rest, &k[i..])),
            Some((&"*", rest)) => !k.is_empty() && walk(rest, &k[1..]),
            Some((word, rest)) => k.first() == Some(word) && walk(rest, &k[1..]),
        }
    }

    let p: Vec<&str> = pattern.split('.').collect();
    let k: Vec<&str> = key.split('.').collect();
    walk(&p, &k)
}
