//! Shared backend state and connection lifecycle hooks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{watch, Semaphore};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;

use super::events::EventSubscribers;
use super::results::ResultRouter;
use super::tasks::BackendTasks;
use super::topology::TopologyManager;
use super::{timed, MessageHandler, TaskHandler};
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_info,
    log_warn,
    BackendConfig,
    BackendError,
    CallbackKind,
    ChannelPtr,
    ConnectionRegistry,
    ExchangeKind,
    ExchangeSpec,
    Result,
    RetryPolicy,
    SerializerPtr,
    SharedConnection,
    TransportPtr,
};

/// A running basic.consume and the task draining its inbox.
pub(crate) struct ActiveConsumer {
    pub(crate) channel: ChannelPtr,
    pub(crate) consumer_tag: String,
    pub(crate) task: AbortHandle,
}

impl ActiveConsumer {
    /// Still attached to an open channel.
    pub(crate) fn is_live(&self) -> bool {
        !self.channel.is_closed() && !self.task.is_finished()
    }

    /// Cancel the consumer and close its channel. Failures are only logged.
    pub(crate) async fn stop(self, core: &Core) {
        // ---
        self.task.abort();
        if self.channel.is_closed() {
            return;
        }
        if let Err(err) = core.call(self.channel.basic_cancel(&self.consumer_tag)).await {
            log_debug!("{core}: cancel {} failed: {err}", self.consumer_tag);
        }
        if let Err(err) = self.channel.close().await {
            log_debug!("{core}: channel close failed: {err}");
        }
    }
}

/// A handler registered for a queue, and its consumer when one is running.
pub(crate) struct Subscription<H> {
    pub(crate) handler: H,
    pub(crate) active: Option<ActiveConsumer>,
}

impl<H> Subscription<H> {
    pub(crate) fn is_live(&self) -> bool {
        self.active.as_ref().is_some_and(ActiveConsumer::is_live)
    }
}

#[derive(Default)]
pub(crate) struct Consumers {
    pub(crate) tasks: HashMap<String, Subscription<TaskHandler>>,
    pub(crate) messages: HashMap<String, Subscription<MessageHandler>>,
    pub(crate) events: EventSubscribers,
    pub(crate) results: Vec<ActiveConsumer>,
}

pub(crate) struct Core {
    pub(crate) config: BackendConfig,
    pub(crate) serializer: SerializerPtr,
    pub(crate) conn: SharedConnection,
    pub(crate) topology: TopologyManager,
    pub(crate) results: ResultRouter,
    pub(crate) tasks: BackendTasks,
    pub(crate) consumers: Mutex<Consumers>,
    /// True between a completed open callback and the next loss or close.
    pub(crate) open_ev: watch::Sender<bool>,
    /// Bounds concurrently running task and message handlers.
    pub(crate) semaphore: Arc<Semaphore>,
    pub(crate) closed: CancellationToken,
    pub(crate) push_retry: RetryPolicy,
    pub(crate) pull_retry: RetryPolicy,
    /// Channel carrying the direct reply-to consumer; direct-mode tasks are
    /// published on it.
    reply_channel: Mutex<Option<ChannelPtr>>,
}

impl Core {
    pub(crate) fn new(
        config: BackendConfig,
        transport: TransportPtr,
        serializer: SerializerPtr,
        registry: &ConnectionRegistry,
    ) -> Result<Arc<Self>> {
        // ---
        config.validate()?;
        let conn = SharedConnection::new(
            &config.urls,
            transport,
            RetryPolicy::new(config.conn_retry.clone()),
            registry,
        )?;

        let core = Arc::new(Self {
            results: ResultRouter::new(&config.results_queue_prefix, &config.id),
            semaphore: Arc::new(Semaphore::new(config.pool_size)),
            push_retry: RetryPolicy::new(config.push_retry.clone()),
            pull_retry: RetryPolicy::new(config.pull_retry.clone()),
            open_ev: watch::channel(false).0,
            topology: TopologyManager::default(),
            tasks: BackendTasks::default(),
            consumers: Mutex::new(Consumers::default()),
            closed: CancellationToken::new(),
            reply_channel: Mutex::new(None),
            serializer,
            conn,
            config,
        });
        core.register_connection_callbacks();
        Ok(core)
    }

    fn register_connection_callbacks(self: &Arc<Self>) {
        // ---
        let weak = Arc::downgrade(self);
        self.conn.add_callback(
            CallbackKind::OnOpenOrdered,
            "backend:on_open",
            move || with_core(weak.clone(), |core| async move { core.on_connection_open().await }),
            true,
        );

        let weak = Arc::downgrade(self);
        self.conn.add_callback(
            CallbackKind::OnLostOrdered,
            "backend:on_lost",
            move || with_core(weak.clone(), |core| async move { core.on_connection_lost() }),
            false,
        );

        let weak = Arc::downgrade(self);
        self.conn.add_callback(
            CallbackKind::OnCloseOrdered,
            "backend:on_close",
            move || with_core(weak.clone(), |core| async move { core.on_connection_close() }),
            false,
        );
    }

    /// Declare exchanges and the common results queue, then start the
    /// result consumers. Runs inside `open()`, so it uses the connection
    /// directly instead of waiting for the open flag.
    async fn on_connection_open(self: Arc<Self>) -> Result<()> {
        // ---
        self.topology.clear();
        let channel = self.conn.channel().await?;
        let config = &self.config;

        self.call(channel.exchange_declare(&ExchangeSpec {
            name: config.tasks_exchange.clone(),
            kind: ExchangeKind::Topic,
            durable: config.tasks_exchange_durable,
            auto_delete: !config.tasks_exchange_durable,
        }))
        .await?;

        if config.events_exchange != config.tasks_exchange {
            self.call(channel.exchange_declare(&ExchangeSpec {
                name: config.events_exchange.clone(),
                kind: ExchangeKind::Topic,
                durable: config.events_exchange_durable,
                auto_delete: !config.events_exchange_durable,
            }))
            .await?;
        }

        self.declare_common_queue(&channel).await?;

        self.consume_results().await?;
        self.open_ev.send_replace(true);

        log_info!("{self}: connection open");
        Ok(())
    }

    fn on_connection_lost(self: Arc<Self>) -> Result<()> {
        // ---
        log_warn!("{self}: connection lost");
        if self.conn.is_open() {
            // Already reconnected by a concurrent caller.
            return Ok(());
        }
        self.open_ev.send_replace(false);
        self.topology.clear();
        lock_ignore_poison(&self.reply_channel).take();
        for consumer in std::mem::take(&mut lock_ignore_poison(&self.consumers).results) {
            consumer.task.abort();
        }

        if self.closed.is_cancelled() {
            return Ok(());
        }

        let core = self.clone();
        self.tasks.spawn("reopen", async move {
            // ---
            let result = core.pull_retry.run("reopen", || core.conn.open()).await;
            if let Err(err) = result {
                log_warn!("{core}: reopen failed: {err}");
            }
        });
        Ok(())
    }

    fn on_connection_close(self: Arc<Self>) -> Result<()> {
        // ---
        self.open_ev.send_replace(false);
        self.topology.clear();
        lock_ignore_poison(&self.reply_channel).take();

        let consumers = std::mem::take(&mut *lock_ignore_poison(&self.consumers));
        let tasks = consumers.tasks.into_values().filter_map(|s| s.active);
        let messages = consumers.messages.into_values().filter_map(|s| s.active);
        for consumer in tasks
            .chain(messages)
            .chain(consumers.events.active)
            .chain(consumers.results)
        {
            consumer.task.abort();
        }
        Ok(())
    }

    /// Start the common-queue and direct reply-to result consumers.
    async fn consume_results(self: &Arc<Self>) -> Result<()> {
        // ---
        let common = self.consume_common_results().await?;
        let reply_channel = self.conn.new_channel().await?;
        let direct = self.consume_direct_results(reply_channel.clone()).await?;

        *lock_ignore_poison(&self.reply_channel) = Some(reply_channel);
        let stale = std::mem::replace(
            &mut lock_ignore_poison(&self.consumers).results,
            vec![common, direct],
        );
        for consumer in stale {
            consumer.stop(self).await;
        }
        Ok(())
    }

    pub(crate) fn ensure_running(&self) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(BackendError::ConnectionClosed(self.to_string()));
        }
        Ok(())
    }

    /// Wait until the open callback has run.
    async fn wait_open(&self) -> Result<()> {
        // ---
        let mut open = self.open_ev.subscribe();
        tokio::select! {
            changed = open.wait_for(|open| *open) => changed
                .map(|_| ())
                .map_err(|_| BackendError::ConnectionClosed(self.to_string())),
            _ = self.closed.cancelled() => Err(BackendError::ConnectionClosed(self.to_string())),
        }
    }

    /// The connection's cached channel, once the backend is open.
    pub(crate) async fn channel(&self) -> Result<ChannelPtr> {
        // ---
        loop {
            self.ensure_running()?;
            let channel = self.conn.channel().await?;
            self.wait_open().await?;
            if !channel.is_closed() {
                return Ok(channel);
            }
        }
    }

    /// A fresh channel, once the backend is open.
    pub(crate) async fn new_channel(&self) -> Result<ChannelPtr> {
        // ---
        self.ensure_running()?;
        let channel = self.conn.new_channel().await?;
        self.wait_open().await?;
        Ok(channel)
    }

    /// The channel owning the direct reply-to consumer.
    pub(crate) async fn reply_channel(&self) -> Result<ChannelPtr> {
        // ---
        self.channel().await?;
        lock_ignore_poison(&self.reply_channel)
            .clone()
            .filter(|channel| !channel.is_closed())
            .ok_or_else(|| {
                BackendError::TransportRetryable(format!("{self}: reply channel not ready"))
            })
    }

    /// Bound a broker call by the configured timeout.
    pub(crate) async fn call<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        timed(self.config.timeout, fut).await
    }
}

impl fmt::Display for Core {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Backend[{}]", self.config.id)
    }
}

/// Run `f` with the backend if it is still alive.
async fn with_core<F, Fut>(weak: Weak<Core>, f: F) -> Result<()>
where
    F: FnOnce(Arc<Core>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    match weak.upgrade() {
        Some(core) => f(core).await,
        None => Ok(()),
    }
}
