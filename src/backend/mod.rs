//! Task, message and event backend.
//!
//! [`Backend`] is the public face: a cheap-to-clone handle over shared state
//! that owns one logical broker connection. Every operation runs as a named
//! background task; [`Backend::close`] aborts whatever is still running,
//! stops all consumers and releases the connection.

mod consumer;
mod events;
mod inner;
mod publisher;
mod results;
mod tasks;
mod topology;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use inner::Core;
pub use results::ResultStream;

use crate::{
    // ---
    lock_ignore_poison,
    log_info,
    BackendConfig,
    BackendError,
    ConnectionRegistry,
    Event,
    Message,
    Result,
    SerializerPtr,
    SharedConnection,
    TaskInstance,
    TaskResult,
    TransportPtr,
};

/// Type-erased task handler.
pub type TaskHandler = Arc<dyn Fn(TaskInstance) -> BoxFuture<'static, ()> + Send + Sync>;

/// Type-erased message handler.
pub type MessageHandler = Arc<dyn Fn(Message) -> BoxFuture<'static, ()> + Send + Sync>;

/// Type-erased event handler.
pub type EventHandler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Bound `fut` by `timeout` when one is set.
pub(crate) async fn timed<T, F>(timeout: Option<Duration>, fut: F) -> Result<T>
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

/// Broker backend for tasks, results, messages and events.
///
/// Created through [`BackendBuilder`](crate::BackendBuilder). Clones share
/// the same state. Backends built from the same URL list in one registry
/// share one physical connection.
///
/// # Example
///
/// ```no_run
/// use mom_taskq::{BackendBuilder, BackendConfig, TaskInstance};
///
/// # async fn example() -> mom_taskq::Result<()> {
/// let backend = BackendBuilder::new(BackendConfig::with_broker("amqp://localhost")).build()?;
///
/// backend
///     .consume_tasks(["default"], |task: TaskInstance| async move {
///         println!("got {}", task.task_name);
///     })
///     .await?;
///
/// let mut task = TaskInstance::new("hello", "default");
/// backend.send_task(&mut task).await?;
/// backend.close().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Backend {
    core: Arc<Core>,
}

impl Backend {
    pub(crate) fn new(
        config: BackendConfig,
        transport: TransportPtr,
        serializer: SerializerPtr,
        registry: &ConnectionRegistry,
    ) -> Result<Self> {
        // ---
        let core = Core::new(config, transport, serializer, registry)?;
        log_info!("{core}: created");
        Ok(Self { core })
    }

    pub fn id(&self) -> &str {
        &self.core.config.id
    }

    pub fn config(&self) -> &BackendConfig {
        &self.core.config
    }

    /// The logical connection this backend owns.
    pub fn connection(&self) -> &SharedConnection {
        &self.core.conn
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.is_cancelled()
    }

    /// Connect eagerly. Other operations connect on first use.
    pub async fn open(&self) -> Result<()> {
        self.core.ensure_running()?;
        self.core.conn.open().await
    }

    /// Publish `task` to its queue.
    ///
    /// The backend id and effective result mode are written into
    /// `task.data.extra`, so pass the same instance to
    /// [`pop_task_result`](Self::pop_task_result) afterwards.
    ///
    /// # Errors
    ///
    /// - [`BackendError::GraphUnsupported`] for a graph task in direct
    ///   reply-to mode
    /// - the last publish error once the push retry policy gives up
    pub async fn send_task(&self, task: &mut TaskInstance) -> Result<()> {
        self.core.send_task(task).await
    }

    /// Consume tasks from `queues`.
    ///
    /// Each task is acknowledged before `handler` runs, or after it returns
    /// when the task asked for late acknowledgement. A panicking handler is
    /// logged and the task is still acknowledged. Consumers are re-created
    /// after a connection loss.
    pub async fn consume_tasks<I, S, F, Fut>(&self, queues: I, handler: F) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(TaskInstance) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let handler: TaskHandler = Arc::new(move |task: TaskInstance| handler(task).boxed());
        let queues = queues.into_iter().map(Into::into).collect();
        self.core.consume_tasks(queues, handler).await
    }

    /// Stop consuming `queues`, or every task queue when `None`.
    pub async fn stop_consume_tasks(&self, queues: Option<&[String]>) -> Result<()> {
        self.core.stop_consume_tasks(queues).await
    }

    /// Publish one result of `task`. Called on the worker side.
    pub async fn push_task_result(&self, task: &TaskInstance, result: &TaskResult) -> Result<()> {
        self.core.push_task_result(task, result).await
    }

    /// Read the results of `task`.
    ///
    /// # Errors
    ///
    /// [`BackendError::ResultNotRequested`] when the task does not return
    /// results.
    pub fn pop_task_result(&self, task: &TaskInstance) -> Result<ResultStream> {
        self.core.pop_task_result(task)
    }

    /// End a streaming task's results. `idx` tags the marker with a
    /// sequence position.
    pub async fn close_task(&self, task: &TaskInstance, idx: Option<(String, u64)>) -> Result<()> {
        self.core.close_task(task, idx).await
    }

    /// Publish a raw message. `delivery_mode` defaults to persistent.
    pub async fn send_message(
        &self,
        message: &Message,
        routing_key: &str,
        delivery_mode: Option<u8>,
    ) -> Result<()> {
        self.core.send_message(message, routing_key, delivery_mode).await
    }

    /// Consume raw messages from `queues`. Acknowledgement follows the
    /// sender's `ack_late` choice.
    pub async fn consume_messages<I, S, F, Fut>(&self, queues: I, handler: F) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let handler: MessageHandler = Arc::new(move |message: Message| handler(message).boxed());
        let queues = queues.into_iter().map(Into::into).collect();
        self.core.consume_messages(queues, handler).await
    }

    pub async fn stop_consume_messages(&self, queues: Option<&[String]>) -> Result<()> {
        self.core.stop_consume_messages(queues).await
    }

    pub async fn send_event(&self, event: &Event) -> Result<()> {
        self.core.send_event(event).await
    }

    /// Subscribe `handler` to events, optionally only those whose type is
    /// in `event_types`.
    pub async fn consume_events<F, Fut>(
        &self,
        subscriber_id: &str,
        handler: F,
        event_types: Option<&[&str]>,
    ) -> Result<()>
    where
        F: Fn(Event) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let handler: EventHandler = Arc::new(move |event: Event| handler(event).boxed());
        let event_types = event_types.map(|types| types.iter().map(|t| t.to_string()).collect());
        self.core.consume_events(subscriber_id, handler, event_types).await
    }

    /// Unsubscribe `subscriber_id`, or everyone when `None`.
    pub async fn stop_consume_events(&self, subscriber_id: Option<&str>) -> Result<()> {
        self.core.stop_consume_events(subscriber_id).await
    }

    /// Stop every consumer, abort running operations and release the
    /// connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        // ---
        let core = &self.core;
        if core.closed.is_cancelled() {
            return Ok(());
        }
        core.closed.cancel();

        core.stop_consume_tasks(None).await?;
        core.stop_consume_messages(None).await?;
        core.stop_consume_events(None).await?;
        let results = std::mem::take(&mut lock_ignore_poison(&core.consumers).results);
        for consumer in results {
            consumer.stop(core).await;
        }

        core.tasks.cancel_all();
        core.conn.close().await?;
        log_info!("{core}: closed");
        Ok(())
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.core, f)
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.core.config.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}
