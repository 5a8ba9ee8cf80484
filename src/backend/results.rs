//! Result routing.
//!
//! Results reach the caller through one of three reply addresses:
//!
//! | Mode          | reply_to                          | Consumer                 |
//! |---------------|-----------------------------------|--------------------------|
//! | DirectReplyTo | `amq.rabbitmq.reply-to`           | per-backend, no-ack      |
//! | Common        | `{prefix}results.{backend_id}`    | per-backend, acked       |
//! | Separate      | `{prefix}result.{task_id}`        | per-wait, queue deleted  |
//!
//! The two per-backend consumers feed a [`ResultRouter`], which buffers
//! results per task id until a [`ResultStream`] reads them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::time::{sleep_until, Duration, Instant};

use super::inner::{ActiveConsumer, Core};
use super::tasks::BackendTasks;
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_error,
    log_warn,
    models::keys,
    BackendError,
    ChannelPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    QueueArguments,
    QueueSpec,
    Result,
    ResultQueueMode,
    Serializer,
    TaskId,
    TaskInstance,
    TaskResult,
    DIRECT_REPLY_TO,
};

/// Prefetch of the common results consumer.
const RESULTS_PREFETCH: u16 = 5;

/// Backend task name of the slot expiry timers.
pub(crate) const REAPER_TASK: &str = "result_reaper";

/// Results of one task id, shared by every waiter.
///
/// The log is append-only; each waiter reads it through its own cursor,
/// so every waiter sees every result.
pub(crate) struct WaitSlot {
    /// Bumped on every push and on removal.
    version: watch::Sender<u64>,
    log: Mutex<Vec<TaskResult>>,
    /// Attached [`ResultStream`]s. Changed only under the router lock.
    waiters: AtomicUsize,
    deadline: Mutex<Option<Instant>>,
    reaper: AtomicBool,
}

impl WaitSlot {
    fn new() -> Self {
        Self {
            version: watch::channel(0).0,
            log: Mutex::new(Vec::new()),
            waiters: AtomicUsize::new(0),
            deadline: Mutex::new(None),
            reaper: AtomicBool::new(false),
        }
    }

    fn push(&self, result: TaskResult) {
        lock_ignore_poison(&self.log).push(result);
        self.version.send_modify(|v| *v += 1);
    }

    /// Result at `cursor`, advancing it.
    fn read(&self, cursor: &mut usize) -> Option<TaskResult> {
        // ---
        let result = lock_ignore_poison(&self.log).get(*cursor).cloned()?;
        *cursor += 1;
        Some(result)
    }

    fn wake(&self) {
        self.version.send_modify(|v| *v += 1);
    }
}

type Slots = Arc<Mutex<HashMap<TaskId, Arc<WaitSlot>>>>;

pub(crate) struct ResultRouter {
    common_queue: String,
    separate_prefix: String,
    slots: Slots,
}

impl ResultRouter {
    pub(crate) fn new(prefix: &str, backend_id: &str) -> Self {
        Self {
            common_queue: format!("{prefix}results.{backend_id}"),
            separate_prefix: format!("{prefix}result."),
            slots: Arc::default(),
        }
    }

    /// Reply address stamped on a task sent in `mode`.
    pub(crate) fn reply_to(&self, mode: ResultQueueMode, task_id: TaskId) -> String {
        // ---
        match mode {
            ResultQueueMode::DirectReplyTo => DIRECT_REPLY_TO.to_string(),
            ResultQueueMode::Common => self.common_queue.clone(),
            ResultQueueMode::Separate => self.separate_queue(task_id),
        }
    }

    pub(crate) fn common_queue(&self) -> &str {
        &self.common_queue
    }

    pub(crate) fn separate_queue(&self, task_id: TaskId) -> String {
        format!("{}{task_id}", self.separate_prefix)
    }

    fn slot(&self, task_id: TaskId) -> Arc<WaitSlot> {
        lock_ignore_poison(&self.slots)
            .entry(task_id)
            .or_insert_with(|| Arc::new(WaitSlot::new()))
            .clone()
    }

    /// Join the slot of `task_id` as one more waiter.
    fn attach(&self, task_id: TaskId) -> Arc<WaitSlot> {
        // ---
        let mut slots = lock_ignore_poison(&self.slots);
        let slot = slots
            .entry(task_id)
            .or_insert_with(|| Arc::new(WaitSlot::new()))
            .clone();
        slot.waiters.fetch_add(1, Ordering::SeqCst);
        slot
    }

    fn is_current(&self, task_id: TaskId, slot: &Arc<WaitSlot>) -> bool {
        lock_ignore_poison(&self.slots)
            .get(&task_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
    }

    /// Leave the slot. The last waiter removes it.
    fn release(&self, task_id: TaskId, slot: &Arc<WaitSlot>) {
        // ---
        let mut slots = lock_ignore_poison(&self.slots);
        let left = slot.waiters.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if left > 0 {
            return;
        }
        if slots.get(&task_id).is_some_and(|current| Arc::ptr_eq(current, slot)) {
            slots.remove(&task_id);
        }
        drop(slots);
        slot.wake();
    }

    /// Tasks with buffered or awaited results.
    #[cfg(test)]
    pub(crate) fn pending(&self) -> usize {
        lock_ignore_poison(&self.slots).len()
    }

    /// Route one delivery from a per-backend results consumer.
    ///
    /// Deliveries without a parsable correlation id, or with an undecodable
    /// body, are logged and dropped.
    pub(crate) fn dispatch(&self, tasks: &BackendTasks, serializer: &dyn Serializer, delivery: &Delivery) {
        // ---
        let props = &delivery.properties;
        let key = props.correlation_id.as_deref().or(props.message_id.as_deref());
        let Some(task_id) = key.and_then(|k| k.parse::<TaskId>().ok()) else {
            log_warn!("result without task id on {} dropped", delivery.routing_key);
            return;
        };

        let result = match serializer.loads_task_result(&delivery.body) {
            Ok(result) => result,
            Err(err) => {
                log_error!("undecodable result for task {task_id}: {err}");
                return;
            }
        };

        let slot = self.slot(task_id);
        slot.push(result);
        if let Some(ttl) = props.ttl() {
            self.expire_after(tasks, task_id, &slot, ttl);
        }
    }

    /// Drop the slot once `ttl` passes without another result arriving.
    fn expire_after(&self, tasks: &BackendTasks, task_id: TaskId, slot: &Arc<WaitSlot>, ttl: Duration) {
        // ---
        *lock_ignore_poison(&slot.deadline) = Some(Instant::now() + ttl);
        if slot.reaper.swap(true, Ordering::SeqCst) {
            return;
        }

        let slots = Arc::downgrade(&self.slots);
        let slot = slot.clone();
        tasks.spawn(REAPER_TASK, async move {
            // ---
            loop {
                let Some(deadline) = *lock_ignore_poison(&slot.deadline) else {
                    return;
                };
                if Instant::now() >= deadline {
                    break;
                }
                sleep_until(deadline).await;
            }
            if let Some(slots) = slots.upgrade() {
                let mut slots = lock_ignore_poison(&slots);
                if slots.get(&task_id).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
                    slots.remove(&task_id);
                }
            }
            log_debug!("results for task {task_id} expired");
            slot.wake();
        });
    }
}

/// Per-sequence index check for streamed results.
///
/// The first index seen on a sequence sets its baseline; each later one
/// must be exactly one more than the previous.
#[derive(Debug, Default)]
pub(crate) struct IndexTracker {
    last: HashMap<String, u64>,
}

impl IndexTracker {
    pub(crate) fn check(&mut self, task_id: TaskId, result: &TaskResult) -> Result<()> {
        // ---
        let Some((seq, idx)) = &result.idx else {
            return Ok(());
        };
        if let Some(prev) = self.last.get(seq) {
            let expected = prev + 1;
            if *idx != expected {
                return Err(BackendError::UnexpectedIndex {
                    task_id,
                    expected,
                    got: *idx,
                });
            }
        }
        self.last.insert(seq.clone(), *idx);
        Ok(())
    }
}

/// Consumer of a per-task result queue.
struct SeparateConsumer {
    queue: String,
    channel: ChannelPtr,
    handle: ConsumerHandle,
}

impl SeparateConsumer {
    /// Cancel, delete the queue and close the channel. Failures are logged.
    async fn teardown(self, core: &Core) {
        // ---
        if let Err(err) = core.call(self.channel.basic_cancel(&self.handle.consumer_tag)).await {
            log_debug!("{core}: cancel on {} failed: {err}", self.queue);
        }
        if let Err(err) = core.call(self.channel.queue_delete(&self.queue)).await {
            log_warn!("{core}: delete of {} failed: {err}", self.queue);
        }
        if let Err(err) = self.channel.close().await {
            log_debug!("{core}: channel close failed: {err}");
        }
    }
}

/// One stream's view of a [`WaitSlot`].
struct Waiter {
    slot: Arc<WaitSlot>,
    version: watch::Receiver<u64>,
    cursor: usize,
}

/// Results of one task, in arrival order.
///
/// A plain task yields exactly one result. A streaming task yields results
/// until its closing marker arrives; the marker itself is not yielded.
/// Errors end the stream.
///
/// ```ignore
/// let mut results = backend.pop_task_result(&task)?;
/// while let Some(result) = results.next().await {
///     println!("{:?}", result?.res);
/// }
/// ```
pub struct ResultStream {
    core: Arc<Core>,
    task: TaskInstance,
    mode: ResultQueueMode,
    index: IndexTracker,
    waiter: Option<Waiter>,
    separate: Option<SeparateConsumer>,
    done: bool,
}

impl std::fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream")
            .field("task", &self.task)
            .field("mode", &self.mode)
            .field("index", &self.index)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl ResultStream {
    pub fn task_id(&self) -> TaskId {
        self.task.task_id()
    }

    /// Next result, or `None` once the stream has ended.
    pub async fn next(&mut self) -> Option<Result<TaskResult>> {
        // ---
        if self.done {
            return None;
        }

        let received = match self.mode {
            ResultQueueMode::Separate => self.next_separate().await,
            _ => self.next_shared().await,
        };

        let result = match received {
            Ok(result) => result,
            Err(err) => {
                self.finish().await;
                return Some(Err(err));
            }
        };

        let stream = self.task.is_stream();
        if stream && result.is_closed() {
            self.finish().await;
            return None;
        }
        if let Err(err) = self.index.check(self.task_id(), &result) {
            self.finish().await;
            return Some(Err(err));
        }
        if !stream {
            self.finish().await;
        }
        Some(Ok(result))
    }

    /// Collect every remaining result, stopping at the first error.
    pub async fn collect(mut self) -> Result<Vec<TaskResult>> {
        // ---
        let mut results = Vec::new();
        while let Some(result) = self.next().await {
            results.push(result?);
        }
        Ok(results)
    }

    async fn next_shared(&mut self) -> Result<TaskResult> {
        // ---
        let core = self.core.clone();
        let task_id = self.task_id();
        let Some(waiter) = self.waiter.as_mut() else {
            return Err(BackendError::ResultExpired(task_id));
        };

        loop {
            if let Some(result) = waiter.slot.read(&mut waiter.cursor) {
                return Ok(result);
            }
            if !core.results.is_current(task_id, &waiter.slot) {
                return Err(BackendError::ResultExpired(task_id));
            }
            tokio::select! {
                changed = waiter.version.changed() => {
                    if changed.is_err() {
                        return Err(BackendError::ResultExpired(task_id));
                    }
                }
                _ = core.closed.cancelled() => {
                    return Err(BackendError::ConnectionClosed(core.to_string()));
                }
            }
        }
    }

    async fn next_separate(&mut self) -> Result<TaskResult> {
        // ---
        let core = self.core.clone();
        loop {
            if self.separate.is_none() {
                let task = &self.task;
                let consumer = core
                    .pull_retry
                    .run("pop_task_result", || core.open_separate(task))
                    .await?;
                self.separate = Some(consumer);
            }
            let separate = self
                .separate
                .as_mut()
                .ok_or_else(|| BackendError::TransportRetryable("result consumer gone".into()))?;

            let delivery = tokio::select! {
                delivery = separate.handle.inbox.recv() => delivery,
                _ = core.closed.cancelled() => {
                    return Err(BackendError::ConnectionClosed(core.to_string()));
                }
            };

            match delivery {
                Some(delivery) => {
                    let acked = core.call(separate.channel.basic_ack(delivery.delivery_tag)).await;
                    if let Err(err) = acked {
                        log_debug!("{core}: result ack failed: {err}");
                    }
                    return core.serializer.loads_task_result(&delivery.body);
                }
                None => {
                    log_debug!("{core}: result consumer on {} ended, reopening", separate.queue);
                    if let Some(stale) = self.separate.take() {
                        let _ = stale.channel.close().await;
                    }
                }
            }
        }
    }

    async fn finish(&mut self) {
        // ---
        self.done = true;
        if let Some(waiter) = self.waiter.take() {
            self.core.results.release(self.task.task_id(), &waiter.slot);
        }
        if let Some(separate) = self.separate.take() {
            separate.teardown(&self.core).await;
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        // ---
        if self.done {
            return;
        }
        if let Some(waiter) = self.waiter.take() {
            self.core.results.release(self.task.task_id(), &waiter.slot);
        }
        if let Some(separate) = self.separate.take() {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let core = self.core.clone();
                handle.spawn(async move { separate.teardown(&core).await });
            }
        }
    }
}

impl Core {
    /// Start waiting for results of `task`.
    ///
    /// # Errors
    ///
    /// [`BackendError::ResultNotRequested`] when the task was sent with
    /// `result_return` off.
    pub(crate) fn pop_task_result(self: &Arc<Self>, task: &TaskInstance) -> Result<ResultStream> {
        // ---
        self.ensure_running()?;
        if !task.data.result_return {
            return Err(BackendError::ResultNotRequested(task.task_id()));
        }

        let mode = task.data.results_queue_mode(self.config.results_queue_mode);
        let waiter = (mode != ResultQueueMode::Separate).then(|| {
            let slot = self.results.attach(task.task_id());
            let version = slot.version.subscribe();
            Waiter {
                slot,
                version,
                cursor: 0,
            }
        });

        Ok(ResultStream {
            core: self.clone(),
            mode,
            task: task.clone(),
            index: IndexTracker::default(),
            waiter,
            separate: None,
            done: false,
        })
    }

    /// Publish the closing marker that ends a streaming task's results.
    pub(crate) async fn close_task(
        self: &Arc<Self>,
        task: &TaskInstance,
        idx: Option<(String, u64)>,
    ) -> Result<()> {
        self.push_task_result(task, &TaskResult::closed(idx)).await
    }

    pub(crate) async fn declare_common_queue(&self, channel: &ChannelPtr) -> Result<()> {
        // ---
        let config = &self.config;
        let name = self.results.common_queue();
        let spec = QueueSpec {
            name: name.to_string(),
            durable: config.results_common_queue_durable,
            auto_delete: !config.results_common_queue_durable,
            exclusive: false,
            arguments: QueueArguments {
                queue_type: Some(config.results_common_queue_type),
                max_priority: None,
                expires: config.results_common_queue_ttl,
            },
        };
        self.call(channel.queue_declare(&spec)).await?;
        self.call(channel.queue_bind(name, &config.tasks_exchange, name)).await
    }

    /// Declare and bind the per-task result queue of `task`.
    pub(crate) async fn declare_result_queue(
        &self,
        channel: &ChannelPtr,
        task: &TaskInstance,
    ) -> Result<String> {
        // ---
        let config = &self.config;
        let name = self.results.separate_queue(task.task_id());
        let durable = task
            .data
            .extra_bool(keys::RESULT_QUEUE_DURABLE)
            .unwrap_or(config.results_separate_queue_durable);
        let spec = QueueSpec {
            name: name.clone(),
            durable,
            auto_delete: false,
            exclusive: false,
            arguments: QueueArguments {
                queue_type: Some(config.results_separate_queue_type),
                max_priority: None,
                expires: task.data.result_ttl,
            },
        };
        self.call(channel.queue_declare(&spec)).await?;
        self.call(channel.queue_bind(&name, &config.tasks_exchange, &name)).await?;
        Ok(name)
    }

    async fn open_separate(&self, task: &TaskInstance) -> Result<SeparateConsumer> {
        // ---
        let channel = self.new_channel().await?;
        let consumed = async {
            let queue = self.declare_result_queue(&channel, task).await?;
            let handle = self
                .call(channel.basic_consume(&queue, ConsumeOptions::default()))
                .await?;
            Ok::<_, BackendError>((queue, handle))
        }
        .await;

        match consumed {
            Ok((queue, handle)) => Ok(SeparateConsumer {
                queue,
                channel,
                handle,
            }),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    pub(crate) async fn consume_common_results(self: &Arc<Self>) -> Result<ActiveConsumer> {
        // ---
        let channel = self.conn.new_channel().await?;
        self.call(channel.basic_qos(RESULTS_PREFETCH)).await?;
        let handle = self
            .call(channel.basic_consume(self.results.common_queue(), ConsumeOptions::default()))
            .await?;
        Ok(self.spawn_results_loop(channel, handle, true))
    }

    pub(crate) async fn consume_direct_results(
        self: &Arc<Self>,
        channel: ChannelPtr,
    ) -> Result<ActiveConsumer> {
        // ---
        let options = ConsumeOptions {
            no_ack: true,
            consumer_tag: None,
        };
        let handle = self.call(channel.basic_consume(DIRECT_REPLY_TO, options)).await?;
        Ok(self.spawn_results_loop(channel, handle, false))
    }

    fn spawn_results_loop(
        self: &Arc<Self>,
        channel: ChannelPtr,
        handle: ConsumerHandle,
        ack: bool,
    ) -> ActiveConsumer {
        // ---
        let weak = Arc::downgrade(self);
        let acks = channel.clone();
        let mut inbox = handle.inbox;

        let task = self.tasks.spawn("consume_results", async move {
            // ---
            while let Some(delivery) = inbox.recv().await {
                let Some(core) = weak.upgrade() else { break };
                core.results.dispatch(&core.tasks, core.serializer.as_ref(), &delivery);
                if ack {
                    if let Err(err) = core.call(acks.basic_ack(delivery.delivery_tag)).await {
                        log_debug!("{core}: result ack failed: {err}");
                    }
                }
            }
        });

        ActiveConsumer {
            channel,
            consumer_tag: handle.consumer_tag,
            task: task.abort_handle(),
        }
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{JsonSerializer, MessageProperties};
    use bytes::Bytes;
    use serde_json::json;

    fn delivery(task_id: TaskId, result: &TaskResult, ttl: Option<Duration>) -> Delivery {
        // ---
        let task = TaskInstance::new("t", "q");
        let body = JsonSerializer.dumps_task_result(&task, result).unwrap();
        Delivery {
            delivery_tag: 1,
            exchange: "taskq".into(),
            routing_key: "taskq.results.b".into(),
            redelivered: false,
            body,
            properties: MessageProperties {
                correlation_id: Some(task_id.to_string()),
                ..Default::default()
            }
            .with_ttl(ttl),
        }
    }

    #[test]
    fn test_reply_to_per_mode() {
        // ---
        let router = ResultRouter::new("taskq.", "b1");
        let id = TaskId::generate();
        assert_eq!(router.reply_to(ResultQueueMode::DirectReplyTo, id), DIRECT_REPLY_TO);
        assert_eq!(router.reply_to(ResultQueueMode::Common, id), "taskq.results.b1");
        assert_eq!(
            router.reply_to(ResultQueueMode::Separate, id),
            format!("taskq.result.{id}")
        );
    }

    #[test]
    fn test_index_tracker() {
        // ---
        let id = TaskId::generate();
        let mut tracker = IndexTracker::default();
        tracker.check(id, &TaskResult::ok(json!(1)).with_idx("s", 0)).unwrap();
        tracker.check(id, &TaskResult::ok(json!(2)).with_idx("s", 1)).unwrap();
        tracker.check(id, &TaskResult::ok(json!(3)).with_idx("other", 7)).unwrap();
        tracker.check(id, &TaskResult::ok(json!(4))).unwrap();

        let err = tracker
            .check(id, &TaskResult::ok(json!(5)).with_idx("s", 3))
            .unwrap_err();
        assert!(matches!(
            err,
            BackendError::UnexpectedIndex {
                expected: 2,
                got: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_dispatch_buffers_per_task() {
        // ---
        let router = ResultRouter::new("taskq.", "b1");
        let a = TaskId::generate();
        let b = TaskId::generate();

        let tasks = BackendTasks::default();
        router.dispatch(&tasks, &JsonSerializer, &delivery(a, &TaskResult::ok(json!("a1")), None));
        router.dispatch(&tasks, &JsonSerializer, &delivery(b, &TaskResult::ok(json!("b1")), None));
        router.dispatch(&tasks, &JsonSerializer, &delivery(a, &TaskResult::ok(json!("a2")), None));
        assert_eq!(router.pending(), 2);

        let slot = router.slot(a);
        let mut cursor = 0;
        assert_eq!(slot.read(&mut cursor).unwrap().res, Some(json!("a1")));
        assert_eq!(slot.read(&mut cursor).unwrap().res, Some(json!("a2")));
        assert!(slot.read(&mut cursor).is_none());
    }

    #[tokio::test]
    async fn test_every_waiter_reads_every_result() {
        // ---
        let router = ResultRouter::new("taskq.", "b1");
        let tasks = BackendTasks::default();
        let id = TaskId::generate();
        let first = router.attach(id);
        let second = router.attach(id);
        assert!(Arc::ptr_eq(&first, &second));

        router.dispatch(&tasks, &JsonSerializer, &delivery(id, &TaskResult::ok(json!(1)), None));
        let (mut a, mut b) = (0, 0);
        assert_eq!(first.read(&mut a).unwrap().res, Some(json!(1)));
        assert_eq!(second.read(&mut b).unwrap().res, Some(json!(1)));

        let mut version = second.version.subscribe();
        router.release(id, &first);
        assert!(router.is_current(id, &second), "slot kept while a waiter remains");

        router.release(id, &second);
        assert!(!router.is_current(id, &second));
        assert_eq!(router.pending(), 0);
        assert!(version.has_changed().unwrap(), "removal wakes parked waiters");
    }

    #[tokio::test]
    async fn test_dispatch_drops_unroutable() {
        // ---
        let router = ResultRouter::new("taskq.", "b1");
        let mut bad = delivery(TaskId::generate(), &TaskResult::ok(json!(1)), None);
        bad.properties.correlation_id = Some("nope".into());
        let tasks = BackendTasks::default();
        router.dispatch(&tasks, &JsonSerializer, &bad);

        let mut garbage = delivery(TaskId::generate(), &TaskResult::ok(json!(1)), None);
        garbage.body = Bytes::from_static(b"{not json");
        router.dispatch(&tasks, &JsonSerializer, &garbage);

        assert_eq!(router.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_expires_after_ttl() {
        // ---
        let router = ResultRouter::new("taskq.", "b1");
        let id = TaskId::generate();
        let ttl = Some(Duration::from_secs(10));
        let tasks = BackendTasks::default();

        router.dispatch(&tasks, &JsonSerializer, &delivery(id, &TaskResult::ok(json!(1)), ttl));
        assert_eq!(tasks.running(REAPER_TASK), 1);
        let slot = router.slot(id);
        let mut version = slot.version.subscribe();

        tokio::time::sleep(Duration::from_secs(6)).await;
        router.dispatch(&tasks, &JsonSerializer, &delivery(id, &TaskResult::ok(json!(2)), ttl));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(router.is_current(id, &slot), "second result extends the deadline");

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!router.is_current(id, &slot));
        assert!(version.has_changed().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_reaper_keeps_slot() {
        // ---
        let router = ResultRouter::new("taskq.", "b1");
        let id = TaskId::generate();
        let tasks = BackendTasks::default();

        let ttl = Some(Duration::from_secs(1));
        router.dispatch(&tasks, &JsonSerializer, &delivery(id, &TaskResult::ok(json!(1)), ttl));
        let slot = router.slot(id);
        tasks.cancel_all();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tasks.running(REAPER_TASK), 0);
        assert!(router.is_current(id, &slot), "aborted timer never fires");
    }
}
