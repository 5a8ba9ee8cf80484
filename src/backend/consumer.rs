//! Inbound side: task and message consumers.
//!
//! Each queue gets its own channel with bounded prefetch. Deliveries are
//! handed to the registered handler on a spawned task once a slot in the
//! backend's pool is free; the handler itself runs on a separate task so a
//! stopped consumer never cancels work already started. A connection loss
//! re-subscribes every queue still registered.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use super::inner::{ActiveConsumer, Core, Subscription};
use super::publisher::ACK_LATE_HEADER;
use super::{MessageHandler, TaskHandler};
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    log_warn,
    models::keys,
    CallbackKind,
    ChannelPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    Message,
    Result,
};

const TASKS_CALLBACK: &str = "consume_tasks";
const MESSAGES_CALLBACK: &str = "consume_messages";

impl Core {
    /// Consume `queues`, dispatching each task to `handler`.
    ///
    /// Queues already being consumed keep their current handler.
    pub(crate) async fn consume_tasks(
        self: &Arc<Self>,
        queues: Vec<String>,
        handler: TaskHandler,
    ) -> Result<()> {
        // ---
        self.ensure_running()?;
        {
            let mut consumers = lock_ignore_poison(&self.consumers);
            for queue in &queues {
                let sub = consumers
                    .tasks
                    .entry(queue.clone())
                    .or_insert_with(|| Subscription {
                        handler: handler.clone(),
                        active: None,
                    });
                if !sub.is_live() {
                    sub.handler = handler.clone();
                }
            }
        }
        self.resubscribe_on_loss(TASKS_CALLBACK, |core| async move {
            let queues: Vec<String> = lock_ignore_poison(&core.consumers).tasks.keys().cloned().collect();
            for queue in queues {
                if let Err(err) = core.start_task_consumer(&queue).await {
                    log_error!("{core}: resubscribe to {queue} failed: {err}");
                }
            }
        });

        for queue in &queues {
            self.start_task_consumer(queue).await?;
        }
        Ok(())
    }

    async fn start_task_consumer(self: &Arc<Self>, queue: &str) -> Result<()> {
        // ---
        let handler = match lock_ignore_poison(&self.consumers).tasks.get(queue) {
            Some(sub) if !sub.is_live() => sub.handler.clone(),
            _ => return Ok(()),
        };

        let prefetch = self.config.tasks_prefetch_count;
        let (channel, handle) = self
            .pull_retry
            .run("consume_tasks", || self.open_consumer(queue, prefetch))
            .await?;
        let active = self.spawn_consume_loop("consume_tasks", channel, handle, move |core, channel, delivery| {
            core.on_task_delivery(channel, delivery, handler.clone())
        });

        let stale = match lock_ignore_poison(&self.consumers).tasks.get_mut(queue) {
            Some(sub) => sub.active.replace(active),
            None => Some(active),
        };
        if let Some(stale) = stale {
            stale.stop(self).await;
        }
        log_info!("{self}: consuming tasks from {queue}");
        Ok(())
    }

    async fn on_task_delivery(self: Arc<Self>, channel: ChannelPtr, delivery: Delivery, handler: TaskHandler) {
        // ---
        let tag = delivery.delivery_tag;
        let mut task = match self.serializer.loads_task_instance(&delivery.body) {
            Ok(task) => task,
            Err(err) => {
                log_error!("{self}: undecodable task on {} dropped: {err}", delivery.routing_key);
                self.ack(&channel, tag).await;
                return;
            }
        };

        if let Some(reply_to) = delivery.properties.reply_to {
            task.data.extra.insert(keys::REPLY_TO.into(), Value::from(reply_to));
        }
        let task_id = task.task_id();
        let ack_late = task.data.ack_late;
        log_debug!("{self}: got task {task_id} ({})", task.task_name);

        if !ack_late {
            self.ack(&channel, tag).await;
        }
        if let Err(err) = tokio::spawn(handler(task)).await {
            log_error!("{self}: handler for task {task_id} failed: {err}");
        }
        if ack_late {
            self.ack(&channel, tag).await;
        }
    }

    /// Stop consuming `queues`, or every task queue when `None`.
    pub(crate) async fn stop_consume_tasks(self: &Arc<Self>, queues: Option<&[String]>) -> Result<()> {
        // ---
        let (removed, none_left) = {
            let mut consumers = lock_ignore_poison(&self.consumers);
            let removed: Vec<_> = match queues {
                None => consumers.tasks.drain().collect(),
                Some(queues) => queues
                    .iter()
                    .filter_map(|q| consumers.tasks.remove_entry(q))
                    .collect(),
            };
            (removed, consumers.tasks.is_empty())
        };
        if none_left {
            self.conn.remove_callback(CallbackKind::OnLost, TASKS_CALLBACK);
        }

        for (queue, sub) in removed {
            if let Some(active) = sub.active {
                active.stop(self).await;
            }
            self.topology.forget(&queue);
            log_info!("{self}: stopped consuming tasks from {queue}");
        }
        Ok(())
    }

    /// Consume raw messages from `queues`.
    pub(crate) async fn consume_messages(
        self: &Arc<Self>,
        queues: Vec<String>,
        handler: MessageHandler,
    ) -> Result<()> {
        // ---
        self.ensure_running()?;
        {
            let mut consumers = lock_ignore_poison(&self.consumers);
            for queue in &queues {
                let sub = consumers
                    .messages
                    .entry(queue.clone())
                    .or_insert_with(|| Subscription {
                        handler: handler.clone(),
                        active: None,
                    });
                if !sub.is_live() {
                    sub.handler = handler.clone();
                }
            }
        }
        self.resubscribe_on_loss(MESSAGES_CALLBACK, |core| async move {
            let queues: Vec<String> = lock_ignore_poison(&core.consumers).messages.keys().cloned().collect();
            for queue in queues {
                if let Err(err) = core.start_message_consumer(&queue).await {
                    log_error!("{core}: resubscribe to {queue} failed: {err}");
                }
            }
        });

        for queue in &queues {
            self.start_message_consumer(queue).await?;
        }
        Ok(())
    }

    async fn start_message_consumer(self: &Arc<Self>, queue: &str) -> Result<()> {
        // ---
        let handler = match lock_ignore_poison(&self.consumers).messages.get(queue) {
            Some(sub) if !sub.is_live() => sub.handler.clone(),
            _ => return Ok(()),
        };

        let prefetch = self.config.messages_prefetch_count;
        let (channel, handle) = self
            .pull_retry
            .run("consume_messages", || self.open_consumer(queue, prefetch))
            .await?;
        let active = self.spawn_consume_loop("consume_messages", channel, handle, move |core, channel, delivery| {
            core.on_message_delivery(channel, delivery, handler.clone())
        });

        let stale = match lock_ignore_poison(&self.consumers).messages.get_mut(queue) {
            Some(sub) => sub.active.replace(active),
            None => Some(active),
        };
        if let Some(stale) = stale {
            stale.stop(self).await;
        }
        log_info!("{self}: consuming messages from {queue}");
        Ok(())
    }

    async fn on_message_delivery(
        self: Arc<Self>,
        channel: ChannelPtr,
        delivery: Delivery,
        handler: MessageHandler,
    ) {
        // ---
        let tag = delivery.delivery_tag;
        let data = match self.serializer.loads(&delivery.body) {
            Ok(data) => data,
            Err(err) => {
                log_error!("{self}: undecodable message on {} dropped: {err}", delivery.routing_key);
                self.ack(&channel, tag).await;
                return;
            }
        };

        let props = delivery.properties;
        let mut message = Message::new(delivery.exchange, data);
        if let Some(id) = props.message_id.as_deref().and_then(|id| id.parse().ok()) {
            message.message_id = id;
        }
        message.priority = props.priority;
        message.ttl = props.ttl();
        message.ack_late = props
            .headers
            .get(ACK_LATE_HEADER)
            .is_some_and(|v| v == "true");

        let ack_late = message.ack_late;
        let message_id = message.message_id;
        if !ack_late {
            self.ack(&channel, tag).await;
        }
        if let Err(err) = tokio::spawn(handler(message)).await {
            log_error!("{self}: handler for message {message_id} failed: {err}");
        }
        if ack_late {
            self.ack(&channel, tag).await;
        }
    }

    /// Stop consuming `queues`, or every message queue when `None`.
    pub(crate) async fn stop_consume_messages(self: &Arc<Self>, queues: Option<&[String]>) -> Result<()> {
        // ---
        let (removed, none_left) = {
            let mut consumers = lock_ignore_poison(&self.consumers);
            let removed: Vec<_> = match queues {
                None => consumers.messages.drain().collect(),
                Some(queues) => queues
                    .iter()
                    .filter_map(|q| consumers.messages.remove_entry(q))
                    .collect(),
            };
            (removed, consumers.messages.is_empty())
        };
        if none_left {
            self.conn.remove_callback(CallbackKind::OnLost, MESSAGES_CALLBACK);
        }

        for (queue, sub) in removed {
            if let Some(active) = sub.active {
                active.stop(self).await;
            }
            log_info!("{self}: stopped consuming messages from {queue}");
        }
        Ok(())
    }

    /// Fresh channel consuming `queue`, declared and bound first.
    async fn open_consumer(&self, queue: &str, prefetch: u16) -> Result<(ChannelPtr, ConsumerHandle)> {
        // ---
        let channel = self.new_channel().await?;
        let opened = async {
            self.topology
                .declare_tasks_queue(&channel, &self.config, queue)
                .await?;
            self.call(channel.basic_qos(prefetch)).await?;
            self.call(channel.basic_consume(queue, ConsumeOptions::default()))
                .await
        }
        .await;

        match opened {
            Ok(handle) => Ok((channel, handle)),
            Err(err) => {
                let _ = channel.close().await;
                Err(err)
            }
        }
    }

    /// Drain `handle`, running `on_delivery` for each delivery once a pool
    /// permit is available.
    fn spawn_consume_loop<F, Fut>(
        self: &Arc<Self>,
        name: &str,
        channel: ChannelPtr,
        handle: ConsumerHandle,
        on_delivery: F,
    ) -> ActiveConsumer
    where
        F: Fn(Arc<Core>, ChannelPtr, Delivery) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let weak = Arc::downgrade(self);
        let deliveries = channel.clone();
        let mut inbox = handle.inbox;
        let tag = handle.consumer_tag.clone();

        let task = self.tasks.spawn(name, async move {
            // ---
            while let Some(delivery) = inbox.recv().await {
                let Some(core) = weak.upgrade() else { break };
                let Ok(permit) = core.semaphore.clone().acquire_owned().await else {
                    break;
                };
                let work = on_delivery(core, deliveries.clone(), delivery);
                tokio::spawn(async move {
                    let _permit = permit;
                    work.await;
                });
            }
            log_debug!("consumer {tag} ended");
        });

        ActiveConsumer {
            channel,
            consumer_tag: handle.consumer_tag,
            task: task.abort_handle(),
        }
    }

    /// Register (or replace) the on-lost hook `name` running `resubscribe`.
    pub(crate) fn resubscribe_on_loss<F, Fut>(self: &Arc<Self>, name: &str, resubscribe: F)
    where
        F: Fn(Arc<Core>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        // ---
        let weak = Arc::downgrade(self);
        let resubscribe = Arc::new(resubscribe);
        self.conn.add_callback(
            CallbackKind::OnLost,
            name,
            move || {
                let weak = weak.clone();
                let resubscribe = resubscribe.clone();
                async move {
                    if let Some(core) = weak.upgrade() {
                        if !core.closed.is_cancelled() {
                            resubscribe(core).await;
                        }
                    }
                    Ok(())
                }
            },
            false,
        );
    }

    pub(crate) async fn ack(&self, channel: &ChannelPtr, delivery_tag: u64) {
        if let Err(err) = self.call(channel.basic_ack(delivery_tag)).await {
            log_warn!("{self}: ack of {delivery_tag} failed: {err}");
        }
    }
}
