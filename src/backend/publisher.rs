//! Outbound side: tasks, results, messages and events.
//!
//! Every publish runs as a named backend task under the push retry policy.
//! A retried attempt re-acquires the channel, so a publish interrupted by a
//! connection loss goes out on the reconnected channel.

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::events::EVENTS_ROUTING_KEY;
use super::inner::Core;
use crate::{
    // ---
    log_debug,
    models::keys,
    BackendError,
    Event,
    Message,
    MessageProperties,
    Publish,
    Result,
    ResultQueueMode,
    TaskInstance,
    TaskResult,
};

/// Message header carrying the sender's `ack_late` choice.
pub(crate) const ACK_LATE_HEADER: &str = "x-ack-late";

/// AMQP persistent delivery mode.
const PERSISTENT: u8 = 2;

fn now() -> Option<u64> {
    u64::try_from(Utc::now().timestamp()).ok()
}

impl Core {
    /// Publish `task` to its queue.
    ///
    /// Stamps the backend id and the effective result mode into the task's
    /// extra map before encoding.
    ///
    /// # Errors
    ///
    /// [`BackendError::GraphUnsupported`] for a graph task in direct
    /// reply-to mode, before any broker I/O.
    pub(crate) async fn send_task(self: &Arc<Self>, task: &mut TaskInstance) -> Result<()> {
        // ---
        self.ensure_running()?;
        let task_id = task.task_id();

        task.data
            .extra
            .insert(keys::BACKEND_ID.into(), Value::from(self.config.id.clone()));
        let mode = task.data.results_queue_mode(self.config.results_queue_mode);
        task.data.set_results_queue_mode(mode);

        if mode == ResultQueueMode::DirectReplyTo && task.data.is_graph() {
            return Err(BackendError::GraphUnsupported(format!(
                "task {task_id} is part of a graph and cannot use direct reply-to"
            )));
        }

        let reply_to = task
            .data
            .result_return
            .then(|| self.results.reply_to(mode, task_id));
        let publish = Publish {
            exchange: self.config.tasks_exchange.clone(),
            routing_key: task.data.queue.clone(),
            body: self.serializer.dumps_task_instance(task)?,
            properties: MessageProperties {
                delivery_mode: Some(PERSISTENT),
                message_id: Some(task_id.to_string()),
                correlation_id: Some(task_id.to_string()),
                timestamp: now(),
                priority: Some(task.data.priority),
                reply_to,
                ..Default::default()
            }
            .with_ttl(task.data.ttl),
        };

        log_debug!("{self}: send task {task_id} ({}) to {}", task.task_name, task.data.queue);
        let core = self.clone();
        let queue = task.data.queue.clone();
        self.tasks
            .run("send_task", async move {
                // ---
                core.push_retry
                    .run("send_task", || core.publish_task(&queue, mode, &publish))
                    .await
            })
            .await
    }

    async fn publish_task(&self, queue: &str, mode: ResultQueueMode, publish: &Publish) -> Result<()> {
        // ---
        let channel = self.channel().await?;
        self.topology
            .declare_tasks_queue(&channel, &self.config, queue)
            .await?;

        // The direct reply-to consumer only sees replies to messages
        // published on its own channel.
        let channel = match mode {
            ResultQueueMode::DirectReplyTo => self.reply_channel().await?,
            _ => channel,
        };
        self.call(channel.basic_publish(publish.clone())).await
    }

    /// Publish one result of `task` to the address its caller listens on.
    ///
    /// The reply address recorded at consume time wins; otherwise it is
    /// derived from the task's result mode.
    pub(crate) async fn push_task_result(
        self: &Arc<Self>,
        task: &TaskInstance,
        result: &TaskResult,
    ) -> Result<()> {
        // ---
        self.ensure_running()?;
        let task_id = task.task_id();
        let mode = task.data.results_queue_mode(self.config.results_queue_mode);

        let routing_key = match task.data.extra_str(keys::REPLY_TO) {
            Some(reply_to) => reply_to.to_string(),
            None => self.results.reply_to(mode, task_id),
        };
        let exchange = match mode {
            ResultQueueMode::DirectReplyTo => String::new(),
            _ => self.config.tasks_exchange.clone(),
        };
        let publish = Publish {
            exchange,
            routing_key,
            body: self.serializer.dumps_task_result(task, result)?,
            properties: MessageProperties {
                delivery_mode: Some(PERSISTENT),
                message_id: Some(task_id.to_string()),
                correlation_id: Some(task_id.to_string()),
                timestamp: now(),
                ..Default::default()
            }
            .with_ttl(task.data.result_ttl),
        };

        let core = self.clone();
        let task = task.clone();
        self.tasks
            .run("push_task_result", async move {
                // ---
                core.push_retry
                    .run("push_task_result", || core.publish_result(&task, mode, &publish))
                    .await
            })
            .await
    }

    async fn publish_result(
        &self,
        task: &TaskInstance,
        mode: ResultQueueMode,
        publish: &Publish,
    ) -> Result<()> {
        // ---
        let channel = self.channel().await?;
        if mode == ResultQueueMode::Separate {
            self.declare_result_queue(&channel, task).await?;
        }
        self.call(channel.basic_publish(publish.clone())).await
    }

    /// Publish a raw message to `message.exchange` under `routing_key`.
    ///
    /// `delivery_mode` defaults to persistent.
    pub(crate) async fn send_message(
        self: &Arc<Self>,
        message: &Message,
        routing_key: &str,
        delivery_mode: Option<u8>,
    ) -> Result<()> {
        // ---
        self.ensure_running()?;
        let mut headers = BTreeMap::new();
        headers.insert(ACK_LATE_HEADER.to_string(), message.ack_late.to_string());

        let publish = Publish {
            exchange: message.exchange.clone(),
            routing_key: routing_key.to_string(),
            body: self.serializer.dumps(&message.data)?,
            properties: MessageProperties {
                delivery_mode: Some(delivery_mode.unwrap_or(PERSISTENT)),
                message_id: Some(message.message_id.to_string()),
                timestamp: now(),
                priority: message.priority,
                headers,
                ..Default::default()
            }
            .with_ttl(message.ttl),
        };

        log_debug!("{self}: send message {} to {routing_key}", message.message_id);
        self.publish_retried("send_message", publish).await
    }

    /// Publish `event` on the events exchange.
    pub(crate) async fn send_event(self: &Arc<Self>, event: &Event) -> Result<()> {
        // ---
        self.ensure_running()?;
        let publish = Publish {
            exchange: self.config.events_exchange.clone(),
            routing_key: EVENTS_ROUTING_KEY.to_string(),
            body: self.serializer.dumps_event(event)?,
            properties: MessageProperties {
                delivery_mode: Some(PERSISTENT),
                message_id: Some(event.event_id.to_string()),
                timestamp: now(),
                ..Default::default()
            }
            .with_ttl(event.ttl),
        };

        log_debug!("{self}: send event {} ({})", event.event_id, event.event_type);
        self.publish_retried("send_event", publish).await
    }

    async fn publish_retried(self: &Arc<Self>, name: &'static str, publish: Publish) -> Result<()> {
        // ---
        let core = self.clone();
        self.tasks
            .run(name, async move {
                core.push_retry
                    .run(name, || async {
                        let channel = core.channel().await?;
                        core.call(channel.basic_publish(publish.clone())).await
                    })
                    .await
            })
            .await
    }
}
