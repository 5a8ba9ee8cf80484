//! Event fan-out.
//!
//! Events go out on the events exchange under a fixed routing key. Each
//! backend reads them from one queue of its own and dispatches every event
//! to the subscribers whose type filter accepts it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use super::inner::{ActiveConsumer, Core};
use super::EventHandler;
use crate::{
    // ---
    lock_ignore_poison,
    log_debug,
    log_error,
    log_info,
    CallbackKind,
    ChannelPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    QueueArguments,
    QueueSpec,
    Result,
};

pub(crate) const EVENTS_ROUTING_KEY: &str = "events";

const EVENTS_CALLBACK: &str = "consume_events";

pub(crate) struct EventSubscriber {
    handler: EventHandler,
    /// `None` accepts every type.
    event_types: Option<HashSet<String>>,
}

impl EventSubscriber {
    fn accepts(&self, event_type: &str) -> bool {
        self.event_types
            .as_ref()
            .map_or(true, |types| types.contains(event_type))
    }
}

#[derive(Default)]
pub(crate) struct EventSubscribers {
    pub(crate) subscribers: HashMap<String, EventSubscriber>,
    pub(crate) active: Option<ActiveConsumer>,
}

impl Core {
    pub(crate) fn events_queue(&self) -> String {
        format!("{}events.{}", self.config.events_queue_prefix, self.config.id)
    }

    /// Register `handler` under `subscriber_id` and make sure the events
    /// consumer runs.
    ///
    /// Registering an existing id replaces its handler and filter.
    pub(crate) async fn consume_events(
        self: &Arc<Self>,
        subscriber_id: &str,
        handler: EventHandler,
        event_types: Option<Vec<String>>,
    ) -> Result<()> {
        // ---
        self.ensure_running()?;
        lock_ignore_poison(&self.consumers).events.subscribers.insert(
            subscriber_id.to_string(),
            EventSubscriber {
                handler,
                event_types: event_types.map(|types| types.into_iter().collect()),
            },
        );
        self.resubscribe_on_loss(EVENTS_CALLBACK, |core| async move {
            if let Err(err) = core.start_events_consumer().await {
                log_error!("{core}: resubscribe to events failed: {err}");
            }
        });
        self.start_events_consumer().await
    }

    async fn start_events_consumer(self: &Arc<Self>) -> Result<()> {
        // ---
        {
            let consumers = lock_ignore_poison(&self.consumers);
            let events = &consumers.events;
            if events.subscribers.is_empty() || events.active.as_ref().is_some_and(ActiveConsumer::is_live) {
                return Ok(());
            }
        }

        let (channel, handle) = self
            .pull_retry
            .run("consume_events", || self.open_events_consumer())
            .await?;
        let active = self.spawn_events_loop(channel, handle);

        let stale = lock_ignore_poison(&self.consumers).events.active.replace(active);
        if let Some(stale) = stale {
            stale.stop(self).await;
        }
        log_info!("{self}: consuming events from {}", self.events_queue());
        Ok(())
    }

    async fn open_events_consumer(&self) -> Result<(ChannelPtr, ConsumerHandle)> {
        // ---
        let config = &self.config;
        let queue = self.events_queue();
        let channel = self.new_channel().await?;

        let opened = async {
            let spec = QueueSpec {
                name: queue.clone(),
                durable: config.events_queue_durable,
                auto_delete: !config.events_queue_durable,
                exclusive: false,
                arguments: QueueArguments {
                    queue_type: Some(config.events_queue_type),
                    max_priority: None,
                    expires: config.events_queue_ttl,
                },
            };
            self.call(channel.queue_declare(&spec)).await?;
            self.call(channel.queue_bind(&queue, &config.events_exchange, EVENTS_ROUTING_KEY))
                .await?;
            self.call(channel.basic_qos(config.events_prefetch_count)).await?;
            self.call(channel.basic_consume(&queue, ConsumeOptions::default()))
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

    fn spawn_events_loop(self: &Arc<Self>, channel: ChannelPtr, handle: ConsumerHandle) -> ActiveConsumer {
        // ---
        let weak: Weak<Core> = Arc::downgrade(self);
        let acks = channel.clone();
        let mut inbox = handle.inbox;

        let task = self.tasks.spawn("consume_events", async move {
            // ---
            while let Some(delivery) = inbox.recv().await {
                let Some(core) = weak.upgrade() else { break };
                core.on_event_delivery(&acks, delivery).await;
            }
        });

        ActiveConsumer {
            channel,
            consumer_tag: handle.consumer_tag,
            task: task.abort_handle(),
        }
    }

    async fn on_event_delivery(&self, channel: &ChannelPtr, delivery: Delivery) {
        // ---
        self.ack(channel, delivery.delivery_tag).await;
        let event = match self.serializer.loads_event(&delivery.body) {
            Ok(event) => event,
            Err(err) => {
                log_error!("{self}: undecodable event dropped: {err}");
                return;
            }
        };

        let handlers: Vec<EventHandler> = lock_ignore_poison(&self.consumers)
            .events
            .subscribers
            .values()
            .filter(|sub| sub.accepts(&event.event_type))
            .map(|sub| sub.handler.clone())
            .collect();
        log_debug!("{self}: event {} to {} subscribers", event.event_type, handlers.len());

        for handler in handlers {
            let work = handler(event.clone());
            let event_id = event.event_id;
            self.tasks.spawn("event_cb", async move {
                if let Err(err) = tokio::spawn(work).await {
                    log_error!("event callback for {event_id} failed: {err}");
                }
            });
        }
    }

    /// Drop `subscriber_id`, or every subscriber when `None`. The consumer
    /// stops once no subscriber is left.
    pub(crate) async fn stop_consume_events(self: &Arc<Self>, subscriber_id: Option<&str>) -> Result<()> {
        // ---
        let stopped = {
            let mut consumers = lock_ignore_poison(&self.consumers);
            let events = &mut consumers.events;
            match subscriber_id {
                Some(id) => {
                    events.subscribers.remove(id);
                }
                None => events.subscribers.clear(),
            }
            if events.subscribers.is_empty() {
                events.active.take()
            } else {
                None
            }
        };

        let none_left = lock_ignore_poison(&self.consumers).events.subscribers.is_empty();
        if none_left {
            self.conn.remove_callback(CallbackKind::OnLost, EVENTS_CALLBACK);
        }
        if let Some(active) = stopped {
            active.stop(self).await;
            log_info!("{self}: stopped consuming events");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use futures_util::FutureExt;

    #[test]
    fn test_subscriber_filter() {
        // ---
        let handler: EventHandler = Arc::new(|_: crate::Event| async {}.boxed());
        let all = EventSubscriber {
            handler: handler.clone(),
            event_types: None,
        };
        let some = EventSubscriber {
            handler,
            event_types: Some(["task.done".to_string()].into_iter().collect()),
        };

        assert!(all.accepts("anything"));
        assert!(some.accepts("task.done"));
        assert!(!some.accepts("task.started"));
    }
}
