//! Idempotent queue declarations, cached per connection epoch.

use std::collections::HashSet;
use std::sync::Mutex;

use super::timed;
use crate::{lock_ignore_poison, log_debug, BackendConfig, ChannelPtr, QueueArguments, QueueSpec, Result};

/// Set of task queues declared and bound on the current connection.
///
/// Cleared on connection loss and close, so the next use of a queue
/// declares it again.
#[derive(Default)]
pub(crate) struct TopologyManager {
    declared: Mutex<HashSet<String>>,
}

impl TopologyManager {
    /// Declare `name` and bind it to the tasks exchange under its own name,
    /// unless already done on this connection.
    pub(crate) async fn declare_tasks_queue(
        &self,
        channel: &ChannelPtr,
        config: &BackendConfig,
        name: &str,
    ) -> Result<()> {
        // ---
        if self.is_declared(name) {
            return Ok(());
        }

        let spec = QueueSpec {
            name: name.to_string(),
            durable: config.tasks_queue_durable,
            auto_delete: !config.tasks_queue_durable,
            exclusive: false,
            arguments: QueueArguments {
                queue_type: Some(config.tasks_queue_type),
                max_priority: Some(config.max_priority),
                expires: config.tasks_queue_ttl,
            },
        };
        timed(config.timeout, channel.queue_declare(&spec)).await?;
        timed(
            config.timeout,
            channel.queue_bind(name, &config.tasks_exchange, name),
        )
        .await?;

        log_debug!("declared tasks queue {name}");
        lock_ignore_poison(&self.declared).insert(name.to_string());
        Ok(())
    }

    pub(crate) fn is_declared(&self, name: &str) -> bool {
        lock_ignore_poison(&self.declared).contains(name)
    }

    pub(crate) fn forget(&self, name: &str) {
        lock_ignore_poison(&self.declared).remove(name);
    }

    pub(crate) fn clear(&self) {
        lock_ignore_poison(&self.declared).clear();
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{
        create_memory_transport_with_broker, BrokerUrl, ExchangeKind, ExchangeSpec, MemoryBroker,
    };

    #[tokio::test]
    async fn test_declare_once_per_epoch() {
        // ---
        let broker = MemoryBroker::new();
        let transport = create_memory_transport_with_broker(broker.clone());
        let url = BrokerUrl::parse("amqp://localhost").unwrap();
        let conn = transport.connect(&url, None).await.unwrap();
        let channel = conn.channel().await.unwrap();
        let config = BackendConfig::default();
        channel
            .exchange_declare(&ExchangeSpec {
                name: config.tasks_exchange.clone(),
                kind: ExchangeKind::Topic,
                durable: false,
                auto_delete: false,
            })
            .await
            .unwrap();

        let topology = TopologyManager::default();
        topology.declare_tasks_queue(&channel, &config, "q").await.unwrap();
        topology.declare_tasks_queue(&channel, &config, "q").await.unwrap();
        assert_eq!(broker.stats().declares("q"), 1);
        assert_eq!(broker.stats().binds("q"), 1);

        topology.clear();
        topology.declare_tasks_queue(&channel, &config, "q").await.unwrap();
        assert_eq!(broker.stats().declares("q"), 2);
        assert_eq!(broker.stats().binds("q"), 2);
    }
}
