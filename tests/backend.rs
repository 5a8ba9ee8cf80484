use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

use mom_taskq::{
    //
    create_memory_transport_with_broker,
    Backend,
    BackendBuilder,
    BackendConfig,
    BackendError,
    ConnectionRegistry,
    Event,
    MemoryBroker,
    Message,
    Result,
    ResultQueueMode,
    RetryDelays,
    TaskInstance,
    TaskResult,
};

/// Isolated broker and registry per test.
struct Harness {
    // ---
    broker: Arc<MemoryBroker>,
    registry: ConnectionRegistry,
}

impl Harness {
    // ---
    fn new() -> Self {
        // ---
        init_logging();

        Self {
            broker: MemoryBroker::new(),
            registry: ConnectionRegistry::new(),
        }
    }

    fn config(&self, id: &str) -> BackendConfig {
        // ---
        BackendConfig::default()
            .with_id(id)
            .with_timeout(Some(Duration::from_secs(2)))
            .with_push_retry(Some(RetryDelays::Fixed(vec![Duration::from_millis(50); 3])))
            .with_pull_retry(Some(RetryDelays::Fixed(vec![Duration::from_millis(50); 3])))
    }

    fn backend(&self, config: BackendConfig) -> Backend {
        // ---
        BackendBuilder::new(config)
            .transport(create_memory_transport_with_broker(self.broker.clone()))
            .registry(self.registry.clone())
            .build()
            .expect("valid config")
    }
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(what: &str, check: impl Fn() -> bool) {
    // ---
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Worker that answers every task on `queue` with `{"echo": args}`.
async fn echo_worker(worker: &Backend, queue: &str) -> Result<()> {
    // ---
    let pusher = worker.clone();
    worker
        .consume_tasks([queue], move |task: TaskInstance| {
            let pusher = pusher.clone();
            async move {
                let result = TaskResult::ok(json!({ "echo": task.args }));
                pusher.push_task_result(&task, &result).await.unwrap();
            }
        })
        .await
}

#[tokio::test]
async fn test_backends_share_one_connection() -> Result<()> {
    // ---
    let h = Harness::new();
    let a = h.backend(h.config("a"));
    let b = h.backend(h.config("b"));

    a.open().await?;
    b.open().await?;
    assert_eq!(h.broker.stats().connects, 1);
    assert_eq!(h.broker.open_connections(), 1);

    a.close().await?;
    assert_eq!(h.broker.open_connections(), 1, "b still holds the connection");

    b.close().await?;
    eventually("connection release", || h.broker.open_connections() == 0).await;
    Ok(())
}

#[tokio::test]
async fn test_queue_declared_once_per_connection() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("topology"));

    for _ in 0..2 {
        let mut task = TaskInstance::new("noop", "q1");
        backend.send_task(&mut task).await?;
    }
    assert_eq!(h.broker.stats().declares("q1"), 1);
    assert_eq!(h.broker.stats().binds("q1"), 1);
    assert_eq!(h.broker.queue_len("q1"), 2);

    h.broker.disconnect_all();
    eventually("reconnect", || h.broker.stats().connects == 2).await;

    let mut task = TaskInstance::new("noop", "q1");
    backend.send_task(&mut task).await?;
    assert_eq!(h.broker.stats().declares("q1"), 2);
    assert_eq!(h.broker.queue_len("q1"), 3);

    backend.close().await
}

#[tokio::test]
async fn test_plain_result_common_queue() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(h.config("caller"));
    let worker = h.backend(h.config("worker"));
    echo_worker(&worker, "math").await?;

    let mut task = TaskInstance::new("echo", "math").with_args(json!([1, 2]));
    caller.send_task(&mut task).await?;
    assert_eq!(
        task.data.extra_str("backend:id"),
        Some("caller"),
        "sender stamps its id"
    );

    let results = caller.pop_task_result(&task)?.collect().await?;
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].res, Some(json!({ "echo": [1, 2] })));

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_plain_result_direct_reply_to() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(
        h.config("caller")
            .with_results_queue_mode(ResultQueueMode::DirectReplyTo),
    );
    let worker = h.backend(h.config("worker"));
    echo_worker(&worker, "direct").await?;

    let mut task = TaskInstance::new("echo", "direct").with_args(json!("hi"));
    caller.send_task(&mut task).await?;

    let mut results = caller.pop_task_result(&task)?;
    let result = results.next().await.expect("one result")?;
    assert_eq!(result.res, Some(json!({ "echo": "hi" })));
    assert!(results.next().await.is_none());

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_plain_result_separate_queue() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(
        h.config("caller")
            .with_results_queue_mode(ResultQueueMode::Separate),
    );
    let worker = h.backend(h.config("worker"));
    echo_worker(&worker, "sep").await?;

    let mut task = TaskInstance::new("echo", "sep").with_args(json!(7));
    caller.send_task(&mut task).await?;
    let result_queue = format!("taskq.result.{}", task.task_id());

    let results = caller.pop_task_result(&task)?.collect().await?;
    assert_eq!(results[0].res, Some(json!({ "echo": 7 })));
    assert!(!h.broker.queue_exists(&result_queue), "result queue deleted");

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_streaming_results_end_at_closed_marker() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(h.config("caller"));
    let worker = h.backend(h.config("worker"));

    let pusher = worker.clone();
    worker
        .consume_tasks(["stream"], move |task: TaskInstance| {
            let pusher = pusher.clone();
            async move {
                for i in 0..3 {
                    let result = TaskResult::ok(json!(i)).with_idx("s", i);
                    pusher.push_task_result(&task, &result).await.unwrap();
                }
                pusher.close_task(&task, Some(("s".into(), 3))).await.unwrap();
            }
        })
        .await?;

    let mut task = TaskInstance::new("count", "stream");
    task.streaming = true;
    caller.send_task(&mut task).await?;

    let results = caller.pop_task_result(&task)?.collect().await?;
    let values: Vec<_> = results.into_iter().filter_map(|r| r.res).collect();
    assert_eq!(values, vec![json!(0), json!(1), json!(2)]);

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_stream_index_gap_is_an_error() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(h.config("caller"));
    let worker = h.backend(h.config("worker"));

    let pusher = worker.clone();
    worker
        .consume_tasks(["gappy"], move |task: TaskInstance| {
            let pusher = pusher.clone();
            async move {
                for i in [0, 2] {
                    let result = TaskResult::ok(json!(i)).with_idx("s", i);
                    pusher.push_task_result(&task, &result).await.unwrap();
                }
            }
        })
        .await?;

    let mut task = TaskInstance::new("gappy", "gappy");
    task.streaming = true;
    caller.send_task(&mut task).await?;

    let mut results = caller.pop_task_result(&task)?;
    assert_eq!(results.next().await.unwrap()?.res, Some(json!(0)));
    let err = results.next().await.unwrap().unwrap_err();
    assert!(matches!(
        err,
        BackendError::UnexpectedIndex {
            expected: 1,
            got: 2,
            ..
        }
    ));
    assert!(results.next().await.is_none(), "stream ends after an error");

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_stream_expires_when_results_stop() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(h.config("caller"));
    let worker = h.backend(h.config("worker"));

    let pusher = worker.clone();
    worker
        .consume_tasks(["slow"], move |task: TaskInstance| {
            let pusher = pusher.clone();
            async move {
                let first = TaskResult::ok(json!("first")).with_idx("s", 0);
                pusher.push_task_result(&task, &first).await.unwrap();
            }
        })
        .await?;

    let mut task = TaskInstance::new("slow", "slow");
    task.streaming = true;
    task.data.result_ttl = Some(Duration::from_millis(200));
    caller.send_task(&mut task).await?;

    let mut results = caller.pop_task_result(&task)?;
    assert_eq!(results.next().await.unwrap()?.res, Some(json!("first")));

    let next = tokio::time::timeout(Duration::from_secs(2), results.next())
        .await
        .expect("expiry wakes the reader");
    assert!(matches!(next, Some(Err(BackendError::ResultExpired(_)))));

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_result_not_requested() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("fire-and-forget"));

    let mut task = TaskInstance::new("noop", "ff");
    task.data.result_return = false;
    backend.send_task(&mut task).await?;

    let err = backend.pop_task_result(&task).unwrap_err();
    assert!(matches!(err, BackendError::ResultNotRequested(id) if id == task.task_id()));
    backend.close().await
}

#[tokio::test]
async fn test_graph_task_rejects_direct_reply_to() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(
        h.config("graph")
            .with_results_queue_mode(ResultQueueMode::DirectReplyTo),
    );

    let mut task = TaskInstance::new("node", "graphs");
    task.data.extra.insert("graph:id".into(), json!("g1"));

    let err = backend.send_task(&mut task).await.unwrap_err();
    assert!(matches!(err, BackendError::GraphUnsupported(_)));
    assert_eq!(h.broker.stats().connect_attempts, 0, "rejected before any I/O");
    backend.close().await
}

#[tokio::test]
async fn test_ack_before_handler_by_default() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("early"));
    let release = Arc::new(Notify::new());
    let (started_tx, mut started) = mpsc::unbounded_channel();

    let gate = release.clone();
    backend
        .consume_tasks(["early"], move |_task: TaskInstance| {
            let gate = gate.clone();
            let started_tx = started_tx.clone();
            async move {
                started_tx.send(()).unwrap();
                gate.notified().await;
            }
        })
        .await?;

    let mut task = TaskInstance::new("block", "early");
    task.data.result_return = false;
    backend.send_task(&mut task).await?;

    started.recv().await.unwrap();
    assert_eq!(h.broker.stats().acks, 1, "acked before the handler ran");

    release.notify_one();
    backend.close().await
}

#[tokio::test]
async fn test_ack_late_waits_for_handler() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("late"));
    let release = Arc::new(Notify::new());
    let (started_tx, mut started) = mpsc::unbounded_channel();

    let gate = release.clone();
    backend
        .consume_tasks(["late"], move |_task: TaskInstance| {
            let gate = gate.clone();
            let started_tx = started_tx.clone();
            async move {
                started_tx.send(()).unwrap();
                gate.notified().await;
            }
        })
        .await?;

    let mut task = TaskInstance::new("block", "late");
    task.data.result_return = false;
    task.data.ack_late = true;
    backend.send_task(&mut task).await?;

    started.recv().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.broker.stats().acks, 0, "not acked while the handler runs");

    release.notify_one();
    eventually("late ack", || h.broker.stats().acks == 1).await;
    backend.close().await
}

#[tokio::test]
async fn test_panicking_handler_still_acks() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("panicky"));

    backend
        .consume_tasks(["panicky"], |_task: TaskInstance| async move {
            panic!("handler blew up");
        })
        .await?;

    let mut task = TaskInstance::new("boom", "panicky");
    task.data.result_return = false;
    task.data.ack_late = true;
    backend.send_task(&mut task).await?;

    eventually("ack after panic", || h.broker.stats().acks == 1).await;
    assert_eq!(h.broker.queue_len("panicky"), 0);
    backend.close().await
}

#[tokio::test]
async fn test_pool_size_bounds_handlers() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(
        h.config("pool")
            .with_pool_size(1)
            .with_tasks_prefetch_count(10),
    );
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let (r, p, d) = (running.clone(), peak.clone(), done.clone());
    backend
        .consume_tasks(["pool"], move |_task: TaskInstance| {
            let (r, p, d) = (r.clone(), p.clone(), d.clone());
            async move {
                let now = r.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                r.fetch_sub(1, Ordering::SeqCst);
                d.fetch_add(1, Ordering::SeqCst);
            }
        })
        .await?;

    for _ in 0..4 {
        let mut task = TaskInstance::new("work", "pool");
        task.data.result_return = false;
        backend.send_task(&mut task).await?;
    }

    eventually("all tasks", || done.load(Ordering::SeqCst) == 4).await;
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    backend.close().await
}

#[tokio::test]
async fn test_consumers_resubscribe_after_connection_loss() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("resub"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    backend
        .consume_tasks(["q1", "q2", "q3"], move |task: TaskInstance| {
            let tx = tx.clone();
            async move {
                tx.send(task.task_name).unwrap();
            }
        })
        .await?;
    backend.stop_consume_tasks(Some(&["q3".to_string()])).await?;
    assert_eq!(h.broker.consumer_count("q1"), 1);
    assert_eq!(h.broker.consumer_count("q2"), 1);
    assert_eq!(h.broker.consumer_count("q3"), 0);

    h.broker.disconnect_all();
    eventually("reconnect", || h.broker.stats().connects == 2).await;
    eventually("resubscribe q1", || h.broker.consumer_count("q1") == 1).await;
    eventually("resubscribe q2", || h.broker.consumer_count("q2") == 1).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.broker.consumer_count("q3"), 0, "stopped queue stays stopped");

    for queue in ["q1", "q2"] {
        let mut task = TaskInstance::new(format!("after-loss-{queue}"), queue);
        task.data.result_return = false;
        backend.send_task(&mut task).await?;
        assert_eq!(rx.recv().await, Some(format!("after-loss-{queue}")));
    }

    backend.close().await
}

#[tokio::test]
async fn test_separate_result_survives_connection_loss() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(
        h.config("caller")
            .with_results_queue_mode(ResultQueueMode::Separate),
    );
    let worker = h.backend(h.config("worker"));

    let mut task = TaskInstance::new("slow", "sep-loss");
    caller.send_task(&mut task).await?;
    let result_queue = format!("taskq.result.{}", task.task_id());

    let mut results = caller.pop_task_result(&task)?;
    let waiting = tokio::spawn(async move { results.next().await });
    eventually("result consumer", || h.broker.consumer_count(&result_queue) == 1).await;

    h.broker.disconnect_all();
    eventually("reconnect", || h.broker.stats().connects == 2).await;
    eventually("result consumer reopened", || {
        h.broker.consumer_count(&result_queue) == 1
    })
    .await;

    worker
        .push_task_result(&task, &TaskResult::ok(json!("late")))
        .await?;
    let result = tokio::time::timeout(Duration::from_secs(2), waiting)
        .await
        .expect("result after reconnect")
        .unwrap();
    assert_eq!(result.unwrap()?.res, Some(json!("late")));
    eventually("result queue deleted", || !h.broker.queue_exists(&result_queue)).await;

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_concurrent_waiters_share_results() -> Result<()> {
    // ---
    let h = Harness::new();
    let caller = h.backend(h.config("caller"));
    let worker = h.backend(h.config("worker"));
    echo_worker(&worker, "shared").await?;

    let mut task = TaskInstance::new("echo", "shared").with_args(json!("both"));
    caller.send_task(&mut task).await?;

    let mut a = caller.pop_task_result(&task)?;
    let mut b = caller.pop_task_result(&task)?;
    let (a, b) = tokio::time::timeout(Duration::from_secs(2), async {
        tokio::join!(a.next(), b.next())
    })
    .await
    .expect("both waiters receive the result");

    assert_eq!(a.unwrap()?.res, Some(json!({ "echo": "both" })));
    assert_eq!(b.unwrap()?.res, Some(json!({ "echo": "both" })));

    worker.close().await?;
    caller.close().await
}

#[tokio::test]
async fn test_stop_consume_tasks() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("stopper"));

    backend
        .consume_tasks(["s1", "s2"], |_task: TaskInstance| async {})
        .await?;
    assert_eq!(h.broker.consumer_count("s1"), 1);
    assert_eq!(h.broker.consumer_count("s2"), 1);

    backend.stop_consume_tasks(Some(&["s1".to_string()])).await?;
    assert_eq!(h.broker.consumer_count("s1"), 0);
    assert_eq!(h.broker.consumer_count("s2"), 1);

    backend.stop_consume_tasks(None).await?;
    assert_eq!(h.broker.consumer_count("s2"), 0);
    backend.close().await
}

#[tokio::test]
async fn test_messages_round_trip() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("messages"));
    let (tx, mut rx) = mpsc::unbounded_channel();

    backend
        .consume_messages(["inbox"], move |message: Message| {
            let tx = tx.clone();
            async move {
                tx.send(message).unwrap();
            }
        })
        .await?;

    let mut message = Message::new("taskq", json!({ "hello": "world" }));
    message.ack_late = true;
    message.priority = Some(3);
    backend.send_message(&message, "inbox", None).await?;

    let received = rx.recv().await.unwrap();
    assert_eq!(received.message_id, message.message_id);
    assert_eq!(received.data, json!({ "hello": "world" }));
    assert_eq!(received.priority, Some(3));
    assert!(received.ack_late);

    backend.stop_consume_messages(None).await?;
    backend.close().await
}

#[tokio::test]
async fn test_events_filtered_by_type() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("events"));
    let (all_tx, mut all) = mpsc::unbounded_channel();
    let (done_tx, mut done) = mpsc::unbounded_channel();

    backend
        .consume_events(
            "all",
            move |event: Event| {
                let tx = all_tx.clone();
                async move {
                    tx.send(event.event_type).unwrap();
                }
            },
            None,
        )
        .await?;
    backend
        .consume_events(
            "done-only",
            move |event: Event| {
                let tx = done_tx.clone();
                async move {
                    tx.send(event.event_type).unwrap();
                }
            },
            Some(&["task.done"]),
        )
        .await?;

    backend.send_event(&Event::new("task.started", json!({}))).await?;
    backend.send_event(&Event::new("task.done", json!({}))).await?;

    let mut seen = vec![all.recv().await.unwrap(), all.recv().await.unwrap()];
    seen.sort();
    assert_eq!(seen, vec!["task.done", "task.started"]);
    assert_eq!(done.recv().await.as_deref(), Some("task.done"));

    backend.stop_consume_events(Some("all")).await?;
    assert_eq!(h.broker.consumer_count("taskq.events.events"), 1);
    backend.stop_consume_events(None).await?;
    assert_eq!(h.broker.consumer_count("taskq.events.events"), 0);
    backend.close().await
}

#[tokio::test]
async fn test_operations_fail_after_close() -> Result<()> {
    // ---
    let h = Harness::new();
    let backend = h.backend(h.config("closed"));
    backend.open().await?;
    backend.close().await?;
    backend.close().await?;

    let mut task = TaskInstance::new("late", "q");
    let err = backend.send_task(&mut task).await.unwrap_err();
    assert!(matches!(err, BackendError::ConnectionClosed(_)));
    assert!(backend.pop_task_result(&task).is_err());
    assert!(backend.is_closed());
    Ok(())
}

#[tokio::test]
async fn test_failover_to_second_broker() -> Result<()> {
    // ---
    let h = Harness::new();
    h.broker.set_host_down("primary", true);
    let config = BackendConfig::with_brokers(["amqp://primary", "amqp://secondary"])
        .with_id("failover")
        .with_timeout(Some(Duration::from_secs(2)));
    let backend = h.backend(config);

    backend.open().await?;
    assert_eq!(h.broker.stats().connected_hosts, vec!["secondary".to_string()]);
    backend.close().await
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
