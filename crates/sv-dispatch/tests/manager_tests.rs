//! Manager, fetcher and launcher tests against the in-memory backend
//!
//! Tests for:
//! - Busy processors never exceed the group concurrency
//! - Weighted round robin dispatch order
//! - FIFO ordering with hold-until-processed
//! - Worker errors and panics never stop the manager
//! - Graceful and forced stop
//! - Fetch retries and `raise_errors`
//! - Launcher queue validation and lifecycle events

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sv_common::{Group, OutgoingMessage, Payload, QueueAttributes, QueueConfiguration, ReceivedMessage};
use sv_dispatch::polling::shared_strategy;
use sv_dispatch::{
    Body, BodyParser, Context, DispatchError, DispatchOptions, EnqueueBody, Enqueuer, ErrorContext, Fetcher,
    Launcher, LifecycleEvent, Manager, ManagerState, Worker, WorkerDefinition, WorkerOptions, WorkerRegistry,
};
use sv_queue::{BatchFailure, DeleteEntry, InMemoryQueueClient, QueueClient, QueueError, ReceiveRequest};

type Events = Arc<Mutex<Vec<LifecycleEvent>>>;

fn client() -> Arc<InMemoryQueueClient> {
    Arc::new(InMemoryQueueClient::new().with_wait_time_seconds(1))
}

fn fast_options() -> DispatchOptions {
    DispatchOptions {
        raise_errors: false,
        fetch_retry_backoff: Duration::from_millis(1),
        fetch_error_backoff: Duration::from_millis(10),
    }
}

fn context(client: Arc<dyn QueueClient>, registry: Arc<WorkerRegistry>) -> (Arc<Context>, Events) {
    let events: Events = Arc::new(Mutex::new(Vec::new()));
    let mut ctx = Context::new(client, registry).with_options(fast_options());
    let recorder = events.clone();
    ctx.on_event(move |event| recorder.lock().push(event.clone()));
    (Arc::new(ctx), events)
}

async fn wait_until(condition: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(300), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn send(client: &InMemoryQueueClient, queue: &str, body: &str) {
    let mut message = OutgoingMessage::new(body);
    if queue.ends_with(".fifo") {
        message = message.with_group("g1");
    }
    client.send_message(queue, message).await.unwrap();
}

/// Tracks concurrent performs and the bodies it saw
#[derive(Clone, Default)]
struct TrackingWorker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    done: Arc<AtomicUsize>,
    bodies: Arc<Mutex<Vec<String>>>,
    sleep: Duration,
}

#[async_trait]
impl Worker for TrackingWorker {
    async fn perform(&self, _payload: &Payload, body: &Body) -> anyhow::Result<()> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.bodies
            .lock()
            .push(body.as_text().unwrap_or_default().to_string());
        tokio::time::sleep(self.sleep).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        self.done.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn register(registry: &WorkerRegistry, name: &str, queue: &str, worker: TrackingWorker) {
    registry
        .register_worker(WorkerDefinition::new(
            name,
            WorkerOptions::new(queue).auto_delete(true),
            move || worker.clone(),
        ))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_busy_never_exceeds_concurrency() {
    let client = client();
    client.create_queue("default", 30);
    for i in 0..20 {
        send(&client, "default", &format!("m{i}")).await;
    }
    let registry = Arc::new(WorkerRegistry::new());
    let worker = TrackingWorker {
        sleep: Duration::from_millis(250),
        ..Default::default()
    };
    register(&registry, "TrackingWorker", "default", worker.clone());

    let (ctx, events) = context(client.clone(), registry);
    let manager = Manager::new(ctx, Group::new("default", 3).with_queue("default", 1));
    manager.start();

    let done = worker.done.clone();
    wait_until(|| done.load(Ordering::SeqCst) == 20).await;
    manager.stop(None).await;

    assert!(worker.peak.load(Ordering::SeqCst) <= 3);
    assert!(worker.peak.load(Ordering::SeqCst) >= 2);
    assert!(client.is_empty("default"));
    for event in events.lock().iter() {
        if let LifecycleEvent::UtilizationUpdate { max, busy, .. } = event {
            assert_eq!(*max, 3);
            assert!(*busy <= 3);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_weighted_round_robin_dispatch_order() {
    let client = client();
    let registry = Arc::new(WorkerRegistry::new());
    for queue in ["a", "b"] {
        client.create_queue(queue, 30);
        for i in 0..10 {
            send(&client, queue, &format!("{queue}{i}")).await;
        }
        register(&registry, &format!("{queue}Worker"), queue, TrackingWorker::default());
    }

    let (ctx, events) = context(client.clone(), registry);
    let group = Group::new("default", 1).with_queue("a", 3).with_queue("b", 1);
    let manager = Manager::new(ctx, group);
    manager.start();

    let recorded = events.clone();
    let dispatches = move || {
        recorded
            .lock()
            .iter()
            .filter_map(|event| match event {
                LifecycleEvent::Dispatch { queue, .. } => Some(queue.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
    };
    let counter = dispatches.clone();
    wait_until(move || counter().len() >= 8).await;
    manager.stop(None).await;

    assert_eq!(&dispatches()[..8], &["a", "a", "a", "b", "a", "a", "a", "b"]);
}

#[tokio::test(start_paused = true)]
async fn test_fifo_messages_processed_in_order_one_at_a_time() {
    let client = client();
    client.create_queue("orders.fifo", 30);
    for body in ["first", "second", "third", "fourth"] {
        send(&client, "orders.fifo", body).await;
    }
    let registry = Arc::new(WorkerRegistry::new());
    let worker = TrackingWorker {
        sleep: Duration::from_millis(200),
        ..Default::default()
    };
    register(&registry, "OrderWorker", "orders.fifo", worker.clone());

    let (ctx, _) = context(client.clone(), registry);
    let manager = Manager::new(ctx, Group::new("default", 5).with_queue("orders.fifo", 1));
    manager.start();

    let done = worker.done.clone();
    wait_until(|| done.load(Ordering::SeqCst) == 4).await;
    manager.stop(None).await;

    assert_eq!(*worker.bodies.lock(), vec!["first", "second", "third", "fourth"]);
    assert_eq!(worker.peak.load(Ordering::SeqCst), 1);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Order {
    id: u64,
    sku: String,
}

#[derive(Clone)]
struct OrderWorker {
    seen: Arc<Mutex<Vec<Order>>>,
}

#[async_trait]
impl Worker for OrderWorker {
    async fn perform(&self, _payload: &Payload, body: &Body) -> anyhow::Result<()> {
        self.seen.lock().push(body.deserialize::<Order>()?);
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn test_json_round_trip_through_enqueuer_and_manager() {
    let client = client();
    client.create_queue("orders", 30);
    let registry = Arc::new(WorkerRegistry::new());
    let worker = OrderWorker {
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let factory = worker.clone();
    registry
        .register_worker(WorkerDefinition::new(
            "OrderWorker",
            WorkerOptions::new("orders")
                .auto_delete(true)
                .body_parser(BodyParser::Json),
            move || factory.clone(),
        ))
        .unwrap();

    let order = Order {
        id: 7,
        sku: "SKU-1".to_string(),
    };
    let enqueuer = Enqueuer::new(client.clone(), registry.clone());
    enqueuer
        .perform_async("OrderWorker", EnqueueBody::json(&order).unwrap())
        .await
        .unwrap();

    let (ctx, _) = context(client.clone(), registry);
    let manager = Manager::new(ctx, Group::new("default", 2).with_queue("orders", 1));
    manager.start();

    let seen = worker.seen.clone();
    wait_until(|| !seen.lock().is_empty()).await;
    manager.stop(None).await;

    assert_eq!(*worker.seen.lock(), vec![order]);
    assert!(client.is_empty("orders"));
}

struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    async fn perform(&self, _payload: &Payload, _body: &Body) -> anyhow::Result<()> {
        Err(anyhow::anyhow!("payment gateway down"))
    }
}

#[tokio::test(start_paused = true)]
async fn test_worker_error_reaches_error_handlers_and_keeps_message() {
    let client = client();
    client.create_queue("payments", 30);
    send(&client, "payments", "charge").await;
    let registry = Arc::new(WorkerRegistry::new());
    registry
        .register_worker(WorkerDefinition::new(
            "PaymentWorker",
            WorkerOptions::new("payments").auto_delete(true),
            || FailingWorker,
        ))
        .unwrap();

    let errors: Arc<Mutex<Vec<(String, ErrorContext)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = errors.clone();
    let mut ctx = Context::new(client.clone(), registry).with_options(fast_options());
    ctx.on_error(move |err, context| recorder.lock().push((err.to_string(), context.clone())));
    let manager = Manager::new(Arc::new(ctx), Group::new("default", 2).with_queue("payments", 1));
    manager.start();

    let recorded = errors.clone();
    wait_until(move || !recorded.lock().is_empty()).await;
    assert!(manager.running());
    manager.stop(None).await;

    let errors = errors.lock();
    assert_eq!(errors[0].0, "payment gateway down");
    assert_eq!(errors[0].1.worker, "PaymentWorker");
    assert_eq!(errors[0].1.queue, "payments");
    assert_eq!(errors[0].1.message_ids.len(), 1);
    assert_eq!(client.len("payments"), 1);
}

struct PanickingWorker {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Worker for PanickingWorker {
    async fn perform(&self, _payload: &Payload, _body: &Body) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        panic!("worker bug");
    }
}

#[tokio::test(start_paused = true)]
async fn test_panicking_worker_does_not_crash_manager() {
    let client = client();
    client.create_queue("default", 30);
    send(&client, "default", "a").await;
    send(&client, "default", "b").await;
    let registry = Arc::new(WorkerRegistry::new());
    let calls = Arc::new(AtomicUsize::new(0));
    let factory_calls = calls.clone();
    registry
        .register_worker(WorkerDefinition::new(
            "PanickingWorker",
            WorkerOptions::new("default"),
            move || PanickingWorker {
                calls: factory_calls.clone(),
            },
        ))
        .unwrap();

    let (ctx, _) = context(client.clone(), registry);
    let manager = Manager::new(ctx, Group::new("default", 2).with_queue("default", 1));
    manager.start();

    let observed = calls.clone();
    wait_until(move || observed.load(Ordering::SeqCst) >= 2).await;
    wait_until(|| manager.busy() == 0).await;

    assert!(manager.running());
    assert_eq!(manager.ready(), 2);
    manager.stop(None).await;
}

#[tokio::test(start_paused = true)]
async fn test_stop_is_idempotent_and_drains() {
    let client = client();
    client.create_queue("default", 30);
    send(&client, "default", "x").await;
    let registry = Arc::new(WorkerRegistry::new());
    let worker = TrackingWorker {
        sleep: Duration::from_secs(5),
        ..Default::default()
    };
    register(&registry, "SlowWorker", "default", worker.clone());

    let (ctx, _) = context(client.clone(), registry);
    let manager = Manager::new(ctx, Group::new("default", 1).with_queue("default", 1));
    manager.start();

    let current = worker.current.clone();
    wait_until(move || current.load(Ordering::SeqCst) == 1).await;

    manager.stop(None).await;
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert_eq!(worker.done.load(Ordering::SeqCst), 1);
    assert!(client.is_empty("default"));

    manager.stop(None).await;
    manager.stop(Some(Duration::from_secs(1))).await;
    assert_eq!(manager.state(), ManagerState::Stopped);
    assert!(!manager.running());
}

#[tokio::test(start_paused = true)]
async fn test_stop_with_timeout_aborts_in_flight_work() {
    let client = client();
    client.create_queue("default", 30);
    send(&client, "default", "x").await;
    let registry = Arc::new(WorkerRegistry::new());
    let worker = TrackingWorker {
        sleep: Duration::from_secs(3600),
        ..Default::default()
    };
    register(&registry, "StuckWorker", "default", worker.clone());

    let (ctx, _) = context(client.clone(), registry);
    let manager = Manager::new(ctx, Group::new("default", 1).with_queue("default", 1));
    manager.start();

    let current = worker.current.clone();
    wait_until(move || current.load(Ordering::SeqCst) == 1).await;

    let started = tokio::time::Instant::now();
    manager.stop(Some(Duration::from_secs(2))).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert_eq!(manager.busy(), 0);
    assert_eq!(worker.done.load(Ordering::SeqCst), 0);
    // Never deleted, SQS redelivers it
    assert_eq!(client.len("default"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_empty_queue_is_paused_for_delay() {
    let client = client();
    client.create_queue("quiet", 30);
    client.create_queue("busy", 30);
    let registry = Arc::new(WorkerRegistry::new());
    register(&registry, "QuietWorker", "quiet", TrackingWorker::default());
    register(&registry, "BusyWorker", "busy", TrackingWorker::default());

    let (ctx, _) = context(client.clone(), registry);
    let group = Group::new("default", 1)
        .with_delay(60.0)
        .with_queue("quiet", 1)
        .with_queue("busy", 1);
    let manager = Manager::new(ctx, group);
    manager.start();

    // Both queues come back empty once and are paused
    let polled = client.clone();
    wait_until(move || polled.receive_calls() >= 2).await;
    tokio::time::sleep(Duration::from_secs(5)).await;
    let calls = client.receive_calls();
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(client.receive_calls(), calls);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(client.receive_calls() > calls);
    manager.stop(None).await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_receives_do_not_spin_the_dispatch_loop() {
    // No long polling: every receive answers at once
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("idle", 30);
    let registry = Arc::new(WorkerRegistry::new());
    register(&registry, "IdleWorker", "idle", TrackingWorker::default());

    let (ctx, _) = context(client.clone(), registry);
    let manager = Manager::new(ctx, Group::new("default", 2).with_queue("idle", 1));
    manager.start();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let calls = client.receive_calls();
    assert!((1..=11).contains(&calls), "{calls} receives in one second");

    manager.stop(None).await;
    assert_eq!(manager.state(), ManagerState::Stopped);
}

#[tokio::test]
async fn test_fetcher_caches_fifo_flag() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("orders.fifo", 30);
    send(&client, "orders.fifo", "first").await;
    let (ctx, _) = context(client.clone(), Arc::new(WorkerRegistry::new()));
    let strategy = shared_strategy(&Group::new("default", 1).with_queue("orders.fifo", 1));
    let fetcher = Fetcher::new(ctx, "default");
    let queue = QueueConfiguration::new("orders.fifo");

    let first = fetcher.fetch(&queue, 5, &strategy).await.unwrap();
    assert!(first.fifo);
    assert_eq!(first.messages.len(), 1);

    for _ in 0..3 {
        let again = fetcher.fetch(&queue, 5, &strategy).await.unwrap();
        assert!(again.fifo);
        assert!(again.messages.is_empty());
    }
    assert_eq!(client.receive_calls(), 4);
    assert_eq!(client.attribute_calls(), 1);
}

/// Fails the first `failures` receives, then delegates
struct FlakyClient {
    inner: InMemoryQueueClient,
    failures: AtomicUsize,
    receives: AtomicUsize,
}

#[async_trait]
impl QueueClient for FlakyClient {
    async fn receive_messages(&self, queue: &str, request: ReceiveRequest) -> sv_queue::Result<Vec<ReceivedMessage>> {
        self.receives.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(QueueError::Sqs("connection reset".to_string()));
        }
        self.inner.receive_messages(queue, request).await
    }

    async fn delete_messages(&self, queue: &str, entries: Vec<DeleteEntry>) -> sv_queue::Result<Vec<BatchFailure>> {
        self.inner.delete_messages(queue, entries).await
    }

    async fn send_message(&self, queue: &str, message: OutgoingMessage) -> sv_queue::Result<String> {
        self.inner.send_message(queue, message).await
    }

    async fn get_attributes(&self, queue: &str) -> sv_queue::Result<QueueAttributes> {
        self.inner.get_attributes(queue).await
    }

    async fn change_visibility(&self, queue: &str, receipt_handle: &str, seconds: u32) -> sv_queue::Result<()> {
        self.inner.change_visibility(queue, receipt_handle, seconds).await
    }
}

async fn flaky(failures: usize) -> Arc<FlakyClient> {
    let inner = InMemoryQueueClient::new();
    inner.create_queue("default", 30);
    send(&inner, "default", "x").await;
    Arc::new(FlakyClient {
        inner,
        failures: AtomicUsize::new(failures),
        receives: AtomicUsize::new(0),
    })
}

#[tokio::test(start_paused = true)]
async fn test_fetch_retries_transient_errors() {
    let client = flaky(2).await;
    let (ctx, _) = context(client.clone(), Arc::new(WorkerRegistry::new()));
    let strategy = shared_strategy(&Group::new("default", 1).with_queue("default", 1));

    let fetched = Fetcher::new(ctx, "default")
        .fetch(&QueueConfiguration::new("default"), 5, &strategy)
        .await
        .unwrap();
    assert_eq!(fetched.messages.len(), 1);
    assert!(!fetched.fifo);
    assert_eq!(client.receives.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fetch_errors_are_swallowed_unless_raise_errors() {
    let client = flaky(100).await;
    let (ctx, _) = context(client.clone(), Arc::new(WorkerRegistry::new()));
    let strategy = shared_strategy(&Group::new("default", 1).with_queue("default", 1));

    let fetched = Fetcher::new(ctx, "default")
        .fetch(&QueueConfiguration::new("default"), 5, &strategy)
        .await
        .unwrap();
    assert!(fetched.messages.is_empty());
    // One attempt plus three retries
    assert_eq!(client.receives.load(Ordering::SeqCst), 4);

    let options = DispatchOptions {
        raise_errors: true,
        ..fast_options()
    };
    let ctx = Arc::new(Context::new(client.clone(), Arc::new(WorkerRegistry::new())).with_options(options));
    let err = Fetcher::new(ctx, "default")
        .fetch(&QueueConfiguration::new("default"), 5, &strategy)
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Fetch { ref queue, .. } if queue == "default"));
}

#[tokio::test]
async fn test_launcher_rejects_missing_queue() {
    let client = client();
    client.create_queue("present", 30);
    let (ctx, events) = context(client, Arc::new(WorkerRegistry::new()));
    let launcher = Launcher::new(
        ctx,
        vec![Group::new("default", 1).with_queue("present", 1).with_queue("missing", 1)],
    );

    let err = launcher.start().await.unwrap_err();
    assert!(matches!(err, DispatchError::Queue(QueueError::QueueNotFound(_))));
    assert!(events.lock().is_empty());
    assert!(!launcher.healthy());
}

#[tokio::test(start_paused = true)]
async fn test_launcher_lifecycle_events() {
    let client = client();
    client.create_queue("default", 30);
    client.create_queue("reports", 30);
    let registry = Arc::new(WorkerRegistry::new());
    register(&registry, "DefaultWorker", "default", TrackingWorker::default());
    register(&registry, "ReportWorker", "reports", TrackingWorker::default());

    let (ctx, events) = context(client, registry);
    let launcher = Launcher::new(
        ctx,
        vec![
            Group::new("default", 2).with_queue("default", 1),
            Group::new("reports", 1).with_queue("reports", 1),
        ],
    );
    launcher.start().await.unwrap();
    assert!(launcher.healthy());
    assert_eq!(launcher.managers().len(), 2);

    tokio::time::sleep(Duration::from_secs(2)).await;
    launcher.stop().await;
    launcher.stop().await;
    assert!(!launcher.healthy());

    let lifecycle: Vec<LifecycleEvent> = events
        .lock()
        .iter()
        .filter(|event| {
            !matches!(
                event,
                LifecycleEvent::Dispatch { .. } | LifecycleEvent::UtilizationUpdate { .. }
            )
        })
        .cloned()
        .collect();
    assert_eq!(
        lifecycle,
        vec![
            LifecycleEvent::Startup,
            LifecycleEvent::Quiet,
            LifecycleEvent::Shutdown,
            LifecycleEvent::Stopped
        ]
    );

    let err = launcher.start().await.unwrap_err();
    assert!(matches!(err, DispatchError::ShutdownInProgress));
}
