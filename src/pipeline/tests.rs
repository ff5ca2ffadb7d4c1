//! Lifecycle tests: start order, shutdown order and drain behaviour.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::pipeline::bus::InMemoryBus;
use crate::types::{MessageId, NormalizedEvent};

fn event(id: &str) -> NormalizedEvent {
    NormalizedEvent::new(id, "test://lifecycle", "test.event", Utc::now(), b"{}".to_vec())
}

fn publisher_config(max_events: usize) -> PublisherConfig {
    PublisherConfig {
        topic: "events".to_string(),
        limits: BatchLimits {
            max_events,
            max_bytes: usize::MAX,
            max_linger: Duration::from_secs(60),
        },
        retry: RetryConfig::NONE,
    }
}

/// Emits a fixed set of events on start and an optional final event when
/// told to stop.
struct ScriptedSource {
    name: String,
    events: Vec<NormalizedEvent>,
    on_stop: Option<NormalizedEvent>,
    fail_start: bool,
    log: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSource {
    fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
        ScriptedSource {
            name: name.to_string(),
            events: Vec::new(),
            on_stop: None,
            fail_start: false,
            log: Arc::clone(log),
        }
    }
}

impl Source for ScriptedSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(
        self: Box<Self>,
        sink: EventSink,
        shutdown: CancellationToken,
    ) -> Result<RunningSource, SourceError> {
        if self.fail_start {
            return Err(SourceError::Startup {
                name: self.name.clone(),
                message: "refused".to_string(),
            });
        }

        let ScriptedSource {
            name,
            events,
            on_stop,
            log,
            ..
        } = *self;
        log.lock().unwrap().push(format!("start {}", name));

        let task_name = name.clone();
        Ok(RunningSource::spawn(name, &shutdown, move |stop| async move {
            for event in events {
                let _ = sink.offer(event);
            }
            stop.cancelled().await;
            if let Some(event) = on_stop {
                let _ = sink.offer(event);
            }
            log.lock().unwrap().push(format!("stop {}", task_name));
        }))
    }
}

/// Wraps the in-memory bus and records when `close` is called.
struct LoggingBus {
    inner: InMemoryBus,
    log: Arc<Mutex<Vec<String>>>,
}

impl MessageBus for LoggingBus {
    async fn publish(&self, topic: &str, message: &BusMessage) -> Result<MessageId, BusError> {
        self.inner.publish(topic, message).await
    }

    async fn publish_batch(
        &self,
        topic: &str,
        messages: &[BusMessage],
    ) -> Result<Vec<MessageId>, BusError> {
        self.inner.publish_batch(topic, messages).await
    }

    async fn close(&self) -> Result<(), BusError> {
        self.log.lock().unwrap().push("close bus".to_string());
        self.inner.close().await
    }
}

#[tokio::test]
async fn shutdown_delivers_all_buffered_events_before_closing_bus() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(InMemoryBus::new());
    let mut source = ScriptedSource::new("burst", &log);
    source.events = (0..10).map(|i| event(&format!("e{}", i))).collect();

    let shutdown = CancellationToken::new();
    let running = Pipeline::new(Arc::clone(&bus), publisher_config(100))
        .with_source(source)
        .start(&shutdown)
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(1), async {
        while running.sink().accepted() < 10 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(bus.batch_sizes().is_empty(), "nothing flushes before shutdown");

    shutdown.cancel();
    let report = running.shutdown().await;

    let expected: Vec<String> = (0..10).map(|i| format!("e{}", i)).collect();
    assert_eq!(bus.delivered_ids(), expected);
    assert_eq!(report.events_published, 10);
    assert_eq!(report.events_failed, 0);
    assert!(bus.is_closed());
}

#[tokio::test]
async fn sources_stop_before_queue_closes_and_bus_closes_last() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(LoggingBus {
        inner: InMemoryBus::new(),
        log: Arc::clone(&log),
    });
    let mut source = ScriptedSource::new("collector", &log);
    source.on_stop = Some(event("farewell"));

    let shutdown = CancellationToken::new();
    let running = Pipeline::new(Arc::clone(&bus), publisher_config(100))
        .with_source(source)
        .start(&shutdown)
        .await
        .unwrap();

    let report = running.shutdown().await;

    // The event emitted while stopping is still delivered, so the queue was
    // open until the source had exited.
    assert_eq!(bus.inner.delivered_ids(), vec!["farewell"]);
    assert_eq!(report.events_published, 1);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["start collector", "stop collector", "close bus"]
    );
}

#[tokio::test]
async fn top_level_cancel_stops_sources() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(InMemoryBus::new());
    let shutdown = CancellationToken::new();
    let running = Pipeline::new(Arc::clone(&bus), publisher_config(100))
        .with_source(ScriptedSource::new("a", &log))
        .start(&shutdown)
        .await
        .unwrap();

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), async {
        while !log.lock().unwrap().iter().any(|l| l == "stop a") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("source should observe the top-level token");

    running.shutdown().await;
}

#[tokio::test]
async fn failed_source_start_stops_started_sources() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(InMemoryBus::new());
    let mut broken = ScriptedSource::new("broken", &log);
    broken.fail_start = true;

    let shutdown = CancellationToken::new();
    let result = Pipeline::new(Arc::clone(&bus), publisher_config(100))
        .with_source(ScriptedSource::new("healthy", &log))
        .with_source(broken)
        .start(&shutdown)
        .await;

    let err = result.unwrap_err();
    assert!(matches!(err, SourceError::Startup { ref name, .. } if name == "broken"));
    assert_eq!(*log.lock().unwrap(), vec!["start healthy", "stop healthy"]);
    assert!(!shutdown.is_cancelled());
}

#[tokio::test]
async fn dropped_events_are_reported() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let bus = Arc::new(InMemoryBus::new());
    let shutdown = CancellationToken::new();
    let running = Pipeline::new(Arc::clone(&bus), publisher_config(100))
        .with_queue_capacity(1)
        .with_source(ScriptedSource::new("idle", &log))
        .start(&shutdown)
        .await
        .unwrap();

    // Single-threaded runtime: the publisher cannot run between these two
    // offers, so the second one finds the queue full.
    running.sink().offer(event("kept")).unwrap();
    assert_eq!(running.sink().offer(event("lost")), Err(EnqueueError::Full));

    let report = running.shutdown().await;
    assert_eq!(report.events_dropped, 1);
    assert_eq!(report.events_published, 1);
    assert_eq!(bus.delivered_ids(), vec!["kept"]);
}
