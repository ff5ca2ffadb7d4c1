//! Scenario tests for the incremental collector against an in-memory feed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::cursor::CursorStore;
use crate::pipeline::{EnqueueError, EventSink, QueueReceiver, Source, fan_in};
use crate::types::{ConversionError, CursorToken, NormalizedEvent, RepoId};

const GROUP: &str = "acme";

/// Feed whose listings are scripted per repository.
#[derive(Default)]
struct MockFeed {
    keys: Mutex<Vec<RepoId>>,
    pages: Mutex<HashMap<String, Vec<Vec<FeedItem>>>>,
    /// Requests beyond this count fail, per repository.
    fail_after: Mutex<HashMap<String, usize>>,
    requests: Mutex<HashMap<String, usize>>,
}

impl MockFeed {
    fn with_repo(self, repo: &str, pages: Vec<Vec<FeedItem>>) -> Self {
        let key = RepoId::new(GROUP, repo);
        self.pages.lock().unwrap().insert(key.full_name(), pages);
        self.keys.lock().unwrap().push(key);
        self
    }

    fn set_pages(&self, repo: &str, pages: Vec<Vec<FeedItem>>) {
        self.pages
            .lock()
            .unwrap()
            .insert(RepoId::new(GROUP, repo).full_name(), pages);
    }

    fn fail(&self, repo: &str) {
        self.fail_after_requests(repo, 0);
    }

    fn fail_after_requests(&self, repo: &str, ok_requests: usize) {
        self.fail_after
            .lock()
            .unwrap()
            .insert(RepoId::new(GROUP, repo).full_name(), ok_requests);
    }

    fn requests(&self, repo: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .get(&RepoId::new(GROUP, repo).full_name())
            .copied()
            .unwrap_or(0)
    }
}

impl ActivityFeed for MockFeed {
    async fn list_keys(
        &self,
        _group: &str,
        _page: Option<PageToken>,
    ) -> Result<Page<RepoId>, FeedError> {
        Ok(Page::last(self.keys.lock().unwrap().clone()))
    }

    async fn list_page(
        &self,
        key: &RepoId,
        page: Option<PageToken>,
    ) -> Result<Page<FeedItem>, FeedError> {
        let name = key.full_name();
        let count = {
            let mut requests = self.requests.lock().unwrap();
            let count = requests.entry(name.clone()).or_default();
            *count += 1;
            *count
        };
        if let Some(ok_requests) = self.fail_after.lock().unwrap().get(&name)
            && count > *ok_requests
        {
            return Err(FeedError::Listing("connection reset".to_string()));
        }

        let pages = self
            .pages
            .lock()
            .unwrap()
            .get(&name)
            .cloned()
            .unwrap_or_default();
        let index = page
            .map(|p| p.as_str().parse::<usize>().unwrap())
            .unwrap_or(0);
        let items = pages.get(index).cloned().unwrap_or_default();
        let next = (index + 1 < pages.len()).then(|| PageToken::new((index + 1).to_string()));
        Ok(Page { items, next })
    }

    fn convert(
        &self,
        group: &str,
        key: &RepoId,
        item: &FeedItem,
    ) -> Result<NormalizedEvent, ConversionError> {
        if item.raw.get("malformed").is_some() {
            return Err(ConversionError::MissingField("type"));
        }
        Ok(NormalizedEvent::new(
            item.id.clone(),
            format!("//test/{}/{}", group, key.repo),
            "test.item",
            item.created_at,
            serde_json::to_vec(&item.raw)?,
        ))
    }
}

fn minutes_ago(minutes: i64) -> DateTime<Utc> {
    Utc::now() - chrono::Duration::minutes(minutes)
}

fn item(id: &str, age_minutes: i64) -> FeedItem {
    FeedItem {
        id: id.to_string(),
        created_at: minutes_ago(age_minutes),
        raw: serde_json::json!({ "id": id }),
    }
}

fn malformed(id: &str, age_minutes: i64) -> FeedItem {
    FeedItem {
        raw: serde_json::json!({ "id": id, "malformed": true }),
        ..item(id, age_minutes)
    }
}

/// Newest first: `ids[0]` is one minute old, `ids[1]` two minutes, ...
fn listing(ids: &[&str]) -> Vec<FeedItem> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| item(id, i as i64 + 1))
        .collect()
}

fn config(order: EmitOrder) -> CollectorConfig {
    let mut config = CollectorConfig::new(vec![GROUP.to_string()]);
    config.rate_per_sec = 0;
    config.enqueue_timeout = Duration::from_millis(20);
    config.emit_order = order;
    config
}

fn collector(feed: &Arc<MockFeed>, order: EmitOrder) -> IncrementalCollector<MockFeed> {
    IncrementalCollector::new(Arc::clone(feed), Arc::new(CursorStore::new()), config(order))
}

/// Takes everything currently buffered.
async fn drain(sink: &EventSink, rx: &mut QueueReceiver) -> Vec<String> {
    let mut ids = Vec::new();
    for _ in 0..sink.len() {
        ids.push(rx.recv().await.unwrap().id);
    }
    ids
}

fn cursor(collector: &IncrementalCollector<MockFeed>, repo: &str) -> CursorToken {
    collector.cursors().get(&RepoId::new(GROUP, repo).full_name())
}

#[tokio::test]
async fn first_run_emits_all_items_in_window_and_sets_cursor() {
    let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&["C", "B", "A"])]));
    let collector = collector(&feed, EmitOrder::ScanOrder);
    let (sink, mut rx) = fan_in(16);

    let report = collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(report.emitted, 3);
    assert_eq!(drain(&sink, &mut rx).await, vec!["C", "B", "A"]);
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("C"));
}

#[tokio::test]
async fn oldest_first_reverses_scan_order() {
    let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&["C", "B", "A"])]));
    let collector = collector(&feed, EmitOrder::OldestFirst);
    let (sink, mut rx) = fan_in(16);

    collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(drain(&sink, &mut rx).await, vec!["A", "B", "C"]);
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("C"));
}

#[tokio::test]
async fn stops_at_previous_cursor_and_advances_to_newest() {
    let feed = Arc::new(
        MockFeed::default().with_repo("widgets", vec![listing(&["D", "C", "B", "A"])]),
    );
    let collector = collector(&feed, EmitOrder::ScanOrder);
    collector
        .cursors()
        .set(&RepoId::new(GROUP, "widgets").full_name(), CursorToken::from("B"));
    let (sink, mut rx) = fan_in(16);

    let report = collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(report.emitted, 2);
    assert_eq!(drain(&sink, &mut rx).await, vec!["D", "C"]);
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("D"));
}

#[tokio::test]
async fn first_run_never_emits_items_older_than_cutoff() {
    let feed = Arc::new(MockFeed::default().with_repo(
        "widgets",
        vec![vec![item("C", 5), item("B", 25 * 60), item("A", 30 * 60)]],
    ));
    let collector = collector(&feed, EmitOrder::OldestFirst);
    let (sink, mut rx) = fan_in(16);

    collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(drain(&sink, &mut rx).await, vec!["C"]);
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("C"));
}

#[tokio::test]
async fn cursor_advances_when_nothing_is_new() {
    let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&["C", "B"])]));
    let collector = collector(&feed, EmitOrder::OldestFirst);
    let (sink, mut rx) = fan_in(16);
    let cancel = CancellationToken::new();

    collector.run_cycle(&sink, &cancel).await;
    drain(&sink, &mut rx).await;

    let report = collector.run_cycle(&sink, &cancel).await;

    assert_eq!(report.emitted, 0);
    assert!(sink.is_empty());
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("C"));
}

#[tokio::test]
async fn consecutive_cycles_make_monotonic_progress_without_duplicates() {
    let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&["B", "A"])]));
    let collector = collector(&feed, EmitOrder::OldestFirst);
    let (sink, mut rx) = fan_in(64);
    let cancel = CancellationToken::new();
    let mut delivered = Vec::new();

    collector.run_cycle(&sink, &cancel).await;
    delivered.extend(drain(&sink, &mut rx).await);

    feed.set_pages("widgets", vec![listing(&["D", "C", "B", "A"])]);
    collector.run_cycle(&sink, &cancel).await;
    delivered.extend(drain(&sink, &mut rx).await);

    feed.set_pages("widgets", vec![listing(&["F", "E", "D", "C"])]);
    collector.run_cycle(&sink, &cancel).await;
    delivered.extend(drain(&sink, &mut rx).await);

    assert_eq!(delivered, vec!["A", "B", "C", "D", "E", "F"]);
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("F"));
}

#[tokio::test]
async fn conversion_failure_skips_only_that_item() {
    let feed = Arc::new(MockFeed::default().with_repo(
        "widgets",
        vec![vec![item("C", 1), malformed("B", 2), item("A", 3)]],
    ));
    let collector = collector(&feed, EmitOrder::ScanOrder);
    let (sink, mut rx) = fan_in(16);

    let report = collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(report.emitted, 2);
    assert_eq!(report.skipped, 1);
    assert_eq!(drain(&sink, &mut rx).await, vec!["C", "A"]);
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("C"));
}

#[tokio::test]
async fn listing_error_aborts_only_that_key() {
    let feed = Arc::new(
        MockFeed::default()
            .with_repo("broken", vec![listing(&["X"])])
            .with_repo("widgets", vec![listing(&["B", "A"])]),
    );
    feed.fail("broken");
    let collector = collector(&feed, EmitOrder::OldestFirst);
    collector
        .cursors()
        .set(&RepoId::new(GROUP, "broken").full_name(), CursorToken::from("W"));
    let (sink, mut rx) = fan_in(16);

    let report = collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(report.keys, 2);
    assert_eq!(report.failed_keys, 1);
    assert_eq!(drain(&sink, &mut rx).await, vec!["A", "B"]);
    assert_eq!(cursor(&collector, "broken"), CursorToken::from("W"));
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("B"));
}

#[tokio::test]
async fn error_on_later_page_emits_nothing_for_the_key() {
    let feed = Arc::new(MockFeed::default().with_repo(
        "widgets",
        vec![listing(&["D", "C"]), listing(&["B", "A"])],
    ));
    let collector = collector(&feed, EmitOrder::OldestFirst);
    let (sink, _rx) = fan_in(16);
    let cancel = CancellationToken::new();

    feed.fail_after_requests("widgets", 1);

    let err = collector
        .collect_key(GROUP, &RepoId::new(GROUP, "widgets"), &sink, &cancel)
        .await
        .unwrap_err();

    assert!(matches!(err, KeyError::Feed(FeedError::Listing(_))));
    assert_eq!(feed.requests("widgets"), 2);
    assert!(sink.is_empty());
    assert!(cursor(&collector, "widgets").is_empty());
}

#[tokio::test]
async fn empty_listing_leaves_cursor_untouched() {
    let feed = Arc::new(MockFeed::default().with_repo("quiet", vec![]));
    let collector = collector(&feed, EmitOrder::OldestFirst);
    collector
        .cursors()
        .set(&RepoId::new(GROUP, "quiet").full_name(), CursorToken::from("Q"));
    let (sink, _rx) = fan_in(16);

    let report = collector
        .collect_key(GROUP, &RepoId::new(GROUP, "quiet"), &sink, &CancellationToken::new())
        .await
        .unwrap();

    assert!(!report.cursor_advanced);
    assert_eq!(report.emitted, 0);
    assert_eq!(cursor(&collector, "quiet"), CursorToken::from("Q"));
}

#[tokio::test]
async fn walks_pages_until_previous_cursor_then_stops_fetching() {
    let feed = Arc::new(MockFeed::default().with_repo(
        "widgets",
        vec![listing(&["F", "E"]), listing(&["D", "C"]), listing(&["B", "A"])],
    ));
    let collector = collector(&feed, EmitOrder::ScanOrder);
    collector
        .cursors()
        .set(&RepoId::new(GROUP, "widgets").full_name(), CursorToken::from("D"));
    let (sink, mut rx) = fan_in(16);

    collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(drain(&sink, &mut rx).await, vec!["F", "E"]);
    assert_eq!(feed.requests("widgets"), 2);
    assert_eq!(cursor(&collector, "widgets"), CursorToken::from("F"));
}

#[tokio::test]
async fn full_queue_abandons_key_without_advancing_cursor() {
    let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&["B", "A"])]));
    let collector = collector(&feed, EmitOrder::OldestFirst);
    let (sink, _rx) = fan_in(1);
    sink.offer(NormalizedEvent::new("filler", "test://", "test", Utc::now(), Vec::new()))
        .unwrap();

    let err = collector
        .collect_key(GROUP, &RepoId::new(GROUP, "widgets"), &sink, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, KeyError::Enqueue(EnqueueError::TimedOut(_))));
    assert!(cursor(&collector, "widgets").is_empty());
}

#[tokio::test]
async fn cancellation_aborts_pending_enqueue() {
    let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&["A"])]));
    let mut cfg = config(EmitOrder::OldestFirst);
    cfg.enqueue_timeout = Duration::from_secs(60);
    let collector = IncrementalCollector::new(Arc::clone(&feed), Arc::new(CursorStore::new()), cfg);
    let (sink, _rx) = fan_in(1);
    sink.offer(NormalizedEvent::new("filler", "test://", "test", Utc::now(), Vec::new()))
        .unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        canceller.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        collector.collect_key(GROUP, &RepoId::new(GROUP, "widgets"), &sink, &cancel),
    )
    .await
    .expect("cancellation should interrupt the enqueue");

    assert!(matches!(result, Err(KeyError::Enqueue(EnqueueError::Cancelled))));
}

#[tokio::test]
async fn allow_list_filters_keys() {
    let feed = Arc::new(
        MockFeed::default()
            .with_repo("widgets", vec![listing(&["A"])])
            .with_repo("gadgets", vec![listing(&["B"])]),
    );
    let mut cfg = config(EmitOrder::OldestFirst);
    cfg.allow = Some(["gadgets".to_string()].into_iter().collect());
    let collector = IncrementalCollector::new(Arc::clone(&feed), Arc::new(CursorStore::new()), cfg);
    let (sink, mut rx) = fan_in(16);

    let report = collector.run_cycle(&sink, &CancellationToken::new()).await;

    assert_eq!(report.keys, 1);
    assert_eq!(drain(&sink, &mut rx).await, vec!["B"]);
    assert_eq!(feed.requests("widgets"), 0);
}

#[tokio::test]
async fn source_runs_first_cycle_immediately_and_stops_on_cancel() {
    let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&["B", "A"])]));
    let mut cfg = config(EmitOrder::OldestFirst);
    cfg.poll_interval = Duration::from_secs(3600);
    let collector = IncrementalCollector::new(Arc::clone(&feed), Arc::new(CursorStore::new()), cfg);
    let (sink, mut rx) = fan_in(16);
    let shutdown = CancellationToken::new();

    let running = Box::new(collector).start(sink.clone(), shutdown.clone()).unwrap();
    assert_eq!(running.name(), "github");

    let first = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("first cycle should run without waiting for the interval")
        .unwrap();
    assert_eq!(first.id, "A");

    tokio::time::timeout(Duration::from_secs(1), running.stop())
        .await
        .expect("collector should stop promptly");
}

proptest! {
    /// Whatever position the stored cursor has in the listing, the cursor
    /// item is never emitted and the cursor ends on the newest item.
    #[test]
    fn cursor_item_is_never_re_emitted(len in 1usize..30, k in 0usize..30) {
        let k = k % len;
        let ids: Vec<String> = (0..len).map(|i| format!("e{}", len - i)).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (emitted, final_cursor) = runtime.block_on(async {
            let feed = Arc::new(MockFeed::default().with_repo("widgets", vec![listing(&id_refs)]));
            let collector = collector(&feed, EmitOrder::ScanOrder);
            collector
                .cursors()
                .set(&RepoId::new(GROUP, "widgets").full_name(), CursorToken::new(ids[k].clone()));
            let (sink, mut rx) = fan_in(64);
            collector.run_cycle(&sink, &CancellationToken::new()).await;
            (drain(&sink, &mut rx).await, cursor(&collector, "widgets"))
        });

        prop_assert_eq!(emitted.len(), k);
        prop_assert!(!emitted.contains(&ids[k]));
        prop_assert_eq!(final_cursor, CursorToken::new(ids[0].clone()));
    }
}
