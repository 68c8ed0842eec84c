//! Tests for the stream state machine.

use std::time::Duration;

use super::*;
use crate::adapter::MockBackingStore;
use crate::utils::retry::BackoffStep;

#[derive(Default)]
struct RecordingSink {
    applied: Mutex<Vec<(usize, u64, Vec<String>)>>,
}

impl RecordingSink {
    fn sequences(&self) -> Vec<u64> {
        self.applied.lock().iter().map(|(_, seq, _)| *seq).collect()
    }

    fn values(&self) -> Vec<String> {
        self.applied
            .lock()
            .iter()
            .flat_map(|(_, _, values)| values.clone())
            .collect()
    }
}

impl BatchSink for RecordingSink {
    fn apply(&self, batch: Arc<MessageBatch>) {
        let values = batch
            .messages()
            .iter()
            .map(|m| String::from_utf8_lossy(m.value()).into_owned())
            .collect();
        self.applied
            .lock()
            .push((batch.stream_index(), batch.sequence_id(), values));
    }
}

struct Harness {
    store: Arc<MockBackingStore>,
    sink: Arc<RecordingSink>,
    stats: Arc<BusStats>,
    stream: Arc<Stream>,
}

fn harness(max_queue_length: usize, reconnect: Vec<BackoffStep>) -> Harness {
    let store = Arc::new(MockBackingStore::new());
    let sink = Arc::new(RecordingSink::default());
    let stats = Arc::new(BusStats::default());
    let stream = Stream::start(
        0,
        store.clone(),
        StreamOptions {
            max_queue_length,
            reconnect: BackoffSchedule::new(reconnect),
        },
        sink.clone(),
        stats.clone(),
    );
    Harness {
        store,
        sink,
        stats,
        stream,
    }
}

/// Retry every 10ms for a long time.
fn patient() -> Vec<BackoffStep> {
    vec![BackoffStep::new(Duration::from_millis(10), 1000)]
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn msg(value: &str) -> Vec<Message> {
    vec![Message::new("k", value.to_string())]
}

#[tokio::test]
async fn test_send_before_open_is_unavailable() {
    let h = harness(10, patient());
    assert_eq!(h.stream.state(), StreamState::Closed);

    let err = h.stream.send(msg("a")).await.unwrap_err();
    assert!(matches!(err, BusError::StreamUnavailable { stream: 0 }));
}

#[tokio::test]
async fn test_open_then_send_applies_in_order() {
    let h = harness(10, patient());
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    for value in ["a", "b", "c"] {
        h.stream.send(msg(value)).await.unwrap();
    }
    wait_until(|| h.sink.sequences().len() == 3).await;

    assert_eq!(h.sink.sequences(), vec![1, 2, 3]);
    assert_eq!(h.sink.values(), vec!["a", "b", "c"]);
    assert_eq!(h.stats.snapshot().received, 3);
}

#[tokio::test]
async fn test_sends_queue_while_opening_and_flush_in_order() {
    let h = harness(10, patient());
    h.store.set_available(false);
    h.stream.open();
    assert_eq!(h.stream.state(), StreamState::Opening);

    let first = tokio::spawn({
        let stream = h.stream.clone();
        async move { stream.send(msg("first")).await }
    });
    wait_until(|| h.stream.queue_len() == 1).await;
    let second = tokio::spawn({
        let stream = h.stream.clone();
        async move { stream.send(msg("second")).await }
    });
    wait_until(|| h.stream.queue_len() == 2).await;
    assert!(h.sink.sequences().is_empty());

    h.store.set_available(true);
    first.await.unwrap().unwrap();
    second.await.unwrap().unwrap();
    wait_until(|| h.sink.sequences().len() == 2).await;

    assert_eq!(h.stream.state(), StreamState::Open);
    assert_eq!(h.sink.values(), vec!["first", "second"]);
}

#[tokio::test]
async fn test_full_queue_rejects_immediately() {
    let h = harness(2, patient());
    h.store.set_available(false);
    h.stream.open();

    for value in ["a", "b"] {
        let stream = h.stream.clone();
        tokio::spawn(async move { stream.send(msg(value)).await });
    }
    wait_until(|| h.stream.queue_len() == 2).await;

    let err = h.stream.send(msg("c")).await.unwrap_err();
    assert!(matches!(
        err,
        BusError::Backpressure {
            stream: 0,
            capacity: 2
        }
    ));
    assert_eq!(h.stats.snapshot().backpressured, 1);
}

#[tokio::test]
async fn test_exhausted_schedule_closes_and_fails_queued_sends() {
    let h = harness(10, vec![BackoffStep::new(Duration::from_millis(50), 2)]);
    h.store.set_available(false);
    h.stream.open();

    let queued = tokio::spawn({
        let stream = h.stream.clone();
        async move { stream.send(msg("lost")).await }
    });

    let err = queued.await.unwrap().unwrap_err();
    assert!(matches!(err, BusError::StreamUnavailable { stream: 0 }));
    assert_eq!(h.stream.state(), StreamState::Closed);
    assert_eq!(h.store.open_attempts(), 2);
    assert_eq!(h.store.fallback_calls(), 1);

    // Closed for good: neither sends nor reopen bring it back
    assert!(h.stream.send(msg("later")).await.is_err());
    h.stream.open();
    assert_eq!(h.stream.state(), StreamState::Closed);
}

#[tokio::test]
async fn test_fallback_keeps_stream_open() {
    let h = harness(10, vec![BackoffStep::new(Duration::ZERO, 1)]);
    h.store.set_available(false);
    h.store.allow_fallback(true);
    h.stream.open();

    wait_until(|| h.stream.state() == StreamState::Open).await;
    h.stream.send(msg("a")).await.unwrap();
    wait_until(|| h.sink.sequences() == vec![1]).await;
}

#[tokio::test]
async fn test_disconnect_buffers_until_reconnected() {
    let h = harness(10, patient());
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    h.store.set_available(false);
    h.store.disconnect(0);
    wait_until(|| h.stream.state() == StreamState::Buffering).await;

    let pending = tokio::spawn({
        let stream = h.stream.clone();
        async move { stream.send(msg("buffered")).await }
    });
    wait_until(|| h.stream.queue_len() == 1).await;

    h.store.set_available(true);
    pending.await.unwrap().unwrap();
    wait_until(|| h.sink.values() == vec!["buffered"]).await;
    assert_eq!(h.stream.state(), StreamState::Open);
}

#[tokio::test]
async fn test_restored_connection_reopens_without_waiting_for_backoff() {
    let h = harness(
        10,
        vec![
            BackoffStep::new(Duration::ZERO, 1),
            BackoffStep::new(Duration::from_secs(60), 1),
        ],
    );
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    // First reconnect attempt fails, then the driver sleeps for a minute
    h.store.set_available(false);
    h.store.disconnect(0);
    wait_until(|| h.store.open_attempts() == 2).await;
    assert_eq!(h.stream.state(), StreamState::Buffering);

    h.store.set_available(true);
    h.store.restore(0);
    wait_until(|| h.stream.state() == StreamState::Open).await;
    h.stream.send(msg("after-restore")).await.unwrap();
    wait_until(|| h.sink.values() == vec!["after-restore"]).await;
    assert_eq!(h.store.open_attempts(), 2);
}

#[tokio::test]
async fn test_failed_send_is_retried_after_reconnect() {
    let h = harness(10, patient());
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    h.store.fail_next_sends(1);
    h.stream.send(msg("retried")).await.unwrap();
    wait_until(|| h.sink.sequences().len() == 1).await;

    assert_eq!(h.sink.values(), vec!["retried"]);
    assert_eq!(h.store.sent_count(), 1);
    assert!(h.store.open_attempts() >= 2);
}

#[tokio::test]
async fn test_sends_failing_after_every_reconnect_exhaust_the_budget() {
    let h = harness(10, vec![BackoffStep::new(Duration::ZERO, 3)]);
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    // Every reopen succeeds, every send fails
    h.store.fail_next_sends(u32::MAX);
    let err = tokio::time::timeout(Duration::from_secs(5), h.stream.send(msg("never")))
        .await
        .expect("send should resolve")
        .unwrap_err();

    assert!(matches!(err, BusError::StreamUnavailable { stream: 0 }));
    assert_eq!(h.stream.state(), StreamState::Closed);
    assert_eq!(h.store.open_attempts(), 4);
    assert_eq!(h.store.fallback_calls(), 1);
    assert!(h.sink.values().is_empty());
}

#[tokio::test]
async fn test_fallback_is_tried_once_while_sends_keep_failing() {
    let h = harness(10, vec![BackoffStep::new(Duration::ZERO, 2)]);
    h.store.allow_fallback(true);
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    h.store.fail_next_sends(u32::MAX);
    let err = tokio::time::timeout(Duration::from_secs(5), h.stream.send(msg("never")))
        .await
        .expect("send should resolve")
        .unwrap_err();

    assert!(matches!(err, BusError::StreamUnavailable { stream: 0 }));
    assert_eq!(h.stream.state(), StreamState::Closed);
    assert_eq!(h.store.fallback_calls(), 1);
}

#[tokio::test]
async fn test_successful_send_restores_the_full_budget() {
    let h = harness(10, vec![BackoffStep::new(Duration::ZERO, 2)]);
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    // Each failure costs one reopen; the successful send in between refills
    // the budget, so no publish exhausts it
    for value in ["first", "second", "third"] {
        h.store.fail_next_sends(1);
        h.stream.send(msg(value)).await.unwrap();
    }

    wait_until(|| h.sink.values() == vec!["first", "second", "third"]).await;
    assert_eq!(h.stream.state(), StreamState::Open);
    assert_eq!(h.store.fallback_calls(), 0);
}

#[tokio::test]
async fn test_stale_receipts_are_dropped() {
    let h = harness(10, patient());
    h.stream.open();
    wait_until(|| h.stream.state() == StreamState::Open).await;

    h.store.inject(0, 1, msg("one"));
    h.store.inject(0, 1, msg("one again"));
    h.store.inject(0, 3, msg("three"));
    h.store.inject(0, 2, msg("two late"));
    h.store.inject(0, 0, msg("reserved"));
    h.store.inject(0, 4, msg("four"));
    wait_until(|| h.sink.sequences().len() == 3).await;

    assert_eq!(h.sink.sequences(), vec![1, 3, 4]);
    assert_eq!(h.stats.snapshot().duplicates_dropped, 2);
}

#[tokio::test]
async fn test_shutdown_fails_queued_sends() {
    let h = harness(10, patient());
    h.store.set_available(false);
    h.stream.open();

    let pending = tokio::spawn({
        let stream = h.stream.clone();
        async move { stream.send(msg("never")).await }
    });
    wait_until(|| h.stream.queue_len() == 1).await;

    h.stream.shutdown().await;
    assert!(matches!(pending.await.unwrap(), Err(BusError::ShutDown)));
    assert!(matches!(
        h.stream.send(msg("after")).await,
        Err(BusError::ShutDown)
    ));
}
