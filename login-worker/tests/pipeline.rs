use std::sync::Arc;
use std::time;

use async_trait::async_trait;
use login_common::health::{ComponentStatus, HealthHandle, HealthRegistry};
use login_common::login::NormalizedLoginRecord;
use login_common::memory::{MemoryDeadLetterSink, MemoryLoginStore, MemoryQueue};
use login_common::queue::{ConsumerError, QueueConsumer};
use login_common::retry::RetryPolicy;
use login_common::store::{InsertOutcome, LoginStore, PersistenceWriter, StoreError};
use login_worker::worker::{LoginWorker, WorkerLimits};
use serde_json::json;
use tokio_util::sync::CancellationToken;

const VISIBILITY_TIMEOUT: time::Duration = time::Duration::from_secs(30);

fn retry_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::build(1, time::Duration::from_millis(1))
        .max_attempts(max_attempts)
        .provide()
}

fn consumer(queue: Arc<MemoryQueue>) -> QueueConsumer {
    QueueConsumer::new(
        queue,
        time::Duration::from_millis(50),
        time::Duration::from_secs(1),
        retry_policy(2),
    )
}

fn worker(
    queue: Arc<MemoryQueue>,
    store: Arc<dyn LoginStore>,
    dead_letters: Arc<MemoryDeadLetterSink>,
    write_max_attempts: u32,
    max_receive_count: u32,
) -> LoginWorker {
    let liveness =
        HealthRegistry::new("liveness").register("worker", chrono::Duration::seconds(30));

    worker_with_liveness(
        queue,
        store,
        dead_letters,
        write_max_attempts,
        max_receive_count,
        liveness,
    )
}

fn worker_with_liveness(
    queue: Arc<MemoryQueue>,
    store: Arc<dyn LoginStore>,
    dead_letters: Arc<MemoryDeadLetterSink>,
    write_max_attempts: u32,
    max_receive_count: u32,
    liveness: HealthHandle,
) -> LoginWorker {
    LoginWorker::new(
        "test-worker",
        consumer(queue),
        PersistenceWriter::new(
            store,
            retry_policy(write_max_attempts),
            time::Duration::from_secs(1),
        ),
        dead_letters,
        WorkerLimits {
            batch_size: 10,
            max_concurrent_messages: 4,
            max_receive_count,
            dead_letter_timeout: time::Duration::from_secs(1),
            poll_backoff: time::Duration::from_millis(10),
        },
        liveness,
    )
}

fn login_event(user_id: &str) -> Vec<u8> {
    json!({
        "user_id": user_id,
        "device_type": "android",
        "ip": "199.172.111.135",
        "device_id": "593-47-5928",
        "locale": "RU",
        "app_version": 3,
    })
    .to_string()
    .into_bytes()
}

#[tokio::test]
async fn test_batch_persists_dead_letters_and_acknowledges() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());

    let valid = queue.enqueue(&login_event("424cdd21-063a-43a7-b91b-7ca1a833afae"));
    let missing_device = queue.enqueue(
        json!({
            "user_id": "c0173198-76a8-4e67-bfc2-74eaa3bbff57",
            "device_type": "ios",
            "ip": "241.6.88.151",
            "locale": "PH",
            "app_version": "2.3.0",
        })
        .to_string()
        .as_bytes(),
    );
    let flaky = queue.enqueue(&login_event("66e0635b-ce36-4ec7-aa9e-8a8fca9b83d4"));
    store.fail_next_inserts(1);

    let worker = worker(queue.clone(), store.clone(), dead_letters.clone(), 3, 5);
    let summary = worker.process_batch().await.expect("failed to process batch");

    assert_eq!(summary.received, 3);
    assert_eq!(summary.persisted, 2);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.acknowledged, 3);
    assert_eq!(summary.redelivery, 0);

    let rows = store.rows();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().any(|row| row.message_id == valid));
    assert!(rows.iter().any(|row| row.message_id == flaky));
    for row in &rows {
        assert_eq!(row.app_version, "3");
        assert_ne!(row.masked_ip, "199.172.111.135");
        assert_ne!(row.masked_device_id, "593-47-5928");
    }

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, missing_device);
    assert_eq!(letters[0].reason, "required field device_id is missing");

    assert_eq!(queue.total_acknowledged(), 3);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn test_concurrent_duplicate_delivery_writes_one_row() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    let message_id = queue.enqueue(&login_event("424cdd21-063a-43a7-b91b-7ca1a833afae"));

    // Two workers get the same message: the first lease runs out before anyone acknowledges.
    let first = consumer(queue.clone()).poll(10).await.expect("failed to poll");
    queue.expire_leases();
    let second = consumer(queue.clone()).poll(10).await.expect("failed to poll");
    assert_eq!(first[0].message_id, second[0].message_id);
    assert_eq!(second[0].receive_count, 2);

    let worker_a = worker(queue.clone(), store.clone(), dead_letters.clone(), 3, 5);
    let worker_b = worker(queue.clone(), store.clone(), dead_letters.clone(), 3, 5);

    let (summary_a, summary_b) = tokio::join!(
        worker_a.process_messages(first),
        worker_b.process_messages(second)
    );

    assert_eq!(store.rows().len(), 1);
    assert_eq!(summary_a.persisted + summary_b.persisted, 1);
    assert_eq!(summary_a.duplicates + summary_b.duplicates, 1);
    assert_eq!(summary_a.acknowledged + summary_b.acknowledged, 1);
    assert_eq!(summary_a.ack_failures + summary_b.ack_failures, 1);
    assert_eq!(queue.acknowledged_count(&message_id), 1);
    assert!(dead_letters.letters().is_empty());
}

#[tokio::test]
async fn test_unwritable_message_is_dead_lettered_at_receive_ceiling() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    let message_id = queue.enqueue(&login_event("424cdd21-063a-43a7-b91b-7ca1a833afae"));
    store.fail_next_inserts(100);

    let worker = worker(queue.clone(), store.clone(), dead_letters.clone(), 1, 2);

    let first = worker.process_batch().await.expect("failed to process batch");
    assert_eq!(first.redelivery, 1);
    assert_eq!(first.acknowledged, 0);
    assert!(dead_letters.letters().is_empty());
    assert_eq!(queue.pending(), 1);

    queue.expire_leases();

    let second = worker.process_batch().await.expect("failed to process batch");
    assert_eq!(second.dead_lettered, 1);
    assert_eq!(second.acknowledged, 1);

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, message_id);
    assert!(letters[0].reason.contains("unavailable"));
    assert_eq!(queue.acknowledged_count(&message_id), 1);
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered_and_acknowledged() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    let message_id = queue.enqueue(b"not json");

    let worker = worker(queue.clone(), store.clone(), dead_letters.clone(), 3, 5);
    let summary = worker.process_batch().await.expect("failed to process batch");

    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(summary.acknowledged, 1);
    assert_eq!(summary.redelivery, 0);

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].message_id, message_id);
    assert_eq!(letters[0].payload, b"not json".to_vec());
    assert_eq!(letters[0].reason, "payload is not a JSON object");

    assert_eq!(queue.acknowledged_count(&message_id), 1);
    assert_eq!(queue.pending(), 0);
    assert!(store.rows().is_empty());
}

#[tokio::test]
async fn test_dead_letter_failure_leaves_message_on_queue() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    queue.enqueue(b"not json");
    dead_letters.fail_next_sends(1);

    let worker = worker(queue.clone(), store.clone(), dead_letters.clone(), 3, 5);
    let summary = worker.process_batch().await.expect("failed to process batch");

    assert_eq!(summary.redelivery, 1);
    assert_eq!(summary.acknowledged, 0);
    assert_eq!(queue.total_acknowledged(), 0);
    assert_eq!(queue.pending(), 1);
}

#[tokio::test]
async fn test_poll_failure_claims_and_acknowledges_nothing() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    queue.enqueue(&login_event("424cdd21-063a-43a7-b91b-7ca1a833afae"));
    queue.fail_next_receives(10);

    let worker = worker(queue.clone(), store.clone(), dead_letters, 3, 5);
    let result = worker.process_batch().await;

    assert!(matches!(
        result,
        Err(ConsumerError::SourceUnavailable { attempts: 2, .. })
    ));
    assert_eq!(queue.total_acknowledged(), 0);
    assert_eq!(queue.in_flight(), 0);
    assert!(store.rows().is_empty());
}

/// Requests shutdown as soon as the first record of a batch is written.
struct CancellingStore {
    inner: MemoryLoginStore,
    cancel: CancellationToken,
}

#[async_trait]
impl LoginStore for CancellingStore {
    async fn insert(&self, record: &NormalizedLoginRecord) -> Result<InsertOutcome, StoreError> {
        self.cancel.cancel();
        self.inner.insert(record).await
    }
}

#[tokio::test]
async fn test_shutdown_finishes_in_flight_batch() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let cancel = CancellationToken::new();
    let store = Arc::new(CancellingStore {
        inner: MemoryLoginStore::new(),
        cancel: cancel.clone(),
    });
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    for user in ["a", "b", "c"] {
        queue.enqueue(&login_event(user));
    }

    let worker = worker(queue.clone(), store.clone(), dead_letters, 3, 5);

    tokio::time::timeout(time::Duration::from_secs(5), worker.run(cancel.clone()))
        .await
        .expect("worker did not stop after shutdown was requested");

    assert!(cancel.is_cancelled());
    assert_eq!(store.inner.rows().len(), 3);
    assert_eq!(queue.total_acknowledged(), 3);
    assert_eq!(queue.pending(), 0);
}

#[tokio::test]
async fn test_shutdown_interrupts_idle_poll() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    let worker = worker(queue, store, dead_letters, 3, 5);

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(time::Duration::from_millis(20)).await;
        shutdown.cancel();
    });

    tokio::time::timeout(time::Duration::from_secs(5), worker.run(cancel))
        .await
        .expect("worker did not stop after shutdown was requested");
}

#[tokio::test]
async fn test_unreachable_source_stalls_liveness() {
    let queue = Arc::new(MemoryQueue::new(VISIBILITY_TIMEOUT));
    let store = Arc::new(MemoryLoginStore::new());
    let dead_letters = Arc::new(MemoryDeadLetterSink::new());
    queue.fail_next_receives(u32::MAX);

    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("worker", chrono::Duration::milliseconds(200));
    let worker = worker_with_liveness(queue, store, dead_letters, 3, 5, liveness);

    let cancel = CancellationToken::new();
    let ((), status) = tokio::join!(worker.run(cancel.clone()), async {
        tokio::time::sleep(time::Duration::from_millis(600)).await;
        let status = registry.get_status();
        cancel.cancel();
        status
    });

    assert!(!status.healthy);
    assert_eq!(
        status.components.get("worker"),
        Some(&ComponentStatus::Stalled)
    );
}
