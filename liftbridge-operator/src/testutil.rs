//! In-memory coordination store for exercising leader election without an
//! API server.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{OperatorError, Result};
use crate::events::{EventSink, EventType};
use crate::lock::{LeaseLock, LeaseRecord, LockKey};

#[derive(Default)]
struct StoredLease {
    record: Option<LeaseRecord>,
    version: u64,
    history: Vec<LeaseRecord>,
}

/// A single lease slot with versioned compare-and-swap writes.
pub struct MockLeaseStore {
    lease: Mutex<StoredLease>,
    read_fail: AtomicBool,
    write_fail: AtomicBool,
    write_hang: AtomicBool,
    event_delay: Mutex<Duration>,
    get_count: AtomicU64,
    create_count: AtomicU64,
    update_count: AtomicU64,
}

impl MockLeaseStore {
    pub fn new() -> Self {
        Self {
            lease: Mutex::new(StoredLease::default()),
            read_fail: AtomicBool::new(false),
            write_fail: AtomicBool::new(false),
            write_hang: AtomicBool::new(false),
            event_delay: Mutex::new(Duration::ZERO),
            get_count: AtomicU64::new(0),
            create_count: AtomicU64::new(0),
            update_count: AtomicU64::new(0),
        }
    }

    /// A lock handle for `identity` that records events into `events`.
    pub fn lock_with_events(
        self: &Arc<Self>,
        identity: impl Into<String>,
        events: Arc<dyn EventSink>,
    ) -> MockLeaseLock {
        MockLeaseLock {
            store: Arc::clone(self),
            key: LockKey::default(),
            identity: identity.into(),
            events,
            observed_version: Mutex::new(None),
        }
    }

    pub fn lock(self: &Arc<Self>, identity: impl Into<String>) -> MockLeaseLock {
        self.lock_with_events(identity, Arc::new(RecordingEventSink::new()))
    }

    pub fn set_read_fail(&self, fail: bool) {
        self.read_fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_write_fail(&self, fail: bool) {
        self.write_fail.store(fail, Ordering::SeqCst);
    }

    /// Writes never complete while set, like a request to an API server
    /// that accepted the connection and stopped answering.
    pub fn set_write_hang(&self, hang: bool) {
        self.write_hang.store(hang, Ordering::SeqCst);
    }

    /// Delays every `record_event` call by `delay`.
    pub fn set_event_delay(&self, delay: Duration) {
        *self.event_delay.lock() = delay;
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.set_read_fail(unavailable);
        self.set_write_fail(unavailable);
    }

    pub fn record(&self) -> Option<LeaseRecord> {
        self.lease.lock().record.clone()
    }

    pub fn holder(&self) -> Option<String> {
        self.record().and_then(|r| r.holder().map(str::to_string))
    }

    pub fn version(&self) -> u64 {
        self.lease.lock().version
    }

    /// Every record successfully written, in order.
    pub fn history(&self) -> Vec<LeaseRecord> {
        self.lease.lock().history.clone()
    }

    /// Overwrites the lease as an out-of-band writer would.
    pub fn put(&self, record: LeaseRecord) {
        let mut lease = self.lease.lock();
        lease.version += 1;
        lease.history.push(record.clone());
        lease.record = Some(record);
    }

    pub fn get_count(&self) -> u64 {
        self.get_count.load(Ordering::Relaxed)
    }

    pub fn create_count(&self) -> u64 {
        self.create_count.load(Ordering::Relaxed)
    }

    pub fn update_count(&self) -> u64 {
        self.update_count.load(Ordering::Relaxed)
    }
}

impl MockLeaseStore {
    async fn hang_if_requested(&self) {
        if self.write_hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for MockLeaseStore {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MockLeaseLock {
    store: Arc<MockLeaseStore>,
    key: LockKey,
    identity: String,
    events: Arc<dyn EventSink>,
    observed_version: Mutex<Option<u64>>,
}

#[async_trait]
impl LeaseLock for MockLeaseLock {
    async fn get(&self) -> Result<Option<LeaseRecord>> {
        self.store.get_count.fetch_add(1, Ordering::Relaxed);
        if self.store.read_fail.load(Ordering::SeqCst) {
            return Err(OperatorError::store("mock read failure"));
        }
        let lease = self.store.lease.lock();
        *self.observed_version.lock() = lease.record.as_ref().map(|_| lease.version);
        Ok(lease.record.clone())
    }

    async fn create(&self, record: &LeaseRecord) -> Result<()> {
        self.store.create_count.fetch_add(1, Ordering::Relaxed);
        self.store.hang_if_requested().await;
        if self.store.write_fail.load(Ordering::SeqCst) {
            return Err(OperatorError::store("mock write failure"));
        }
        let mut lease = self.store.lease.lock();
        if lease.record.is_some() {
            return Err(OperatorError::AlreadyExists(self.key.to_string()));
        }
        lease.version += 1;
        lease.record = Some(record.clone());
        lease.history.push(record.clone());
        *self.observed_version.lock() = Some(lease.version);
        Ok(())
    }

    async fn update(&self, record: &LeaseRecord) -> Result<()> {
        self.store.update_count.fetch_add(1, Ordering::Relaxed);
        self.store.hang_if_requested().await;
        if self.store.write_fail.load(Ordering::SeqCst) {
            return Err(OperatorError::store("mock write failure"));
        }
        let mut lease = self.store.lease.lock();
        let observed = *self.observed_version.lock();
        match observed {
            None => return Err(OperatorError::lock("lease must be read before it is updated")),
            Some(version) if version != lease.version => {
                return Err(OperatorError::Conflict(self.key.to_string()));
            }
            Some(_) => {}
        }
        lease.version += 1;
        lease.record = Some(record.clone());
        lease.history.push(record.clone());
        *self.observed_version.lock() = Some(lease.version);
        Ok(())
    }

    async fn record_event(&self, message: &str) {
        let delay = *self.store.event_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let message = format!("{} {}", self.identity, message);
        let _ = self
            .events
            .emit(EventType::Normal, "LeaderElection", &message)
            .await;
    }

    fn identity(&self) -> &str {
        &self.identity
    }

    fn key(&self) -> &LockKey {
        &self.key
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
    fail: AtomicBool,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.message.clone()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    fn component(&self) -> &str {
        "liftbridge-operator"
    }

    async fn emit(&self, event_type: EventType, reason: &str, message: &str) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(OperatorError::store("mock event sink failure"));
        }
        self.events.lock().push(RecordedEvent {
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_get_on_empty_store() {
        let store = Arc::new(MockLeaseStore::new());
        let lock = store.lock("pod-1");
        assert_eq!(lock.get().await.unwrap(), None);
        assert_eq!(store.get_count(), 1);
    }

    #[tokio::test]
    async fn test_create_then_conflicting_create() {
        let store = Arc::new(MockLeaseStore::new());
        let a = store.lock("pod-1");
        let b = store.lock("pod-2");

        a.create(&LeaseRecord::held_by("pod-1", 15, Utc::now()))
            .await
            .unwrap();
        let err = b
            .create(&LeaseRecord::held_by("pod-2", 15, Utc::now()))
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert_eq!(store.holder().as_deref(), Some("pod-1"));
    }

    #[tokio::test]
    async fn test_stale_update_is_rejected() {
        let store = Arc::new(MockLeaseStore::new());
        store.put(LeaseRecord::held_by("old", 15, Utc::now()));
        let a = store.lock("pod-1");
        let b = store.lock("pod-2");

        a.get().await.unwrap();
        b.get().await.unwrap();

        a.update(&LeaseRecord::held_by("pod-1", 15, Utc::now()))
            .await
            .unwrap();
        let err = b
            .update(&LeaseRecord::held_by("pod-2", 15, Utc::now()))
            .await
            .unwrap_err();

        assert!(matches!(err, OperatorError::Conflict(_)));
        assert_eq!(store.holder().as_deref(), Some("pod-1"));
        assert_eq!(store.history().len(), 2);
    }

    #[tokio::test]
    async fn test_update_without_get_fails() {
        let store = Arc::new(MockLeaseStore::new());
        let lock = store.lock("pod-1");
        let err = lock
            .update(&LeaseRecord::held_by("pod-1", 15, Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, OperatorError::Lock(_)));
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = Arc::new(MockLeaseStore::new());
        let lock = store.lock("pod-1");

        store.set_unavailable(true);
        assert!(lock.get().await.is_err());
        assert!(lock
            .create(&LeaseRecord::held_by("pod-1", 15, Utc::now()))
            .await
            .is_err());

        store.set_unavailable(false);
        assert!(lock.get().await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_write_never_completes() {
        let store = Arc::new(MockLeaseStore::new());
        let lock = store.lock("pod-1");
        store.set_write_hang(true);

        let record = LeaseRecord::held_by("pod-1", 15, Utc::now());
        let write = lock.create(&record);
        let result = tokio::time::timeout(Duration::from_secs(60), write).await;

        assert!(result.is_err());
        assert_eq!(store.holder(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_delay() {
        let store = Arc::new(MockLeaseStore::new());
        let sink = Arc::new(RecordingEventSink::new());
        let lock = store.lock_with_events("pod-1", sink.clone());
        store.set_event_delay(Duration::from_secs(5));

        let start = tokio::time::Instant::now();
        lock.record_event("became leader").await;

        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(sink.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_event_sink_failure_is_swallowed() {
        let store = Arc::new(MockLeaseStore::new());
        let sink = Arc::new(RecordingEventSink::new());
        let lock = store.lock_with_events("pod-1", sink.clone());

        lock.record_event("became leader").await;
        sink.set_fail(true);
        lock.record_event("stopped leading").await;

        assert_eq!(sink.messages(), vec!["pod-1 became leader".to_string()]);
    }
}
