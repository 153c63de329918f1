//! Persisted replay queue with a retrying drain.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::sink::Sink;
use super::types::{ConnectivityState, DrainOutcome, DrainState, QueueEntry, SyncOptions};
use crate::error::{Error, Result};
use crate::medium::Medium;
use crate::store::DurableStore;

/// Store key holding the persisted queue snapshot.
pub const QUEUE_KEY: &str = "__syncQueue";

#[derive(Default)]
struct QueueState {
  entries: Vec<QueueEntry>,
  connectivity: ConnectivityState,
  drain: DrainState,
}

struct Shared<M: Medium, S: Sink> {
  store: Arc<DurableStore<M>>,
  sink: S,
  state: Mutex<QueueState>,
  options: Mutex<SyncOptions>,
  ticker: Mutex<Option<JoinHandle<()>>>,
  /// Set while a drain started by the ticker is waiting or running
  tick_drain: AtomicBool,
  /// One drain at a time
  drain_gate: tokio::sync::Mutex<()>,
  /// Orders snapshot writes so the last one persisted is the newest
  persist_gate: tokio::sync::Mutex<()>,
}

impl<M: Medium, S: Sink> Drop for Shared<M, S> {
  fn drop(&mut self) {
    if let Some(ticker) = lock(&self.ticker).take() {
      ticker.abort();
    }
  }
}

/// Outbound queue of mutations replayed against a [`Sink`].
///
/// Entries are applied in FIFO order, one sink call each. A drain makes up to
/// `max_retries` passes over the queued entries; a pass only counts if every
/// entry in it succeeds, and entries are only removed after such a pass.
/// Delivery is at-least-once: entries applied before a failure in the same
/// pass are applied again on the next pass.
///
/// Cloning yields another handle to the same queue.
pub struct ReplayQueue<M: Medium, S: Sink> {
  shared: Arc<Shared<M, S>>,
}

impl<M: Medium, S: Sink> Clone for ReplayQueue<M, S> {
  fn clone(&self) -> Self {
    Self {
      shared: Arc::clone(&self.shared),
    }
  }
}

impl<M: Medium + 'static, S: Sink + 'static> ReplayQueue<M, S> {
  /// Create an empty, disconnected queue with default options.
  ///
  /// No periodic trigger runs until [`ReplayQueue::configure`] is called.
  pub fn new(store: Arc<DurableStore<M>>, sink: S) -> Self {
    Self {
      shared: Arc::new(Shared {
        store,
        sink,
        state: Mutex::new(QueueState::default()),
        options: Mutex::new(SyncOptions::default()),
        ticker: Mutex::new(None),
        tick_drain: AtomicBool::new(false),
        drain_gate: tokio::sync::Mutex::new(()),
        persist_gate: tokio::sync::Mutex::new(()),
      }),
    }
  }

  /// Create a queue and restore the snapshot persisted in `store`.
  pub async fn open(store: Arc<DurableStore<M>>, sink: S) -> Self {
    let restored = match store.get::<Vec<QueueEntry>>(QUEUE_KEY, false).await {
      Ok(entries) => entries.unwrap_or_default(),
      Err(e) => {
        warn!(error = %e, "discarding unreadable queue snapshot");
        Vec::new()
      }
    };

    let queue = Self::new(store, sink);
    if !restored.is_empty() {
      info!(pending = restored.len(), "restored queued operations");
      queue.state().entries = restored;
    }
    queue
  }

  /// Replace the drain options and re-arm the periodic trigger.
  ///
  /// Must be called from within a Tokio runtime.
  pub fn configure(&self, options: SyncOptions) {
    let interval = options.interval;
    *lock(&self.shared.options) = options;
    self.arm(interval);
  }

  /// Cancel the periodic trigger. A drain already running is not interrupted.
  pub fn stop(&self) {
    if let Some(ticker) = lock(&self.shared.ticker).take() {
      ticker.abort();
      debug!("periodic sync stopped");
    }
  }

  /// Append `entry` and persist the queue. Drains before returning when
  /// connected; the drain result does not affect the return value.
  pub async fn enqueue(&self, entry: QueueEntry) -> Result<()> {
    debug!(key = %entry.key, operation = %entry.operation, "queueing operation");
    self.state().entries.push(entry);
    self.persist().await?;

    if self.is_connected() {
      self.drain().await;
    }
    Ok(())
  }

  /// Apply every queued entry to the sink, retrying whole passes.
  pub async fn drain(&self) -> DrainOutcome {
    let _drain = self.shared.drain_gate.lock().await;

    let batch = self.pending_operations();
    if batch.is_empty() {
      return DrainOutcome::Empty;
    }

    let (max_retries, on_complete, on_error) = {
      let options = lock(&self.shared.options);
      (
        options.max_retries.max(1),
        options.on_complete.clone(),
        options.on_error.clone(),
      )
    };

    self.state().drain = DrainState::Draining;

    let mut attempt = 0;
    let error = loop {
      attempt += 1;
      match self.apply_pass(&batch).await {
        Ok(()) => {
          self.complete(batch.len()).await;
          self.state().drain = DrainState::Idle;
          info!(applied = batch.len(), attempt, "queue drained");

          if let Some(callback) = on_complete {
            callback(true);
          }
          return DrainOutcome::Synced {
            applied: batch.len(),
            attempts: attempt,
          };
        }
        Err(e) if attempt < max_retries => {
          warn!(attempt, max_retries, error = %e, "drain pass failed");
        }
        Err(e) => break e,
      }
    };

    self.state().drain = DrainState::Idle;
    error!(pending = batch.len(), attempts = attempt, error = %error, "drain gave up");
    if let Some(callback) = on_error {
      callback(&error);
    }
    DrainOutcome::Failed {
      attempts: attempt,
      error,
    }
  }

  /// Same as [`ReplayQueue::drain`].
  pub async fn sync_queued_items(&self) -> DrainOutcome {
    self.drain().await
  }

  /// Report a connectivity change. Going from disconnected to connected
  /// starts a drain on its own task and returns its handle.
  pub fn set_connected(&self, connected: bool) -> Option<JoinHandle<DrainOutcome>> {
    let was_connected = {
      let mut state = self.state();
      let was = state.connectivity.is_connected;
      state.connectivity.is_connected = connected;
      was
    };

    if connected && !was_connected {
      info!("connectivity restored");
      return Some(self.spawn_drain());
    }
    if !connected && was_connected {
      info!("connectivity lost");
    }
    None
  }

  /// Follow connectivity reported through a watch channel.
  ///
  /// The current value is applied immediately. The returned task ends when
  /// the sender is dropped or the queue is gone.
  pub fn observe(&self, mut connectivity: watch::Receiver<bool>) -> JoinHandle<()> {
    let initial = *connectivity.borrow_and_update();
    self.set_connected(initial);

    let weak = Arc::downgrade(&self.shared);
    tokio::spawn(async move {
      while connectivity.changed().await.is_ok() {
        let connected = *connectivity.borrow_and_update();
        match Self::upgrade(&weak) {
          Some(queue) => {
            queue.set_connected(connected);
          }
          None => break,
        }
      }
    })
  }

  /// Snapshot of the queued entries, oldest first.
  pub fn pending_operations(&self) -> Vec<QueueEntry> {
    self.state().entries.clone()
  }

  pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
    self.state().connectivity.last_sync_at
  }

  pub fn is_connected(&self) -> bool {
    self.state().connectivity.is_connected
  }

  pub fn connectivity(&self) -> ConnectivityState {
    self.state().connectivity.clone()
  }

  pub fn drain_state(&self) -> DrainState {
    self.state().drain
  }

  fn arm(&self, interval: Duration) {
    let weak = Arc::downgrade(&self.shared);
    let ticker = tokio::spawn(async move {
      let mut ticks = tokio::time::interval(interval);
      ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
      // The first tick fires immediately.
      ticks.tick().await;

      loop {
        ticks.tick().await;
        let Some(queue) = Self::upgrade(&weak) else {
          break;
        };
        // A slow sink must not pile up one waiting drain per tick.
        if queue.is_connected() && !queue.shared.tick_drain.swap(true, Ordering::AcqRel) {
          tokio::spawn(async move {
            queue.drain().await;
            queue.shared.tick_drain.store(false, Ordering::Release);
          });
        }
      }
    });

    if let Some(previous) = lock(&self.shared.ticker).replace(ticker) {
      previous.abort();
    }
    debug!(?interval, "periodic sync armed");
  }

  // Drains run on their own task so that stopping the ticker never cancels one.
  fn spawn_drain(&self) -> JoinHandle<DrainOutcome> {
    let queue = self.clone();
    tokio::spawn(async move { queue.drain().await })
  }

  async fn apply_pass(&self, batch: &[QueueEntry]) -> Result<()> {
    for entry in batch {
      self
        .shared
        .sink
        .apply(entry)
        .await
        .map_err(|source| Error::SinkFailure {
          key: entry.key.clone(),
          source,
        })?;
    }
    Ok(())
  }

  /// Drop the `applied` oldest entries and stamp the sync time.
  async fn complete(&self, applied: usize) {
    {
      let mut state = self.state();
      let applied = applied.min(state.entries.len());
      state.entries.drain(..applied);
      state.connectivity.last_sync_at = Some(Utc::now());
    }

    // The sink already has these entries; a failed write only means they may
    // be replayed again after a restart.
    if let Err(e) = self.persist().await {
      error!(error = %e, "failed to persist drained queue");
    }
  }

  async fn persist(&self) -> Result<()> {
    let _persist = self.shared.persist_gate.lock().await;
    let snapshot = self.pending_operations();
    self
      .shared
      .store
      .set(QUEUE_KEY, &snapshot, false, None)
      .await
  }

  fn upgrade(shared: &Weak<Shared<M, S>>) -> Option<Self> {
    shared.upgrade().map(|shared| Self { shared })
  }

  fn state(&self) -> MutexGuard<'_, QueueState> {
    lock(&self.shared.state)
  }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
  mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::codec::Obfuscator;
  use crate::error::SinkError;
  use crate::medium::MemoryMedium;
  use crate::sync::sink::FnSink;
  use async_trait::async_trait;
  use serde_json::json;
  use std::collections::HashSet;
  use std::sync::atomic::AtomicUsize;

  /// Sink recording every applied key.
  #[derive(Default)]
  struct RecordingSink {
    applied: Mutex<Vec<String>>,
    calls: AtomicUsize,
    fail_all: AtomicBool,
    fail_once: Mutex<HashSet<String>>,
    delay: Option<Duration>,
  }

  impl RecordingSink {
    fn applied(&self) -> Vec<String> {
      lock(&self.applied).clone()
    }
  }

  #[async_trait]
  impl Sink for RecordingSink {
    async fn apply(&self, entry: &QueueEntry) -> std::result::Result<(), SinkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      if self.fail_all.load(Ordering::SeqCst) {
        return Err("backend unreachable".into());
      }
      if lock(&self.fail_once).remove(&entry.key) {
        return Err(format!("rejected {}", entry.key).into());
      }
      lock(&self.applied).push(entry.key.clone());
      Ok(())
    }
  }

  fn store() -> Arc<DurableStore<MemoryMedium>> {
    Arc::new(DurableStore::new(
      MemoryMedium::new(),
      Arc::new(Obfuscator::new()),
    ))
  }

  fn queue_with(sink: RecordingSink) -> (ReplayQueue<MemoryMedium, Arc<RecordingSink>>, Arc<RecordingSink>) {
    let sink = Arc::new(sink);
    (ReplayQueue::new(store(), sink.clone()), sink)
  }

  fn entry(key: &str) -> QueueEntry {
    QueueEntry::set(key, &json!({ "key": key })).unwrap()
  }

  fn keys(entries: &[QueueEntry]) -> Vec<String> {
    entries.iter().map(|e| e.key.clone()).collect()
  }

  async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..100 {
      if condition() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 1s");
  }

  #[tokio::test]
  async fn test_offline_entries_drain_on_reconnect() {
    let (queue, sink) = queue_with(RecordingSink::default());
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    queue.configure(SyncOptions::default().on_complete(move |ok| {
      assert!(ok);
      counter.fetch_add(1, Ordering::SeqCst);
    }));

    for key in ["a", "b", "c"] {
      queue.enqueue(entry(key)).await.unwrap();
    }
    assert_eq!(keys(&queue.pending_operations()), vec!["a", "b", "c"]);
    assert!(sink.applied().is_empty());

    let outcome = queue.set_connected(true).unwrap().await.unwrap();
    assert!(matches!(
      outcome,
      DrainOutcome::Synced {
        applied: 3,
        attempts: 1
      }
    ));

    assert!(queue.pending_operations().is_empty());
    assert_eq!(sink.applied(), vec!["a", "b", "c"]);
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    assert!(queue.last_sync_at().is_some());
    assert_eq!(queue.drain_state(), DrainState::Idle);

    let connectivity = queue.connectivity();
    assert!(connectivity.is_connected);
    assert_eq!(connectivity.last_sync_at, queue.last_sync_at());
  }

  #[tokio::test]
  async fn test_retry_exhaustion_keeps_queue() {
    let (queue, sink) = queue_with(RecordingSink::default());
    sink.fail_all.store(true, Ordering::SeqCst);

    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    queue.configure(SyncOptions::default().max_retries(2).on_error(move |e| {
      assert!(matches!(e, Error::SinkFailure { .. }));
      counter.fetch_add(1, Ordering::SeqCst);
    }));

    for key in ["a", "b", "c"] {
      queue.enqueue(entry(key)).await.unwrap();
    }
    let before = queue.pending_operations();

    let outcome = queue.drain().await;
    assert!(matches!(outcome, DrainOutcome::Failed { attempts: 2, .. }));
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(queue.pending_operations(), before);
    // The first entry fails each pass, so each pass makes one call.
    assert_eq!(sink.calls.load(Ordering::SeqCst), 2);
    assert!(queue.last_sync_at().is_none());
  }

  #[tokio::test]
  async fn test_failed_pass_restarts_from_the_top() {
    let (queue, sink) = queue_with(RecordingSink::default());
    lock(&sink.fail_once).insert("b".to_string());

    for key in ["a", "b", "c"] {
      queue.enqueue(entry(key)).await.unwrap();
    }

    let outcome = queue.drain().await;
    assert!(matches!(
      outcome,
      DrainOutcome::Synced {
        applied: 3,
        attempts: 2
      }
    ));
    // "a" was applied by both passes.
    assert_eq!(sink.applied(), vec!["a", "a", "b", "c"]);
    assert!(queue.pending_operations().is_empty());
  }

  #[tokio::test]
  async fn test_zero_retries_still_makes_one_pass() {
    let (queue, sink) = queue_with(RecordingSink::default());
    queue.configure(SyncOptions::default().max_retries(0));
    queue.enqueue(entry("a")).await.unwrap();

    assert!(queue.drain().await.is_synced());
    assert_eq!(sink.applied(), vec!["a"]);
  }

  #[tokio::test]
  async fn test_empty_drain_is_a_no_op() {
    let (queue, sink) = queue_with(RecordingSink::default());
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    queue.configure(SyncOptions::default().on_complete(move |_| {
      counter.fetch_add(1, Ordering::SeqCst);
    }));

    assert!(matches!(queue.drain().await, DrainOutcome::Empty));
    assert_eq!(completions.load(Ordering::SeqCst), 0);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    assert!(queue.last_sync_at().is_none());
  }

  #[tokio::test]
  async fn test_enqueue_while_connected_drains_immediately() {
    let (queue, sink) = queue_with(RecordingSink::default());
    if let Some(handle) = queue.set_connected(true) {
      handle.await.unwrap();
    }

    queue.enqueue(entry("a")).await.unwrap();
    assert!(queue.pending_operations().is_empty());
    assert_eq!(sink.applied(), vec!["a"]);
  }

  #[tokio::test]
  async fn test_queue_is_persisted_and_restored() {
    let store = store();
    let sink = Arc::new(RecordingSink::default());

    {
      let queue = ReplayQueue::new(store.clone(), sink.clone());
      queue.enqueue(entry("a")).await.unwrap();
      queue.enqueue(QueueEntry::remove("b")).await.unwrap();
    }

    let persisted: Vec<QueueEntry> = store.get(QUEUE_KEY, false).await.unwrap().unwrap();
    assert_eq!(keys(&persisted), vec!["a", "b"]);

    let queue = ReplayQueue::open(store.clone(), sink.clone()).await;
    assert_eq!(queue.pending_operations(), persisted);

    assert!(queue.drain().await.is_synced());
    let persisted: Vec<QueueEntry> = store.get(QUEUE_KEY, false).await.unwrap().unwrap();
    assert!(persisted.is_empty());
  }

  #[tokio::test]
  async fn test_enqueue_persist_failure_propagates() {
    let (queue, _sink) = queue_with(RecordingSink::default());
    queue.shared.store.medium().fail_writes(true);

    let err = queue.enqueue(entry("a")).await.unwrap_err();
    assert!(matches!(err, Error::PersistFailure { ref key, .. } if key == QUEUE_KEY));
    assert_eq!(keys(&queue.pending_operations()), vec!["a"]);
  }

  #[tokio::test]
  async fn test_entries_enqueued_mid_drain_are_kept() {
    let (queue, sink) = queue_with(RecordingSink {
      delay: Some(Duration::from_millis(50)),
      ..RecordingSink::default()
    });
    queue.enqueue(entry("a")).await.unwrap();

    let draining = queue.clone();
    let handle = tokio::spawn(async move { draining.drain().await });
    wait_until(|| queue.drain_state() == DrainState::Draining).await;

    queue.enqueue(entry("b")).await.unwrap();
    let outcome = handle.await.unwrap();

    assert!(matches!(outcome, DrainOutcome::Synced { applied: 1, .. }));
    assert_eq!(sink.applied(), vec!["a"]);
    assert_eq!(keys(&queue.pending_operations()), vec!["b"]);
  }

  #[tokio::test]
  async fn test_periodic_trigger_retries_when_connected() {
    let (queue, sink) = queue_with(RecordingSink::default());
    sink.fail_all.store(true, Ordering::SeqCst);
    queue.configure(
      SyncOptions::default()
        .interval(Duration::from_millis(20))
        .max_retries(1),
    );
    if let Some(handle) = queue.set_connected(true) {
      handle.await.unwrap();
    }

    queue.enqueue(entry("a")).await.unwrap();
    assert_eq!(queue.pending_operations().len(), 1);

    sink.fail_all.store(false, Ordering::SeqCst);
    wait_until(|| queue.pending_operations().is_empty()).await;
    assert_eq!(sink.applied(), vec!["a"]);
  }

  #[tokio::test]
  async fn test_slow_sink_keeps_one_periodic_drain_in_flight() {
    let (queue, sink) = queue_with(RecordingSink {
      delay: Some(Duration::from_millis(300)),
      ..RecordingSink::default()
    });
    queue.enqueue(entry("a")).await.unwrap();
    queue.configure(SyncOptions::default().interval(Duration::from_millis(10)));

    let reconnect = queue.set_connected(true).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // This handle, the reconnect drain, and at most one drain from the ticker.
    assert!(Arc::strong_count(&queue.shared) <= 3);

    assert!(reconnect.await.unwrap().is_synced());
    assert_eq!(sink.applied(), vec!["a"]);
  }

  #[tokio::test]
  async fn test_stop_disarms_periodic_trigger() {
    let (queue, sink) = queue_with(RecordingSink::default());
    sink.fail_all.store(true, Ordering::SeqCst);
    queue.configure(
      SyncOptions::default()
        .interval(Duration::from_millis(20))
        .max_retries(1),
    );
    if let Some(handle) = queue.set_connected(true) {
      handle.await.unwrap();
    }
    queue.enqueue(entry("a")).await.unwrap();

    queue.stop();
    sink.fail_all.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.pending_operations().len(), 1);

    assert!(queue.drain().await.is_synced());
    assert!(queue.pending_operations().is_empty());
  }

  #[tokio::test]
  async fn test_no_drain_while_disconnected() {
    let (queue, sink) = queue_with(RecordingSink::default());
    queue.configure(SyncOptions::default().interval(Duration::from_millis(10)));
    queue.enqueue(entry("a")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
    assert_eq!(queue.pending_operations().len(), 1);
  }

  #[tokio::test]
  async fn test_watch_channel_reconnect_triggers_drain() {
    let (queue, sink) = queue_with(RecordingSink::default());
    let (tx, rx) = watch::channel(false);
    let _observer = queue.observe(rx);

    queue.enqueue(entry("a")).await.unwrap();
    queue.enqueue(entry("b")).await.unwrap();
    assert!(!queue.is_connected());

    tx.send(true).unwrap();
    wait_until(|| queue.pending_operations().is_empty()).await;
    assert_eq!(sink.applied(), vec!["a", "b"]);
    assert!(queue.is_connected());

    tx.send(false).unwrap();
    wait_until(|| !queue.is_connected()).await;
  }

  #[tokio::test]
  async fn test_only_the_disconnected_to_connected_edge_drains() {
    let (queue, _sink) = queue_with(RecordingSink::default());
    assert!(queue.set_connected(false).is_none());
    assert!(queue.set_connected(true).is_some());
    assert!(queue.set_connected(true).is_none());
    assert!(queue.set_connected(false).is_none());
  }

  #[tokio::test]
  async fn test_closure_sink() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    let sink = FnSink(move |entry: QueueEntry| {
      let log = log.clone();
      async move {
        lock(&log).push((entry.key, entry.operation));
        Ok::<(), SinkError>(())
      }
    });
    let queue = ReplayQueue::new(store(), sink);

    queue.enqueue(entry("a")).await.unwrap();
    queue.enqueue(QueueEntry::remove("a")).await.unwrap();
    assert!(queue.sync_queued_items().await.is_synced());

    use crate::sync::types::Operation;
    assert_eq!(
      *lock(&seen),
      vec![
        ("a".to_string(), Operation::Set),
        ("a".to_string(), Operation::Remove)
      ]
    );
  }
}
