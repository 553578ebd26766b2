//! Durable FIFO queue of writes awaiting delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::request::{DrainReport, QueuedRequest};
use crate::clock::Clock;
use crate::connectivity::ConnectivityMonitor;
use crate::error::FetchError;
use crate::event::{EventBus, NetworkEvent, SubscriptionId};
use crate::request::RequestSpec;
use crate::store::KeyValueStore;
use crate::transport::{self, Transport};

/// Storage key holding the serialized queue.
pub const QUEUE_KEY: &str = "queue:pending";

/// Queue sizing and retry limits.
#[derive(Debug, Clone)]
pub struct QueueConfig {
  /// Maximum queued items; the oldest is evicted to make room
  pub capacity: usize,
  /// Attempts granted when the caller does not choose
  pub default_max_attempts: u32,
  /// Timeout for each delivery attempt
  pub attempt_timeout: Duration,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      capacity: 50,
      default_max_attempts: 3,
      attempt_timeout: transport::DEFAULT_TIMEOUT,
    }
  }
}

/// Everything the queue talks to.
pub struct QueueDeps {
  pub store: Arc<dyn KeyValueStore>,
  pub clock: Arc<dyn Clock>,
  pub monitor: Arc<ConnectivityMonitor>,
  pub transport: Arc<dyn Transport>,
  pub events: Arc<EventBus>,
}

/// Ordered, persisted list of pending writes.
///
/// The in-memory list is authoritative for the session; the persisted copy
/// exists for restart recovery and is rewritten in full after every change.
pub struct MutationQueue {
  items: Mutex<Vec<QueuedRequest>>,
  draining: AtomicBool,
  deps: QueueDeps,
  config: QueueConfig,
}

/// Resets the draining flag when a pass ends, including on panic or cancel.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}

impl MutationQueue {
  /// Create the queue, restoring whatever was persisted by a previous session.
  pub fn load(deps: QueueDeps, config: QueueConfig) -> Self {
    let items = match deps.store.get(QUEUE_KEY) {
      Ok(Some(raw)) => match serde_json::from_str::<Vec<QueuedRequest>>(&raw) {
        Ok(mut items) => {
          // Stable: ties keep their persisted (insertion) order
          items.sort_by_key(|item| item.enqueued_at);
          items
        }
        Err(e) => {
          warn!(error = %e, "persisted queue is unreadable, starting empty");
          Vec::new()
        }
      },
      Ok(None) => Vec::new(),
      Err(e) => {
        warn!(error = %e, "failed to load persisted queue, starting empty");
        Vec::new()
      }
    };

    if !items.is_empty() {
      info!(count = items.len(), "restored queued requests");
    }

    Self {
      items: Mutex::new(items),
      draining: AtomicBool::new(false),
      deps,
      config,
    }
  }

  pub fn config(&self) -> &QueueConfig {
    &self.config
  }

  fn lock(&self) -> MutexGuard<'_, Vec<QueuedRequest>> {
    self.items.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Add a write to the back of the queue and return its id.
  ///
  /// Never fails: at capacity the oldest item is evicted first.
  pub fn enqueue(&self, target: RequestSpec, max_attempts: u32, context: impl Into<String>) -> String {
    let request = QueuedRequest::new(target, max_attempts, context.into(), self.deps.clock.now());
    let id = request.id.clone();

    let (evicted, count) = {
      let mut items = self.lock();
      let mut evicted = Vec::new();
      while !items.is_empty() && items.len() >= self.config.capacity.max(1) {
        evicted.push(items.remove(0));
      }
      items.push(request);
      self.persist(&items);
      (evicted, items.len())
    };

    for request in evicted {
      warn!(id = %request.id, context = %request.context, "queue full, evicted oldest request");
      self
        .deps
        .events
        .emit(&NetworkEvent::RequestEvicted { request });
    }
    info!(%id, count, "request queued");
    self.deps.events.emit(&NetworkEvent::QueueChanged { count });
    id
  }

  /// Remove a queued request. Returns false if it is not queued.
  pub fn cancel(&self, id: &str) -> bool {
    let count = {
      let mut items = self.lock();
      let Some(pos) = items.iter().position(|item| item.id == id) else {
        return false;
      };
      items.remove(pos);
      self.persist(&items);
      items.len()
    };

    info!(id, "queued request cancelled");
    self.deps.events.emit(&NetworkEvent::QueueChanged { count });
    true
  }

  /// Try to deliver every queued request once, oldest first.
  ///
  /// No-op while another pass is running or while offline. Items failing with
  /// a retryable error stay queued for the next pass until their attempts run
  /// out; a permanent error fails the item immediately. The pass stops as
  /// soon as connectivity is lost; attempts already counted stay counted.
  pub async fn drain(&self) -> DrainReport {
    if self.draining.swap(true, Ordering::SeqCst) {
      debug!("drain already in progress");
      return DrainReport::skipped(self.len());
    }
    let _guard = DrainGuard(&self.draining);

    if !self.deps.monitor.is_online() {
      debug!("offline, not draining");
      return DrainReport::skipped(self.len());
    }

    let snapshot = self.pending();
    if snapshot.is_empty() {
      return DrainReport::default();
    }

    let mut report = DrainReport::default();
    for item in snapshot {
      if !self.deps.monitor.is_online() {
        report.interrupted = true;
        break;
      }

      let Some(attempts) = self.begin_attempt(&item.id) else {
        // Cancelled or evicted since the snapshot
        continue;
      };
      report.attempted += 1;

      let result = transport::execute_with_timeout(
        self.deps.transport.as_ref(),
        &item.target,
        self.config.attempt_timeout,
      )
      .await;

      match result {
        Ok(_) => {
          self.remove(&item.id);
          report.delivered += 1;
          debug!(id = %item.id, attempts, "queued request delivered");
          self.deps.events.emit(&NetworkEvent::RequestDelivered {
            id: item.id.clone(),
            attempts,
          });
        }
        Err(error) => {
          let lost_connection = error == FetchError::Connectivity;
          if let Some(request) = self.record_failure(&item.id, &error) {
            report.failed += 1;
            warn!(
              id = %request.id,
              context = %request.context,
              attempts = request.attempts,
              %error,
              "queued request failed permanently"
            );
            self
              .deps
              .events
              .emit(&NetworkEvent::RequestFailed { request, error });
          } else {
            debug!(id = %item.id, attempts, %error, "queued request failed, will retry");
          }
          if lost_connection {
            report.interrupted = true;
            break;
          }
        }
      }
    }

    let count = {
      let items = self.lock();
      self.persist(&items);
      items.len()
    };
    report.remaining = count;

    if report.interrupted {
      info!(?report, "drain interrupted by connectivity loss");
    } else {
      info!(?report, "drain pass finished");
    }
    // Cancels and evictions during the pass emit their own count
    if report.attempted > 0 {
      self.deps.events.emit(&NetworkEvent::QueueChanged { count });
    }
    report
  }

  /// Count an attempt against `id`. Returns the new attempt count.
  fn begin_attempt(&self, id: &str) -> Option<u32> {
    let now = self.deps.clock.now();
    let mut items = self.lock();
    let item = items.iter_mut().find(|item| item.id == id)?;
    item.attempts += 1;
    item.last_attempt_at = Some(now);
    Some(item.attempts)
  }

  /// Record a failed attempt. Returns the item if it is now terminal and removed:
  /// either its attempts are used up or the error is permanent.
  fn record_failure(&self, id: &str, error: &FetchError) -> Option<QueuedRequest> {
    let mut items = self.lock();
    let pos = items.iter().position(|item| item.id == id)?;
    items[pos].last_error = Some(error.clone());
    if !error.is_retryable() || items[pos].is_exhausted() {
      Some(items.remove(pos))
    } else {
      None
    }
  }

  fn remove(&self, id: &str) {
    self.lock().retain(|item| item.id != id);
  }

  /// Rewrite the persisted copy. Failures are logged, never rolled back.
  fn persist(&self, items: &[QueuedRequest]) {
    let result = serde_json::to_string(items)
      .map_err(|e| e.to_string())
      .and_then(|raw| {
        self
          .deps
          .store
          .set(QUEUE_KEY, &raw)
          .map_err(|e| e.to_string())
      });
    if let Err(error) = result {
      warn!(%error, "failed to persist queue");
    }
  }

  /// Snapshot of queued requests in delivery order.
  pub fn pending(&self) -> Vec<QueuedRequest> {
    self.lock().clone()
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_draining(&self) -> bool {
    self.draining.load(Ordering::SeqCst)
  }
}

/// Background task that drains the queue whenever connectivity comes back.
///
/// Dropping the handle stops the task and removes its subscription.
pub struct AutoDrain {
  handle: JoinHandle<()>,
  events: Arc<EventBus>,
  subscription: SubscriptionId,
}

/// Start draining `queue` on every `Reconnected` event.
pub fn spawn_auto_drain(queue: Arc<MutationQueue>) -> AutoDrain {
  let events = queue.deps.events.clone();
  let (subscription, mut rx) = events.channel();

  let handle = tokio::spawn(async move {
    while let Some(event) = rx.recv().await {
      if event == NetworkEvent::Reconnected {
        let report = queue.drain().await;
        debug!(?report, "reconnect drain");
      }
    }
  });

  AutoDrain {
    handle,
    events,
    subscription,
  }
}

impl Drop for AutoDrain {
  fn drop(&mut self) {
    self.handle.abort();
    self.events.unsubscribe(self.subscription);
  }
}
