//! Event surface exposed to the rest of the application.
//!
//! The bus is an ordinary value owned by whoever constructs the client. There
//! is no process-wide emitter: listeners are registered on an instance and
//! removed from it explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::connectivity::ConnectivityState;
use crate::error::FetchError;
use crate::queue::QueuedRequest;

/// Events emitted by the resilience layer
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
  /// Connectivity state differs from the previous one
  ConnectivityChanged(ConnectivityState),
  /// Offline to online transition
  Reconnected,
  /// Number of pending queued requests changed
  QueueChanged { count: usize },
  /// A queued request exhausted its attempts and was dropped
  RequestFailed {
    request: QueuedRequest,
    error: FetchError,
  },
  /// The oldest request was pushed out to make room
  RequestEvicted { request: QueuedRequest },
  /// A queued request was delivered
  RequestDelivered { id: String, attempts: u32 },
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&NetworkEvent) + Send + Sync>;

/// Subscriber list for [`NetworkEvent`]s.
#[derive(Default)]
pub struct EventBus {
  next_id: AtomicU64,
  listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
}

impl EventBus {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a listener invoked for every emitted event.
  pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
  where
    F: Fn(&NetworkEvent) + Send + Sync + 'static,
  {
    let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .push((id, Arc::new(listener)));
    id
  }

  /// Remove a listener. Returns false if it was already gone.
  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
    let before = listeners.len();
    listeners.retain(|(sid, _)| *sid != id);
    listeners.len() != before
  }

  /// Subscribe with a channel instead of a callback.
  ///
  /// The receiver yields every event emitted after this call. Unsubscribe with
  /// the returned id to close it.
  pub fn channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<NetworkEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let id = self.subscribe(move |event| {
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(event.clone());
    });
    (id, rx)
  }

  /// Deliver `event` to every listener.
  pub fn emit(&self, event: &NetworkEvent) {
    // Snapshot so listeners can (un)subscribe from inside a callback
    let listeners: Vec<Listener> = self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();

    for listener in listeners {
      listener(event);
    }
  }

  pub fn listener_count(&self) -> usize {
    self
      .listeners
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .len()
  }
}

impl std::fmt::Debug for EventBus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("EventBus")
      .field("listeners", &self.listener_count())
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::AtomicUsize;

  #[test]
  fn test_subscribe_and_emit() {
    let bus = EventBus::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();

    bus.subscribe(move |_| {
      seen_clone.fetch_add(1, Ordering::SeqCst);
    });

    bus.emit(&NetworkEvent::Reconnected);
    bus.emit(&NetworkEvent::QueueChanged { count: 1 });
    assert_eq!(seen.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_unsubscribe_stops_delivery() {
    let bus = EventBus::new();
    let seen = Arc::new(AtomicUsize::new(0));
    let seen_clone = seen.clone();

    let id = bus.subscribe(move |_| {
      seen_clone.fetch_add(1, Ordering::SeqCst);
    });
    assert!(bus.unsubscribe(id));
    assert!(!bus.unsubscribe(id));

    bus.emit(&NetworkEvent::Reconnected);
    assert_eq!(seen.load(Ordering::SeqCst), 0);
    assert_eq!(bus.listener_count(), 0);
  }

  #[tokio::test]
  async fn test_channel_receives_events() {
    let bus = EventBus::new();
    let (_id, mut rx) = bus.channel();

    bus.emit(&NetworkEvent::QueueChanged { count: 3 });

    assert_eq!(
      rx.recv().await,
      Some(NetworkEvent::QueueChanged { count: 3 })
    );
  }

  #[test]
  fn test_listener_may_unsubscribe_itself() {
    let bus = Arc::new(EventBus::new());
    let bus_clone = bus.clone();
    let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
    let slot_clone = slot.clone();

    let id = bus.subscribe(move |_| {
      if let Some(id) = *slot_clone.lock().unwrap() {
        bus_clone.unsubscribe(id);
      }
    });
    *slot.lock().unwrap() = Some(id);

    bus.emit(&NetworkEvent::Reconnected);
    assert_eq!(bus.listener_count(), 0);
  }
}
