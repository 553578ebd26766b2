//! Connectivity state tracking.
//!
//! The monitor holds the single current [`ConnectivityState`] and turns raw
//! platform signals into `ConnectivityChanged` / `Reconnected` events. With no
//! signal source it stays optimistic (online), so callers fall back to plain
//! network semantics instead of queueing everything forever.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::event::{EventBus, NetworkEvent, SubscriptionId};

/// Transport class of the active network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkKind {
  Wifi,
  Cellular,
  Other,
  Unknown,
}

/// Snapshot of reachability. Replaced wholesale on every signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityState {
  pub connected: bool,
  pub internet_reachable: bool,
  pub transport: NetworkKind,
}

impl ConnectivityState {
  /// Assumed state when no platform signal is available.
  pub fn optimistic() -> Self {
    Self::online(NetworkKind::Unknown)
  }

  pub fn online(transport: NetworkKind) -> Self {
    Self {
      connected: true,
      internet_reachable: true,
      transport,
    }
  }

  pub fn offline() -> Self {
    Self {
      connected: false,
      internet_reachable: false,
      transport: NetworkKind::Unknown,
    }
  }

  pub fn is_online(&self) -> bool {
    self.connected && self.internet_reachable
  }
}

impl Default for ConnectivityState {
  fn default() -> Self {
    Self::optimistic()
  }
}

/// Owner of the current connectivity state.
pub struct ConnectivityMonitor {
  state: Mutex<ConnectivityState>,
  events: Arc<EventBus>,
}

impl ConnectivityMonitor {
  /// Create a monitor in the optimistic state.
  pub fn new(events: Arc<EventBus>) -> Self {
    Self::with_state(events, ConnectivityState::optimistic())
  }

  pub fn with_state(events: Arc<EventBus>, initial: ConnectivityState) -> Self {
    Self {
      state: Mutex::new(initial),
      events,
    }
  }

  /// Last known state.
  pub fn current(&self) -> ConnectivityState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn is_online(&self) -> bool {
    self.current().is_online()
  }

  /// Feed a platform signal into the monitor.
  ///
  /// Returns true if the state changed. An offline to online transition also
  /// emits `Reconnected`, which is what the queue drain listens for.
  pub fn update(&self, next: ConnectivityState) -> bool {
    let previous = {
      let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
      if *state == next {
        return false;
      }
      std::mem::replace(&mut *state, next)
    };

    let reconnected = !previous.is_online() && next.is_online();
    if reconnected {
      info!(transport = ?next.transport, "connectivity restored");
    } else if previous.is_online() && !next.is_online() {
      info!("connectivity lost");
    } else {
      debug!(?next, "connectivity changed");
    }

    self.events.emit(&NetworkEvent::ConnectivityChanged(next));
    if reconnected {
      self.events.emit(&NetworkEvent::Reconnected);
    }
    true
  }

  /// Register a callback for connectivity changes only.
  pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
  where
    F: Fn(ConnectivityState) + Send + Sync + 'static,
  {
    self.events.subscribe(move |event| {
      if let NetworkEvent::ConnectivityChanged(state) = event {
        listener(*state);
      }
    })
  }

  pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
    self.events.unsubscribe(id)
  }
}

impl std::fmt::Debug for ConnectivityMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectivityMonitor")
      .field("state", &self.current())
      .finish_non_exhaustive()
  }
}

/// Low-level reachability signal.
pub trait ReachabilityProbe: Send + Sync {
  fn probe(&self) -> BoxFuture<'_, ConnectivityState>;
}

/// Considers the network reachable when a TCP connection to `addr` succeeds.
#[derive(Debug, Clone)]
pub struct TcpProbe {
  addr: String,
  timeout: Duration,
}

impl TcpProbe {
  pub fn new(host: &str, port: u16) -> Self {
    Self {
      addr: format!("{}:{}", host, port),
      timeout: Duration::from_secs(3),
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }
}

impl ReachabilityProbe for TcpProbe {
  fn probe(&self) -> BoxFuture<'_, ConnectivityState> {
    Box::pin(async move {
      match tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr)).await {
        Ok(Ok(_)) => ConnectivityState::online(NetworkKind::Unknown),
        Ok(Err(e)) => {
          debug!(addr = %self.addr, error = %e, "reachability probe failed");
          ConnectivityState::offline()
        }
        Err(_) => {
          debug!(addr = %self.addr, "reachability probe timed out");
          ConnectivityState::offline()
        }
      }
    })
  }
}

/// Poll `probe` every `every` and feed the result into `monitor`.
pub fn spawn_probe<P>(monitor: Arc<ConnectivityMonitor>, probe: P, every: Duration) -> JoinHandle<()>
where
  P: ReachabilityProbe + 'static,
{
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      interval.tick().await;
      let state = probe.probe().await;
      monitor.update(state);
    }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn collect(events: &EventBus) -> Arc<Mutex<Vec<NetworkEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    events.subscribe(move |e| seen_clone.lock().unwrap().push(e.clone()));
    seen
  }

  #[test]
  fn test_defaults_to_online() {
    let monitor = ConnectivityMonitor::new(Arc::new(EventBus::new()));
    assert!(monitor.is_online());
    assert_eq!(monitor.current().transport, NetworkKind::Unknown);
  }

  #[test]
  fn test_same_state_is_not_a_change() {
    let events = Arc::new(EventBus::new());
    let seen = collect(&events);
    let monitor = ConnectivityMonitor::new(events);

    assert!(!monitor.update(ConnectivityState::optimistic()));
    assert!(seen.lock().unwrap().is_empty());
  }

  #[test]
  fn test_reconnect_emitted_only_on_offline_to_online() {
    let events = Arc::new(EventBus::new());
    let seen = collect(&events);
    let monitor = ConnectivityMonitor::with_state(events, ConnectivityState::offline());

    monitor.update(ConnectivityState::online(NetworkKind::Wifi));
    // online -> online with another transport: change, but no reconnect
    monitor.update(ConnectivityState::online(NetworkKind::Cellular));
    monitor.update(ConnectivityState::offline());

    let seen = seen.lock().unwrap();
    let reconnects = seen
      .iter()
      .filter(|e| matches!(e, NetworkEvent::Reconnected))
      .count();
    let changes = seen
      .iter()
      .filter(|e| matches!(e, NetworkEvent::ConnectivityChanged(_)))
      .count();
    assert_eq!(reconnects, 1);
    assert_eq!(changes, 3);
  }

  #[test]
  fn test_connected_without_internet_is_offline() {
    let state = ConnectivityState {
      connected: true,
      internet_reachable: false,
      transport: NetworkKind::Wifi,
    };
    assert!(!state.is_online());
  }

  #[test]
  fn test_subscribe_filters_connectivity_events() {
    let events = Arc::new(EventBus::new());
    let monitor = ConnectivityMonitor::new(events.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let id = monitor.subscribe(move |_| {
      calls_clone.fetch_add(1, Ordering::SeqCst);
    });

    events.emit(&NetworkEvent::QueueChanged { count: 2 });
    monitor.update(ConnectivityState::offline());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(monitor.unsubscribe(id));
    monitor.update(ConnectivityState::optimistic());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_tcp_probe_reports_reachable_listener() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let state = TcpProbe::new("127.0.0.1", port).probe().await;
    assert!(state.is_online());
  }

  #[tokio::test]
  async fn test_spawn_probe_feeds_monitor() {
    struct Down;
    impl ReachabilityProbe for Down {
      fn probe(&self) -> BoxFuture<'_, ConnectivityState> {
        Box::pin(async { ConnectivityState::offline() })
      }
    }

    let monitor = Arc::new(ConnectivityMonitor::new(Arc::new(EventBus::new())));
    let handle = spawn_probe(monitor.clone(), Down, Duration::from_millis(5));

    tokio::time::sleep(Duration::from_millis(50)).await;
    handle.abort();
    assert!(!monitor.is_online());
  }
}
