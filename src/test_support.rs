//! Shared helpers for unit tests.

use futures::future::BoxFuture;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::FetchError;
use crate::event::{EventBus, NetworkEvent};
use crate::request::{RequestSpec, Response};
use crate::transport::Transport;

type CallHook = Box<dyn Fn(&RequestSpec) + Send + Sync>;

/// Transport that replays scripted outcomes and records every call.
///
/// Scripted outcomes are consumed first; after that every call gets the
/// fallback outcome.
pub struct MockTransport {
  script: Mutex<VecDeque<Result<Response, FetchError>>>,
  fallback: Result<Response, FetchError>,
  calls: Mutex<Vec<RequestSpec>>,
  on_call: Mutex<Option<CallHook>>,
  delay: Option<Duration>,
}

impl MockTransport {
  /// Every call succeeds with `200 {"ok": true}`.
  pub fn ok() -> Self {
    Self::with_fallback(Ok(ok_response()))
  }

  /// Every call fails with `error`.
  pub fn failing(error: FetchError) -> Self {
    Self::with_fallback(Err(error))
  }

  fn with_fallback(fallback: Result<Response, FetchError>) -> Self {
    Self {
      script: Mutex::new(VecDeque::new()),
      fallback,
      calls: Mutex::new(Vec::new()),
      on_call: Mutex::new(None),
      delay: None,
    }
  }

  /// Queue a one-shot outcome ahead of the fallback.
  pub fn then(self, outcome: Result<Response, FetchError>) -> Self {
    self.script.lock().unwrap().push_back(outcome);
    self
  }

  /// Sleep before answering each call.
  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = Some(delay);
    self
  }

  /// Run `hook` at the start of every call.
  pub fn on_call<F>(&self, hook: F)
  where
    F: Fn(&RequestSpec) + Send + Sync + 'static,
  {
    *self.on_call.lock().unwrap() = Some(Box::new(hook));
  }

  pub fn calls(&self) -> Vec<RequestSpec> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Transport for MockTransport {
  fn execute<'a>(&'a self, request: &'a RequestSpec) -> BoxFuture<'a, Result<Response, FetchError>> {
    Box::pin(async move {
      self.calls.lock().unwrap().push(request.clone());
      if let Some(hook) = self.on_call.lock().unwrap().as_ref() {
        hook(request);
      }
      if let Some(delay) = self.delay {
        tokio::time::sleep(delay).await;
      }
      let scripted = self.script.lock().unwrap().pop_front();
      scripted.unwrap_or_else(|| self.fallback.clone())
    })
  }
}

pub fn ok_response() -> Response {
  Response::new(200, serde_json::json!({"ok": true}))
}

/// Record every event emitted on `events`.
pub fn record_events(events: &EventBus) -> Arc<Mutex<Vec<NetworkEvent>>> {
  let seen = Arc::new(Mutex::new(Vec::new()));
  let seen_clone = seen.clone();
  events.subscribe(move |e| seen_clone.lock().unwrap().push(e.clone()));
  seen
}

/// Poll `condition` until it holds or a second passes.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
  for _ in 0..100 {
    if condition() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  condition()
}
