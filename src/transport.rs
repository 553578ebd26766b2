//! Network transport abstraction.
//!
//! The resilience layer wraps calls, it does not define endpoints. Anything
//! that can turn a [`RequestSpec`] into a [`Response`] can sit underneath it;
//! production uses [`HttpTransport`], tests script their own.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::error::FetchError;
use crate::request::{Method, RequestSpec, Response};

/// Default per-attempt timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Something that performs a single network attempt.
pub trait Transport: Send + Sync {
  /// Perform `request` once. Non-2xx responses are errors.
  fn execute<'a>(&'a self, request: &'a RequestSpec) -> BoxFuture<'a, Result<Response, FetchError>>;
}

/// Run one attempt, converting an elapsed `timeout` into [`FetchError::Timeout`].
pub async fn execute_with_timeout(
  transport: &dyn Transport,
  request: &RequestSpec,
  timeout: Duration,
) -> Result<Response, FetchError> {
  match tokio::time::timeout(timeout, transport.execute(request)).await {
    Ok(result) => result,
    Err(_) => Err(FetchError::Timeout),
  }
}

/// HTTP transport using reqwest.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base_url: Option<Url>,
  timeout: Duration,
}

impl HttpTransport {
  /// Create a transport. Relative request URLs are joined onto `base_url`.
  pub fn new(base_url: Option<&str>, timeout: Duration) -> color_eyre::Result<Self> {
    let base_url = base_url
      .map(Url::parse)
      .transpose()
      .map_err(|e| color_eyre::eyre::eyre!("Invalid base URL: {}", e))?;

    let client = reqwest::Client::builder()
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      timeout,
    })
  }

  fn resolve(&self, url: &str) -> Result<Url, FetchError> {
    match Url::parse(url) {
      Ok(url) => Ok(url),
      Err(url::ParseError::RelativeUrlWithoutBase) => match &self.base_url {
        Some(base) => base
          .join(url)
          .map_err(|e| FetchError::Unknown(format!("invalid url {}: {}", url, e))),
        None => Err(FetchError::Unknown(format!(
          "relative url {} without a base url",
          url
        ))),
      },
      Err(e) => Err(FetchError::Unknown(format!("invalid url {}: {}", url, e))),
    }
  }

  async fn send(&self, request: &RequestSpec) -> Result<Response, FetchError> {
    let url = self.resolve(&request.url)?;
    debug!(method = %request.method, %url, "sending request");

    let mut builder = self
      .client
      .request(to_reqwest_method(request.method), url)
      .timeout(self.timeout);
    for (name, value) in &request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await.map_err(classify)?;
    let status = response.status().as_u16();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let text = response.text().await.map_err(classify)?;

    if !(200..300).contains(&status) {
      return Err(FetchError::from_status(status, &text));
    }

    Ok(Response {
      status,
      headers,
      body: Response::body_from_text(&text),
    })
  }
}

impl Transport for HttpTransport {
  fn execute<'a>(&'a self, request: &'a RequestSpec) -> BoxFuture<'a, Result<Response, FetchError>> {
    Box::pin(self.send(request))
  }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
  match method {
    Method::Get => reqwest::Method::GET,
    Method::Head => reqwest::Method::HEAD,
    Method::Options => reqwest::Method::OPTIONS,
    Method::Post => reqwest::Method::POST,
    Method::Put => reqwest::Method::PUT,
    Method::Patch => reqwest::Method::PATCH,
    Method::Delete => reqwest::Method::DELETE,
  }
}

/// Map a reqwest failure onto the error taxonomy.
fn classify(error: reqwest::Error) -> FetchError {
  if error.is_timeout() {
    FetchError::Timeout
  } else if error.is_connect() {
    FetchError::Connectivity
  } else if let Some(status) = error.status() {
    FetchError::from_status(status.as_u16(), &error.to_string())
  } else {
    FetchError::Unknown(error.to_string())
  }
}
