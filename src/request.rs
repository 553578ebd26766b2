//! Request and response values passed through the fetch layer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// HTTP method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
  Get,
  Head,
  Options,
  Post,
  Put,
  Patch,
  Delete,
}

impl Method {
  /// Reads are cacheable and never queued.
  pub fn is_read(&self) -> bool {
    matches!(self, Method::Get | Method::Head | Method::Options)
  }

  pub fn as_str(&self) -> &'static str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Options => "OPTIONS",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    }
  }
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Method {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_uppercase().as_str() {
      "GET" => Ok(Method::Get),
      "HEAD" => Ok(Method::Head),
      "OPTIONS" => Ok(Method::Options),
      "POST" => Ok(Method::Post),
      "PUT" => Ok(Method::Put),
      "PATCH" => Ok(Method::Patch),
      "DELETE" => Ok(Method::Delete),
      other => Err(format!("unsupported method: {}", other)),
    }
  }
}

/// Everything needed to (re)issue a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestSpec {
  pub method: Method,
  pub url: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Option<serde_json::Value>,
}

impl RequestSpec {
  pub fn new(method: Method, url: impl Into<String>) -> Self {
    Self {
      method,
      url: url.into(),
      headers: BTreeMap::new(),
      body: None,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new(Method::Get, url)
  }

  pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
    Self::new(Method::Post, url).with_body(body)
  }

  pub fn with_body(mut self, body: serde_json::Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

/// A completed network response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  /// JSON body. Non-JSON text is kept as a JSON string, empty bodies as null.
  pub body: serde_json::Value,
}

impl Response {
  pub fn new(status: u16, body: serde_json::Value) -> Self {
    Self {
      status,
      headers: BTreeMap::new(),
      body,
    }
  }

  /// Decode a raw body the way the transport does.
  pub fn body_from_text(text: &str) -> serde_json::Value {
    if text.trim().is_empty() {
      return serde_json::Value::Null;
    }
    serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_read_methods() {
    assert!(Method::Get.is_read());
    assert!(Method::Head.is_read());
    assert!(!Method::Post.is_read());
    assert!(!Method::Delete.is_read());
  }

  #[test]
  fn test_method_parse_is_case_insensitive() {
    assert_eq!("patch".parse::<Method>(), Ok(Method::Patch));
    assert!("TRACE".parse::<Method>().is_err());
  }

  #[test]
  fn test_body_from_text() {
    assert_eq!(Response::body_from_text(""), serde_json::Value::Null);
    assert_eq!(Response::body_from_text("{\"a\":1}"), json!({"a": 1}));
    assert_eq!(Response::body_from_text("plain"), json!("plain"));
  }
}
