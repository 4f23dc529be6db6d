//! HTTP transport used by the fetch layer.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Transport-level failures.
///
/// Only [`TransportError::Unreachable`] means "the exchange could not
/// complete"; it is the one failure the fetch layer answers from the cache.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
  /// No network, connection refused, timeout, or the body was cut off.
  #[error("request to {url} could not complete: {message}")]
  Unreachable { url: String, message: String },

  /// The server answered with a non-success status.
  #[error("request to {url} failed with status {status}")]
  Status { url: String, status: u16 },

  /// The request could not be built.
  #[error("invalid request to {url}: {message}")]
  InvalidRequest { url: String, message: String },
}

impl TransportError {
  pub fn is_unreachable(&self) -> bool {
    matches!(self, TransportError::Unreachable { .. })
  }
}

/// Issues GET requests and returns the fully buffered body.
#[async_trait]
pub trait HttpTransport: Send + Sync + 'static {
  async fn get(&self, url: &Url) -> Result<Vec<u8>, TransportError>;
}

#[async_trait]
impl<T: HttpTransport> HttpTransport for std::sync::Arc<T> {
  async fn get(&self, url: &Url) -> Result<Vec<u8>, TransportError> {
    (**self).get(url).await
  }
}

/// Transport backed by a shared `reqwest` client.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  /// Build a transport. `session_token`, when present, is sent as a bearer
  /// token on every request.
  pub fn new(
    timeout: Duration,
    user_agent: &str,
    session_token: Option<&str>,
  ) -> Result<Self, TransportError> {
    let mut headers = HeaderMap::new();
    if let Some(token) = session_token {
      let mut value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
        TransportError::InvalidRequest {
          url: String::new(),
          message: format!("session token is not a valid header value: {}", e),
        }
      })?;
      value.set_sensitive(true);
      headers.insert(AUTHORIZATION, value);
    }

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .user_agent(user_agent)
      .default_headers(headers)
      .build()
      .map_err(|e| TransportError::InvalidRequest {
        url: String::new(),
        message: e.to_string(),
      })?;

    Ok(Self { client })
  }
}

fn classify(url: &Url, error: reqwest::Error) -> TransportError {
  if error.is_builder() {
    TransportError::InvalidRequest {
      url: url.to_string(),
      message: error.to_string(),
    }
  } else {
    TransportError::Unreachable {
      url: url.to_string(),
      message: error.to_string(),
    }
  }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
  async fn get(&self, url: &Url) -> Result<Vec<u8>, TransportError> {
    debug!("GET {}", url);

    let response = self
      .client
      .get(url.clone())
      .send()
      .await
      .map_err(|e| classify(url, e))?;

    let status = response.status();
    if !status.is_success() {
      return Err(TransportError::Status {
        url: url.to_string(),
        status: status.as_u16(),
      });
    }

    let body = response.bytes().await.map_err(|e| classify(url, e))?;
    Ok(body.to_vec())
  }
}

/// Scripted transport for tests: serves registered bodies while online,
/// fails every request as unreachable while offline.
#[cfg(test)]
pub(crate) mod fake {
  use super::*;
  use std::collections::HashMap;
  use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
  use std::sync::Mutex;

  #[derive(Default)]
  pub struct FakeTransport {
    bodies: Mutex<HashMap<String, Result<Vec<u8>, u16>>>,
    offline: AtomicBool,
    requests: AtomicUsize,
  }

  impl FakeTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn serve(&self, url: &str, body: &[u8]) {
      self
        .bodies
        .lock()
        .unwrap()
        .insert(url.to_string(), Ok(body.to_vec()));
    }

    pub fn fail_with_status(&self, url: &str, status: u16) {
      self
        .bodies
        .lock()
        .unwrap()
        .insert(url.to_string(), Err(status));
    }

    pub fn set_offline(&self, offline: bool) {
      self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn requests(&self) -> usize {
      self.requests.load(Ordering::SeqCst)
    }
  }

  #[async_trait]
  impl HttpTransport for FakeTransport {
    async fn get(&self, url: &Url) -> Result<Vec<u8>, TransportError> {
      self.requests.fetch_add(1, Ordering::SeqCst);

      if self.offline.load(Ordering::SeqCst) {
        return Err(TransportError::Unreachable {
          url: url.to_string(),
          message: "network is unreachable".to_string(),
        });
      }

      match self.bodies.lock().unwrap().get(url.as_str()) {
        Some(Ok(body)) => Ok(body.clone()),
        Some(Err(status)) => Err(TransportError::Status {
          url: url.to_string(),
          status: *status,
        }),
        None => Err(TransportError::Status {
          url: url.to_string(),
          status: 404,
        }),
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  fn transport(token: Option<&str>) -> ReqwestTransport {
    ReqwestTransport::new(Duration::from_secs(5), "rescache-test", token).unwrap()
  }

  #[tokio::test]
  async fn test_get_returns_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/a.png"))
      .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![1u8, 2, 3]))
      .mount(&mock_server)
      .await;

    let url = Url::parse(&format!("{}/a.png", mock_server.uri())).unwrap();
    let body = transport(None).get(&url).await.unwrap();

    assert_eq!(body, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_session_token_sent_as_bearer() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/private"))
      .and(header("authorization", "Bearer s3cret"))
      .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
      .mount(&mock_server)
      .await;

    let url = Url::parse(&format!("{}/private", mock_server.uri())).unwrap();
    let body = transport(Some("s3cret")).get(&url).await.unwrap();

    assert_eq!(body, b"ok".to_vec());
  }

  #[tokio::test]
  async fn test_error_status_is_not_unreachable() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/missing"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&mock_server)
      .await;

    let url = Url::parse(&format!("{}/missing", mock_server.uri())).unwrap();
    let err = transport(None).get(&url).await.unwrap_err();

    assert!(matches!(err, TransportError::Status { status: 404, .. }));
    assert!(!err.is_unreachable());
  }

  #[tokio::test]
  async fn test_connection_refused_is_unreachable() {
    // Grab a free port and release it so nothing is listening there
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let url = Url::parse(&format!("http://127.0.0.1:{}/gone", port)).unwrap();
    let err = transport(None).get(&url).await.unwrap_err();

    assert!(err.is_unreachable());
  }
}
