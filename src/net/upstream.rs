use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue};

use super::snapshot::{is_hop_by_hop, Request, ResponseSnapshot};
use crate::error::FetchError;

/// Anything able to turn a request into a response.
///
/// Any status code with its full body counts as a response.
#[async_trait]
pub trait Network: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, FetchError>;
}

/// Network access through reqwest
#[derive(Clone)]
pub struct HttpUpstream {
  client: reqwest::Client,
}

impl HttpUpstream {
  pub fn new() -> Result<Self> {
    // Redirects are returned to the client untouched; it follows them through the gateway.
    let client = reqwest::Client::builder()
      .redirect(reqwest::redirect::Policy::none())
      .user_agent(concat!("posw/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpUpstream {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, FetchError> {
    let url = request.url.as_str();
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      if is_hop_by_hop(name) {
        continue;
      }
      match (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        (Ok(name), Ok(value)) => builder = builder.header(name, value),
        _ => tracing::debug!("Dropping invalid request header '{}'", name),
      }
    }

    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| FetchError::unreachable(url, e))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    // The status is in hand from here on, so a failure is no longer "unreachable".
    let body = response
      .bytes()
      .await
      .map_err(|e| FetchError::incomplete(url, status, e))?;

    Ok(ResponseSnapshot {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
