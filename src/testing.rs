//! Test doubles shared by the module tests.

use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::error::FetchError;
use crate::net::{Network, Request, ResponseSnapshot};

type Responder = Box<dyn Fn(&Request) -> Option<ResponseSnapshot> + Send + Sync>;

/// Scripted network: answers from a table while online, fails every request while offline.
pub struct FakeNetwork {
  online: AtomicBool,
  routes: Mutex<HashMap<String, ResponseSnapshot>>,
  responder: Mutex<Option<Responder>>,
  latency: Mutex<Duration>,
  log: Mutex<Vec<Request>>,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      responder: Mutex::new(None),
      latency: Mutex::new(Duration::ZERO),
      log: Mutex::new(Vec::new()),
    })
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Answer `method url` with `response`.
  pub fn respond(&self, method: Method, url: &str, response: ResponseSnapshot) {
    let key = format!("{} {}", method, Url::parse(url).unwrap());
    self.routes.lock().unwrap().insert(key, response);
  }

  /// Computed answers, consulted before the table.
  pub fn set_responder<F>(&self, responder: F)
  where
    F: Fn(&Request) -> Option<ResponseSnapshot> + Send + Sync + 'static,
  {
    *self.responder.lock().unwrap() = Some(Box::new(responder));
  }

  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  /// Requests that reached the network while online.
  pub fn requests(&self) -> Vec<Request> {
    self.log.lock().unwrap().clone()
  }

  pub fn count(&self, method: Method, url: &str) -> usize {
    let url = Url::parse(url).unwrap();
    self
      .requests()
      .iter()
      .filter(|r| r.method == method && r.url == url)
      .count()
  }
}

#[async_trait]
impl Network for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<ResponseSnapshot, FetchError> {
    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(FetchError::unreachable(
        request.url.as_str(),
        "network is offline",
      ));
    }

    self.log.lock().unwrap().push(request.clone());

    if let Some(responder) = self.responder.lock().unwrap().as_ref() {
      if let Some(response) = responder(request) {
        return Ok(response);
      }
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&request.cache_key())
        .cloned()
        .unwrap_or_else(|| ResponseSnapshot::new(404, "not found")),
    )
  }
}

/// Answers one request with a 200 that promises 100 body bytes, sends 14, then hangs up.
pub async fn truncating_server() -> std::net::SocketAddr {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (mut socket, _) = listener.accept().await.unwrap();
    let mut buf = [0u8; 4096];
    let _ = socket.read(&mut buf).await;
    let _ = socket
      .write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: 100\r\n\r\n{\"success\": tr",
      )
      .await;
    let _ = socket.shutdown().await;
  });
  addr
}
