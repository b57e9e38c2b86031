//! Error taxonomy of the request path.
//!
//! A non-2xx response is not an error here: it is a response like any other
//! and flows back to the client unchanged.

/// Failure to obtain a complete response from the network.
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
  /// DNS, connection, TLS or timeout failure before any status arrived
  #[error("{url} unreachable: {reason}")]
  Unreachable { url: String, reason: String },

  /// The server answered with a status but the body was cut short. The
  /// request reached the server and may have taken effect.
  #[error("{url} answered {status} but the body was lost: {reason}")]
  Incomplete {
    url: String,
    status: u16,
    reason: String,
  },
}

impl FetchError {
  pub fn unreachable(url: impl Into<String>, reason: impl ToString) -> Self {
    Self::Unreachable {
      url: url.into(),
      reason: reason.to_string(),
    }
  }

  pub fn incomplete(url: impl Into<String>, status: u16, reason: impl ToString) -> Self {
    Self::Incomplete {
      url: url.into(),
      status,
      reason: reason.to_string(),
    }
  }

  /// No status line was received at all.
  pub fn is_unreachable(&self) -> bool {
    matches!(self, Self::Unreachable { .. })
  }
}

/// Conditions the interceptor cannot absorb and must surface to the caller.
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
  /// Neither network nor a local fallback produced a response
  #[error(transparent)]
  Fetch(#[from] FetchError),

  /// The sale could not be queued because its body is not JSON; the
  /// network failure that triggered the fallback is what the caller sees.
  #[error("{network} (sale body not queued: {reason})")]
  MalformedPayload {
    #[source]
    network: FetchError,
    reason: String,
  },

  /// The sale could not be written to the outbox, so it is NOT safely queued
  #[error("sale could not be stored offline: {0}")]
  OutboxWrite(String),
}

impl InterceptError {
  /// Whether the failure stems from the network being unavailable.
  pub fn is_offline(&self) -> bool {
    match self {
      Self::Fetch(e) => e.is_unreachable(),
      Self::MalformedPayload { .. } => true,
      Self::OutboxWrite(_) => false,
    }
  }
}
