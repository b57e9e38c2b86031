//! Request classification by URL path.

use std::fmt;
use url::Url;

use crate::config::RoutesConfig;

/// How an intercepted request is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Classification {
  /// The sale-submission endpoint: network only, outbox on failure
  SaleSubmit,
  /// API data: network first, runtime-data cache as fallback
  ApiData,
  /// Everything else: shell cache first, refreshed in the background
  StaticAsset,
}

impl Classification {
  pub const fn as_str(&self) -> &'static str {
    match self {
      Self::SaleSubmit => "sale_submit",
      Self::ApiData => "api_data",
      Self::StaticAsset => "static_asset",
    }
  }
}

impl fmt::Display for Classification {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Maps URLs to a handling strategy. Built once at startup.
#[derive(Debug, Clone)]
pub struct StrategyRouter {
  sale_path: String,
  api_prefixes: Vec<String>,
}

impl StrategyRouter {
  pub fn new(routes: &RoutesConfig) -> Self {
    Self {
      sale_path: routes.sale_path.clone(),
      api_prefixes: routes.api_prefixes.clone(),
    }
  }

  /// Classify a URL. Only the path is considered.
  ///
  /// Order matters: the exact sale path wins over any API prefix that might
  /// also match it.
  pub fn classify(&self, url: &Url) -> Classification {
    self.classify_path(url.path())
  }

  pub fn classify_path(&self, path: &str) -> Classification {
    if path == self.sale_path {
      return Classification::SaleSubmit;
    }

    if self
      .api_prefixes
      .iter()
      .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return Classification::ApiData;
    }

    Classification::StaticAsset
  }
}
