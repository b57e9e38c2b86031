use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

const DEFAULT_UPSTREAM: &str = "http://127.0.0.1:8000/";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Address the gateway listens on
  pub listen: SocketAddr,
  /// Base URL of the origin server
  pub upstream: Url,
  /// Generation tag of the cached assets (e.g. "v1")
  pub generation: String,
  /// Prefix of every cache region name
  pub cache_prefix: String,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  pub shell: ShellConfig,
  pub outbox: OutboxConfig,
  pub connectivity: ConnectivityConfig,
  /// Directory holding the database and log files
  pub data_dir: Option<PathBuf>,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// When false, nothing is cached and every lookup misses
  pub enabled: bool,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self { enabled: true }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// Exact path of the sale-submission endpoint
  pub sale_path: String,
  /// Path prefixes served network-first
  pub api_prefixes: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      sale_path: "/pos/procesar-venta/".to_string(),
      api_prefixes: vec![
        "/pos/buscar-productos/".to_string(),
        "/pos/productos-categoria/".to_string(),
        "/pos/buscar-tarjeta/".to_string(),
        "/api/v1/productos/".to_string(),
        "/api/v1/categorias/".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
  /// Critical assets pre-cached on install. Relative entries resolve against `upstream`.
  pub manifest: Vec<String>,
}

impl Default for ShellConfig {
  fn default() -> Self {
    Self {
      manifest: vec![
        "/pos/".to_string(),
        "/pos/dashboard/".to_string(),
        "/static/manifest.json".to_string(),
        "https://unpkg.com/htmx.org@1.9.10".to_string(),
        "https://unpkg.com/alpinejs@3.13.3/dist/cdn.min.js".to_string(),
        "https://cdn.tailwindcss.com".to_string(),
        "https://cdn.jsdelivr.net/npm/daisyui@4.4.19/dist/full.min.css".to_string(),
        "https://cdn.jsdelivr.net/npm/howler@2.2.4/dist/howler.min.js".to_string(),
        "https://cdn.jsdelivr.net/npm/chart.js@4.4.0/dist/chart.umd.min.js".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
  /// Prune synced records older than this many days. Absent keeps them forever.
  pub retention_days: Option<u32>,
  /// Extra periodic drain trigger
  pub drain_interval_secs: Option<u64>,
  /// Header carrying the record id when a sale is replayed
  pub idempotency_header: Option<String>,
}

impl OutboxConfig {
  pub fn retention(&self) -> Option<chrono::Duration> {
    self
      .retention_days
      .map(|days| chrono::Duration::days(i64::from(days)))
  }

  pub fn drain_interval(&self) -> Option<Duration> {
    self
      .drain_interval_secs
      .filter(|secs| *secs > 0)
      .map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectivityConfig {
  pub probe_interval_secs: u64,
  /// Path on the upstream used to detect reachability
  pub probe_path: String,
}

impl Default for ConnectivityConfig {
  fn default() -> Self {
    Self {
      probe_interval_secs: 15,
      probe_path: "/".to_string(),
    }
  }
}

impl ConnectivityConfig {
  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Also write a daily-rolled log file under `<data_dir>/logs`
  pub file: bool,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self { file: true }
  }
}

impl Default for Config {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([127, 0, 0, 1], 8780)),
      // Literal checked by test_default_config_is_valid.
      upstream: Url::parse(DEFAULT_UPSTREAM).expect("default upstream is a valid URL"),
      generation: "v1".to_string(),
      cache_prefix: "cantina".to_string(),
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      shell: ShellConfig::default(),
      outbox: OutboxConfig::default(),
      connectivity: ConnectivityConfig::default(),
      data_dir: None,
      log: LogConfig::default(),
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./posw.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/posw/config.yaml
  ///
  /// Falls back to the built-in defaults when no file exists.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("posw.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("posw").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    Ok(config)
  }

  /// Apply command-line overrides and check the result again.
  pub fn with_overrides(
    mut self,
    listen: Option<SocketAddr>,
    upstream: Option<Url>,
    generation: Option<String>,
  ) -> Result<Self> {
    if let Some(listen) = listen {
      self.listen = listen;
    }
    if let Some(upstream) = upstream {
      self.upstream = upstream;
    }
    if let Some(generation) = generation {
      self.generation = generation;
    }
    self.validate()?;
    Ok(self)
  }

  fn validate(&self) -> Result<()> {
    if !self.routes.sale_path.starts_with('/') {
      return Err(eyre!(
        "routes.sale_path must be an absolute path, got '{}'",
        self.routes.sale_path
      ));
    }
    if self.generation.trim().is_empty() {
      return Err(eyre!("generation must not be empty"));
    }
    if !matches!(self.upstream.scheme(), "http" | "https") {
      return Err(eyre!("upstream must be an http(s) URL: {}", self.upstream));
    }
    Ok(())
  }

  /// Directory holding the database and logs.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("posw"))
  }

  /// Absolute URL of the sale-submission endpoint on the upstream.
  pub fn sale_url(&self) -> Result<Url> {
    self
      .upstream
      .join(&self.routes.sale_path)
      .map_err(|e| eyre!("Invalid sale path '{}': {}", self.routes.sale_path, e))
  }

  pub fn probe_url(&self) -> Result<Url> {
    self
      .upstream
      .join(&self.connectivity.probe_path)
      .map_err(|e| eyre!("Invalid probe path '{}': {}", self.connectivity.probe_path, e))
  }

  /// Resolve the shell manifest into absolute URLs, skipping entries that don't parse.
  pub fn manifest_urls(&self) -> Vec<Url> {
    self
      .shell
      .manifest
      .iter()
      .filter_map(|entry| match self.upstream.join(entry) {
        Ok(url) => Some(url),
        Err(e) => {
          tracing::warn!("Skipping manifest entry '{}': {}", entry, e);
          None
        }
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_default_routes() {
    let config = Config::default();
    assert_eq!(config.routes.sale_path, "/pos/procesar-venta/");
    assert_eq!(config.routes.api_prefixes.len(), 5);
    assert!(config.outbox.retention().is_none());
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "upstream: https://pos.example.com/\ngeneration: v7\noutbox:\n  retention_days: 30\n",
    )
    .unwrap();
    assert_eq!(config.upstream.as_str(), "https://pos.example.com/");
    assert_eq!(config.generation, "v7");
    assert_eq!(config.outbox.retention(), Some(chrono::Duration::days(30)));
    assert_eq!(config.routes.sale_path, "/pos/procesar-venta/");
  }

  #[test]
  fn test_manifest_resolves_relative_and_absolute() {
    let config = Config::from_yaml(
      "upstream: http://shop.local:8000/\nshell:\n  manifest: ['/pos/', 'https://cdn.example/app.js']\n",
    )
    .unwrap();
    let urls = config.manifest_urls();
    assert_eq!(urls[0].as_str(), "http://shop.local:8000/pos/");
    assert_eq!(urls[1].as_str(), "https://cdn.example/app.js");
  }

  #[test]
  fn test_sale_url_joins_upstream() {
    let config = Config::default();
    assert_eq!(
      config.sale_url().unwrap().as_str(),
      "http://127.0.0.1:8000/pos/procesar-venta/"
    );
  }

  #[test]
  fn test_validate_rejects_relative_sale_path() {
    let config = Config::from_yaml("routes:\n  sale_path: pos/venta\n").unwrap();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_zero_drain_interval_is_disabled() {
    let config = Config::from_yaml("outbox:\n  drain_interval_secs: 0\n").unwrap();
    assert!(config.outbox.drain_interval().is_none());
  }

  #[test]
  fn test_default_config_is_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.upstream.as_str(), DEFAULT_UPSTREAM);
  }

  #[test]
  fn test_overrides_are_validated() {
    let upstream = Url::parse("https://pos.example.com/").unwrap();
    let config = Config::default()
      .with_overrides(None, Some(upstream.clone()), Some("v2".to_string()))
      .unwrap();
    assert_eq!(config.upstream, upstream);
    assert_eq!(config.generation, "v2");

    let ftp = Url::parse("ftp://pos.example.com/").unwrap();
    assert!(Config::default().with_overrides(None, Some(ftp), None).is_err());
    assert!(Config::default()
      .with_overrides(None, None, Some(String::new()))
      .is_err());
  }
}
