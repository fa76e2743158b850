//! Process configuration read from the environment (and `.env` via `dotenv`).

use anyhow::{Context, Result};
use std::{path::PathBuf, time::Duration};

const DEFAULT_ADDRESS: &str = "0.0.0.0:8080";
const DEFAULT_SECRET_KEY: &str = "my_secret_random_key_>_than_24_characters";
const DEFAULT_TOKEN_TTL_SECS: u64 = 15 * 60;

/// Runtime settings for the server.
#[derive(Debug, Clone)]
pub struct Config {
  /// Socket address to bind, e.g. `0.0.0.0:8080`.
  pub address: String,
  /// Process-wide secret mixed into every room's signing key.
  pub secret_key: String,
  /// Lifetime of issued room tokens.
  pub token_ttl: Duration,
  /// Directory served under `/static`, if any.
  pub static_dir: Option<PathBuf>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      address: DEFAULT_ADDRESS.to_string(),
      secret_key: DEFAULT_SECRET_KEY.to_string(),
      token_ttl: Duration::from_secs(DEFAULT_TOKEN_TTL_SECS),
      static_dir: None,
    }
  }
}

impl Config {
  /// Read `ADDRESS`, `PORT`, `SECRET_KEY`, `TOKEN_TTL_SECS` and `STATIC_DIR`.
  pub fn from_env() -> Result<Self> {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  /// Build a config from an arbitrary variable source.
  ///
  /// `PORT` wins over `ADDRESS` so hosted platforms that only hand out a port
  /// keep working.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
  where
    F: Fn(&str) -> Option<String>,
  {
    let mut config = Self::default();

    if let Some(address) = lookup("ADDRESS").filter(|v| !v.is_empty()) {
      config.address = address;
    }
    if let Some(port) = lookup("PORT").filter(|v| !v.is_empty()) {
      let port: u16 = port.parse().with_context(|| format!("PORT is not a valid port: {port}"))?;
      config.address = format!("0.0.0.0:{port}");
    }

    match lookup("SECRET_KEY").filter(|v| !v.is_empty()) {
      Some(key) => config.secret_key = key,
      None => tracing::warn!("SECRET_KEY not set, using the built-in development key"),
    }

    if let Some(ttl) = lookup("TOKEN_TTL_SECS") {
      let secs: u64 = ttl
        .parse()
        .with_context(|| format!("TOKEN_TTL_SECS is not a number of seconds: {ttl}"))?;
      config.token_ttl = Duration::from_secs(secs);
    }

    config.static_dir = lookup("STATIC_DIR")
      .filter(|v| !v.is_empty())
      .map(PathBuf::from);

    Ok(config)
  }
}
