use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::retry::Backoff;

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default upload chunk size, 5 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default number of retries for transient failures.
pub const DEFAULT_RETRIES: u32 = 5;

/// Settings for talking to a registry.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RegistryConfig {
    /// Deadline for each request, in seconds.
    #[serde(deserialize_with = "seconds")]
    pub timeout: Duration,

    /// Bytes sent per upload chunk.
    pub chunk_size: usize,

    /// How many times a transient failure is retried.
    pub retries: u32,

    /// Delay between retries.
    pub backoff: Backoff,

    /// Use `http://` instead of `https://`. Loopback registries always use
    /// plain HTTP.
    pub plain_http: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
            retries: DEFAULT_RETRIES,
            backoff: Backoff::default(),
            plain_http: false,
        }
    }
}

impl RegistryConfig {
    /// The URL scheme to use for `registry`.
    pub fn scheme(&self, registry: &str) -> &'static str {
        if self.plain_http || is_loopback(registry) {
            "http"
        } else {
            "https"
        }
    }
}

fn is_loopback(registry: &str) -> bool {
    let host = match registry.strip_prefix('[') {
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => registry.split(':').next().unwrap_or(registry),
    };
    host == "localhost" || host == "::1" || host.starts_with("127.")
}

/// Deserialize a duration given as (fractional) seconds.
pub(crate) fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let seconds = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(seconds).map_err(serde::de::Error::custom)
}
