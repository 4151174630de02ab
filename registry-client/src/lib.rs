//! # Registry client
//!
//! A client for the OCI distribution API, built on [`hyperdriver`].
//!
//! [`RegistryClient`] handles credentials, timeouts and retries for one
//! registry. [`Repository`] exposes a repository as a [`content::Target`],
//! so the copy engine can move content between local stores and registries
//! in either direction. Blobs are sent through an [`UploadSession`], which
//! enforces chunk order and checks the digest the registry acknowledges.
//!
//! ```no_run
//! use content::{copy, CopyOptions, MemoryStore};
//! use registry_client::{Anonymous, RegistryClient, RegistryConfig};
//!
//! # async fn example() -> Result<(), content::Error> {
//! let store = MemoryStore::new();
//! let client = RegistryClient::new("localhost:5000", RegistryConfig::default(), Anonymous)?;
//! let repository = client.repository("hello-world")?;
//! copy(&store, "v1", &repository, "v1", &CopyOptions::default()).await?;
//! # Ok(())
//! # }
//! ```

mod auth;
mod client;
mod config;
pub mod mock;
mod reference;
mod repository;
mod retry;
mod timeout;
pub mod upload;

pub use self::auth::{basic_auth, Anonymous, Authenticator, Secret, StaticCredential};
pub use self::client::{RegistryClient, DOCKER_CONTENT_DIGEST};
pub use self::config::{RegistryConfig, DEFAULT_CHUNK_SIZE, DEFAULT_RETRIES, DEFAULT_TIMEOUT};
pub use self::reference::{Reference, DEFAULT_TAG};
pub use self::repository::Repository;
pub use self::retry::Backoff;
pub use self::upload::{UploadSession, UploadState};

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_send<T: Send>(_t: T) {}

    #[test]
    fn futures_are_send() {
        let client = RegistryClient::with_service(
            "localhost:5000",
            RegistryConfig::default(),
            Anonymous,
            mock::MockRegistry::new(),
        )
        .unwrap();
        assert_send(client.ping());
        assert_send(UploadSession::start(&client, "hello"));
    }
}
