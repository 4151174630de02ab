//! # Content stores
//!
//! Local places to stage content: an in-memory store, and an on-disk OCI
//! image layout. Both implement [`Target`] for copies and [`Inventory`] for
//! garbage collection.

use chrono::{DateTime, Utc};

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::Error;
use crate::target::Target;

pub(crate) mod layout;
pub(crate) mod memory;

#[doc(inline)]
pub use layout::LocalStore;
#[doc(inline)]
pub use memory::MemoryStore;

/// A blob held by a store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobInfo {
    /// Digest of the blob.
    pub digest: Digest,

    /// Length of the blob in bytes.
    pub size: u64,

    /// When the blob was last written, pushed again, or found by
    /// [`Target::exists`].
    pub last_used: DateTime<Utc>,
}

/// A store which can enumerate and remove what it holds.
#[async_trait::async_trait]
pub trait Inventory: Target {
    /// Every blob in the store, manifests included.
    async fn blobs(&self) -> Result<Vec<BlobInfo>, Error>;

    /// Manifests the store keeps alive: everything tagged, or listed in an
    /// image layout index.
    async fn roots(&self) -> Result<Vec<Descriptor>, Error>;

    /// Remove a blob unless it was used after `cutoff`. Tags are left alone.
    /// Returns whether the blob was removed.
    async fn remove(&self, digest: &Digest, cutoff: DateTime<Utc>) -> Result<bool, Error>;
}
