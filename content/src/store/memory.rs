use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{BlobInfo, Inventory};
use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::Error;
use crate::target::{parse_reference, validate_tag, BoxReader, Reader, Target};
use crate::verify::{read_verified, DigestReader};

#[derive(Debug)]
struct MemoryBlob {
    last_used: DateTime<Utc>,
    media_type: String,
    data: Bytes,
}

impl MemoryBlob {
    fn new(media_type: &str, data: Bytes) -> Self {
        Self {
            last_used: Utc::now(),
            media_type: media_type.to_owned(),
            data,
        }
    }
}

/// Content store which keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: RwLock<HashMap<Digest, MemoryBlob>>,
    tags: RwLock<BTreeMap<String, Descriptor>>,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a blob with this digest is stored.
    pub async fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().await.contains_key(digest)
    }

    /// Number of blobs stored.
    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    /// Whether the store holds no blobs.
    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    /// Mark a blob as used now. Returns whether it is stored.
    async fn touch(&self, digest: &Digest) -> bool {
        match self.blobs.write().await.get_mut(digest) {
            Some(blob) => {
                blob.last_used = Utc::now();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) async fn backdate(&self, digest: &Digest, when: DateTime<Utc>) {
        if let Some(blob) = self.blobs.write().await.get_mut(digest) {
            blob.last_used = when;
        }
    }
}

#[async_trait::async_trait]
impl Target for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, Error> {
        Ok(self.touch(&descriptor.digest).await)
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BoxReader, Error> {
        let blobs = self.blobs.read().await;
        let blob = blobs
            .get(&descriptor.digest)
            .ok_or_else(|| Error::NotFound(descriptor.digest.to_string()))?;
        Ok(Box::new(DigestReader::new(
            Cursor::new(blob.data.clone()),
            descriptor,
        )))
    }

    #[tracing::instrument(skip_all, fields(digest = %descriptor.digest, size = descriptor.size))]
    async fn push(&self, descriptor: &Descriptor, content: &mut Reader<'_>) -> Result<(), Error> {
        if self.touch(&descriptor.digest).await {
            tracing::trace!("blob already present");
            return Ok(());
        }

        let data = read_verified(content, descriptor).await?;

        let mut blobs = self.blobs.write().await;
        blobs
            .entry(descriptor.digest.clone())
            .and_modify(|blob| blob.last_used = Utc::now())
            .or_insert_with(|| MemoryBlob::new(&descriptor.media_type, data));
        Ok(())
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        match parse_reference(reference)? {
            Some(digest) => {
                let blobs = self.blobs.read().await;
                let blob = blobs
                    .get(&digest)
                    .ok_or_else(|| Error::NotFound(reference.to_owned()))?;
                Ok(Descriptor::new(
                    blob.media_type.clone(),
                    digest,
                    blob.data.len() as u64,
                ))
            }
            None => self
                .tags
                .read()
                .await
                .get(reference)
                .cloned()
                .ok_or_else(|| Error::NotFound(reference.to_owned())),
        }
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error> {
        validate_tag(reference)?;
        if !self.contains(&descriptor.digest).await {
            return Err(Error::NotFound(descriptor.digest.to_string()));
        }

        tracing::debug!(digest = %descriptor.digest, tag = reference, "tag");
        self.tags
            .write()
            .await
            .insert(reference.to_owned(), descriptor.clone());
        Ok(())
    }

    async fn delete(&self, descriptor: &Descriptor) -> Result<(), Error> {
        if self.blobs.write().await.remove(&descriptor.digest).is_none() {
            return Err(Error::NotFound(descriptor.digest.to_string()));
        }
        self.tags
            .write()
            .await
            .retain(|_, tagged| tagged.digest != descriptor.digest);
        Ok(())
    }

    async fn tags(&self) -> Result<Vec<String>, Error> {
        Ok(self.tags.read().await.keys().cloned().collect())
    }
}

#[async_trait::async_trait]
impl Inventory for MemoryStore {
    async fn blobs(&self) -> Result<Vec<BlobInfo>, Error> {
        Ok(self
            .blobs
            .read()
            .await
            .iter()
            .map(|(digest, blob)| BlobInfo {
                digest: digest.clone(),
                size: blob.data.len() as u64,
                last_used: blob.last_used,
            })
            .collect())
    }

    async fn roots(&self) -> Result<Vec<Descriptor>, Error> {
        let mut roots: Vec<Descriptor> = self.tags.read().await.values().cloned().collect();
        roots.sort_by(|a, b| a.digest.cmp(&b.digest));
        roots.dedup_by(|a, b| a.digest == b.digest);
        Ok(roots)
    }

    async fn remove(&self, digest: &Digest, cutoff: DateTime<Utc>) -> Result<bool, Error> {
        let mut blobs = self.blobs.write().await;
        let stale = blobs
            .get(digest)
            .is_some_and(|blob| blob.last_used <= cutoff);
        if stale {
            blobs.remove(digest);
        }
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::verify::fetch_all;

    async fn push_bytes(
        store: &MemoryStore,
        descriptor: &Descriptor,
        data: &[u8],
    ) -> Result<(), Error> {
        let mut reader = data;
        store.push(descriptor, &mut reader).await
    }

    #[tokio::test]
    async fn push_fetch_round_trip() {
        let store = MemoryStore::new();
        let descriptor = Descriptor::from_bytes("text/plain", "hello world");
        push_bytes(&store, &descriptor, b"hello world").await.unwrap();

        assert!(store.exists(&descriptor).await.unwrap());
        let data = fetch_all(&store, &descriptor).await.unwrap();
        assert_eq!(&data[..], b"hello world");
    }

    #[tokio::test]
    async fn push_is_idempotent() {
        let store = MemoryStore::new();
        let descriptor = Descriptor::from_bytes("text/plain", "hello world");
        push_bytes(&store, &descriptor, b"hello world").await.unwrap();
        push_bytes(&store, &descriptor, b"hello world").await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn corrupt_push_leaves_nothing_behind() {
        let store = MemoryStore::new();
        let descriptor = Descriptor::from_bytes("text/plain", "hello world");

        let error = push_bytes(&store, &descriptor, b"hello wxrld").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DigestMismatch);

        let error = push_bytes(&store, &descriptor, b"hello").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SizeMismatch);

        assert!(!store.exists(&descriptor).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn fetch_missing_is_not_found() {
        let store = MemoryStore::new();
        let descriptor = Descriptor::from_bytes("text/plain", "absent");
        let Err(error) = store.fetch(&descriptor).await else {
            panic!("fetched a blob that was never pushed");
        };
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn tags_overwrite_and_resolve() {
        let store = MemoryStore::new();
        let one = Descriptor::from_bytes("text/plain", "one");
        let two = Descriptor::from_bytes("text/plain", "two");
        push_bytes(&store, &one, b"one").await.unwrap();
        push_bytes(&store, &two, b"two").await.unwrap();

        assert_eq!(
            store.resolve("latest").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );

        store.tag(&one, "latest").await.unwrap();
        store.tag(&two, "latest").await.unwrap();
        store.tag(&one, "stable").await.unwrap();

        assert_eq!(store.resolve("latest").await.unwrap(), two);
        assert_eq!(store.tags().await.unwrap(), vec!["latest", "stable"]);

        let by_digest = store.resolve(&one.digest.to_string()).await.unwrap();
        assert_eq!(by_digest, one);
    }

    #[tokio::test]
    async fn tag_requires_content() {
        let store = MemoryStore::new();
        let missing = Descriptor::from_bytes("text/plain", "missing");
        let error = store.tag(&missing, "latest").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);

        let present = Descriptor::from_bytes("text/plain", "x");
        push_bytes(&store, &present, b"x").await.unwrap();
        let error = store.tag(&present, "not a tag").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn delete_removes_tags() {
        let store = MemoryStore::new();
        let descriptor = Descriptor::from_bytes("text/plain", "x");
        push_bytes(&store, &descriptor, b"x").await.unwrap();
        store.tag(&descriptor, "v1").await.unwrap();

        store.delete(&descriptor).await.unwrap();
        assert!(store.tags().await.unwrap().is_empty());
        assert_eq!(
            store.delete(&descriptor).await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn concurrent_identical_pushes() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let descriptor = Descriptor::from_bytes("text/plain", "race");

        let pushes = (0..8).map(|_| {
            let store = store.clone();
            let descriptor = descriptor.clone();
            async move { push_bytes(&store, &descriptor, b"race").await }
        });
        for result in futures::future::join_all(pushes).await {
            result.unwrap();
        }
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn use_refreshes_last_used() {
        let store = MemoryStore::new();
        let descriptor = Descriptor::from_bytes("text/plain", "old");
        push_bytes(&store, &descriptor, b"old").await.unwrap();

        let long_ago = Utc::now() - chrono::Duration::hours(2);
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        store.backdate(&descriptor.digest, long_ago).await;
        assert!(store.exists(&descriptor).await.unwrap());
        assert!(!store.remove(&descriptor.digest, cutoff).await.unwrap());

        store.backdate(&descriptor.digest, long_ago).await;
        push_bytes(&store, &descriptor, b"old").await.unwrap();
        assert!(!store.remove(&descriptor.digest, cutoff).await.unwrap());

        store.backdate(&descriptor.digest, long_ago).await;
        assert!(store.remove(&descriptor.digest, cutoff).await.unwrap());
        assert!(store.is_empty().await);
    }
}
