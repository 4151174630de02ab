use std::collections::BTreeSet;
use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::Instrument;

use super::{BlobInfo, Inventory};
use crate::descriptor::{Descriptor, ANNOTATION_REF_NAME};
use crate::digest::{Algorithm, Digest};
use crate::error::Error;
use crate::manifest::{Manifest, OCI_IMAGE_INDEX};
use crate::target::{parse_reference, validate_tag, BoxReader, Reader, Target};
use crate::verify::DigestReader;

const LAYOUT_FILE: &str = "oci-layout";
const LAYOUT_VERSION: &str = "1.0.0";
const INDEX_FILE: &str = "index.json";
const BLOBS_DIR: &str = "blobs";
const INGEST_DIR: &str = "ingest";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageLayout {
    image_layout_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageIndex {
    schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

impl Default for ImageIndex {
    fn default() -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_IMAGE_INDEX.to_owned()),
            manifests: Vec::new(),
        }
    }
}

fn not_found_or_io(error: io::Error, what: impl std::fmt::Display) -> Error {
    if error.kind() == io::ErrorKind::NotFound {
        Error::NotFound(what.to_string())
    } else {
        Error::Io(error)
    }
}

/// Content store backed by an OCI image layout directory.
///
/// Blobs live at `blobs/<algorithm>/<hex>`; tags are the
/// `org.opencontainers.image.ref.name` annotations in `index.json`. Incoming
/// blobs are written under `ingest/` and renamed into place once verified, so
/// readers never observe partial content.
#[derive(Debug)]
pub struct LocalStore {
    root: Utf8PathBuf,
    index: Mutex<()>,
}

impl LocalStore {
    /// Open the layout at `root`, creating it if it does not exist.
    #[tracing::instrument]
    pub async fn open(root: Utf8PathBuf) -> Result<Self, Error> {
        tokio::fs::create_dir_all(root.join(BLOBS_DIR)).await?;
        tokio::fs::create_dir_all(root.join(INGEST_DIR)).await?;

        let store = Self {
            root,
            index: Mutex::new(()),
        };

        let layout = store.root.join(LAYOUT_FILE);
        if !tokio::fs::try_exists(&layout).await? {
            let body = serde_json::to_vec(&ImageLayout {
                image_layout_version: LAYOUT_VERSION.to_owned(),
            })
            .map_err(io::Error::other)?;
            store.write_atomic(&layout, &body).await?;
        }

        if !tokio::fs::try_exists(store.root.join(INDEX_FILE)).await? {
            store.write_index(&ImageIndex::default()).await?;
        }

        Ok(store)
    }

    /// The layout directory.
    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    fn blob_path(&self, digest: &Digest) -> Utf8PathBuf {
        let mut path = self.root.join(BLOBS_DIR);
        path.push(digest.algorithm().as_str());
        path.push(digest.hex());
        path
    }

    fn ingest_path(&self) -> Utf8PathBuf {
        self.root
            .join(INGEST_DIR)
            .join(uuid::Uuid::new_v4().to_string())
    }

    /// Whether a blob with this digest is stored.
    pub async fn contains(&self, digest: &Digest) -> Result<bool, Error> {
        Ok(tokio::fs::try_exists(self.blob_path(digest)).await?)
    }

    /// Mark a blob as used now by bumping its modification time. Returns
    /// whether it is stored.
    async fn touch(&self, digest: &Digest) -> Result<bool, Error> {
        let path = self.blob_path(digest);
        let touched = tokio::task::spawn_blocking(move || {
            filetime::set_file_mtime(&path, filetime::FileTime::now())
        })
        .await
        .map_err(io::Error::other)?;

        match touched {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            // Read-only layouts cannot record the use.
            Err(error) if error.kind() == io::ErrorKind::PermissionDenied => {
                self.contains(digest).await
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn write_atomic(&self, path: &Utf8Path, body: &[u8]) -> Result<(), Error> {
        let temporary = self.ingest_path();
        let result = async {
            let mut file = tokio::fs::File::create(&temporary).await?;
            file.write_all(body).await?;
            file.sync_all().await?;
            tokio::fs::rename(&temporary, path).await
        }
        .await;

        if let Err(error) = result {
            let _ = tokio::fs::remove_file(&temporary).await;
            return Err(error.into());
        }
        Ok(())
    }

    async fn read_index(&self) -> Result<ImageIndex, Error> {
        let body = tokio::fs::read(self.root.join(INDEX_FILE)).await?;
        serde_json::from_slice(&body).map_err(|error| {
            Error::MalformedManifest(format!("{}: {error}", self.root.join(INDEX_FILE)))
        })
    }

    async fn write_index(&self, index: &ImageIndex) -> Result<(), Error> {
        let body = serde_json::to_vec_pretty(index).map_err(io::Error::other)?;
        self.write_atomic(&self.root.join(INDEX_FILE), &body).await
    }

    async fn resolve_digest(&self, digest: Digest) -> Result<Descriptor, Error> {
        let index = self.read_index().await?;
        if let Some(listed) = index.manifests.iter().find(|m| m.digest == digest) {
            let mut descriptor = listed.clone();
            descriptor.annotations.remove(ANNOTATION_REF_NAME);
            return Ok(descriptor);
        }

        let body = tokio::fs::read(self.blob_path(&digest))
            .await
            .map_err(|error| not_found_or_io(error, &digest))?;
        let manifest = Manifest::parse(&body)?;
        Ok(Descriptor::new(
            manifest.content_type(),
            digest,
            body.len() as u64,
        ))
    }
}

#[async_trait::async_trait]
impl Target for LocalStore {
    fn name(&self) -> &str {
        self.root.as_str()
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, Error> {
        self.touch(&descriptor.digest).await
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BoxReader, Error> {
        let file = tokio::fs::File::open(self.blob_path(&descriptor.digest))
            .await
            .map_err(|error| not_found_or_io(error, &descriptor.digest))?;
        Ok(Box::new(DigestReader::new(
            tokio::io::BufReader::new(file),
            descriptor,
        )))
    }

    #[tracing::instrument(skip_all, fields(digest = %descriptor.digest, size = descriptor.size))]
    async fn push(&self, descriptor: &Descriptor, content: &mut Reader<'_>) -> Result<(), Error> {
        if self.touch(&descriptor.digest).await? {
            tracing::trace!("blob already present");
            return Ok(());
        }

        let destination = self.blob_path(&descriptor.digest);

        let temporary = self.ingest_path();
        let result: Result<(), Error> = async {
            let mut reader = DigestReader::new(content, descriptor);
            let file = tokio::fs::File::create(&temporary).await?;
            let mut file = tokio::io::BufWriter::new(file);
            tokio::io::copy(&mut reader, &mut file).await?;
            file.shutdown().await?;
            file.into_inner().sync_all().await?;

            if let Some(parent) = destination.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // Concurrent pushes of the same digest race here; both files are
            // identical so whichever rename lands last is fine.
            tokio::fs::rename(&temporary, &destination).await?;
            Ok(())
        }
        .in_current_span()
        .await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(&temporary).await;
        }
        result
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        if let Some(digest) = parse_reference(reference)? {
            return self.resolve_digest(digest).await;
        }

        let index = self.read_index().await?;
        let mut candidates: Vec<Descriptor> = index
            .manifests
            .into_iter()
            .filter(|m| m.ref_name() == Some(reference))
            .map(|mut m| {
                m.annotations.remove(ANNOTATION_REF_NAME);
                m
            })
            .collect();
        candidates.dedup();

        match candidates.len() {
            0 => Err(Error::NotFound(reference.to_owned())),
            1 => Ok(candidates.remove(0)),
            _ => {
                let digests: BTreeSet<Digest> =
                    candidates.iter().map(|c| c.digest.clone()).collect();
                if digests.len() == 1 {
                    Ok(candidates.remove(0))
                } else {
                    Err(Error::Ambiguous {
                        reference: reference.to_owned(),
                        candidates: digests.into_iter().collect(),
                    })
                }
            }
        }
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error> {
        validate_tag(reference)?;
        if !self.contains(&descriptor.digest).await? {
            return Err(Error::NotFound(descriptor.digest.to_string()));
        }

        let _guard = self.index.lock().await;
        let mut index = self.read_index().await?;
        index.manifests.retain(|m| m.ref_name() != Some(reference));
        index
            .manifests
            .push(descriptor.clone().with_annotation(ANNOTATION_REF_NAME, reference));
        tracing::debug!(digest = %descriptor.digest, tag = reference, "tag");
        self.write_index(&index).await
    }

    async fn delete(&self, descriptor: &Descriptor) -> Result<(), Error> {
        tokio::fs::remove_file(self.blob_path(&descriptor.digest))
            .await
            .map_err(|error| not_found_or_io(error, &descriptor.digest))?;

        let _guard = self.index.lock().await;
        let mut index = self.read_index().await?;
        let before = index.manifests.len();
        index.manifests.retain(|m| m.digest != descriptor.digest);
        if index.manifests.len() != before {
            self.write_index(&index).await?;
        }
        Ok(())
    }

    async fn tags(&self) -> Result<Vec<String>, Error> {
        let index = self.read_index().await?;
        let tags: BTreeSet<String> = index
            .manifests
            .iter()
            .filter_map(|m| m.ref_name().map(str::to_owned))
            .collect();
        Ok(tags.into_iter().collect())
    }
}

#[async_trait::async_trait]
impl Inventory for LocalStore {
    async fn blobs(&self) -> Result<Vec<BlobInfo>, Error> {
        let root = self.root.join(BLOBS_DIR);
        tokio::task::spawn_blocking(move || collect_blobs(&root))
            .in_current_span()
            .await
            .map_err(io::Error::other)?
            .map_err(Error::from)
    }

    async fn roots(&self) -> Result<Vec<Descriptor>, Error> {
        let index = self.read_index().await?;
        Ok(index
            .manifests
            .into_iter()
            .map(|mut m| {
                m.annotations.remove(ANNOTATION_REF_NAME);
                m
            })
            .collect())
    }

    async fn remove(&self, digest: &Digest, cutoff: DateTime<Utc>) -> Result<bool, Error> {
        let path = self.blob_path(digest);
        let metadata = match tokio::fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(false),
            Err(error) => return Err(error.into()),
        };
        let last_used: DateTime<Utc> = metadata.modified()?.into();
        if last_used > cutoff {
            return Ok(false);
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }
}

fn collect_blobs(root: &Utf8Path) -> io::Result<Vec<BlobInfo>> {
    let mut blobs = Vec::new();
    for algorithm in root.read_dir_utf8()? {
        let algorithm = algorithm?;
        let Ok(parsed) = algorithm.file_name().parse::<Algorithm>() else {
            continue;
        };
        if !algorithm.file_type()?.is_dir() {
            continue;
        }

        for entry in algorithm.path().read_dir_utf8()? {
            let entry = entry?;
            let Ok(digest) = format!("{parsed}:{}", entry.file_name()).parse::<Digest>() else {
                tracing::warn!(path = %entry.path(), "ignoring unexpected file in blob store");
                continue;
            };
            let metadata = entry.metadata()?;
            let last_used: DateTime<Utc> = metadata.modified()?.into();
            blobs.push(BlobInfo {
                digest,
                size: metadata.len(),
                last_used,
            });
        }
    }
    Ok(blobs)
}
