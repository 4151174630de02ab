//! Mark and sweep garbage collection for content stores.

use std::collections::HashSet;

use chrono::{Duration, Utc};
use serde::Deserialize;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::Error;
use crate::graph::{fetch_manifest, successors};
use crate::manifest::OCI_IMAGE_INDEX;
use crate::store::Inventory;
use crate::verify::fetch_all;

/// Result of a garbage collection pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Blobs deleted.
    pub removed: Vec<Digest>,

    /// Number of blobs kept, whether reachable or inside the grace period.
    pub retained: usize,
}

#[derive(Debug, Deserialize)]
struct IndexEntries {
    #[serde(default)]
    manifests: Vec<Descriptor>,
}

/// Remove blobs no root manifest reaches.
///
/// Blobs used within `grace` of now are kept even when unreachable: a copy
/// in progress pushes its blobs, or finds them already present, before the
/// manifest that references them, and collecting them in between would break
/// the copy. Pushing a blob or finding it with [`Target::exists`] counts as a
/// use.
///
/// Image index roots are followed to the manifests they list. Other roots
/// which are not image manifests are kept, but nothing beneath them is.
///
/// [`Target::exists`]: crate::Target::exists
#[tracing::instrument(skip(store), fields(store = store.name()))]
pub async fn collect_garbage<I>(store: &I, grace: Duration) -> Result<GcReport, Error>
where
    I: Inventory + ?Sized,
{
    let mut reachable: HashSet<Digest> = HashSet::new();
    let mut pending = store.roots().await?;
    while let Some(node) = pending.pop() {
        if !reachable.insert(node.digest.clone()) {
            continue;
        }

        if node.is_manifest() {
            let (manifest, _) = fetch_manifest(store, &node).await?;
            reachable.extend(successors(&manifest).into_iter().map(|d| d.digest));
        } else if node.media_type == OCI_IMAGE_INDEX {
            let bytes = fetch_all(store, &node).await?;
            match serde_json::from_slice::<IndexEntries>(&bytes) {
                Ok(index) => pending.extend(index.manifests),
                Err(error) => tracing::warn!(
                    digest = %node.digest,
                    %error,
                    "unreadable image index, keeping the index alone"
                ),
            }
        } else {
            tracing::warn!(
                digest = %node.digest,
                media_type = %node.media_type,
                "root is not an image manifest, keeping it alone"
            );
        }
    }

    let cutoff = Utc::now() - grace;
    let mut report = GcReport::default();
    for blob in store.blobs().await? {
        if reachable.contains(&blob.digest) || blob.last_used > cutoff {
            report.retained += 1;
            continue;
        }

        // Checked again by the store, so a blob used since it was listed stays.
        if store.remove(&blob.digest, cutoff).await? {
            tracing::debug!(digest = %blob.digest, size = blob.size, "removed unreferenced blob");
            report.removed.push(blob.digest);
        } else {
            report.retained += 1;
        }
    }

    report.removed.sort();
    tracing::info!(
        removed = report.removed.len(),
        retained = report.retained,
        "garbage collection complete"
    );
    Ok(report)
}
