//! Copying manifest graphs between targets.

use futures::stream::{self, StreamExt, TryStreamExt};
use tokio_util::sync::CancellationToken;

use crate::descriptor::Descriptor;
use crate::error::Error;
use crate::graph::{fetch_manifest, resolve_tag, successors};
use crate::target::{parse_reference, Target};

/// Default number of blobs transferred at once.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Options for [`copy`] and [`copy_graph`].
#[derive(Debug, Clone)]
pub struct CopyOptions {
    /// Maximum number of blobs in flight.
    pub concurrency: usize,

    /// Checked before each transfer. Cancelling stops the copy before the
    /// manifest is published.
    pub cancel: CancellationToken,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            cancel: CancellationToken::new(),
        }
    }
}

/// What a copy did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    /// The manifest that was copied.
    pub root: Descriptor,

    /// Content pushed to the destination, manifest included.
    pub transferred: Vec<Descriptor>,

    /// Content the destination already had.
    pub skipped: Vec<Descriptor>,
}

/// Copy the graph tagged `src_ref` in `source` to `destination`, tagging it
/// `dst_ref` there. Returns the root manifest descriptor.
pub async fn copy<S, D>(
    source: &S,
    src_ref: &str,
    destination: &D,
    dst_ref: &str,
    options: &CopyOptions,
) -> Result<Descriptor, Error>
where
    S: Target + ?Sized,
    D: Target + ?Sized,
{
    copy_graph(source, src_ref, destination, dst_ref, options)
        .await
        .map(|report| report.root)
}

/// Copy a manifest graph and report what was transferred.
///
/// Blobs move concurrently. The manifest is pushed (and `dst_ref` updated)
/// only after every blob is confirmed present in the destination, so a
/// failed or cancelled copy never leaves the tag pointing at an incomplete
/// graph. Blobs that did arrive are left in place, and re-running the copy
/// skips them.
///
/// A digest `dst_ref` pushes the manifest without tagging it; it must match
/// the source manifest.
#[tracing::instrument(
    skip_all,
    fields(source = source.name(), destination = destination.name(), %src_ref, %dst_ref)
)]
pub async fn copy_graph<S, D>(
    source: &S,
    src_ref: &str,
    destination: &D,
    dst_ref: &str,
    options: &CopyOptions,
) -> Result<CopyReport, Error>
where
    S: Target + ?Sized,
    D: Target + ?Sized,
{
    let pinned = parse_reference(dst_ref)?;
    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    let root = resolve_tag(source, src_ref).await?;
    if let Some(digest) = &pinned {
        if digest != &root.digest {
            return Err(Error::InvalidReference(format!(
                "{dst_ref} does not match {src_ref} ({})",
                root.digest
            )));
        }
    }
    let (manifest, bytes) = fetch_manifest(source, &root).await?;

    let blobs = successors(&manifest);
    tracing::debug!(blobs = blobs.len(), root = %root.digest, "planned copy");

    let outcomes: Vec<(Descriptor, bool)> = stream::iter(blobs)
        .map(|blob| transfer(source, destination, blob, &options.cancel))
        .buffer_unordered(options.concurrency.max(1))
        .try_collect()
        .await?;

    let mut report = CopyReport {
        root: root.clone(),
        transferred: Vec::new(),
        skipped: Vec::new(),
    };
    for (blob, copied) in outcomes {
        if copied {
            report.transferred.push(blob);
        } else {
            report.skipped.push(blob);
        }
    }

    if options.cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    // Skipped blobs may have been collected since they were found. Asking
    // again also marks them used right before the manifest lands.
    for blob in &report.skipped {
        if !destination.exists(blob).await? {
            return Err(Error::NotFound(format!(
                "{} disappeared from {} during the copy",
                blob.digest,
                destination.name()
            )));
        }
    }

    // Every blob is in place; publish the manifest.

    let present = destination.exists(&root).await?;
    match (present, pinned) {
        (true, Some(_)) => report.skipped.push(root),
        (true, None) => {
            destination.tag(&root, dst_ref).await?;
            report.skipped.push(root);
        }
        (false, Some(_)) => {
            let mut reader = &bytes[..];
            destination.push(&root, &mut reader).await?;
            report.transferred.push(root);
        }
        (false, None) => {
            let mut reader = &bytes[..];
            destination.push_reference(&root, &mut reader, dst_ref).await?;
            report.transferred.push(root);
        }
    }

    tracing::info!(
        transferred = report.transferred.len(),
        skipped = report.skipped.len(),
        "copy complete"
    );
    Ok(report)
}

async fn transfer<S, D>(
    source: &S,
    destination: &D,
    blob: Descriptor,
    cancel: &CancellationToken,
) -> Result<(Descriptor, bool), Error>
where
    S: Target + ?Sized,
    D: Target + ?Sized,
{
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }

    if destination.exists(&blob).await? {
        tracing::trace!(digest = %blob.digest, "skip existing blob");
        return Ok((blob, false));
    }

    tracing::debug!(digest = %blob.digest, size = blob.size, "transfer blob");
    let mut reader = source.fetch(&blob).await?;
    destination.push(&blob, &mut reader).await?;
    Ok((blob, true))
}
