//! Walking and building manifest graphs.

use std::collections::{BTreeMap, HashSet};

use bytes::Bytes;

use crate::descriptor::Descriptor;
use crate::error::Error;
use crate::manifest::{Manifest, EMPTY_JSON};
use crate::target::{parse_reference, Target};
use crate::verify::fetch_all;

/// Blobs a manifest references: the config, then layers in manifest order.
///
/// Layers repeated in the manifest appear once.
pub fn successors(manifest: &Manifest) -> Vec<Descriptor> {
    let mut seen = HashSet::new();
    std::iter::once(&manifest.config)
        .chain(manifest.layers.iter())
        .filter(|descriptor| seen.insert(descriptor.digest.clone()))
        .cloned()
        .collect()
}

/// The order in which to transfer a manifest graph: every blob first, the
/// manifest itself last.
pub fn plan_transfer(root: &Descriptor, manifest: &Manifest) -> Vec<Descriptor> {
    let mut plan = successors(manifest);
    plan.retain(|descriptor| descriptor.digest != root.digest);
    plan.push(root.clone());
    plan
}

/// Resolve a tag (or digest) to a manifest descriptor.
pub async fn resolve_tag<T>(target: &T, reference: &str) -> Result<Descriptor, Error>
where
    T: Target + ?Sized,
{
    parse_reference(reference)?;
    let descriptor = target.resolve(reference).await?;
    tracing::debug!(store = target.name(), reference, digest = %descriptor.digest, "resolved");
    Ok(descriptor)
}

/// Fetch and parse the manifest named by `descriptor`.
///
/// Returns the parsed manifest along with the exact bytes, which must be
/// pushed unchanged to keep the digest.
pub async fn fetch_manifest<T>(
    target: &T,
    descriptor: &Descriptor,
) -> Result<(Manifest, Bytes), Error>
where
    T: Target + ?Sized,
{
    let bytes = fetch_all(target, descriptor).await?;
    let manifest = Manifest::parse(&bytes)?;
    Ok((manifest, bytes))
}

/// Options for [`pack`].
#[derive(Debug, Clone, Default)]
pub struct PackOptions {
    /// Artifact type recorded in the manifest.
    pub artifact_type: Option<String>,

    /// Config blob, which must already be in the target. Defaults to the
    /// empty JSON object, pushed on demand.
    pub config: Option<Descriptor>,

    /// Manifest annotations.
    pub annotations: BTreeMap<String, String>,
}

/// Build an image manifest over `layers` and push it to `target`.
///
/// Every layer must already be present; the manifest is only pushed once the
/// whole graph beneath it exists. The manifest is not tagged.
#[tracing::instrument(skip_all, fields(store = target.name(), layers = layers.len()))]
pub async fn pack<T>(
    target: &T,
    layers: &[Descriptor],
    options: &PackOptions,
) -> Result<Descriptor, Error>
where
    T: Target + ?Sized,
{
    let config = match &options.config {
        Some(config) => config.clone(),
        None => {
            let empty = Descriptor::empty_json();
            if !target.exists(&empty).await? {
                let mut reader = EMPTY_JSON;
                target.push(&empty, &mut reader).await?;
            }
            empty
        }
    };

    for blob in std::iter::once(&config).chain(layers) {
        if !target.exists(blob).await? {
            return Err(Error::NotFound(format!(
                "{} is referenced but not present in {}",
                blob.digest,
                target.name()
            )));
        }
    }

    let mut builder = Manifest::builder()
        .config(config)
        .layers(layers.iter().cloned())
        .annotations(options.annotations.clone());
    if let Some(artifact_type) = &options.artifact_type {
        builder = builder.artifact_type(artifact_type);
    }
    let (descriptor, bytes) = builder.build().to_descriptor()?;

    let mut reader = &bytes[..];
    target.push(&descriptor, &mut reader).await?;
    tracing::debug!(digest = %descriptor.digest, "packed manifest");
    Ok(descriptor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::manifest::{OCI_IMAGE_CONFIG, OCI_LAYER_TAR};
    use crate::store::MemoryStore;

    #[test]
    fn plan_orders_config_layers_manifest() {
        let config = Descriptor::from_bytes(OCI_IMAGE_CONFIG, "{}");
        let a = Descriptor::from_bytes(OCI_LAYER_TAR, "a");
        let b = Descriptor::from_bytes(OCI_LAYER_TAR, "b");
        let manifest = Manifest::builder()
            .config(config.clone())
            .layer(a.clone())
            .layer(b.clone())
            .layer(a.clone())
            .build();
        let (root, _) = manifest.to_descriptor().unwrap();

        let plan = plan_transfer(&root, &manifest);
        assert_eq!(plan, vec![config, a, b, root]);
    }

    #[tokio::test]
    async fn pack_pushes_config_and_manifest() {
        let store = MemoryStore::new();
        let layer = Descriptor::from_bytes(OCI_LAYER_TAR, "hello world");
        let mut reader = &b"hello world"[..];
        store.push(&layer, &mut reader).await.unwrap();

        let options = PackOptions {
            artifact_type: Some("application/x-greeting".into()),
            ..Default::default()
        };
        let root = pack(&store, std::slice::from_ref(&layer), &options)
            .await
            .unwrap();

        assert!(store.exists(&Descriptor::empty_json()).await.unwrap());
        let (manifest, _) = fetch_manifest(&store, &root).await.unwrap();
        assert_eq!(manifest.layers, vec![layer]);
        assert_eq!(manifest.artifact_type.as_deref(), Some("application/x-greeting"));

        // Packing is deterministic.
        let again = pack(&store, &manifest.layers, &options).await.unwrap();
        assert_eq!(again, root);
    }

    #[tokio::test]
    async fn pack_refuses_missing_layers() {
        let store = MemoryStore::new();
        let layer = Descriptor::from_bytes(OCI_LAYER_TAR, "absent");
        let error = pack(&store, &[layer], &PackOptions::default())
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn resolve_tag_validates() {
        let store = MemoryStore::new();
        let error = resolve_tag(&store, "bad tag").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::InvalidInput);
        let error = resolve_tag(&store, "missing").await.unwrap_err();
        assert_eq!(error.kind(), ErrorKind::NotFound);
    }
}
