//! Image manifests and the media types that describe them.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::descriptor::Descriptor;
use crate::error::Error;

/// OCI image manifest.
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI image index. Indexes are recognised but not copied.
pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";

/// Docker image manifest, schema 2.
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";

/// OCI image configuration.
pub const OCI_IMAGE_CONFIG: &str = "application/vnd.oci.image.config.v1+json";

/// Uncompressed OCI layer.
pub const OCI_LAYER_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Gzip-compressed OCI layer.
pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// The empty JSON object, used as a placeholder config for artifacts.
pub const OCI_EMPTY: &str = "application/vnd.oci.empty.v1+json";

/// Content of an [`OCI_EMPTY`] blob.
pub const EMPTY_JSON: &[u8] = b"{}";

/// Manifest media types this crate can walk.
pub const MANIFEST_MEDIA_TYPES: &[&str] = &[OCI_IMAGE_MANIFEST, DOCKER_MANIFEST_V2];

/// An image manifest: a config blob, ordered layers and annotations.
///
/// Serialization is deterministic (fixed field order, sorted annotations), so
/// equal manifests produce equal bytes and therefore equal digests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Always `2`.
    pub schema_version: u32,

    /// The manifest's own media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Artifact type, for non-image artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_type: Option<String>,

    /// The config blob.
    pub config: Descriptor,

    /// Layer blobs, in application order.
    #[serde(default)]
    pub layers: Vec<Descriptor>,

    /// Manifest this one refers to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Descriptor>,

    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Manifest {
    /// Start building an OCI image manifest.
    pub fn builder() -> ManifestBuilder {
        ManifestBuilder::default()
    }

    /// Parse and validate manifest JSON.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let manifest: Manifest = serde_json::from_slice(data).map_err(|error| {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(data) {
                if value.get("manifests").is_some() {
                    return Error::MalformedManifest("image indexes are not supported".into());
                }
            }
            Error::MalformedManifest(error.to_string())
        })?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Check the schema version and media type.
    pub fn validate(&self) -> Result<(), Error> {
        if self.schema_version != 2 {
            return Err(Error::MalformedManifest(format!(
                "unsupported schemaVersion {}",
                self.schema_version
            )));
        }

        if let Some(media_type) = &self.media_type {
            if !MANIFEST_MEDIA_TYPES.contains(&media_type.as_str()) {
                return Err(Error::MalformedManifest(format!(
                    "{media_type} is not an image manifest"
                )));
            }
        }
        Ok(())
    }

    /// The media type to advertise when pushing this manifest.
    pub fn content_type(&self) -> &str {
        self.media_type.as_deref().unwrap_or(OCI_IMAGE_MANIFEST)
    }

    /// Canonical JSON bytes of this manifest.
    pub fn to_bytes(&self) -> Result<Bytes, Error> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|error| Error::MalformedManifest(error.to_string()))
    }

    /// Serialize this manifest and describe the result.
    pub fn to_descriptor(&self) -> Result<(Descriptor, Bytes), Error> {
        let bytes = self.to_bytes()?;
        let descriptor = Descriptor::from_bytes(self.content_type(), &bytes);
        Ok((descriptor, bytes))
    }
}

/// Builder for [`Manifest`]. The config defaults to the empty JSON descriptor.
#[derive(Debug, Default)]
pub struct ManifestBuilder {
    media_type: Option<String>,
    artifact_type: Option<String>,
    config: Option<Descriptor>,
    layers: Vec<Descriptor>,
    subject: Option<Descriptor>,
    annotations: BTreeMap<String, String>,
}

impl ManifestBuilder {
    /// Use a manifest media type other than the OCI one.
    pub fn media_type(mut self, media_type: impl Into<String>) -> Self {
        self.media_type = Some(media_type.into());
        self
    }

    /// Set the artifact type.
    pub fn artifact_type(mut self, artifact_type: impl Into<String>) -> Self {
        self.artifact_type = Some(artifact_type.into());
        self
    }

    /// Set the config blob.
    pub fn config(mut self, config: Descriptor) -> Self {
        self.config = Some(config);
        self
    }

    /// Append a layer.
    pub fn layer(mut self, layer: Descriptor) -> Self {
        self.layers.push(layer);
        self
    }

    /// Append several layers.
    pub fn layers(mut self, layers: impl IntoIterator<Item = Descriptor>) -> Self {
        self.layers.extend(layers);
        self
    }

    /// Point this manifest at a subject.
    pub fn subject(mut self, subject: Descriptor) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Add an annotation.
    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Add several annotations.
    pub fn annotations(mut self, annotations: impl IntoIterator<Item = (String, String)>) -> Self {
        self.annotations.extend(annotations);
        self
    }

    /// Finish the manifest.
    pub fn build(self) -> Manifest {
        Manifest {
            schema_version: 2,
            media_type: Some(
                self.media_type
                    .unwrap_or_else(|| OCI_IMAGE_MANIFEST.to_owned()),
            ),
            artifact_type: self.artifact_type,
            config: self.config.unwrap_or_else(Descriptor::empty_json),
            layers: self.layers,
            subject: self.subject,
            annotations: self.annotations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn hello_manifest() -> Manifest {
        Manifest::builder()
            .config(Descriptor::from_bytes(OCI_IMAGE_CONFIG, "{}"))
            .layer(Descriptor::from_bytes(OCI_LAYER_TAR, "hello world"))
            .annotation("org.example.note", "greeting")
            .build()
    }

    #[test]
    fn parse_round_trip() {
        let manifest = hello_manifest();
        let bytes = manifest.to_bytes().unwrap();
        let parsed = Manifest::parse(&bytes).unwrap();
        assert_eq!(parsed, manifest);
        assert_eq!(parsed.to_bytes().unwrap(), bytes);
    }

    #[test]
    fn equal_manifests_have_equal_digests() {
        let (a, _) = hello_manifest().to_descriptor().unwrap();
        let (b, _) = hello_manifest().to_descriptor().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.media_type, OCI_IMAGE_MANIFEST);
    }

    #[test]
    fn parses_foreign_manifest_json() {
        let json = br#"{
            "schemaVersion": 2,
            "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
            "config": {
                "mediaType": "application/vnd.docker.container.image.v1+json",
                "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a",
                "size": 2
            },
            "layers": [],
            "extra": true
        }"#;
        let manifest = Manifest::parse(json).unwrap();
        assert_eq!(manifest.content_type(), DOCKER_MANIFEST_V2);
        assert!(manifest.layers.is_empty());
    }

    #[test]
    fn rejects_invalid_manifests() {
        let cases: &[&[u8]] = &[
            b"not json",
            br#"{"schemaVersion": 2, "layers": []}"#,
            br#"{"schemaVersion": 1, "config": {"mediaType": "x", "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a", "size": 2}}"#,
            br#"{"schemaVersion": 2, "mediaType": "text/plain", "config": {"mediaType": "x", "digest": "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a", "size": 2}}"#,
            br#"{"schemaVersion": 2, "mediaType": "application/vnd.oci.image.index.v1+json", "manifests": []}"#,
        ];
        for case in cases {
            let error = Manifest::parse(case).unwrap_err();
            assert_eq!(error.kind(), ErrorKind::MalformedManifest);
        }
    }

    #[test]
    fn duplicate_layers_are_allowed() {
        let layer = Descriptor::from_bytes(OCI_LAYER_TAR, "same");
        let manifest = Manifest::builder()
            .layer(layer.clone())
            .layer(layer)
            .build();
        let bytes = manifest.to_bytes().unwrap();
        assert_eq!(Manifest::parse(&bytes).unwrap().layers.len(), 2);
    }

    #[test]
    fn default_config_is_empty_json() {
        let manifest = Manifest::builder().artifact_type("application/x-demo").build();
        assert_eq!(manifest.config, Descriptor::empty_json());
        assert_eq!(manifest.artifact_type.as_deref(), Some("application/x-demo"));
    }
}
