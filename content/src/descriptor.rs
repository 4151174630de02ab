use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::digest::{Algorithm, Digest};
use crate::error::Error;
use crate::manifest::{EMPTY_JSON, MANIFEST_MEDIA_TYPES, OCI_EMPTY};

/// Annotation used by OCI image layouts to name a manifest.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Annotation recording when an artifact was created.
pub const ANNOTATION_CREATED: &str = "org.opencontainers.image.created";

/// Identifies a piece of content by media type, digest and size.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,

    /// Digest of the referenced content.
    pub digest: Digest,

    /// Length of the referenced content in bytes.
    pub size: u64,

    /// Arbitrary metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    /// Create a descriptor without annotations.
    pub fn new(media_type: impl Into<String>, digest: Digest, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest,
            size,
            annotations: BTreeMap::new(),
        }
    }

    /// Describe `data`, hashing it with SHA-256.
    pub fn from_bytes(media_type: impl Into<String>, data: impl AsRef<[u8]>) -> Self {
        Self::from_bytes_with(Algorithm::Sha256, media_type, data)
    }

    /// Describe `data`, hashing it with `algorithm`.
    pub fn from_bytes_with(
        algorithm: Algorithm,
        media_type: impl Into<String>,
        data: impl AsRef<[u8]>,
    ) -> Self {
        let data = data.as_ref();
        Self::new(
            media_type,
            Digest::compute(algorithm, data),
            data.len() as u64,
        )
    }

    /// The descriptor of the empty JSON object, `{}`.
    pub fn empty_json() -> Self {
        Self::from_bytes(OCI_EMPTY, EMPTY_JSON)
    }

    /// Add an annotation.
    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }

    /// Whether this descriptor points at an image manifest.
    pub fn is_manifest(&self) -> bool {
        MANIFEST_MEDIA_TYPES.contains(&self.media_type.as_str())
    }

    /// The ref name annotation, if this descriptor came from an image layout index.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_REF_NAME).map(String::as_str)
    }

    /// Check that `data` is exactly the content this descriptor names.
    pub fn verify(&self, data: &[u8]) -> Result<(), Error> {
        if data.len() as u64 != self.size {
            return Err(Error::SizeMismatch {
                expected: self.size,
                actual: data.len() as u64,
            });
        }

        let actual = Digest::compute(self.digest.algorithm(), data);
        if actual != self.digest {
            return Err(Error::DigestMismatch {
                expected: self.digest.clone(),
                actual,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn serializes_like_oci() {
        let descriptor = Descriptor::from_bytes("application/octet-stream", "hello world");
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "mediaType": "application/octet-stream",
                "digest": "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9",
                "size": 11,
            })
        );

        let annotated = descriptor.with_annotation(ANNOTATION_REF_NAME, "v1");
        let json = serde_json::to_value(&annotated).unwrap();
        assert_eq!(json["annotations"][ANNOTATION_REF_NAME], "v1");
        assert_eq!(annotated.ref_name(), Some("v1"));
    }

    #[test]
    fn verify_checks_size_then_digest() {
        let descriptor = Descriptor::from_bytes("text/plain", "hello world");
        descriptor.verify(b"hello world").unwrap();

        let error = descriptor.verify(b"hello").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::SizeMismatch);

        let error = descriptor.verify(b"hello wxrld").unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DigestMismatch);
    }

    #[test]
    fn empty_json_descriptor() {
        let empty = Descriptor::empty_json();
        assert_eq!(empty.size, 2);
        assert_eq!(
            empty.digest.to_string(),
            "sha256:44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }
}
