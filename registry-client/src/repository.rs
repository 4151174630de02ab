use std::collections::BTreeSet;

use bytes::{Bytes, BytesMut};
use content::manifest::{MANIFEST_MEDIA_TYPES, OCI_IMAGE_MANIFEST};
use content::verify::read_verified;
use content::{
    fetch_all, parse_reference, validate_tag, Algorithm, BoxReader, Descriptor, Digest,
    DigestReader, Error, Manifest, Reader, Target,
};
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt as _};

use crate::client::{RegistryClient, RegistryRequest, RegistryResponse, DOCKER_CONTENT_DIGEST};
use crate::reference::validate_repository;
use crate::upload::UploadSession;

/// A repository in a remote registry, usable anywhere a [`Target`] is.
///
/// Blobs are uploaded in chunks of [`crate::RegistryConfig::chunk_size`];
/// manifests are sent whole, and only once the blobs they reference exist.
#[derive(Debug, Clone)]
pub struct Repository {
    client: RegistryClient,
    name: String,
    display: String,
}

impl Repository {
    pub(crate) fn new(client: RegistryClient, name: &str) -> Result<Self, Error> {
        validate_repository(name)?;
        let display = format!("{}/{}", client.registry(), name);
        Ok(Repository {
            client,
            name: name.to_owned(),
            display,
        })
    }

    /// The repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.name
    }

    /// The client this repository talks through.
    pub fn client(&self) -> &RegistryClient {
        &self.client
    }

    fn request(&self, method: Method, path: &str) -> Result<RegistryRequest, Error> {
        let url = self.client.endpoint(&format!("v2/{}/{}", self.name, path))?;
        Ok(RegistryRequest::new(method, url))
    }

    fn content_request(
        &self,
        method: Method,
        descriptor: &Descriptor,
    ) -> Result<RegistryRequest, Error> {
        if descriptor.is_manifest() {
            Ok(self
                .request(method, &format!("manifests/{}", descriptor.digest))?
                .header(header::ACCEPT, media_type_header(&descriptor.media_type)?))
        } else {
            self.request(method, &format!("blobs/{}", descriptor.digest))
        }
    }

    async fn send_streaming(&self, request: &RegistryRequest) -> Result<RegistryResponse, Error> {
        let config = self.client.config();
        let what = format!("{} {}", request.method(), request.url().path());
        let client = &self.client;
        config
            .backoff
            .retry(config.retries, &what, move || client.send(request))
            .await
    }

    async fn put_manifest(
        &self,
        reference: &str,
        media_type: &str,
        manifest: Bytes,
        digest: &Digest,
    ) -> Result<(), Error> {
        let request = self
            .request(Method::PUT, &format!("manifests/{reference}"))?
            .header(header::CONTENT_TYPE, media_type_header(media_type)?)
            .body(manifest);
        let response = self.client.send_idempotent(&request).await?;
        if response.status() != StatusCode::CREATED {
            return Err(Error::ProtocolViolation(format!(
                "pushing a manifest returned {}, expected 201",
                response.status()
            )));
        }

        if let Some(acknowledged) = response.header_str(&DOCKER_CONTENT_DIGEST) {
            let acknowledged: Digest = acknowledged.parse()?;
            if &acknowledged != digest {
                return Err(Error::DigestMismatch {
                    expected: digest.clone(),
                    actual: acknowledged,
                });
            }
        }
        Ok(())
    }

    async fn push_blob(
        &self,
        descriptor: &Descriptor,
        content: &mut Reader<'_>,
    ) -> Result<(), Error> {
        let chunk_size = self.client.config().chunk_size.max(1);
        let mut reader = DigestReader::new(content, descriptor);

        let algorithm = descriptor.digest.algorithm();
        let mut session = UploadSession::start_with(&self.client, &self.name, algorithm).await?;

        let sent: Result<(), Error> = async {
            loop {
                let chunk = read_chunk(&mut reader, chunk_size).await?;
                if chunk.is_empty() {
                    return Ok(());
                }
                session.upload_chunk_with_retry(chunk).await?;
            }
        }
        .await;

        match sent {
            Ok(()) => session.complete_expecting(descriptor).await.map(drop),
            Err(error) => {
                session.abort().await;
                Err(error)
            }
        }
    }

    /// Resolve by downloading the manifest and hashing it, for registries
    /// which do not report digests.
    async fn resolve_by_content(
        &self,
        reference: &str,
        algorithm: Algorithm,
    ) -> Result<Descriptor, Error> {
        let request = self
            .request(Method::GET, &format!("manifests/{reference}"))?
            .header(header::ACCEPT, accept_manifests()?);
        let response = self.client.send_idempotent(&request).await?;
        let media_type = response_media_type(&response);
        let body = response.bytes();

        let manifest = Manifest::parse(&body)?;
        let media_type = media_type.unwrap_or_else(|| manifest.content_type().to_owned());
        Ok(Descriptor::from_bytes_with(algorithm, media_type, &body))
    }
}

#[async_trait::async_trait]
impl Target for Repository {
    fn name(&self) -> &str {
        &self.display
    }

    #[tracing::instrument(
        skip_all,
        fields(repository = %self.display, digest = %descriptor.digest)
    )]
    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, Error> {
        let request = self.content_request(Method::HEAD, descriptor)?;
        match self.client.send_idempotent(&request).await {
            Ok(_) => Ok(true),
            Err(Error::NotFound(_)) => Ok(false),
            Err(error) => Err(error),
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(repository = %self.display, digest = %descriptor.digest)
    )]
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BoxReader, Error> {
        let request = self.content_request(Method::GET, descriptor)?;
        let response = self.send_streaming(&request).await?;
        let reader = tokio_util::io::StreamReader::new(response.into_stream());
        Ok(Box::new(DigestReader::new(reader, descriptor)))
    }

    #[tracing::instrument(
        skip_all,
        fields(repository = %self.display, digest = %descriptor.digest, size = descriptor.size)
    )]
    async fn push(&self, descriptor: &Descriptor, content: &mut Reader<'_>) -> Result<(), Error> {
        if descriptor.is_manifest() {
            let data = read_verified(content, descriptor).await?;
            Manifest::parse(&data)?;
            let reference = descriptor.digest.to_string();
            return self
                .put_manifest(&reference, &descriptor.media_type, data, &descriptor.digest)
                .await;
        }

        if self.exists(descriptor).await? {
            tracing::debug!("blob already present");
            return Ok(());
        }
        self.push_blob(descriptor, content).await
    }

    #[tracing::instrument(skip(self), fields(repository = %self.display))]
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        let pinned = parse_reference(reference)?;
        let request = self
            .request(Method::HEAD, &format!("manifests/{reference}"))?
            .header(header::ACCEPT, accept_manifests()?);
        let response = self.client.send_idempotent(&request).await?;

        let mut digests = BTreeSet::new();
        for value in response.headers().get_all(&DOCKER_CONTENT_DIGEST) {
            let value = value
                .to_str()
                .map_err(|_| Error::ProtocolViolation("non-text digest header".into()))?;
            digests.insert(value.trim().parse::<Digest>()?);
        }
        if digests.len() > 1 {
            return Err(Error::Ambiguous {
                reference: reference.to_owned(),
                candidates: digests.into_iter().collect(),
            });
        }

        let size = response
            .header_str(&header::CONTENT_LENGTH)
            .and_then(|length| length.parse::<u64>().ok());
        let descriptor = match (digests.pop_first(), size) {
            (Some(digest), Some(size)) => {
                let media_type = response_media_type(&response)
                    .unwrap_or_else(|| OCI_IMAGE_MANIFEST.to_owned());
                Descriptor::new(media_type, digest, size)
            }
            (reported, _) => {
                tracing::debug!("registry did not describe the manifest, downloading it");
                let algorithm = pinned
                    .as_ref()
                    .or(reported.as_ref())
                    .map_or(Algorithm::Sha256, Digest::algorithm);
                self.resolve_by_content(reference, algorithm).await?
            }
        };

        if let Some(pinned) = pinned {
            if descriptor.digest != pinned {
                return Err(Error::DigestMismatch {
                    expected: pinned,
                    actual: descriptor.digest,
                });
            }
        }
        Ok(descriptor)
    }

    #[tracing::instrument(
        skip(self, descriptor),
        fields(repository = %self.display, digest = %descriptor.digest)
    )]
    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error> {
        validate_tag(reference)?;
        let manifest = fetch_all(self, descriptor).await?;
        self.put_manifest(reference, &descriptor.media_type, manifest, &descriptor.digest)
            .await
    }

    #[tracing::instrument(
        skip_all,
        fields(repository = %self.display, digest = %descriptor.digest)
    )]
    async fn delete(&self, descriptor: &Descriptor) -> Result<(), Error> {
        let request = self.content_request(Method::DELETE, descriptor)?;
        let response = self.client.send_idempotent(&request).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Error::ProtocolViolation(format!(
                "delete returned {}, expected 202",
                response.status()
            )));
        }
        Ok(())
    }

    #[tracing::instrument(skip(self), fields(repository = %self.display))]
    async fn tags(&self) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct TagList {
            #[serde(default)]
            tags: Option<Vec<String>>,
        }

        let mut tags = Vec::new();
        let mut next = Some(self.request(Method::GET, "tags/list")?);
        while let Some(request) = next.take() {
            let response = self.client.send_idempotent(&request).await?;
            if let Some(url) = self.client.next_link(request.url(), response.headers())? {
                next = Some(RegistryRequest::new(Method::GET, url));
            }
            let page: TagList = response.json()?;
            tags.extend(page.tags.unwrap_or_default());
        }
        tags.sort();
        Ok(tags)
    }

    #[tracing::instrument(
        skip(self, descriptor, content),
        fields(repository = %self.display, digest = %descriptor.digest)
    )]
    async fn push_reference(
        &self,
        descriptor: &Descriptor,
        content: &mut Reader<'_>,
        reference: &str,
    ) -> Result<(), Error> {
        validate_tag(reference)?;
        if !descriptor.is_manifest() {
            return Err(Error::ProtocolViolation(format!(
                "only manifests can be tagged, not {}",
                descriptor.media_type
            )));
        }
        let data = read_verified(content, descriptor).await?;
        Manifest::parse(&data)?;
        self.put_manifest(reference, &descriptor.media_type, data, &descriptor.digest)
            .await
    }
}

/// Read up to `size` bytes, stopping early only at end of stream.
async fn read_chunk<R>(reader: &mut R, size: usize) -> Result<Bytes, Error>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(size);
    while buf.len() < size {
        if reader.read_buf(&mut buf).await? == 0 {
            break;
        }
    }
    Ok(buf.freeze())
}

fn media_type_header(media_type: &str) -> Result<HeaderValue, Error> {
    HeaderValue::from_str(media_type)
        .map_err(|_| Error::ProtocolViolation(format!("invalid media type {media_type:?}")))
}

fn accept_manifests() -> Result<HeaderValue, Error> {
    media_type_header(&MANIFEST_MEDIA_TYPES.join(", "))
}

fn response_media_type(response: &RegistryResponse) -> Option<String> {
    response
        .header_str(&header::CONTENT_TYPE)
        .and_then(|value| value.split(';').next())
        .map(str::trim)
        .filter(|value| MANIFEST_MEDIA_TYPES.contains(value))
        .map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Anonymous;
    use crate::mock::MockRegistry;
    use crate::{Backoff, RegistryConfig};
    use content::manifest::{EMPTY_JSON, OCI_LAYER_TAR};
    use content::ErrorKind;

    fn repository(mock: &MockRegistry, chunk_size: usize) -> Repository {
        let config = RegistryConfig {
            chunk_size,
            backoff: Backoff::none(),
            ..Default::default()
        };
        RegistryClient::with_service("localhost:5000", config, Anonymous, mock.clone())
            .unwrap()
            .repository("hello-world")
            .unwrap()
    }

    async fn push_image(repository: &Repository) -> (Descriptor, Descriptor) {
        let layer = Descriptor::from_bytes(OCI_LAYER_TAR, b"hello world");
        repository.push(&layer, &mut &b"hello world"[..]).await.unwrap();
        let config = Descriptor::empty_json();
        repository.push(&config, &mut &EMPTY_JSON[..]).await.unwrap();

        let (manifest, bytes) = Manifest::builder()
            .layer(layer.clone())
            .build()
            .to_descriptor()
            .unwrap();
        repository
            .push_reference(&manifest, &mut &bytes[..], "v1")
            .await
            .unwrap();
        (manifest, layer)
    }

    #[tokio::test]
    async fn blobs_round_trip_in_chunks() {
        let mock = MockRegistry::new();
        let repository = repository(&mock, 4);
        let layer = Descriptor::from_bytes(OCI_LAYER_TAR, b"hello world");

        assert!(!repository.exists(&layer).await.unwrap());
        repository.push(&layer, &mut &b"hello world"[..]).await.unwrap();
        assert!(repository.exists(&layer).await.unwrap());

        let patches = mock
            .requests()
            .iter()
            .filter(|(method, _)| *method == Method::PATCH)
            .count();
        assert_eq!(patches, 3);

        let data = fetch_all(&repository, &layer).await.unwrap();
        assert_eq!(&data[..], b"hello world");

        // A second push is a no-op.
        let before = mock.requests().len();
        repository.push(&layer, &mut &b"hello world"[..]).await.unwrap();
        assert_eq!(mock.requests().len(), before + 1);
    }

    #[tokio::test]
    async fn corrupt_source_is_not_committed() {
        let mock = MockRegistry::new();
        let repository = repository(&mock, 4);
        let layer = Descriptor::from_bytes(OCI_LAYER_TAR, b"hello world");

        let error = repository
            .push(&layer, &mut &b"hello there"[..])
            .await
            .unwrap_err();
        assert_eq!(error.kind(), ErrorKind::DigestMismatch);
        assert!(!repository.exists(&layer).await.unwrap());
        assert_eq!(mock.open_uploads(), 0);
    }

    #[tokio::test]
    async fn empty_blob() {
        let mock = MockRegistry::new();
        let repository = repository(&mock, 4);
        let empty = Descriptor::from_bytes(OCI_LAYER_TAR, b"");
        repository.push(&empty, &mut &b""[..]).await.unwrap();
        assert!(repository.exists(&empty).await.unwrap());
        assert!(fetch_all(&repository, &empty).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn manifests_and_tags() {
        let mock = MockRegistry::new();
        let repository = repository(&mock, 1024);
        let (manifest, _) = push_image(&repository).await;

        assert_eq!(repository.resolve("v1").await.unwrap(), manifest);
        assert_eq!(
            repository.resolve(&manifest.digest.to_string()).await.unwrap(),
            manifest
        );

        repository.tag(&manifest, "latest").await.unwrap();
        assert_eq!(repository.tags().await.unwrap(), ["latest", "v1"]);

        repository.delete(&manifest).await.unwrap();
        assert_eq!(
            repository.resolve("v1").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn manifests_need_their_blobs() {
        let mock = MockRegistry::new();
        let repository = repository(&mock, 1024);
        let layer = Descriptor::from_bytes(OCI_LAYER_TAR, b"missing");
        let (manifest, bytes) = Manifest::builder()
            .layer(layer)
            .build()
            .to_descriptor()
            .unwrap();

        let error = repository
            .push_reference(&manifest, &mut &bytes[..], "v1")
            .await
            .unwrap_err();
        assert!(
            matches!(
                &error,
                Error::Rejected { status: 400, code, .. } if code == "MANIFEST_BLOB_UNKNOWN"
            ),
            "{error}"
        );
        assert!(mock.tags("hello-world").is_empty());
    }

    #[tokio::test]
    async fn ambiguous_tags() {
        let mock = MockRegistry::new();
        let repository = repository(&mock, 1024);
        push_image(&repository).await;

        mock.duplicate_digest_headers(true);
        let error = repository.resolve("v1").await.unwrap_err();
        assert!(
            matches!(&error, Error::Ambiguous { candidates, .. } if candidates.len() == 2),
            "{error}"
        );
    }

    #[tokio::test]
    async fn resolve_without_digest_header() {
        let mock = MockRegistry::new();
        let repository = repository(&mock, 1024);
        let (manifest, _) = push_image(&repository).await;

        mock.omit_digest_headers(true);
        assert_eq!(repository.resolve("v1").await.unwrap(), manifest);
    }

    #[tokio::test]
    async fn paginated_tags() {
        let mock = MockRegistry::new().with_page_size(2);
        let repository = repository(&mock, 1024);
        let (manifest, _) = push_image(&repository).await;
        for tag in ["a", "b", "c", "d"] {
            repository.tag(&manifest, tag).await.unwrap();
        }
        assert_eq!(repository.tags().await.unwrap(), ["a", "b", "c", "d", "v1"]);
    }

    #[test]
    fn repository_names_are_validated() {
        let client = RegistryClient::with_service(
            "localhost:5000",
            RegistryConfig::default(),
            Anonymous,
            MockRegistry::new(),
        )
        .unwrap();
        assert_eq!(
            client.repository("Hello").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
    }
}
