//! Chunked blob uploads.
//!
//! An upload session is opened with `POST /v2/<name>/blobs/uploads/`, fed in
//! order with `PATCH` requests carrying a `Content-Range`, and closed with a
//! `PUT` naming the digest of everything sent. The registry may move the
//! session after every request, so the session always follows the latest
//! `Location` it was given.

use bytes::Bytes;
use content::{Algorithm, Descriptor, Digest, Digester, Error};
use http::header::{self, HeaderValue};
use http::{Method, StatusCode};
use url::Url;

use crate::client::{RegistryClient, RegistryRequest, RegistryResponse, DOCKER_CONTENT_DIGEST};

/// Where an upload session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// The registry opened the session; nothing has been sent yet.
    Initiated,
    /// At least one chunk has been accepted.
    Uploading,
    /// The blob was committed.
    Completed,
    /// The session was cancelled.
    Aborted,
}

impl UploadState {
    /// Whether chunks may still be sent.
    pub fn is_active(&self) -> bool {
        matches!(self, UploadState::Initiated | UploadState::Uploading)
    }
}

/// One chunked upload to a repository.
///
/// Chunks must be sent in order. The running digest only covers chunks the
/// registry accepted, so a chunk which failed in transit can be sent again
/// at the same offset.
#[derive(Debug)]
pub struct UploadSession {
    client: RegistryClient,
    repository: String,
    location: Url,
    offset: u64,
    digester: Digester,
    state: UploadState,
}

impl UploadSession {
    /// Open a session for a sha256 blob.
    pub async fn start(client: &RegistryClient, repository: &str) -> Result<Self, Error> {
        Self::start_with(client, repository, Algorithm::Sha256).await
    }

    /// Open a session whose content will be addressed with `algorithm`.
    #[tracing::instrument(skip(client), fields(registry = client.registry()))]
    pub async fn start_with(
        client: &RegistryClient,
        repository: &str,
        algorithm: Algorithm,
    ) -> Result<Self, Error> {
        let url = client.endpoint(&format!("v2/{repository}/blobs/uploads/"))?;
        let request = RegistryRequest::new(Method::POST, url);
        // An unanswered POST at worst leaves a session for the registry to reap.
        let response = client.send_idempotent(&request).await?;
        if response.status() != StatusCode::ACCEPTED {
            return Err(Error::ProtocolViolation(format!(
                "starting an upload returned {}, expected 202",
                response.status()
            )));
        }

        let location = client.location(request.url(), response.headers())?;
        tracing::debug!(%location, "upload started");

        Ok(UploadSession {
            client: client.clone(),
            repository: repository.to_owned(),
            location,
            offset: 0,
            digester: Digester::new(algorithm),
            state: UploadState::Initiated,
        })
    }

    /// The repository this blob is being uploaded to.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// Bytes accepted by the registry so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The current session URL.
    pub fn location(&self) -> &Url {
        &self.location
    }

    /// The session state.
    pub fn state(&self) -> UploadState {
        self.state
    }

    fn ensure_active(&self) -> Result<(), Error> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(Error::ProtocolViolation(format!(
                "upload session is {:?}",
                self.state
            )))
        }
    }

    /// Send the next chunk.
    pub async fn upload_chunk(&mut self, chunk: Bytes) -> Result<(), Error> {
        self.upload_chunk_at(self.offset, chunk).await
    }

    /// Send a chunk which the caller claims starts at `offset`.
    ///
    /// Anything but the number of bytes already accepted is a
    /// [`Error::RangeConflict`], and the session is left unchanged.
    #[tracing::instrument(
        skip(self, chunk),
        fields(repository = %self.repository, len = chunk.len())
    )]
    pub async fn upload_chunk_at(&mut self, offset: u64, chunk: Bytes) -> Result<(), Error> {
        self.ensure_active()?;
        if chunk.is_empty() {
            return Err(Error::ProtocolViolation("empty upload chunk".into()));
        }
        if offset != self.offset {
            return Err(Error::RangeConflict {
                accepted: self.offset,
                offset,
            });
        }

        let end = offset + chunk.len() as u64 - 1;
        let request = RegistryRequest::new(Method::PATCH, self.location.clone())
            .header(header::CONTENT_RANGE, format_range(offset, end)?)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            )
            .body(chunk.clone());

        let response = self.client.execute(&request).await?;
        if response.status() == StatusCode::RANGE_NOT_SATISFIABLE {
            let accepted = reported_end(&response)?.map_or(self.offset, accepted_through);
            return Err(Error::RangeConflict { accepted, offset });
        }
        let response = response.error_for_status(&request).await?;
        if !matches!(response.status(), StatusCode::ACCEPTED | StatusCode::NO_CONTENT) {
            return Err(Error::ProtocolViolation(format!(
                "chunk upload returned {}, expected 202",
                response.status()
            )));
        }

        if let Some(reported) = reported_end(&response)? {
            if reported != end {
                return Err(Error::RangeConflict {
                    accepted: accepted_through(reported),
                    offset,
                });
            }
        }

        self.accepted(&chunk)?;
        if response.headers().contains_key(header::LOCATION) {
            self.location = self.client.location(request.url(), response.headers())?;
        }
        tracing::trace!(offset = self.offset, "chunk accepted");
        Ok(())
    }

    /// Record a chunk the registry holds.
    fn accepted(&mut self, chunk: &[u8]) -> Result<(), Error> {
        self.digester.update(chunk)?;
        self.offset += chunk.len() as u64;
        self.state = UploadState::Uploading;
        Ok(())
    }

    /// Send the next chunk, retrying transient failures.
    ///
    /// Before each retry the session asks the registry how much it accepted,
    /// so a chunk which landed but whose acknowledgement was lost is not sent
    /// twice.
    ///
    /// A registry reports both an empty session and one holding a single
    /// byte as `Range: 0-0`. When a lone first byte may or may not have
    /// landed, the chunk is sent again and a range conflict in reply is taken
    /// as proof that it did.
    pub async fn upload_chunk_with_retry(&mut self, chunk: Bytes) -> Result<(), Error> {
        let start = self.offset;
        let retries = self.client.config().retries;
        let backoff = self.client.config().backoff.clone();

        let mut attempt = 0;
        let mut ambiguous = false;
        loop {
            match self.upload_chunk_at(start, chunk.clone()).await {
                Ok(()) => return Ok(()),
                Err(Error::RangeConflict { accepted: 0, .. }) if ambiguous => {
                    tracing::debug!("single byte chunk had already landed");
                    return self.accepted(&chunk);
                }
                Err(error) if error.is_retryable() && attempt < retries => {
                    let delay = backoff.delay_for(attempt);
                    attempt += 1;
                    tracing::warn!(%error, attempt, ?delay, "chunk upload failed, retrying");
                    tokio::time::sleep(delay).await;

                    let reported = match self.reported_range().await {
                        Ok(reported) => reported,
                        Err(error) if error.is_retryable() => continue,
                        Err(error) => return Err(error),
                    };
                    ambiguous = start == 0 && chunk.len() == 1 && reported == Some(0);
                    let accepted = reported.map_or(0, accepted_through);
                    if accepted == start + chunk.len() as u64 {
                        // The chunk landed; only the acknowledgement was lost.
                        return self.accepted(&chunk);
                    }
                    if accepted != start {
                        return Err(Error::RangeConflict {
                            accepted,
                            offset: start,
                        });
                    }
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Ask the registry how many bytes of this session it holds.
    #[tracing::instrument(skip(self), fields(repository = %self.repository))]
    pub async fn status(&mut self) -> Result<u64, Error> {
        Ok(self.reported_range().await?.map_or(0, accepted_through))
    }

    /// The inclusive end of the range the registry reports holding.
    async fn reported_range(&mut self) -> Result<Option<u64>, Error> {
        self.ensure_active()?;
        let request = RegistryRequest::new(Method::GET, self.location.clone());
        let response = self.client.send(&request).await?;
        if response.headers().contains_key(header::LOCATION) {
            self.location = self.client.location(request.url(), response.headers())?;
        }
        reported_end(&response)
    }

    /// Commit the upload. Returns the digest the registry acknowledged, which
    /// is checked against the digest of the chunks sent.
    pub async fn complete(mut self, media_type: &str) -> Result<Descriptor, Error> {
        self.ensure_active()?;
        let digest = self.finalize()?;
        let descriptor = Descriptor::new(media_type, digest, self.offset);
        self.commit(descriptor).await
    }

    /// Commit the upload, refusing to do so unless the content sent matches
    /// `expected`.
    pub async fn complete_expecting(mut self, expected: &Descriptor) -> Result<Descriptor, Error> {
        self.ensure_active()?;
        if self.offset != expected.size {
            let error = Error::SizeMismatch {
                expected: expected.size,
                actual: self.offset,
            };
            self.abort().await;
            return Err(error);
        }

        let digest = self.finalize()?;
        if digest != expected.digest {
            let error = Error::DigestMismatch {
                expected: expected.digest.clone(),
                actual: digest,
            };
            self.abort().await;
            return Err(error);
        }

        self.commit(expected.clone()).await
    }

    fn finalize(&mut self) -> Result<Digest, Error> {
        // An empty blob has seen no chunks; the digester still needs one update.
        self.digester.update(&[])?;
        self.digester.finalize()
    }

    #[tracing::instrument(
        skip_all,
        fields(repository = %self.repository, digest = %descriptor.digest)
    )]
    async fn commit(mut self, descriptor: Descriptor) -> Result<Descriptor, Error> {
        let mut url = self.location.clone();
        url.query_pairs_mut()
            .append_pair("digest", &descriptor.digest.to_string());

        let request = RegistryRequest::new(Method::PUT, url)
            .header(
                header::CONTENT_TYPE,
                HeaderValue::from_static("application/octet-stream"),
            );

        let response = match self.client.send(&request).await {
            Ok(response) => response,
            Err(error) => {
                self.abort().await;
                return Err(error);
            }
        };
        if response.status() != StatusCode::CREATED {
            self.abort().await;
            return Err(Error::ProtocolViolation(format!(
                "completing an upload returned {}, expected 201",
                response.status()
            )));
        }

        match response.header_str(&DOCKER_CONTENT_DIGEST) {
            Some(acknowledged) => {
                let acknowledged: Digest = acknowledged.parse()?;
                if acknowledged != descriptor.digest {
                    self.state = UploadState::Aborted;
                    return Err(Error::DigestMismatch {
                        expected: descriptor.digest,
                        actual: acknowledged,
                    });
                }
            }
            None => tracing::warn!(
                digest = %descriptor.digest,
                "registry did not acknowledge a digest, trusting the local one"
            ),
        }

        self.state = UploadState::Completed;
        tracing::debug!(size = descriptor.size, "upload complete");
        Ok(descriptor)
    }

    /// Cancel the session. Failures are logged, the registry eventually
    /// reclaims abandoned sessions on its own.
    pub async fn abort(&mut self) {
        if !self.state.is_active() {
            return;
        }
        self.state = UploadState::Aborted;

        let request = RegistryRequest::new(Method::DELETE, self.location.clone()).detached();
        match self.client.send(&request).await {
            Ok(_) => tracing::debug!(location = %self.location, "upload aborted"),
            Err(error) => {
                tracing::warn!(%error, location = %self.location, "failed to abort upload")
            }
        }
    }
}

impl Drop for UploadSession {
    fn drop(&mut self) {
        if self.state.is_active() {
            tracing::warn!(
                repository = %self.repository,
                location = %self.location,
                offset = self.offset,
                "upload session dropped before completion"
            );
        }
    }
}

fn format_range(start: u64, end: u64) -> Result<HeaderValue, Error> {
    HeaderValue::try_from(format!("{start}-{end}"))
        .map_err(|error| Error::ProtocolViolation(error.to_string()))
}

/// The inclusive end of the `Range: 0-<end>` a registry reports holding, if
/// the header is present.
fn reported_end(response: &RegistryResponse) -> Result<Option<u64>, Error> {
    let Some(range) = response.header_str(&header::RANGE) else {
        return Ok(None);
    };
    let malformed = || Error::ProtocolViolation(format!("malformed Range {range:?}"));
    let (start, end) = range
        .trim()
        .trim_start_matches("bytes=")
        .split_once('-')
        .ok_or_else(malformed)?;
    let start: u64 = start.parse().map_err(|_| malformed())?;
    let end: u64 = end.parse().map_err(|_| malformed())?;
    if start != 0 {
        return Err(Error::ProtocolViolation(format!(
            "Range {range:?} does not start at zero"
        )));
    }
    Ok(Some(end))
}

/// Bytes held, given a reported range end. Registries report `0-0` for an
/// empty session, so a lone first byte is indistinguishable from none.
fn accepted_through(end: u64) -> u64 {
    if end == 0 {
        0
    } else {
        end + 1
    }
}
