//! An in-memory registry for tests.
//!
//! [`MockRegistry`] is a `tower::Service` which speaks enough of the
//! distribution API to exercise [`crate::RegistryClient`] without a network:
//! chunked uploads with rotating session locations, manifests, tags and the
//! catalog, with paginated listings. Faults can be injected to test retry,
//! integrity and authentication handling.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use content::{validate_tag, Digest, Manifest};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::BodyExt as _;
use hyperdriver::Body;
use parking_lot::Mutex;

use crate::client::DOCKER_CONTENT_DIGEST;

type MockResult = Result<http::Response<hyperdriver::Body>, hyperdriver::client::Error>;

/// An in-memory registry service, with knobs for injecting faults.
///
/// Clones share state, so a test can keep one handle for inspection while
/// the client owns another.
#[derive(Debug, Clone, Default)]
pub struct MockRegistry {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    repositories: BTreeMap<String, MockRepository>,
    uploads: HashMap<String, MockUpload>,
    requests: Vec<(Method, String)>,
    page_size: Option<usize>,
    faults: Faults,
}

#[derive(Debug, Default)]
struct Faults {
    fail: usize,
    time_out: usize,
    drop_patch_responses: usize,
    corrupt_upload_digests: bool,
    duplicate_digest_headers: bool,
    omit_digest_headers: bool,
    bearer: Option<String>,
}

#[derive(Debug, Default)]
struct MockRepository {
    blobs: HashMap<Digest, Bytes>,
    manifests: HashMap<Digest, (String, Bytes)>,
    tags: BTreeMap<String, Digest>,
}

#[derive(Debug)]
struct MockUpload {
    repository: String,
    data: Vec<u8>,
    generation: u64,
}

#[derive(Debug)]
enum MockError {
    BlobUnknown(String),
    BlobUploadUnknown(String),
    ManifestUnknown(String),
    NameUnknown(String),
    ManifestBlobUnknown(Digest),
    ManifestInvalid(String),
    DigestInvalid(String),
    TagInvalid(String),
    Unsupported(String),
    RangeInvalid { accepted: usize },
    Unauthorized,
    Unavailable,
}

impl MockError {
    fn status_code(&self) -> StatusCode {
        match self {
            MockError::BlobUnknown(_)
            | MockError::BlobUploadUnknown(_)
            | MockError::ManifestUnknown(_)
            | MockError::NameUnknown(_) => StatusCode::NOT_FOUND,
            MockError::ManifestBlobUnknown(_)
            | MockError::ManifestInvalid(_)
            | MockError::DigestInvalid(_)
            | MockError::TagInvalid(_) => StatusCode::BAD_REQUEST,
            MockError::Unsupported(_) => StatusCode::METHOD_NOT_ALLOWED,
            MockError::RangeInvalid { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            MockError::Unauthorized => StatusCode::UNAUTHORIZED,
            MockError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            MockError::BlobUnknown(_) => "BLOB_UNKNOWN",
            MockError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            MockError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            MockError::NameUnknown(_) => "NAME_UNKNOWN",
            MockError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            MockError::ManifestInvalid(_) => "MANIFEST_INVALID",
            MockError::DigestInvalid(_) => "DIGEST_INVALID",
            MockError::TagInvalid(_) => "TAG_INVALID",
            MockError::Unsupported(_) => "UNSUPPORTED",
            MockError::RangeInvalid { .. } => "BLOB_UPLOAD_INVALID",
            MockError::Unauthorized => "UNAUTHORIZED",
            MockError::Unavailable => "UNAVAILABLE",
        }
    }

    fn message(&self) -> String {
        match self {
            MockError::BlobUnknown(what)
            | MockError::BlobUploadUnknown(what)
            | MockError::ManifestUnknown(what)
            | MockError::NameUnknown(what)
            | MockError::ManifestInvalid(what)
            | MockError::DigestInvalid(what)
            | MockError::TagInvalid(what)
            | MockError::Unsupported(what) => what.clone(),
            MockError::ManifestBlobUnknown(digest) => format!("blob unknown to registry: {digest}"),
            MockError::RangeInvalid { accepted } => format!("{accepted} bytes accepted"),
            MockError::Unauthorized => "authentication required".into(),
            MockError::Unavailable => "service unavailable".into(),
        }
    }

    fn into_response(self) -> http::Response<hyperdriver::Body> {
        let body = serde_json::json!({
            "errors": [{ "code": self.code(), "message": self.message() }]
        });
        let mut response = respond(self.status_code(), Bytes::from(body.to_string()));
        set(&mut response, header::CONTENT_TYPE, "application/json");
        match self {
            MockError::RangeInvalid { accepted } => {
                set(&mut response, header::RANGE, range(accepted))
            }
            MockError::Unauthorized => {
                set(&mut response, header::WWW_AUTHENTICATE, "Bearer realm=\"mock\"")
            }
            _ => {}
        }
        response
    }
}

impl MockRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return at most `n` entries per tag list or catalog page unless the
    /// client asks for fewer.
    pub fn with_page_size(self, n: usize) -> Self {
        self.state.lock().page_size = Some(n);
        self
    }

    /// Answer the next `n` requests with `503 Service Unavailable`.
    pub fn fail_next(&self, n: usize) {
        self.state.lock().faults.fail = n;
    }

    /// Fail the next `n` requests as if they timed out.
    pub fn time_out_next(&self, n: usize) {
        self.state.lock().faults.time_out = n;
    }

    /// Apply the next chunk upload, then lose the response.
    pub fn drop_next_patch_response(&self) {
        self.state.lock().faults.drop_patch_responses += 1;
    }

    /// Acknowledge completed uploads with the wrong digest.
    pub fn corrupt_upload_digests(&self, enabled: bool) {
        self.state.lock().faults.corrupt_upload_digests = enabled;
    }

    /// Send two different digest headers with every manifest.
    pub fn duplicate_digest_headers(&self, enabled: bool) {
        self.state.lock().faults.duplicate_digest_headers = enabled;
    }

    /// Leave the digest header off manifest responses and upload completions.
    pub fn omit_digest_headers(&self, enabled: bool) {
        self.state.lock().faults.omit_digest_headers = enabled;
    }

    /// Reject requests which do not carry `Authorization: Bearer <token>`.
    pub fn require_bearer(&self, token: impl Into<String>) {
        self.state.lock().faults.bearer = Some(token.into());
    }

    /// A stored blob.
    pub fn blob(&self, repository: &str, digest: &Digest) -> Option<Bytes> {
        let state = self.state.lock();
        state.repositories.get(repository)?.blobs.get(digest).cloned()
    }

    /// The manifest a tag or digest refers to.
    pub fn manifest(&self, repository: &str, reference: &str) -> Option<Bytes> {
        let state = self.state.lock();
        let repository = state.repositories.get(repository)?;
        let digest = repository.lookup(reference)?;
        repository.manifests.get(&digest).map(|(_, data)| data.clone())
    }

    /// Tags in a repository, sorted.
    pub fn tags(&self, repository: &str) -> Vec<String> {
        let state = self.state.lock();
        state
            .repositories
            .get(repository)
            .map(|repository| repository.tags.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Upload sessions which were started but neither completed nor cancelled.
    pub fn open_uploads(&self) -> usize {
        self.state.lock().uploads.len()
    }

    /// Every request received, as method and path.
    pub fn requests(&self) -> Vec<(Method, String)> {
        self.state.lock().requests.clone()
    }
}

impl MockRepository {
    fn lookup(&self, reference: &str) -> Option<Digest> {
        match reference.parse::<Digest>() {
            Ok(digest) => self.manifests.contains_key(&digest).then_some(digest),
            Err(_) => self.tags.get(reference).cloned(),
        }
    }
}

impl tower::Service<http::Request<hyperdriver::Body>> for MockRegistry {
    type Response = http::Response<hyperdriver::Body>;
    type Error = hyperdriver::client::Error;
    type Future = Pin<Box<dyn Future<Output = MockResult> + Send + 'static>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<hyperdriver::Body>) -> Self::Future {
        let state = self.state.clone();
        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default();

            let mut state = state.lock();
            let request = MockRequest {
                method: parts.method,
                path: parts.uri.path().to_owned(),
                query: parts
                    .uri
                    .query()
                    .map(|query| {
                        url::form_urlencoded::parse(query.as_bytes())
                            .into_owned()
                            .collect()
                    })
                    .unwrap_or_default(),
                headers: parts.headers,
                body,
            };
            state.handle(request)
        })
    }
}

#[derive(Debug)]
struct MockRequest {
    method: Method,
    path: String,
    query: HashMap<String, String>,
    headers: HeaderMap,
    body: Bytes,
}

impl MockRequest {
    fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }
}

enum Route<'r> {
    Base,
    Catalog,
    Tags(&'r str),
    Manifest(&'r str, &'r str),
    Uploads(&'r str),
    Upload(&'r str, &'r str),
    Blob(&'r str, &'r str),
}

impl<'r> Route<'r> {
    fn parse(path: &'r str) -> Option<Self> {
        let rest = path.strip_prefix("/v2")?;
        if rest.is_empty() || rest == "/" {
            return Some(Route::Base);
        }
        let rest = rest.strip_prefix('/')?;
        if rest == "_catalog" {
            return Some(Route::Catalog);
        }
        if let Some(name) = rest.strip_suffix("/tags/list") {
            return Some(Route::Tags(name));
        }
        if let Some(name) = rest.strip_suffix("/blobs/uploads/") {
            return Some(Route::Uploads(name));
        }
        if let Some((name, id)) = rest.rsplit_once("/blobs/uploads/") {
            return Some(Route::Upload(name, id));
        }
        if let Some((name, reference)) = rest.rsplit_once("/manifests/") {
            return Some(Route::Manifest(name, reference));
        }
        if let Some((name, digest)) = rest.rsplit_once("/blobs/") {
            return Some(Route::Blob(name, digest));
        }
        None
    }
}

impl MockState {
    fn handle(&mut self, request: MockRequest) -> MockResult {
        self.requests
            .push((request.method.clone(), request.path.clone()));

        if self.faults.time_out > 0 {
            self.faults.time_out -= 1;
            return Err(hyperdriver::client::Error::RequestTimeout);
        }
        if self.faults.fail > 0 {
            self.faults.fail -= 1;
            return Ok(MockError::Unavailable.into_response());
        }
        if let Some(token) = &self.faults.bearer {
            let expected = format!("Bearer {token}");
            if request.header(&header::AUTHORIZATION) != Some(expected.as_str()) {
                return Ok(MockError::Unauthorized.into_response());
            }
        }

        let is_patch = request.method == Method::PATCH;
        let response = self.route(&request).unwrap_or_else(MockError::into_response);

        if is_patch && response.status().is_success() && self.faults.drop_patch_responses > 0 {
            self.faults.drop_patch_responses -= 1;
            return Err(hyperdriver::client::Error::RequestTimeout);
        }
        Ok(response)
    }

    fn route(&mut self, request: &MockRequest) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let unsupported = || MockError::Unsupported(format!("{} {}", request.method, request.path));
        let route = Route::parse(&request.path).ok_or_else(unsupported)?;
        let method = &request.method;

        match route {
            Route::Base if *method == Method::GET => Ok(json(StatusCode::OK, "{}".into())),
            Route::Catalog if *method == Method::GET => {
                let names: Vec<String> = self.repositories.keys().cloned().collect();
                Ok(self.page(request, "/v2/_catalog", "repositories", names, None))
            }
            Route::Tags(name) if *method == Method::GET => {
                let repository = self.repository(name)?;
                let tags: Vec<String> = repository.tags.keys().cloned().collect();
                let path = format!("/v2/{name}/tags/list");
                Ok(self.page(request, &path, "tags", tags, Some(name)))
            }
            Route::Uploads(name) if *method == Method::POST => Ok(self.start_upload(name)),
            Route::Upload(name, id) => match *method {
                Method::PATCH => self.patch_upload(request, name, id),
                Method::GET => self.upload_status(name, id),
                Method::PUT => self.complete_upload(request, name, id),
                Method::DELETE => {
                    self.uploads
                        .remove(id)
                        .ok_or_else(|| MockError::BlobUploadUnknown(id.to_owned()))?;
                    Ok(respond(StatusCode::NO_CONTENT, Bytes::new()))
                }
                _ => Err(unsupported()),
            },
            Route::Blob(name, digest) => {
                let digest: Digest = digest
                    .parse()
                    .map_err(|_| MockError::DigestInvalid(digest.to_owned()))?;
                match *method {
                    Method::GET | Method::HEAD => {
                        self.get_blob(name, &digest, *method == Method::HEAD)
                    }
                    Method::DELETE => {
                        self.repository_mut(name)?
                            .blobs
                            .remove(&digest)
                            .ok_or_else(|| MockError::BlobUnknown(digest.to_string()))?;
                        Ok(respond(StatusCode::ACCEPTED, Bytes::new()))
                    }
                    _ => Err(unsupported()),
                }
            }
            Route::Manifest(name, reference) => match *method {
                Method::GET | Method::HEAD => {
                    self.get_manifest(name, reference, *method == Method::HEAD)
                }
                Method::PUT => self.put_manifest(request, name, reference),
                Method::DELETE => self.delete_manifest(name, reference),
                _ => Err(unsupported()),
            },
            _ => Err(unsupported()),
        }
    }

    fn repository(&self, name: &str) -> Result<&MockRepository, MockError> {
        self.repositories
            .get(name)
            .ok_or_else(|| MockError::NameUnknown(name.to_owned()))
    }

    fn repository_mut(&mut self, name: &str) -> Result<&mut MockRepository, MockError> {
        self.repositories
            .get_mut(name)
            .ok_or_else(|| MockError::NameUnknown(name.to_owned()))
    }

    fn page(
        &self,
        request: &MockRequest,
        path: &str,
        field: &str,
        items: Vec<String>,
        name: Option<&str>,
    ) -> http::Response<hyperdriver::Body> {
        let limit = request
            .query
            .get("n")
            .and_then(|n| n.parse::<usize>().ok())
            .or(self.page_size);
        let last = request.query.get("last");

        let mut remaining = items
            .into_iter()
            .filter(|item| last.map_or(true, |last| item > last))
            .peekable();
        let page: Vec<String> = match limit {
            Some(limit) => remaining.by_ref().take(limit).collect(),
            None => remaining.by_ref().collect(),
        };

        let mut body = serde_json::Map::new();
        if let Some(name) = name {
            body.insert("name".into(), name.into());
        }
        body.insert(field.into(), page.clone().into());
        let mut response = json(StatusCode::OK, serde_json::Value::Object(body).to_string());

        if let (Some(limit), Some(last), Some(_)) = (limit, page.last(), remaining.peek()) {
            let next = format!("<{path}?n={limit}&last={last}>; rel=\"next\"");
            set(&mut response, header::LINK, next);
        }
        response
    }

    fn start_upload(&mut self, name: &str) -> http::Response<hyperdriver::Body> {
        let id = uuid::Uuid::new_v4().simple().to_string();
        let location = upload_location(name, &id, 0);
        self.uploads.insert(
            id.clone(),
            MockUpload {
                repository: name.to_owned(),
                data: Vec::new(),
                generation: 0,
            },
        );

        let mut response = respond(StatusCode::ACCEPTED, Bytes::new());
        set(&mut response, header::LOCATION, location);
        set(&mut response, header::RANGE, "0-0");
        set(&mut response, HeaderName::from_static("docker-upload-uuid"), id);
        response
    }

    fn upload(&mut self, name: &str, id: &str) -> Result<&mut MockUpload, MockError> {
        self.uploads
            .get_mut(id)
            .filter(|upload| upload.repository == name)
            .ok_or_else(|| MockError::BlobUploadUnknown(id.to_owned()))
    }

    fn patch_upload(
        &mut self,
        request: &MockRequest,
        name: &str,
        id: &str,
    ) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let upload = self.upload(name, id)?;
        let accepted = upload.data.len();

        if let Some(content_range) = request.header(&header::CONTENT_RANGE) {
            let (start, end) = content_range
                .split_once('-')
                .and_then(|(start, end)| {
                    Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?))
                })
                .ok_or(MockError::RangeInvalid { accepted })?;
            if start != accepted || end + 1 != start + request.body.len() {
                return Err(MockError::RangeInvalid { accepted });
            }
        }

        upload.data.extend_from_slice(&request.body);
        upload.generation += 1;

        let mut response = respond(StatusCode::ACCEPTED, Bytes::new());
        set(
            &mut response,
            header::LOCATION,
            upload_location(name, id, upload.generation),
        );
        set(&mut response, header::RANGE, range(upload.data.len()));
        Ok(response)
    }

    fn upload_status(
        &mut self,
        name: &str,
        id: &str,
    ) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let upload = self.upload(name, id)?;
        let mut response = respond(StatusCode::NO_CONTENT, Bytes::new());
        set(
            &mut response,
            header::LOCATION,
            upload_location(name, id, upload.generation),
        );
        set(&mut response, header::RANGE, range(upload.data.len()));
        Ok(response)
    }

    fn complete_upload(
        &mut self,
        request: &MockRequest,
        name: &str,
        id: &str,
    ) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let expected = request
            .query
            .get("digest")
            .ok_or_else(|| MockError::DigestInvalid("missing digest".into()))?;
        let expected: Digest = expected
            .parse()
            .map_err(|_| MockError::DigestInvalid(expected.clone()))?;

        let mut upload = self
            .uploads
            .remove(id)
            .filter(|upload| upload.repository == name)
            .ok_or_else(|| MockError::BlobUploadUnknown(id.to_owned()))?;
        upload.data.extend_from_slice(&request.body);

        let actual = Digest::compute(expected.algorithm(), &upload.data);
        if actual != expected {
            return Err(MockError::DigestInvalid(format!(
                "expected {expected}, got {actual}"
            )));
        }

        let acknowledged = if self.faults.corrupt_upload_digests {
            let corrupted = [upload.data.as_slice(), b"corrupt".as_slice()].concat();
            Digest::compute(expected.algorithm(), corrupted)
        } else {
            expected.clone()
        };

        self.repositories
            .entry(name.to_owned())
            .or_default()
            .blobs
            .insert(expected.clone(), Bytes::from(upload.data));

        let mut response = respond(StatusCode::CREATED, Bytes::new());
        set(&mut response, header::LOCATION, format!("/v2/{name}/blobs/{expected}"));
        if !self.faults.omit_digest_headers {
            set(&mut response, DOCKER_CONTENT_DIGEST, acknowledged.to_string());
        }
        Ok(response)
    }

    fn get_blob(
        &self,
        name: &str,
        digest: &Digest,
        head: bool,
    ) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let data = self
            .repository(name)
            .ok()
            .and_then(|repository| repository.blobs.get(digest))
            .ok_or_else(|| MockError::BlobUnknown(digest.to_string()))?;

        let mut response = respond(StatusCode::OK, if head { Bytes::new() } else { data.clone() });
        set(&mut response, header::CONTENT_TYPE, "application/octet-stream");
        set(&mut response, header::CONTENT_LENGTH, data.len().to_string());
        set(&mut response, DOCKER_CONTENT_DIGEST, digest.to_string());
        Ok(response)
    }

    fn get_manifest(
        &self,
        name: &str,
        reference: &str,
        head: bool,
    ) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let unknown = || MockError::ManifestUnknown(reference.to_owned());
        let repository = self.repository(name).map_err(|_| unknown())?;
        let digest = repository.lookup(reference).ok_or_else(unknown)?;
        let (media_type, data) = repository.manifests.get(&digest).ok_or_else(unknown)?;

        let mut response = respond(StatusCode::OK, if head { Bytes::new() } else { data.clone() });
        set(&mut response, header::CONTENT_TYPE, media_type.as_str());
        set(&mut response, header::CONTENT_LENGTH, data.len().to_string());
        if !self.faults.omit_digest_headers {
            set(&mut response, DOCKER_CONTENT_DIGEST, digest.to_string());
        }
        if self.faults.duplicate_digest_headers {
            if let Ok(value) = HeaderValue::try_from(Digest::sha256(b"elsewhere").to_string()) {
                response.headers_mut().append(DOCKER_CONTENT_DIGEST, value);
            }
        }
        Ok(response)
    }

    fn put_manifest(
        &mut self,
        request: &MockRequest,
        name: &str,
        reference: &str,
    ) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let manifest = Manifest::parse(&request.body)
            .map_err(|error| MockError::ManifestInvalid(error.to_string()))?;
        let media_type = request
            .header(&header::CONTENT_TYPE)
            .unwrap_or(manifest.content_type())
            .to_owned();

        let digest = Digest::sha256(&request.body);
        let tag = match reference.parse::<Digest>() {
            Ok(pinned) if pinned == digest => None,
            Ok(pinned) => {
                return Err(MockError::DigestInvalid(format!(
                    "expected {pinned}, got {digest}"
                )))
            }
            Err(_) => {
                validate_tag(reference).map_err(|_| MockError::TagInvalid(reference.to_owned()))?;
                Some(reference)
            }
        };

        let blobs = self.repositories.get(name).map(|repository| &repository.blobs);
        for descriptor in std::iter::once(&manifest.config).chain(&manifest.layers) {
            if !blobs.is_some_and(|blobs| blobs.contains_key(&descriptor.digest)) {
                return Err(MockError::ManifestBlobUnknown(descriptor.digest.clone()));
            }
        }

        let repository = self.repositories.entry(name.to_owned()).or_default();
        repository
            .manifests
            .insert(digest.clone(), (media_type, request.body.clone()));
        if let Some(tag) = tag {
            repository.tags.insert(tag.to_owned(), digest.clone());
        }

        let mut response = respond(StatusCode::CREATED, Bytes::new());
        set(&mut response, header::LOCATION, format!("/v2/{name}/manifests/{digest}"));
        set(&mut response, DOCKER_CONTENT_DIGEST, digest.to_string());
        Ok(response)
    }

    fn delete_manifest(
        &mut self,
        name: &str,
        reference: &str,
    ) -> Result<http::Response<hyperdriver::Body>, MockError> {
        let digest: Digest = reference
            .parse()
            .map_err(|_| MockError::Unsupported("manifests are deleted by digest".into()))?;
        let repository = self
            .repository_mut(name)
            .map_err(|_| MockError::ManifestUnknown(reference.to_owned()))?;
        repository
            .manifests
            .remove(&digest)
            .ok_or_else(|| MockError::ManifestUnknown(reference.to_owned()))?;
        repository.tags.retain(|_, target| *target != digest);
        Ok(respond(StatusCode::ACCEPTED, Bytes::new()))
    }
}

fn upload_location(name: &str, id: &str, generation: u64) -> String {
    format!("/v2/{name}/blobs/uploads/{id}?_state={generation}")
}

fn range(accepted: usize) -> String {
    format!("0-{}", accepted.saturating_sub(1))
}

fn respond(status: StatusCode, body: Bytes) -> http::Response<hyperdriver::Body> {
    let mut response = http::Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}

fn json(status: StatusCode, body: String) -> http::Response<hyperdriver::Body> {
    let mut response = respond(status, Bytes::from(body));
    set(&mut response, header::CONTENT_TYPE, "application/json");
    response
}

fn set(response: &mut http::Response<hyperdriver::Body>, name: HeaderName, value: impl AsRef<str>) {
    if let Ok(value) = HeaderValue::from_str(value.as_ref()) {
        response.headers_mut().insert(name, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt as _;

    fn request(method: Method, uri: &str, body: &'static [u8]) -> http::Request<hyperdriver::Body> {
        let mut request = http::Request::new(Body::from(Bytes::from_static(body)));
        *request.method_mut() = method;
        *request.uri_mut() = uri.parse().unwrap();
        request
    }

    async fn body(response: http::Response<hyperdriver::Body>) -> Bytes {
        response.into_body().collect().await.unwrap().to_bytes()
    }

    #[tokio::test]
    async fn routes() {
        let mock = MockRegistry::new();

        let response = mock
            .clone()
            .oneshot(request(Method::GET, "http://localhost/v2/", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = mock
            .clone()
            .oneshot(request(Method::GET, "http://localhost/v2/a/b/blobs/sha256:nope", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(String::from_utf8_lossy(&body(response).await).contains("DIGEST_INVALID"));

        let response = mock
            .clone()
            .oneshot(request(Method::POST, "http://localhost/v3/", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn uploads_rotate_locations() {
        let mock = MockRegistry::new();
        let response = mock
            .clone()
            .oneshot(request(Method::POST, "http://localhost/v2/hello/blobs/uploads/", b""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let location = response.headers()[header::LOCATION].to_str().unwrap().to_owned();
        assert!(location.ends_with("?_state=0"));

        let mut patch = request(Method::PATCH, &format!("http://localhost{location}"), b"hello");
        patch
            .headers_mut()
            .insert(header::CONTENT_RANGE, HeaderValue::from_static("0-4"));
        let response = mock.clone().oneshot(patch).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(response.headers()[header::RANGE], "0-4");
        assert!(response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .ends_with("?_state=1"));

        // The same range again is refused.
        let mut patch = request(Method::PATCH, &format!("http://localhost{location}"), b"hello");
        patch
            .headers_mut()
            .insert(header::CONTENT_RANGE, HeaderValue::from_static("0-4"));
        let response = mock.clone().oneshot(patch).await.unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(mock.open_uploads(), 1);
    }

    #[test]
    fn route_parsing() {
        assert!(matches!(Route::parse("/v2/"), Some(Route::Base)));
        assert!(matches!(Route::parse("/v2/_catalog"), Some(Route::Catalog)));
        assert!(matches!(Route::parse("/v2/a/b/tags/list"), Some(Route::Tags("a/b"))));
        assert!(matches!(
            Route::parse("/v2/a/blobs/uploads/"),
            Some(Route::Uploads("a"))
        ));
        assert!(matches!(
            Route::parse("/v2/a/blobs/uploads/123"),
            Some(Route::Upload("a", "123"))
        ));
        assert!(matches!(
            Route::parse("/v2/a/manifests/v1"),
            Some(Route::Manifest("a", "v1"))
        ));
        assert!(matches!(
            Route::parse("/v2/a/blobs/sha256:00"),
            Some(Route::Blob("a", "sha256:00"))
        ));
        assert!(Route::parse("/v1/a").is_none());
    }
}
