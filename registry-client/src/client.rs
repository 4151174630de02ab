use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use content::Error;
use futures::stream::BoxStream;
use futures::{StreamExt as _, TryStreamExt as _};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Method, StatusCode};
use http_body_util::BodyExt as _;
use hyperdriver::service::SharedService;
use hyperdriver::Body;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt as _;
use url::Url;

use crate::auth::Authenticator;
use crate::config::RegistryConfig;
use crate::repository::Repository;
use crate::timeout::TimeoutLayer;

/// Header carrying the digest of content the registry accepted or served.
pub const DOCKER_CONTENT_DIGEST: HeaderName = HeaderName::from_static("docker-content-digest");

const MAX_REDIRECTS: usize = 5;

/// A connection to one registry.
///
/// Clients are cheap to clone and share their HTTP connection pool, cached
/// credentials and cancellation token.
#[derive(Clone)]
pub struct RegistryClient {
    inner: Arc<ClientInner>,
    cancel: CancellationToken,
}

struct ClientInner {
    registry: String,
    base: Url,
    service: hyperdriver::client::SharedClientService<Body, Body>,
    auth: Arc<dyn Authenticator>,
    authorization: ArcSwapOption<HeaderValue>,
    config: RegistryConfig,
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryClient")
            .field("registry", &self.inner.registry)
            .field("base", &self.inner.base.as_str())
            .field("auth", &self.inner.auth)
            .finish()
    }
}

impl RegistryClient {
    /// Connect to `registry` (a host with optional port) over TCP, using TLS
    /// unless the configuration or a loopback address says otherwise.
    pub fn new<A>(registry: &str, config: RegistryConfig, auth: A) -> Result<Self, Error>
    where
        A: Authenticator + 'static,
    {
        let service = hyperdriver::Client::build_tcp_http()
            .with_default_tls()
            .build_service();
        Self::with_service(registry, config, auth, service)
    }

    /// Use a custom HTTP service, such as [`crate::mock::MockRegistry`].
    pub fn with_service<A, S>(
        registry: &str,
        config: RegistryConfig,
        auth: A,
        service: S,
    ) -> Result<Self, Error>
    where
        A: Authenticator + 'static,
        S: tower::Service<
                http::Request<hyperdriver::Body>,
                Response = http::Response<hyperdriver::Body>,
                Error = hyperdriver::client::Error,
            > + Clone
            + Send
            + Sync
            + 'static,
        S::Future: Send + 'static,
    {
        let base = Url::parse(&format!("{}://{}/", config.scheme(registry), registry))
            .map_err(|error| Error::InvalidReference(format!("{registry:?}: {error}")))?;

        let service = tower::ServiceBuilder::new()
            .layer(SharedService::layer())
            .layer(TimeoutLayer::new(config.timeout))
            .service(service);

        Ok(RegistryClient {
            inner: Arc::new(ClientInner {
                registry: registry.to_owned(),
                base,
                service,
                auth: Arc::new(auth),
                authorization: ArcSwapOption::empty(),
                config,
            }),
            cancel: CancellationToken::new(),
        })
    }

    /// Observe `token` before every network call made through this client.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// The registry host this client talks to.
    pub fn registry(&self) -> &str {
        &self.inner.registry
    }

    /// The client configuration.
    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// The cancellation token requests observe.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// A handle to a repository in this registry.
    pub fn repository(&self, name: &str) -> Result<Repository, Error> {
        Repository::new(self.clone(), name)
    }

    /// Check that the registry speaks the distribution API and accepts our
    /// credentials.
    #[tracing::instrument(skip(self), fields(registry = %self.inner.registry))]
    pub async fn ping(&self) -> Result<(), Error> {
        let request = RegistryRequest::new(Method::GET, self.endpoint("v2/")?);
        self.send_idempotent(&request).await?;
        Ok(())
    }

    /// List every repository in the registry, following pagination links.
    #[tracing::instrument(skip(self), fields(registry = %self.inner.registry))]
    pub async fn catalog(&self) -> Result<Vec<String>, Error> {
        #[derive(Deserialize)]
        struct Catalog {
            #[serde(default)]
            repositories: Vec<String>,
        }

        let mut repositories = Vec::new();
        let mut next = Some(self.endpoint("v2/_catalog")?);
        while let Some(url) = next.take() {
            let request = RegistryRequest::new(Method::GET, url);
            let response = self.send_idempotent(&request).await?;
            next = self.next_link(request.url(), response.headers())?;
            let page: Catalog = response.json()?;
            repositories.extend(page.repositories);
        }
        Ok(repositories)
    }

    pub(crate) fn endpoint(&self, path: &str) -> Result<Url, Error> {
        self.inner
            .base
            .join(path)
            .map_err(|error| Error::InvalidReference(format!("{path:?}: {error}")))
    }

    /// Resolve a `Location` header against the request that returned it.
    pub(crate) fn location(&self, request: &Url, headers: &HeaderMap) -> Result<Url, Error> {
        let location = headers
            .get(header::LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| Error::ProtocolViolation("response is missing a Location".into()))?;
        request
            .join(location)
            .map_err(|error| {
                Error::ProtocolViolation(format!("bad Location {location:?}: {error}"))
            })
    }

    /// The `rel="next"` target of a `Link` header, if any.
    pub(crate) fn next_link(
        &self,
        request: &Url,
        headers: &HeaderMap,
    ) -> Result<Option<Url>, Error> {
        for value in headers.get_all(header::LINK) {
            let Ok(value) = value.to_str() else { continue };
            for link in value.split(',') {
                let mut parts = link.split(';');
                let target = parts.next().map(str::trim).unwrap_or_default();
                let is_next = parts.any(|param| {
                    let param = param.trim().replace(' ', "");
                    param == "rel=\"next\"" || param == "rel=next"
                });
                if let (true, Some(target)) = (
                    is_next,
                    target.strip_prefix('<').and_then(|t| t.strip_suffix('>')),
                ) {
                    return request.join(target).map(Some).map_err(|error| {
                        Error::ProtocolViolation(format!("bad Link {target:?}: {error}"))
                    });
                }
            }
        }
        Ok(None)
    }

    /// Send a request once, failing on any status which is not a success.
    pub(crate) async fn send(&self, request: &RegistryRequest) -> Result<RegistryResponse, Error> {
        let response = self.execute(request).await?;
        response.error_for_status(request).await
    }

    /// Send a request which may safely be repeated, retrying transient failures.
    pub(crate) async fn send_idempotent(
        &self,
        request: &RegistryRequest,
    ) -> Result<RegistryResponse, Error> {
        let config = &self.inner.config;
        let what = format!("{} {}", request.method, request.url.path());
        config
            .backoff
            .retry(config.retries, &what, move || async move {
                let response = self.send(request).await?;
                // Read the body inside the retry so a stalled body is retried too.
                response.buffered(config).await
            })
            .await
    }

    /// Send a request, attaching credentials, following redirects for reads
    /// and refreshing credentials once if the registry answers `401`.
    pub(crate) async fn execute(
        &self,
        request: &RegistryRequest,
    ) -> Result<RegistryResponse, Error> {
        let mut response = self.execute_once(request, self.authorization().await?).await?;

        if response.status() == StatusCode::UNAUTHORIZED
            && self.inner.auth.refresh(&self.inner.registry).await?
        {
            tracing::debug!(registry = %self.inner.registry, "credentials refreshed, retrying");
            self.inner.authorization.store(None);
            response = self.execute_once(request, self.authorization().await?).await?;
        }

        let mut redirects = 0;
        while is_redirect(response.status())
            && matches!(request.method, Method::GET | Method::HEAD)
            && redirects < MAX_REDIRECTS
        {
            redirects += 1;
            let target = self.location(&request.url, response.headers())?;
            tracing::trace!(%target, "following redirect");

            // Credentials only go to the registry itself.
            let authorization = if target.origin() == self.inner.base.origin() {
                self.authorization().await?
            } else {
                None
            };
            let redirected = RegistryRequest {
                url: target,
                ..request.clone()
            };
            response = self.execute_once(&redirected, authorization).await?;
        }

        Ok(response)
    }

    async fn execute_once(
        &self,
        request: &RegistryRequest,
        authorization: Option<HeaderValue>,
    ) -> Result<RegistryResponse, Error> {
        if !request.detached && self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        tracing::trace!(method = %request.method, url = %request.url, "sending request");
        let http = request.to_http(authorization)?;
        let response = self
            .inner
            .service
            .clone()
            .oneshot(http)
            .await
            .map_err(|error| match error {
                hyperdriver::client::Error::RequestTimeout => {
                    Error::Timeout(format!("{} {}", request.method, request.url))
                }
                error => Error::unavailable(format!("{} {}", request.method, request.url), error),
            })?;

        Ok(RegistryResponse::new(response))
    }

    async fn authorization(&self) -> Result<Option<HeaderValue>, Error> {
        if let Some(cached) = self.inner.authorization.load_full() {
            return Ok(Some((*cached).clone()));
        }
        let value = self.inner.auth.authorization(&self.inner.registry).await?;
        if let Some(value) = &value {
            self.inner.authorization.store(Some(Arc::new(value.clone())));
        }
        Ok(value)
    }
}

fn is_redirect(status: StatusCode) -> bool {
    matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308)
}

/// A request to the registry, kept in a form that can be replayed.
#[derive(Debug, Clone)]
pub(crate) struct RegistryRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
    detached: bool,
}

impl RegistryRequest {
    pub(crate) fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            detached: false,
        }
    }

    pub(crate) fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.append(name, value);
        self
    }

    pub(crate) fn body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    /// Send even after cancellation, for cleanup requests.
    pub(crate) fn detached(mut self) -> Self {
        self.detached = true;
        self
    }

    pub(crate) fn method(&self) -> &Method {
        &self.method
    }

    pub(crate) fn url(&self) -> &Url {
        &self.url
    }

    fn to_http(
        &self,
        authorization: Option<HeaderValue>,
    ) -> Result<http::Request<hyperdriver::Body>, Error> {
        let uri: http::Uri = self
            .url
            .as_str()
            .parse()
            .map_err(|error| Error::InvalidReference(format!("{}: {error}", self.url)))?;

        let body = if self.body.is_empty() {
            Body::empty()
        } else {
            Body::from(self.body.clone())
        };

        let mut request = http::Request::new(body);
        *request.method_mut() = self.method.clone();
        *request.uri_mut() = uri;
        *request.headers_mut() = self.headers.clone();

        if matches!(self.method, Method::PUT | Method::PATCH | Method::POST) {
            request
                .headers_mut()
                .insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
        }
        if let Some(authorization) = authorization {
            request.headers_mut().insert(header::AUTHORIZATION, authorization);
        }
        Ok(request)
    }
}

#[derive(Debug)]
enum ResponseBody {
    Streaming(Body),
    Buffered(Bytes),
}

/// A registry response, with the body either still streaming or already read.
#[derive(Debug)]
pub(crate) struct RegistryResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: ResponseBody,
}

impl RegistryResponse {
    fn new(response: http::Response<hyperdriver::Body>) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            body: ResponseBody::Streaming(body),
        }
    }

    pub(crate) fn status(&self) -> StatusCode {
        self.status
    }

    pub(crate) fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The value of a header, if present and valid text.
    pub(crate) fn header_str(&self, name: &HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    /// Read the whole body, bounded by the request timeout.
    pub(crate) async fn buffered(self, config: &RegistryConfig) -> Result<Self, Error> {
        let body = match self.body {
            ResponseBody::Buffered(bytes) => bytes,
            ResponseBody::Streaming(body) => {
                tokio::time::timeout(config.timeout, body.collect())
                    .await
                    .map_err(|_| Error::Timeout("reading response body".into()))?
                    .map_err(|error| Error::unavailable("reading response body", error))?
                    .to_bytes()
            }
        };
        Ok(Self {
            status: self.status,
            headers: self.headers,
            body: ResponseBody::Buffered(body),
        })
    }

    /// The buffered body. Empty if the body was never read.
    pub(crate) fn bytes(&self) -> Bytes {
        match &self.body {
            ResponseBody::Buffered(bytes) => bytes.clone(),
            ResponseBody::Streaming(_) => Bytes::new(),
        }
    }

    pub(crate) fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.bytes())
            .map_err(|error| Error::ProtocolViolation(format!("unexpected response body: {error}")))
    }

    /// The body as a byte stream, for large downloads.
    pub(crate) fn into_stream(self) -> BoxStream<'static, Result<Bytes, std::io::Error>> {
        match self.body {
            ResponseBody::Streaming(body) => body
                .into_data_stream()
                .map_err(std::io::Error::other)
                .boxed(),
            ResponseBody::Buffered(bytes) => futures::stream::iter(Some(Ok(bytes))).boxed(),
        }
    }

    /// Map a failure status to the error taxonomy.
    pub(crate) async fn error_for_status(self, request: &RegistryRequest) -> Result<Self, Error> {
        let status = self.status;
        if status.is_success() {
            return Ok(self);
        }

        let what = format!("{} {}", request.method, request.url.path());
        if status == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized(what));
        }
        if status == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(what));
        }
        if status.is_server_error()
            || status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
        {
            return Err(Error::RegistryUnavailable {
                message: format!("{what}: {status}"),
                source: None,
            });
        }
        if status.is_redirection() {
            return Err(Error::ProtocolViolation(format!(
                "{what}: unexpected redirect ({status})"
            )));
        }

        // Error bodies are small; a failure to read one should not hide the status.
        let body = match self.body {
            ResponseBody::Buffered(bytes) => bytes,
            ResponseBody::Streaming(body) => body
                .collect()
                .await
                .map(|collected| collected.to_bytes())
                .unwrap_or_default(),
        };
        let (code, message) = ErrorEnvelope::first(&body);
        Err(Error::Rejected {
            status: status.as_u16(),
            code,
            message: if message.is_empty() { what } else { message },
        })
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(default)]
    errors: Vec<ErrorInfo>,
}

#[derive(Debug, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

impl ErrorEnvelope {
    fn first(body: &[u8]) -> (String, String) {
        serde_json::from_slice::<ErrorEnvelope>(body)
            .ok()
            .and_then(|envelope| envelope.errors.into_iter().next())
            .map(|info| (info.code, info.message))
            .unwrap_or_else(|| ("UNKNOWN".to_owned(), String::from_utf8_lossy(body).into_owned()))
    }
}
