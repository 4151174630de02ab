use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use content::graph::{pack, PackOptions};
use content::manifest::OCI_LAYER_TAR;
use content::{
    copy, copy_graph, fetch_all, BoxReader, CopyOptions, Descriptor, Error, ErrorKind, MemoryStore,
    Reader, Target,
};
use http::HeaderValue;
use registry_client::mock::MockRegistry;
use registry_client::{Authenticator, Backoff, RegistryClient, RegistryConfig, Repository};
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn config() -> RegistryConfig {
    RegistryConfig {
        chunk_size: 4,
        backoff: Backoff::none(),
        ..Default::default()
    }
}

fn repository(mock: &MockRegistry) -> Repository {
    RegistryClient::with_service(
        "localhost:5000",
        config(),
        registry_client::Anonymous,
        mock.clone(),
    )
    .unwrap()
    .repository("hello-world")
    .unwrap()
}

/// A store holding the "hello world" image, tagged `v1`.
async fn hello_world() -> (MemoryStore, Descriptor, Descriptor) {
    let store = MemoryStore::new();
    let layer = Descriptor::from_bytes(OCI_LAYER_TAR, b"hello world");
    store.push(&layer, &mut &b"hello world"[..]).await.unwrap();
    let manifest = pack(&store, &[layer.clone()], &PackOptions::default())
        .await
        .unwrap();
    store.tag(&manifest, "v1").await.unwrap();
    (store, manifest, layer)
}

#[tokio::test]
async fn copy_to_registry_and_back() {
    init_tracing();
    let (store, manifest, layer) = hello_world().await;
    let mock = MockRegistry::new();
    let repository = repository(&mock);

    let report = copy_graph(&store, "v1", &repository, "v1", &CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(report.root, manifest);
    assert_eq!(report.transferred.len(), 3);
    assert!(report.skipped.is_empty());
    assert_eq!(mock.tags("hello-world"), ["v1"]);
    assert_eq!(
        mock.blob("hello-world", &layer.digest).unwrap(),
        &b"hello world"[..]
    );

    // Nothing left to send the second time around.
    let report = copy_graph(&store, "v1", &repository, "v1", &CopyOptions::default())
        .await
        .unwrap();
    assert!(report.transferred.is_empty());
    assert_eq!(report.skipped.len(), 3);

    let back = MemoryStore::new();
    let root = copy(&repository, "v1", &back, "copied", &CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(root, manifest);
    assert_eq!(&fetch_all(&back, &layer).await.unwrap()[..], b"hello world");
    assert_eq!(back.tags().await.unwrap(), ["copied"]);
}

#[tokio::test]
async fn transient_failures_are_retried() {
    init_tracing();
    let (store, manifest, _) = hello_world().await;
    let mock = MockRegistry::new();
    let repository = repository(&mock);

    mock.fail_next(2);
    let root = copy(&store, "v1", &repository, "v1", &CopyOptions::default())
        .await
        .unwrap();
    assert_eq!(root, manifest);

    mock.time_out_next(2);
    let resolved = repository.resolve("v1").await.unwrap();
    assert_eq!(resolved, manifest);
}

#[tokio::test]
async fn unavailable_registry_gives_up() {
    let (store, _, _) = hello_world().await;
    let mock = MockRegistry::new();
    let repository = repository(&mock);

    mock.fail_next(1000);
    let error = copy(&store, "v1", &repository, "v1", &CopyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::RegistryUnavailable);
}

#[tokio::test]
async fn acknowledged_digest_mismatch_leaves_tag_unset() {
    init_tracing();
    let (store, _, _) = hello_world().await;
    let mock = MockRegistry::new();
    mock.corrupt_upload_digests(true);
    let repository = repository(&mock);

    let error = copy(&store, "v1", &repository, "v1", &CopyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::DigestMismatch);
    assert!(mock.tags("hello-world").is_empty());
}

#[derive(Debug)]
struct Rotating {
    refreshed: AtomicBool,
}

#[async_trait::async_trait]
impl Authenticator for Rotating {
    async fn authorization(&self, _registry: &str) -> Result<Option<HeaderValue>, Error> {
        let token = if self.refreshed.load(Ordering::SeqCst) {
            "Bearer fresh"
        } else {
            "Bearer stale"
        };
        Ok(Some(HeaderValue::from_static(token)))
    }

    async fn refresh(&self, _registry: &str) -> Result<bool, Error> {
        Ok(!self.refreshed.swap(true, Ordering::SeqCst))
    }
}

#[tokio::test]
async fn credentials_are_refreshed_once() {
    let mock = MockRegistry::new();
    mock.require_bearer("fresh");
    let client = RegistryClient::with_service(
        "localhost:5000",
        config(),
        Rotating {
            refreshed: AtomicBool::new(false),
        },
        mock.clone(),
    )
    .unwrap();
    client.ping().await.unwrap();
    client.ping().await.unwrap();
    assert_eq!(mock.requests().len(), 3);

    let mock = MockRegistry::new();
    mock.require_bearer("something else");
    let client = RegistryClient::with_service(
        "localhost:5000",
        config(),
        registry_client::StaticCredential::bearer("fresh"),
        mock.clone(),
    )
    .unwrap();
    let error = client.ping().await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Unauthorized);
}

#[tokio::test]
async fn ambiguous_tags_are_reported() {
    let (store, _, _) = hello_world().await;
    let mock = MockRegistry::new();
    let repository = repository(&mock);
    copy(&store, "v1", &repository, "v1", &CopyOptions::default())
        .await
        .unwrap();

    mock.duplicate_digest_headers(true);
    let back = MemoryStore::new();
    let error = copy(&repository, "v1", &back, "v1", &CopyOptions::default())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Ambiguous);
    assert!(back.is_empty().await);
}

/// Cancels a token as soon as the first bytes have been read.
struct CancelOnRead {
    inner: BoxReader,
    token: CancellationToken,
}

impl AsyncRead for CancelOnRead {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if poll.is_ready() {
            self.token.cancel();
        }
        poll
    }
}

/// A source whose blob streams cancel the copy mid-upload.
#[derive(Debug)]
struct Cancelling {
    inner: MemoryStore,
    token: CancellationToken,
}

#[async_trait::async_trait]
impl Target for Cancelling {
    fn name(&self) -> &str {
        "cancelling"
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, Error> {
        self.inner.exists(descriptor).await
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BoxReader, Error> {
        let inner = self.inner.fetch(descriptor).await?;
        if descriptor.media_type != OCI_LAYER_TAR {
            return Ok(inner);
        }
        Ok(Box::new(CancelOnRead {
            inner,
            token: self.token.clone(),
        }))
    }

    async fn push(&self, descriptor: &Descriptor, content: &mut Reader<'_>) -> Result<(), Error> {
        self.inner.push(descriptor, content).await
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        self.inner.resolve(reference).await
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error> {
        self.inner.tag(descriptor, reference).await
    }

    async fn delete(&self, descriptor: &Descriptor) -> Result<(), Error> {
        self.inner.delete(descriptor).await
    }

    async fn tags(&self) -> Result<Vec<String>, Error> {
        self.inner.tags().await
    }
}

#[tokio::test]
async fn cancelled_uploads_are_aborted() {
    init_tracing();
    let (store, _, layer) = hello_world().await;
    let token = CancellationToken::new();
    let source = Cancelling {
        inner: store,
        token: token.clone(),
    };

    let mock = MockRegistry::new();
    let repository = RegistryClient::with_service(
        "localhost:5000",
        config(),
        registry_client::Anonymous,
        mock.clone(),
    )
    .unwrap()
    .with_cancellation(token.clone())
    .repository("hello-world")
    .unwrap();

    let options = CopyOptions {
        concurrency: 1,
        cancel: token,
    };
    let error = copy(&source, "v1", &repository, "v1", &options)
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Cancelled);
    assert_eq!(mock.open_uploads(), 0);
    assert!(mock.blob("hello-world", &layer.digest).is_none());
    assert!(mock.tags("hello-world").is_empty());
}
