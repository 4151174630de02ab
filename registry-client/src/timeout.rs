//! A per-request deadline for the HTTP service stack.

use std::future::Future;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::Timeout;

/// Applies a deadline to every request; expiry becomes
/// [`hyperdriver::client::Error::RequestTimeout`].
#[derive(Debug, Clone)]
pub(crate) struct TimeoutLayer {
    timeout: Duration,
}

impl TimeoutLayer {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl<S> tower::Layer<S> for TimeoutLayer {
    type Service = TimeoutService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TimeoutService {
            service: inner,
            timeout: self.timeout,
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct TimeoutService<S> {
    service: S,
    timeout: Duration,
}

impl<S, R> tower::Service<R> for TimeoutService<S>
where
    S: tower::Service<R, Error = hyperdriver::client::Error>,
{
    type Response = S::Response;
    type Error = hyperdriver::client::Error;
    type Future = TimeoutFuture<S::Future>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        TimeoutFuture {
            future: tokio::time::timeout(self.timeout, self.service.call(req)),
        }
    }
}

#[pin_project]
#[derive(Debug)]
pub(crate) struct TimeoutFuture<F> {
    #[pin]
    future: Timeout<F>,
}

impl<F, T> Future for TimeoutFuture<F>
where
    F: Future<Output = Result<T, hyperdriver::client::Error>>,
{
    type Output = Result<T, hyperdriver::client::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Poll::Ready(match ready!(self.project().future.poll(cx)) {
            Ok(result) => result,
            Err(_) => Err(hyperdriver::client::Error::RequestTimeout),
        })
    }
}
