//! Streams which hash content as it passes through.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use pin_project::pin_project;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};

use crate::descriptor::Descriptor;
use crate::digest::{Digest, Digester};
use crate::error::Error;
use crate::target::Target;

/// A reader which verifies the digest (and, when known, the size) of the
/// content it yields.
///
/// Every byte read is fed to a [`Digester`] before it is handed to the caller.
/// When the expected size is known, the read which would deliver the final
/// byte checks the digest first and fails with [`Error::DigestMismatch`]
/// without delivering those bytes, so a consumer never sees the tail of
/// corrupt content. Without a size, the read which observes end-of-stream
/// performs the check.
///
/// Failures are reported as [`io::Error`]s of kind
/// [`io::ErrorKind::InvalidData`]; use `Error::from` to recover the content
/// error.
#[pin_project]
#[derive(Debug)]
pub struct DigestReader<R> {
    #[pin]
    inner: R,
    digester: Digester,
    expected: Digest,
    size: Option<u64>,
    read: u64,
    verified: bool,
}

impl<R> DigestReader<R> {
    /// Verify `reader` against the digest and size of `descriptor`.
    pub fn new(reader: R, descriptor: &Descriptor) -> Self {
        Self {
            inner: reader,
            digester: descriptor.digest.digester(),
            expected: descriptor.digest.clone(),
            size: Some(descriptor.size),
            read: 0,
            verified: false,
        }
    }

    /// Verify `reader` against a digest, with no expectation about its length.
    pub fn with_digest(reader: R, digest: Digest) -> Self {
        Self {
            inner: reader,
            digester: digest.digester(),
            expected: digest,
            size: None,
            read: 0,
            verified: false,
        }
    }

    /// Bytes delivered so far.
    pub fn bytes_read(&self) -> u64 {
        self.read
    }

    /// Whether the content has been read to the end and matched its digest.
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Discard the verifier, returning the inner reader.
    pub fn into_inner(self) -> R {
        self.inner
    }
}

fn check(digester: &mut Digester, expected: &Digest) -> io::Result<()> {
    // An empty update lets an empty stream finalize.
    digester.update(&[]).map_err(Error::into_io)?;
    let actual = digester.finalize().map_err(Error::into_io)?;
    if &actual != expected {
        return Err(Error::DigestMismatch {
            expected: expected.clone(),
            actual,
        }
        .into_io());
    }
    Ok(())
}

impl<R: AsyncRead> AsyncRead for DigestReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.project();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let before = buf.filled().len();
        ready!(this.inner.poll_read(cx, buf))?;
        let n = (buf.filled().len() - before) as u64;

        if n == 0 {
            if *this.verified {
                return Poll::Ready(Ok(()));
            }
            if let Some(size) = *this.size {
                if *this.read < size {
                    return Poll::Ready(Err(Error::SizeMismatch {
                        expected: size,
                        actual: *this.read,
                    }
                    .into_io()));
                }
            }
            check(this.digester, this.expected)?;
            *this.verified = true;
            tracing::trace!(digest = %this.expected, size = *this.read, "verified content");
            return Poll::Ready(Ok(()));
        }

        if let Some(size) = *this.size {
            if *this.read + n > size {
                buf.set_filled(before);
                return Poll::Ready(Err(Error::SizeMismatch {
                    expected: size,
                    actual: *this.read + n,
                }
                .into_io()));
            }
        }

        if let Err(error) = this.digester.update(&buf.filled()[before..]) {
            buf.set_filled(before);
            return Poll::Ready(Err(error.into_io()));
        }
        *this.read += n;

        if Some(*this.read) == *this.size {
            if let Err(error) = check(this.digester, this.expected) {
                buf.set_filled(before);
                return Poll::Ready(Err(error));
            }
            *this.verified = true;
            tracing::trace!(digest = %this.expected, size = *this.read, "verified content");
        }

        Poll::Ready(Ok(()))
    }
}

/// A writer which hashes exactly the bytes its inner writer accepted.
#[pin_project]
#[derive(Debug)]
pub struct DigestWriter<W> {
    #[pin]
    inner: W,
    digester: Digester,
}

impl<W> DigestWriter<W> {
    /// Hash writes to `writer` with `digester`.
    pub fn new(writer: W, digester: Digester) -> Self {
        Self {
            inner: writer,
            digester,
        }
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.digester.bytes_written()
    }

    /// The digest of everything written so far.
    ///
    /// The writer cannot be hashed again afterwards.
    pub fn finalize(&mut self) -> Result<Digest, Error> {
        self.digester.update(&[])?;
        self.digester.finalize()
    }

    /// Discard the hasher, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: AsyncWrite> AsyncWrite for DigestWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.project();
        let n = ready!(this.inner.poll_write(cx, buf))?;
        this.digester
            .update(&buf[..n])
            .map_err(Error::into_io)?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.project().inner.poll_shutdown(cx)
    }
}

/// Read all of `reader`, verifying it against `descriptor`.
pub async fn read_verified<R>(reader: R, descriptor: &Descriptor) -> Result<Bytes, Error>
where
    R: AsyncRead + Unpin,
{
    let mut reader = DigestReader::new(reader, descriptor);
    let mut buf = Vec::with_capacity(capacity_hint(descriptor.size));
    reader.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Fetch the whole of `descriptor` from `target`.
///
/// Targets verify what they serve, so the returned bytes match the descriptor.
pub async fn fetch_all<T>(target: &T, descriptor: &Descriptor) -> Result<Bytes, Error>
where
    T: Target + ?Sized,
{
    let mut reader = target.fetch(descriptor).await?;
    let mut buf = Vec::with_capacity(capacity_hint(descriptor.size));
    reader.read_to_end(&mut buf).await?;
    Ok(Bytes::from(buf))
}

fn capacity_hint(size: u64) -> usize {
    const MAX_PREALLOCATE: u64 = 4 * 1024 * 1024;
    size.min(MAX_PREALLOCATE) as usize
}
