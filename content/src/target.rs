use std::fmt;
use std::sync::Arc;

use tokio::io::AsyncRead;

use crate::descriptor::Descriptor;
use crate::digest::Digest;
use crate::error::Error;

/// A reader stream for blob contents.
pub type Reader<'r> = dyn AsyncRead + Unpin + Send + 'r;

/// An owned reader stream, as returned by [`Target::fetch`].
pub type BoxReader = Box<dyn AsyncRead + Unpin + Send + 'static>;

/// A place content can be copied from or to: a local store or a remote
/// repository.
///
/// Implementations verify content in both directions. `push` must not make a
/// blob visible unless the whole stream matched the descriptor, and the
/// stream returned by `fetch` fails rather than yield content that does not
/// match.
#[async_trait::async_trait]
pub trait Target: fmt::Debug + Send + Sync {
    /// A human readable name for this target, used in logs.
    fn name(&self) -> &str;

    /// Whether the content named by `descriptor` is present.
    ///
    /// Stores that collect garbage count a positive answer as a use of the
    /// content, restarting its grace period.
    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, Error>;

    /// Open the content named by `descriptor` for reading.
    async fn fetch(&self, descriptor: &Descriptor) -> Result<BoxReader, Error>;

    /// Store content, verifying it against `descriptor` as it streams in.
    ///
    /// Pushing content which is already present succeeds without change.
    async fn push(&self, descriptor: &Descriptor, content: &mut Reader<'_>) -> Result<(), Error>;

    /// Find the manifest a tag (or digest) refers to.
    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error>;

    /// Point `reference` at an existing manifest, replacing any previous value.
    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error>;

    /// Remove content.
    async fn delete(&self, descriptor: &Descriptor) -> Result<(), Error>;

    /// List tag names, sorted.
    async fn tags(&self) -> Result<Vec<String>, Error>;

    /// Push a manifest and tag it in one step.
    async fn push_reference(
        &self,
        descriptor: &Descriptor,
        content: &mut Reader<'_>,
        reference: &str,
    ) -> Result<(), Error> {
        validate_tag(reference)?;
        self.push(descriptor, content).await?;
        self.tag(descriptor, reference).await
    }
}

#[async_trait::async_trait]
impl<T> Target for Arc<T>
where
    T: Target + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn exists(&self, descriptor: &Descriptor) -> Result<bool, Error> {
        (**self).exists(descriptor).await
    }

    async fn fetch(&self, descriptor: &Descriptor) -> Result<BoxReader, Error> {
        (**self).fetch(descriptor).await
    }

    async fn push(&self, descriptor: &Descriptor, content: &mut Reader<'_>) -> Result<(), Error> {
        (**self).push(descriptor, content).await
    }

    async fn resolve(&self, reference: &str) -> Result<Descriptor, Error> {
        (**self).resolve(reference).await
    }

    async fn tag(&self, descriptor: &Descriptor, reference: &str) -> Result<(), Error> {
        (**self).tag(descriptor, reference).await
    }

    async fn delete(&self, descriptor: &Descriptor) -> Result<(), Error> {
        (**self).delete(descriptor).await
    }

    async fn tags(&self) -> Result<Vec<String>, Error> {
        (**self).tags().await
    }

    async fn push_reference(
        &self,
        descriptor: &Descriptor,
        content: &mut Reader<'_>,
        reference: &str,
    ) -> Result<(), Error> {
        (**self).push_reference(descriptor, content, reference).await
    }
}

/// Check a tag against the OCI tag grammar, `[A-Za-z0-9_][A-Za-z0-9._-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<(), Error> {
    let mut bytes = tag.bytes();
    let valid = match bytes.next() {
        Some(first) => {
            (first.is_ascii_alphanumeric() || first == b'_')
                && tag.len() <= 128
                && bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
        }
        None => false,
    };

    if valid {
        Ok(())
    } else {
        Err(Error::InvalidReference(format!("invalid tag {tag:?}")))
    }
}

/// Interpret `reference` as a digest, if it looks like one.
///
/// Tags cannot contain `:`, so anything with one must be a valid digest.
pub fn parse_reference(reference: &str) -> Result<Option<Digest>, Error> {
    if reference.contains(':') {
        reference.parse().map(Some)
    } else {
        validate_tag(reference).map(|_| None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    static_assertions::assert_obj_safe!(Target);

    #[test]
    fn tag_grammar() {
        let longest = "x".repeat(128);
        let too_long = "x".repeat(129);
        for good in ["latest", "v1.0.0", "_internal", "a", "1-2_3.4", longest.as_str()] {
            validate_tag(good).unwrap();
        }
        for bad in ["", ".hidden", "-dash", "has space", "a/b", "a:b", too_long.as_str()] {
            assert_eq!(
                validate_tag(bad).unwrap_err().kind(),
                ErrorKind::InvalidInput,
                "{bad:?}"
            );
        }
    }

    #[test]
    fn references_are_tags_or_digests() {
        assert_eq!(parse_reference("latest").unwrap(), None);
        let digest = Digest::sha256("x");
        assert_eq!(
            parse_reference(&digest.to_string()).unwrap(),
            Some(digest)
        );
        assert!(parse_reference("sha256:short").is_err());
    }
}
