use std::fmt;
use std::str::FromStr;

use content::{validate_tag, Digest, Error};

/// Tag used when a reference names neither a tag nor a digest.
pub const DEFAULT_TAG: &str = "latest";

/// A fully qualified artifact reference, `registry/repository[:tag][@digest]`.
///
/// ```rust
/// use registry_client::Reference;
///
/// let reference: Reference = "localhost:5000/hello-world:v1".parse().unwrap();
/// assert_eq!(reference.registry(), "localhost:5000");
/// assert_eq!(reference.repository(), "hello-world");
/// assert_eq!(reference.tag(), Some("v1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Reference {
    registry: String,
    repository: String,
    tag: Option<String>,
    digest: Option<Digest>,
}

impl Reference {
    /// The registry host, with port if given.
    pub fn registry(&self) -> &str {
        &self.registry
    }

    /// The repository path within the registry.
    pub fn repository(&self) -> &str {
        &self.repository
    }

    /// The tag, if the reference names one.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The digest, if the reference pins one.
    pub fn digest(&self) -> Option<&Digest> {
        self.digest.as_ref()
    }

    /// What to resolve in the repository: the digest if pinned, else the tag,
    /// else `latest`.
    pub fn reference(&self) -> String {
        match (&self.digest, &self.tag) {
            (Some(digest), _) => digest.to_string(),
            (None, Some(tag)) => tag.clone(),
            (None, None) => DEFAULT_TAG.to_owned(),
        }
    }
}

pub(crate) fn validate_repository(repository: &str) -> Result<(), Error> {
    let component_ok = |component: &str| {
        let bytes = component.as_bytes();
        !component.is_empty()
            && bytes.first().is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            && bytes.last().is_some_and(|b| b.is_ascii_lowercase() || b.is_ascii_digit())
            && bytes
                .iter()
                .all(|b| {
                    b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'_' | b'-')
                })
    };

    if repository.len() <= 255 && repository.split('/').all(component_ok) {
        Ok(())
    } else {
        Err(Error::InvalidReference(format!(
            "invalid repository name {repository:?}"
        )))
    }
}

impl FromStr for Reference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (rest, digest) = match s.split_once('@') {
            Some((rest, digest)) => (rest, Some(digest.parse::<Digest>()?)),
            None => (s, None),
        };

        let (registry, path) = rest
            .split_once('/')
            .ok_or_else(|| Error::InvalidReference(format!("{s:?} does not name a registry")))?;
        if registry.is_empty() {
            return Err(Error::InvalidReference(format!("{s:?} does not name a registry")));
        }

        // A ':' after the last '/' separates the tag; earlier ones belong to
        // the registry port.
        let last_slash = path.rfind('/').map_or(0, |i| i + 1);
        let (repository, tag) = match path[last_slash..].rfind(':') {
            Some(i) => {
                let (repository, tag) = path.split_at(last_slash + i);
                (repository, Some(&tag[1..]))
            }
            None => (path, None),
        };

        validate_repository(repository)?;
        if let Some(tag) = tag {
            validate_tag(tag)?;
        }

        Ok(Reference {
            registry: registry.to_owned(),
            repository: repository.to_owned(),
            tag: tag.map(str::to_owned),
            digest,
        })
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.registry, self.repository)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{tag}")?;
        }
        if let Some(digest) = &self.digest {
            write!(f, "@{digest}")?;
        }
        Ok(())
    }
}
