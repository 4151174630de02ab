//! Authentication for registry clients.
//!
//! Acquiring credentials (token exchanges, credential helpers, keychains) is
//! left to implementations of [`Authenticator`]. The client only asks for an
//! `Authorization` header value, and asks once for a refresh when the
//! registry answers `401 Unauthorized`.
//!
//! Two implementations are provided:
//! - [`StaticCredential`] for fixed basic or bearer credentials
//! - [`Anonymous`] for registries which allow anonymous access

use std::fmt;

use content::Error;
use http::HeaderValue;
use zeroize::Zeroize;

/// Supplies `Authorization` header values for registry requests.
#[async_trait::async_trait]
pub trait Authenticator: fmt::Debug + Send + Sync {
    /// The header value to send to `registry`, if any.
    async fn authorization(&self, registry: &str) -> Result<Option<HeaderValue>, Error>;

    /// Called after the registry rejected the current credentials. Returns
    /// `true` if new credentials are available and the request should be
    /// retried.
    async fn refresh(&self, registry: &str) -> Result<bool, Error> {
        let _ = registry;
        Ok(false)
    }
}

/// Create a basic authentication header value, with the password being optional.
///
/// Basic authentication Base64 encodes the username and password, separated by a colon.
///
/// # Example
/// ```rust
/// use registry_client::basic_auth;
///
/// let header = basic_auth("username", Some("password")).unwrap();
/// assert_eq!(header.to_str().unwrap(), "Basic dXNlcm5hbWU6cGFzc3dvcmQ=");
/// ```
pub fn basic_auth<U, P>(
    username: U,
    password: Option<P>,
) -> Result<HeaderValue, http::header::InvalidHeaderValue>
where
    U: fmt::Display,
    P: fmt::Display,
{
    use base64::prelude::BASE64_STANDARD;
    use base64::write::EncoderWriter;
    use std::io::Write;

    let mut buf = b"Basic ".to_vec();
    {
        let mut encoder = EncoderWriter::new(&mut buf, &BASE64_STANDARD);
        let _ = write!(encoder, "{}:", username);
        if let Some(password) = password {
            let _ = write!(encoder, "{}", password);
        }
    }
    let header = HeaderValue::from_bytes(&buf);
    buf.zeroize();

    let mut header = header?;
    header.set_sensitive(true);
    Ok(header)
}

/// A secret string, hidden from `Debug` output and wiped on drop.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    /// Expose the underlying value.
    pub fn revealed(&self) -> &str {
        &self.0
    }
}

impl Drop for Secret {
    fn drop(&mut self) {
        self.0.zeroize()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(****)")
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Secret(value)
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Secret(value.to_owned())
    }
}

/// Fixed credentials for a registry.
#[derive(Debug, Clone)]
pub enum StaticCredential {
    /// Username and password, sent with basic authentication.
    Basic {
        /// Account name
        username: String,
        /// Password or access token
        password: Secret,
    },

    /// A bearer token, such as a registry refresh or access token.
    Bearer(Secret),
}

impl StaticCredential {
    /// Basic authentication with a username and password.
    pub fn basic(username: impl Into<String>, password: impl Into<Secret>) -> Self {
        StaticCredential::Basic {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Bearer token authentication.
    pub fn bearer(token: impl Into<Secret>) -> Self {
        StaticCredential::Bearer(token.into())
    }

    /// The `Authorization` header value for these credentials.
    pub fn header_value(&self) -> Result<HeaderValue, Error> {
        let header = match self {
            StaticCredential::Basic { username, password } => {
                basic_auth(username, Some(password.revealed()))
            }
            StaticCredential::Bearer(token) => {
                HeaderValue::try_from(format!("Bearer {}", token.revealed())).map(|mut header| {
                    header.set_sensitive(true);
                    header
                })
            }
        };
        header.map_err(|_| Error::Unauthorized("credential is not a valid header value".into()))
    }
}

#[async_trait::async_trait]
impl Authenticator for StaticCredential {
    async fn authorization(&self, _registry: &str) -> Result<Option<HeaderValue>, Error> {
        self.header_value().map(Some)
    }
}

/// No credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

#[async_trait::async_trait]
impl Authenticator for Anonymous {
    async fn authorization(&self, _registry: &str) -> Result<Option<HeaderValue>, Error> {
        Ok(None)
    }
}
