//! Source URIs.
//!
//! A source is addressed by an absolute URI; the scheme selects the handler.
//! Parsing is delegated to [`url`], which also takes care of scheme
//! normalization (lowercase) and percent-decoding of `file:` paths.

use crate::error::{Error, ErrorKind, Result};
use serde::{Serialize, Serializer};
use std::fmt::{Display, Formatter, Result as FmtResult};
use std::path::PathBuf;
use std::str::FromStr;
use url::{ParseError, Url};

/// A parsed source URI: `{scheme, path-or-address}`.
///
/// Two URIs that differ only in scheme case or percent-encoding compare
/// equal, which is what makes [`as_str()`](Self::as_str) usable as a key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SourceUri {
    url: Url,
}

impl SourceUri {
    /// Parse a URI string.
    ///
    /// Fails with [`InvalidUri`](ErrorKind::InvalidUri) for empty input and
    /// anything without a `scheme:` prefix (bare paths included).
    ///
    /// # Examples
    ///
    /// ```
    /// use srcwatch_source::SourceUri;
    ///
    /// let uri = SourceUri::parse("FILE:///tmp/a.txt").unwrap();
    /// assert_eq!(uri.scheme(), "file");
    /// assert_eq!(uri.as_str(), "file:///tmp/a.txt");
    /// assert!(SourceUri::parse("/tmp/a.txt").is_err());
    /// ```
    pub fn parse(input: &str) -> Result<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            exn::bail!(ErrorKind::invalid_uri(input, "empty uri"));
        }
        match Url::parse(trimmed) {
            Ok(url) => Ok(Self { url }),
            Err(ParseError::RelativeUrlWithoutBase) => exn::bail!(ErrorKind::invalid_uri(input, "missing scheme")),
            Err(err) => exn::bail!(ErrorKind::invalid_uri(input, err.to_string())),
        }
    }

    /// Lowercase scheme, without the trailing `:`.
    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    /// Normalized string form.
    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Everything after `scheme:`, e.g. `///tmp/a.txt` or `//example.com/`.
    pub fn address(&self) -> &str {
        &self.url.as_str()[self.url.scheme().len() + 1..]
    }

    /// Percent-decoded local filesystem path addressed by this URI.
    ///
    /// Fails with [`InvalidUri`](ErrorKind::InvalidUri) when the URI names a
    /// remote host or otherwise cannot be a local path.
    pub fn to_file_path(&self) -> Result<PathBuf> {
        match self.url.to_file_path() {
            Ok(path) => Ok(path),
            Err(()) => exn::bail!(ErrorKind::invalid_uri(self.as_str(), "not a local file path")),
        }
    }

    pub fn as_url(&self) -> &Url {
        &self.url
    }
}

impl FromStr for SourceUri {
    type Err = Error;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<&str> for SourceUri {
    type Error = Error;
    fn try_from(value: &str) -> std::result::Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl Display for SourceUri {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for SourceUri {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl Serialize for SourceUri {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}
