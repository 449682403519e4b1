//! Attribute newtypes shared by every MAL message: identifiers, URIs and blobs.
//!
//! All three serialize transparently so that the `MsgPack` wire form is the bare
//! string or byte array.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A MAL `Identifier`: one component of a domain, a session name, a
/// subscription id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identifier(pub String);

impl Identifier {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the `"*"` wildcard identifier.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.0 == "*"
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Builds a domain (ordered identifier sequence) from string slices.
#[must_use]
pub fn domain(parts: &[&str]) -> Vec<Identifier> {
    parts.iter().map(|p| Identifier::from(*p)).collect()
}

/// Endpoint address of the form `scheme://authority[/path]`.
///
/// The `scheme://authority` prefix (the *base*) names a transport endpoint
/// (one `Context`); the path names a service endpoint inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Uri(pub String);

impl Uri {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The scheme before `://`, e.g. `maltcp`. `None` if the URI has no scheme.
    #[must_use]
    pub fn scheme(&self) -> Option<&str> {
        self.0.split_once("://").map(|(scheme, _)| scheme)
    }

    /// The authority between `://` and the first following `/`.
    #[must_use]
    pub fn authority(&self) -> Option<&str> {
        let (_, rest) = self.0.split_once("://")?;
        Some(rest.split('/').next().unwrap_or(rest))
    }

    /// The `scheme://authority` prefix of this URI.
    #[must_use]
    pub fn base(&self) -> Option<Uri> {
        let scheme = self.scheme()?;
        let authority = self.authority()?;
        Some(Uri(format!("{scheme}://{authority}")))
    }

    /// Appends a path segment: `invm://node` + `svc` = `invm://node/svc`.
    #[must_use]
    pub fn join(&self, segment: &str) -> Uri {
        Uri(format!("{}/{}", self.0.trim_end_matches('/'), segment))
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Uri {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A MAL `Blob`: opaque bytes, serialized as a `MsgPack` bin.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blob(#[serde(with = "serde_bytes")] pub Vec<u8>);

impl From<Vec<u8>> for Blob {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl From<&[u8]> for Blob {
    fn from(value: &[u8]) -> Self {
        Self(value.to_vec())
    }
}
