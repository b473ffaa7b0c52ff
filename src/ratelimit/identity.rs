//! Caller identity extraction.
//!
//! Every rate limit counter is bucketed by an [`IdentityKey`], derived from
//! the request's transport metadata: an optional authenticated principal,
//! forwarding headers set by proxies, or the raw connection address.

use std::net::SocketAddr;

use axum::http::{HeaderMap, HeaderName};

use crate::config::IdentityConfig;
use crate::error::{GuardError, Result};

/// A key that identifies the caller for rate limiting purposes.
///
/// Addresses behind the same NAT or proxy share a key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityKey(String);

impl IdentityKey {
    /// Create a key from a raw string.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Create a key for an authenticated principal.
    ///
    /// Principal keys are namespaced so a username can never collide with an
    /// address-derived key.
    pub fn principal(name: &str) -> Self {
        Self(format!("user:{}", name))
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

/// Maps request metadata to an [`IdentityKey`].
///
/// Sources are tried in order:
/// 1. The principal header, if configured
/// 2. The forwarded-address header (first entry of a comma-separated list)
/// 3. Alternate proxy headers, in configured order
/// 4. The connection's peer address
/// 5. The constant fallback, if configured
#[derive(Debug, Clone)]
pub struct IdentityExtractor {
    principal_header: Option<HeaderName>,
    forwarded_header: HeaderName,
    alternate_headers: Vec<HeaderName>,
    fallback: Option<IdentityKey>,
}

impl IdentityExtractor {
    /// Build an extractor from configuration, validating header names.
    pub fn from_config(config: &IdentityConfig) -> Result<Self> {
        let principal_header = config
            .principal_header
            .as_deref()
            .map(parse_header_name)
            .transpose()?;
        let forwarded_header = parse_header_name(&config.forwarded_header)?;
        let alternate_headers = config
            .alternate_headers
            .iter()
            .map(|name| parse_header_name(name))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            principal_header,
            forwarded_header,
            alternate_headers,
            fallback: config.fallback.as_deref().map(IdentityKey::new),
        })
    }

    /// Derive the caller's identity.
    ///
    /// Returns [`GuardError::InvalidIdentity`] when no source yields a value
    /// and no fallback is configured.
    pub fn extract(&self, headers: &HeaderMap, remote_addr: Option<SocketAddr>) -> Result<IdentityKey> {
        if let Some(ref name) = self.principal_header {
            if let Some(principal) = whole_value(headers, name) {
                return Ok(IdentityKey::principal(principal));
            }
        }

        if let Some(addr) = first_entry(headers, &self.forwarded_header) {
            return Ok(IdentityKey::new(addr));
        }

        for name in &self.alternate_headers {
            if let Some(addr) = first_entry(headers, name) {
                return Ok(IdentityKey::new(addr));
            }
        }

        if let Some(addr) = remote_addr {
            return Ok(IdentityKey::new(addr.ip().to_string()));
        }

        self.fallback.clone().ok_or_else(|| {
            GuardError::InvalidIdentity("no forwarding header or peer address on request".to_string())
        })
    }
}

impl Default for IdentityExtractor {
    fn default() -> Self {
        // The default configuration only holds well-formed header names
        Self {
            principal_header: None,
            forwarded_header: HeaderName::from_static("x-forwarded-for"),
            alternate_headers: vec![
                HeaderName::from_static("x-real-ip"),
                HeaderName::from_static("x-client-ip"),
            ],
            fallback: Some(IdentityKey::new("unknown")),
        }
    }
}

fn parse_header_name(name: &str) -> Result<HeaderName> {
    HeaderName::from_bytes(name.trim().as_bytes())
        .map_err(|e| GuardError::Config(format!("invalid header name '{}': {}", name, e)))
}

/// The full header value, trimmed, if non-empty.
fn whole_value<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// First comma-separated entry of a forwarding header, trimmed, if non-empty.
fn first_entry<'a>(headers: &'a HeaderMap, name: &HeaderName) -> Option<&'a str> {
    whole_value(headers, name)
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
