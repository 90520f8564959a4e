//! Realm context and configuration.
//!
//! A [`Realm`] is built once at process start and handed to every
//! [`Client`](crate::Client), [`Server`](crate::Server) and
//! [`MessageQueue`](crate::MessageQueue) in that process. Tests build
//! as many isolated realms as they like.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use realmbus::{ErrorPolicy, Realm, RealmConfig, RealmKind};
//!
//! let realm = Realm::new(
//!     RealmKind::Content,
//!     RealmConfig::new()
//!         .with_request_timeout(Duration::from_secs(10))
//!         .with_error_policy(ErrorPolicy::Surface),
//! );
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;

// ============================================================================
// RealmKind
// ============================================================================

/// The JavaScript realm a process stands in for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RealmKind {
    /// Background page or service worker.
    Background,
    /// Content script.
    Content,
    /// Page-injected user-script sandbox.
    Inject,
    /// Offscreen document.
    Offscreen,
    /// Sandboxed iframe.
    Sandbox,
    /// Anything else, e.g. a native host.
    Other(String),
}

impl fmt::Display for RealmKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Background => f.write_str("background"),
            Self::Content => f.write_str("content"),
            Self::Inject => f.write_str("inject"),
            Self::Offscreen => f.write_str("offscreen"),
            Self::Sandbox => f.write_str("sandbox"),
            Self::Other(name) => f.write_str(name),
        }
    }
}

// ============================================================================
// ErrorPolicy
// ============================================================================

/// What to do when a native transport call fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorPolicy {
    /// Log the failure and leave the request pending.
    #[default]
    Log,
    /// Return the failure to the caller.
    Surface,
    /// Retry the native call once, then return the failure.
    RetryOnce,
}

// ============================================================================
// RealmConfig
// ============================================================================

/// Realm-wide defaults.
///
/// Deserializes from `{"requestTimeoutMs": 5000, "errorPolicy": "surface",
/// "maxPending": 100}`; every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RealmConfig {
    /// Default request timeout in milliseconds. `None` waits forever.
    pub request_timeout_ms: Option<u64>,

    /// Default transport error policy.
    pub error_policy: ErrorPolicy,

    /// Maximum in-flight requests per client. `None` is unbounded.
    pub max_pending: Option<usize>,
}

impl RealmConfig {
    /// Creates a config with no timeout, [`ErrorPolicy::Log`] and no
    /// pending limit.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            request_timeout_ms: None,
            error_policy: ErrorPolicy::Log,
            max_pending: None,
        }
    }

    /// Parses a config from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Json`](crate::Error::Json) on malformed input.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sets the default request timeout.
    #[inline]
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Sets the default transport error policy.
    #[inline]
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Caps the number of in-flight requests per client.
    #[inline]
    #[must_use]
    pub fn with_max_pending(mut self, max: usize) -> Self {
        self.max_pending = Some(max);
        self
    }

    /// Returns the default timeout as a [`Duration`].
    #[inline]
    #[must_use]
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }
}

// ============================================================================
// RequestOptions
// ============================================================================

/// Per-request overrides.
///
/// Fields left as `None` fall back to the realm's [`RealmConfig`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestOptions {
    /// Maximum time to wait for the response.
    pub timeout: Option<Duration>,
    /// Transport error policy for this request.
    pub error_policy: Option<ErrorPolicy>,
}

impl RequestOptions {
    /// Creates empty options.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            timeout: None,
            error_policy: None,
        }
    }

    /// Sets the timeout.
    #[inline]
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the error policy.
    #[inline]
    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = Some(policy);
        self
    }

    /// Fills unset fields from realm defaults.
    #[must_use]
    pub fn resolve(self, config: &RealmConfig) -> Self {
        Self {
            timeout: self.timeout.or_else(|| config.request_timeout()),
            error_policy: Some(self.error_policy.unwrap_or(config.error_policy)),
        }
    }

    /// Returns the effective policy, defaulting to [`ErrorPolicy::Log`].
    #[inline]
    #[must_use]
    pub fn policy(&self) -> ErrorPolicy {
        self.error_policy.unwrap_or_default()
    }
}

// ============================================================================
// Realm
// ============================================================================

/// Per-process context shared by every substrate object in a realm.
#[derive(Clone)]
pub struct Realm {
    inner: Arc<RealmInner>,
}

struct RealmInner {
    kind: RealmKind,
    config: RealmConfig,
}

impl Realm {
    /// Creates a realm context.
    #[must_use]
    pub fn new(kind: RealmKind, config: RealmConfig) -> Self {
        Self {
            inner: Arc::new(RealmInner { kind, config }),
        }
    }

    /// Creates a realm with default configuration.
    #[must_use]
    pub fn with_defaults(kind: RealmKind) -> Self {
        Self::new(kind, RealmConfig::default())
    }

    /// Returns the realm kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &RealmKind {
        &self.inner.kind
    }

    /// Returns the realm configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &RealmConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Realm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Realm")
            .field("kind", &self.inner.kind)
            .field("config", &self.inner.config)
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_no_timeout() {
        let config = RealmConfig::default();
        assert_eq!(config.request_timeout(), None);
        assert_eq!(config.error_policy, ErrorPolicy::Log);
        assert_eq!(config.max_pending, None);
        assert_eq!(config, RealmConfig::new());
    }

    #[test]
    fn test_builder_methods() {
        let config = RealmConfig::new()
            .with_request_timeout(Duration::from_millis(250))
            .with_error_policy(ErrorPolicy::RetryOnce)
            .with_max_pending(8);

        assert_eq!(config.request_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(config.error_policy, ErrorPolicy::RetryOnce);
        assert_eq!(config.max_pending, Some(8));
    }

    #[test]
    fn test_from_json() {
        let config =
            RealmConfig::from_json(r#"{"requestTimeoutMs": 5000, "errorPolicy": "surface"}"#)
                .expect("parse");
        assert_eq!(config.request_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.error_policy, ErrorPolicy::Surface);
        assert_eq!(config.max_pending, None);
    }

    #[test]
    fn test_from_json_empty_object() {
        let config = RealmConfig::from_json("{}").expect("parse");
        assert_eq!(config, RealmConfig::default());
    }

    #[test]
    fn test_request_options_resolve() {
        let config = RealmConfig::new()
            .with_request_timeout(Duration::from_secs(1))
            .with_error_policy(ErrorPolicy::Surface);

        let resolved = RequestOptions::new().resolve(&config);
        assert_eq!(resolved.timeout, Some(Duration::from_secs(1)));
        assert_eq!(resolved.policy(), ErrorPolicy::Surface);

        let overridden = RequestOptions::new()
            .with_timeout(Duration::from_millis(10))
            .resolve(&config);
        assert_eq!(overridden.timeout, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_realm_kind_display() {
        assert_eq!(RealmKind::Background.to_string(), "background");
        assert_eq!(RealmKind::Other("native".into()).to_string(), "native");
    }
}
