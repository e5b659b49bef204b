//! Route matching logic.
//!
//! # Responsibilities
//! - Match the call's host (exact match, case-insensitive, port ignored)
//! - Match the gRPC method path prefix (case-sensitive)
//! - Combine conditions with AND semantics
//!
//! # Design Decisions
//! - Host matching is case-insensitive
//! - Method matching is case-sensitive (gRPC paths are)
//! - Empty condition = always matches (wildcard)
//! - No regex to guarantee O(n) matching

/// Routing-relevant view of an incoming call.
#[derive(Debug, Clone, Copy)]
pub struct CallInfo<'a> {
    /// `:authority` or `Host`, if the client sent one.
    pub host: Option<&'a str>,
    /// gRPC method path, e.g. `/echo.Echo/Chat`.
    pub method: &'a str,
}

/// Trait for matching calls against conditions.
pub trait Matcher: Send + Sync + std::fmt::Debug {
    /// Returns true if the call matches this condition.
    fn matches(&self, call: &CallInfo<'_>) -> bool;
}

/// Matches the call's host.
#[derive(Debug, Clone)]
pub struct HostMatcher {
    expected_host: String,
}

impl HostMatcher {
    /// The host is normalized to lowercase without port.
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            expected_host: strip_port(&host.into()).to_ascii_lowercase(),
        }
    }
}

impl Matcher for HostMatcher {
    fn matches(&self, call: &CallInfo<'_>) -> bool {
        call.host
            .map(|h| strip_port(h).eq_ignore_ascii_case(&self.expected_host))
            .unwrap_or(false)
    }
}

/// Matches the method path prefix.
#[derive(Debug, Clone)]
pub struct MethodPrefixMatcher {
    prefix: String,
}

impl MethodPrefixMatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Matcher for MethodPrefixMatcher {
    fn matches(&self, call: &CallInfo<'_>) -> bool {
        call.method.starts_with(&self.prefix)
    }
}

/// Combines multiple matchers with AND semantics.
#[derive(Debug)]
pub struct AndMatcher {
    matchers: Vec<Box<dyn Matcher>>,
}

impl AndMatcher {
    pub fn new(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }
}

impl Matcher for AndMatcher {
    fn matches(&self, call: &CallInfo<'_>) -> bool {
        self.matchers.iter().all(|m| m.matches(call))
    }
}

/// Drop a trailing `:port` from an authority. Bracketed IPv6 hosts keep their brackets.
fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}
