//! Passthrough policy: which requests the worker leaves alone.

use crate::Request;
use http::Method;
use satchel_core::ExclusionRule;
use tracing::trace;
use url::Url;

/// Decision for an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InterceptDecision {
    /// Apply the caching policy.
    Intercept,
    /// Forward to the network untouched.
    Passthrough(PassthroughReason),
}

impl InterceptDecision {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, InterceptDecision::Passthrough(_))
    }
}

/// Why a request was not intercepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassthroughReason {
    /// Only GET is cached.
    Method(Method),
    /// Only http and https are cached.
    Scheme(String),
    /// URL hit the exclusion denylist.
    Excluded(String),
}

/// URL pattern for matching.
#[derive(Debug, Clone)]
pub struct UrlPattern {
    /// Pattern type.
    pub pattern_type: PatternType,
    /// Pattern string.
    pub pattern: String,
}

/// Type of URL pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternType {
    /// Path starts with the pattern.
    PathPrefix,
    /// Host contains the pattern.
    HostContains,
    /// Serialized URL contains the pattern anywhere, query string included.
    Contains,
}

impl UrlPattern {
    /// Create a path prefix pattern.
    pub fn path_prefix(prefix: &str) -> Self {
        Self {
            pattern_type: PatternType::PathPrefix,
            pattern: prefix.to_string(),
        }
    }

    /// Create a host fragment pattern.
    pub fn host_contains(fragment: &str) -> Self {
        Self {
            pattern_type: PatternType::HostContains,
            pattern: fragment.to_string(),
        }
    }

    /// Create a raw substring pattern.
    pub fn contains(substring: &str) -> Self {
        Self {
            pattern_type: PatternType::Contains,
            pattern: substring.to_string(),
        }
    }

    /// Check if a URL matches this pattern.
    pub fn matches(&self, url: &Url) -> bool {
        match self.pattern_type {
            PatternType::PathPrefix => url.path().starts_with(&self.pattern),
            PatternType::HostContains => url
                .host_str()
                .map(|host| host.contains(&self.pattern))
                .unwrap_or(false),
            PatternType::Contains => url.as_str().contains(&self.pattern),
        }
    }
}

impl From<&ExclusionRule> for UrlPattern {
    fn from(rule: &ExclusionRule) -> Self {
        match rule {
            ExclusionRule::PathPrefix(prefix) => UrlPattern::path_prefix(prefix),
            ExclusionRule::HostContains(fragment) => UrlPattern::host_contains(fragment),
            ExclusionRule::UrlContains(substring) => UrlPattern::contains(substring),
        }
    }
}

/// Classifies requests into intercepted and passthrough traffic.
#[derive(Debug, Clone, Default)]
pub struct PassthroughPolicy {
    exclusions: Vec<UrlPattern>,
}

impl PassthroughPolicy {
    /// Build the policy from configured exclusion rules.
    pub fn from_rules(rules: &[ExclusionRule]) -> Self {
        Self {
            exclusions: rules.iter().map(UrlPattern::from).collect(),
        }
    }

    /// Decide whether the worker handles this request.
    pub fn classify(&self, request: &Request) -> InterceptDecision {
        if request.method != Method::GET {
            return InterceptDecision::Passthrough(PassthroughReason::Method(
                request.method.clone(),
            ));
        }

        if !request.is_http() {
            return InterceptDecision::Passthrough(PassthroughReason::Scheme(
                request.url.scheme().to_string(),
            ));
        }

        if let Some(pattern) = self.exclusions.iter().find(|p| p.matches(&request.url)) {
            trace!(url = %request.url, pattern = %pattern.pattern, "Excluded by denylist");
            return InterceptDecision::Passthrough(PassthroughReason::Excluded(
                pattern.pattern.clone(),
            ));
        }

        InterceptDecision::Intercept
    }
}
