//! Request to namespace routing

use std::collections::HashSet;

use progload_domain::{RequestKey, ResourceRequest};

use crate::config::RouteRule;

/// Ordered routing rules plus the precache manifest they may refer to.
#[derive(Debug, Clone)]
pub struct RouteTable {
    rules: Vec<RouteRule>,
    default_namespace: String,
    precached: HashSet<RequestKey>,
}

impl RouteTable {
    pub fn new(
        rules: Vec<RouteRule>,
        default_namespace: impl Into<String>,
        precached: impl IntoIterator<Item = RequestKey>,
    ) -> Self {
        Self {
            rules,
            default_namespace: default_namespace.into(),
            precached: precached.into_iter().collect(),
        }
    }

    /// Namespace serving `request`
    pub fn resolve(&self, request: &ResourceRequest) -> &str {
        self.rules
            .iter()
            .find(|rule| self.matches(rule, request))
            .map(|rule| rule.namespace.as_str())
            .unwrap_or(&self.default_namespace)
    }

    pub fn is_precached(&self, key: &RequestKey) -> bool {
        self.precached.contains(key)
    }

    fn matches(&self, rule: &RouteRule, request: &ResourceRequest) -> bool {
        if !rule.kinds.is_empty() && !rule.kinds.contains(&request.kind()) {
            return false;
        }
        if let Some(ref prefix) = rule.path_prefix {
            if !request.path().starts_with(prefix.as_str()) {
                return false;
            }
        }
        if rule.precached && !self.precached.contains(request.key()) {
            return false;
        }
        true
    }
}
