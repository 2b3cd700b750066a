//! Freshness lifetime from HTTP response headers

use std::collections::HashMap;
use std::time::SystemTime;

/// How long a response may be cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// `Cache-Control: no-store`: return to the caller, never store
    NoStore,
    /// Explicit lifetime from `max-age`, `s-maxage` or `Expires`
    Ttl(u64),
    /// No usable header; the namespace default applies
    Default,
}

impl Freshness {
    pub fn ttl_or(self, default_ttl_ms: u64) -> Option<u64> {
        match self {
            Freshness::NoStore => None,
            Freshness::Ttl(ttl) => Some(ttl),
            Freshness::Default => Some(default_ttl_ms),
        }
    }
}

/// Derive freshness from lower-cased response headers.
///
/// `no-store` wins, then `s-maxage`, then `max-age`, then `Expires` measured
/// against `Date` (or `now` when `Date` is absent or unparsable).
pub fn freshness_from_headers(headers: &HashMap<String, String>, now: SystemTime) -> Freshness {
    if let Some(cache_control) = headers.get("cache-control") {
        let mut max_age = None;
        let mut shared_max_age = None;

        for directive in cache_control.split(',') {
            let directive = directive.trim().to_ascii_lowercase();
            let (name, value) = match directive.split_once('=') {
                Some((name, value)) => (
                    name.trim().to_string(),
                    Some(value.trim().trim_matches('"').to_string()),
                ),
                None => (directive.clone(), None),
            };

            match name.as_str() {
                "no-store" => return Freshness::NoStore,
                "max-age" => max_age = value.and_then(|v| v.parse::<u64>().ok()),
                "s-maxage" => shared_max_age = value.and_then(|v| v.parse::<u64>().ok()),
                _ => {}
            }
        }

        if let Some(seconds) = shared_max_age.or(max_age) {
            return Freshness::Ttl(seconds.saturating_mul(1000));
        }
    }

    if let Some(expires) = headers.get("expires") {
        // An unparsable Expires means "already expired"
        let Ok(expires_at) = httpdate::parse_http_date(expires) else {
            return Freshness::Ttl(0);
        };
        let base = headers
            .get("date")
            .and_then(|date| httpdate::parse_http_date(date).ok())
            .unwrap_or(now);
        let ttl = expires_at
            .duration_since(base)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        return Freshness::Ttl(ttl);
    }

    Freshness::Default
}
