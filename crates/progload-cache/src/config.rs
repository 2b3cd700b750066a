//! Worker configuration

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use progload_domain::ResourceKind;
use serde::{Deserialize, Serialize};

use crate::namespace::{CachePolicy, NamespaceSpec};
use crate::{CacheError, Result};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const MINUTE_MS: u64 = 60 * 1000;
const DAY_MS: u64 = 24 * 60 * MINUTE_MS;

/// Worker-side configuration. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Declared namespaces with their current versions
    pub namespaces: Vec<NamespaceSpec>,
    /// Ordered routing rules; the first match wins. A file that declares its
    /// own namespaces but no routes gets none, so everything lands in
    /// `default_namespace`.
    pub routes: Vec<RouteRule>,
    /// Namespace for requests no rule matches
    pub default_namespace: String,
    pub precache: PrecacheConfig,
    /// Budget of the network leg under network-first
    pub network_timeout_ms: u64,
    pub fallback: FallbackConfig,
    /// Directory for persisted tiers; memory-backed when absent
    pub storage_root: Option<PathBuf>,
    /// Origin relative request URLs are fetched from
    pub base_url: String,
}

/// Maps a request to a namespace. Every condition that is set must hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteRule {
    pub namespace: String,
    /// Matches any kind when empty
    #[serde(default)]
    pub kinds: Vec<ResourceKind>,
    #[serde(default)]
    pub path_prefix: Option<String>,
    /// Only URLs listed in the precache manifest
    #[serde(default)]
    pub precached: bool,
}

impl RouteRule {
    pub fn to(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            kinds: Vec::new(),
            path_prefix: None,
            precached: false,
        }
    }

    pub fn kinds(mut self, kinds: &[ResourceKind]) -> Self {
        self.kinds = kinds.to_vec();
        self
    }

    pub fn path_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.path_prefix = Some(prefix.into());
        self
    }

    pub fn precached(mut self) -> Self {
        self.precached = true;
        self
    }
}

/// Assets fetched and stored during install.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PrecacheConfig {
    pub namespace: String,
    pub assets: Vec<String>,
}

/// Responses used when neither network nor cache can answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    pub image_content_type: String,
    pub image_body: String,
    /// Body of the synthesized offline response for JSON endpoints
    pub offline_marker: serde_json::Value,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            namespaces: vec![
                NamespaceSpec::new("static", CachePolicy::CacheFirst, 10 * MIB, 7 * DAY_MS)
                    .persisted(),
                NamespaceSpec::new("images", CachePolicy::CacheFirst, 50 * MIB, 30 * DAY_MS)
                    .persisted(),
                NamespaceSpec::new("api", CachePolicy::NetworkFirst, 5 * MIB, 5 * MINUTE_MS)
                    .persisted(),
                NamespaceSpec::new("dynamic", CachePolicy::StaleWhileRevalidate, 10 * MIB, DAY_MS),
            ],
            routes: vec![
                RouteRule::to("static").precached(),
                RouteRule::to("images").kinds(&[ResourceKind::Image, ResourceKind::Font]),
                RouteRule::to("api").kinds(&[ResourceKind::Api]),
                RouteRule::to("api").path_prefix("/api/"),
            ],
            default_namespace: "dynamic".to_string(),
            precache: PrecacheConfig::default(),
            network_timeout_ms: 3000,
            fallback: FallbackConfig::default(),
            storage_root: None,
            base_url: "http://localhost".to_string(),
        }
    }
}

impl Default for PrecacheConfig {
    fn default() -> Self {
        Self {
            namespace: "static".to_string(),
            assets: Vec::new(),
        }
    }
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            image_content_type: "image/svg+xml".to_string(),
            image_body: concat!(
                r#"<svg xmlns="http://www.w3.org/2000/svg" width="1" height="1">"#,
                r##"<rect width="1" height="1" fill="#eee"/></svg>"##
            )
            .to_string(),
            offline_marker: serde_json::json!({ "offline": true }),
        }
    }
}

impl WorkerConfig {
    /// Load configuration from a YAML file, or defaults if it doesn't exist
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(content)?;
        let own_namespaces = raw.get("namespaces").is_some() && raw.get("routes").is_none();

        let mut config: Self = serde_yaml::from_value(raw)?;
        if own_namespaces {
            // Default routes point at the default namespaces
            config.routes.clear();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn namespace(&self, name: &str) -> Option<&NamespaceSpec> {
        self.namespaces.iter().find(|spec| spec.name == name)
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |message: String| Err(CacheError::Config { message });

        let mut seen = HashSet::new();
        for spec in &self.namespaces {
            if spec.name.is_empty() {
                return invalid("namespace name must not be empty".to_string());
            }
            if !seen.insert(spec.name.as_str()) {
                return invalid(format!("namespace {} declared twice", spec.name));
            }
            if spec.max_bytes == 0 {
                return invalid(format!("namespace {} has max_bytes = 0", spec.name));
            }
        }

        let known = |name: &str| seen.contains(name);
        for route in &self.routes {
            if !known(&route.namespace) {
                return invalid(format!("route points at undeclared namespace {}", route.namespace));
            }
        }
        if !known(&self.default_namespace) {
            return invalid(format!(
                "default namespace {} is not declared",
                self.default_namespace
            ));
        }
        if !self.precache.assets.is_empty() && !known(&self.precache.namespace) {
            return invalid(format!(
                "precache namespace {} is not declared",
                self.precache.namespace
            ));
        }
        if self.network_timeout_ms == 0 {
            return invalid("network_timeout_ms must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.network_timeout_ms, 3000);
        assert_eq!(
            config.fallback.offline_marker,
            serde_json::json!({"offline": true})
        );
        assert_eq!(config.namespace("api").unwrap().policy, CachePolicy::NetworkFirst);
    }

    #[test]
    fn test_yaml_overrides() {
        let yaml = r#"
namespaces:
  - name: api
    version: 2
    policy: network-first
    max_bytes: 4096
    ttl_ms: 1000
default_namespace: api
network_timeout_ms: 250
"#;
        let config = WorkerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.namespace("api").unwrap().full_name(), "api-v2");
        assert_eq!(config.network_timeout_ms, 250);
        assert!(config.routes.is_empty());
        // Unset sections keep their defaults
        assert_eq!(config.precache.namespace, "static");
    }

    #[test]
    fn test_declared_routes_are_kept() {
        let yaml = r#"
namespaces:
  - name: images
    policy: cache-first
    max_bytes: 4096
    ttl_ms: 1000
  - name: rest
    policy: stale-while-revalidate
    max_bytes: 4096
    ttl_ms: 1000
routes:
  - namespace: images
    kinds: [image]
default_namespace: rest
"#;
        let config = WorkerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.routes,
            vec![RouteRule::to("images").kinds(&[ResourceKind::Image])]
        );
    }

    #[test]
    fn test_default_namespaces_keep_default_routes() {
        let config = WorkerConfig::from_yaml_str("network_timeout_ms: 500\n").unwrap();
        assert_eq!(config.routes, WorkerConfig::default().routes);
        assert_eq!(config.network_timeout_ms, 500);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let err = WorkerConfig::from_yaml_str("network_timeout: 10\n").unwrap_err();
        assert!(matches!(err, CacheError::Config { .. }));

        let yaml = r#"
namespaces:
  - name: api
    policy: network-first
    max_bytes: 10
    ttl_ms: 10
    maxAge: 5
default_namespace: api
"#;
        assert!(WorkerConfig::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = WorkerConfig::default();
        config.routes.push(RouteRule::to("missing"));
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.namespaces[0].max_bytes = 0;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        let duplicate = config.namespaces[0].clone();
        config.namespaces.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file_means_defaults() {
        let config = WorkerConfig::from_file(Path::new("/nonexistent/progload.yaml")).unwrap();
        assert_eq!(config, WorkerConfig::default());
    }
}
