//! Fetch priority, decoding hints and early hints for critical resources

use std::collections::HashSet;

use progload_domain::{Codec, Priority, ResourceKind, ResourceRequest};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// `decoding` attribute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecodingHint {
    Sync,
    Async,
}

impl DecodingHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecodingHint::Sync => "sync",
            DecodingHint::Async => "async",
        }
    }
}

/// What the page knows about an element before loading it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementMeta {
    /// First visible hero or banner
    pub critical: bool,
    pub kind: Option<ResourceKind>,
}

impl ElementMeta {
    pub fn critical() -> Self {
        Self {
            critical: true,
            kind: None,
        }
    }
}

/// Result of [`ResourcePriorityManager::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hints {
    pub priority: Priority,
    pub decoding: DecodingHint,
}

/// A declaration emitted ahead of observation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rel", rename_all = "lowercase")]
pub enum EarlyHint {
    Preconnect {
        origin: String,
        crossorigin: bool,
    },
    Preload {
        href: String,
        #[serde(rename = "as")]
        as_kind: String,
        mime_type: Option<String>,
        crossorigin: bool,
    },
}

impl EarlyHint {
    /// HTML `<link>` element
    pub fn to_link_tag(&self) -> String {
        match self {
            EarlyHint::Preconnect { origin, crossorigin } => format!(
                r#"<link rel="preconnect" href="{}"{}>"#,
                origin,
                if *crossorigin { " crossorigin" } else { "" }
            ),
            EarlyHint::Preload {
                href,
                as_kind,
                mime_type,
                crossorigin,
            } => {
                let mut tag = format!(r#"<link rel="preload" href="{}" as="{}""#, href, as_kind);
                if let Some(mime) = mime_type {
                    tag.push_str(&format!(r#" type="{}""#, mime));
                }
                if *crossorigin {
                    tag.push_str(" crossorigin");
                }
                tag.push('>');
                tag
            }
        }
    }

    /// HTTP `Link` header value
    pub fn to_link_header(&self) -> String {
        match self {
            EarlyHint::Preconnect { origin, crossorigin } => format!(
                "<{}>; rel=preconnect{}",
                origin,
                if *crossorigin { "; crossorigin" } else { "" }
            ),
            EarlyHint::Preload {
                href,
                as_kind,
                mime_type,
                crossorigin,
            } => {
                let mut value = format!("<{}>; rel=preload; as={}", href, as_kind);
                if let Some(mime) = mime_type {
                    value.push_str(&format!("; type=\"{}\"", mime));
                }
                if *crossorigin {
                    value.push_str("; crossorigin");
                }
                value
            }
        }
    }
}

/// Assigns priorities and emits a bounded set of early hints.
#[derive(Debug, Clone)]
pub struct ResourcePriorityManager {
    early_hint_limit: usize,
}

impl ResourcePriorityManager {
    pub fn new(early_hint_limit: usize) -> Self {
        Self { early_hint_limit }
    }

    pub fn early_hint_limit(&self) -> usize {
        self.early_hint_limit
    }

    pub fn classify(&self, meta: &ElementMeta) -> Hints {
        if meta.critical {
            Hints {
                priority: Priority::High,
                decoding: DecodingHint::Sync,
            }
        } else {
            Hints {
                priority: Priority::Low,
                decoding: DecodingHint::Async,
            }
        }
    }

    /// Preconnect and preload declarations for at most `early_hint_limit`
    /// resources, in the given order. Each distinct cross-origin host gets
    /// one preconnect ahead of its first preload.
    pub fn inject_early_hints(&self, critical: &[ResourceRequest]) -> Vec<EarlyHint> {
        let mut hints = Vec::new();
        let mut connected = HashSet::new();

        for request in critical.iter().take(self.early_hint_limit) {
            // Fonts are always fetched in CORS mode
            let crossorigin = request.kind() == ResourceKind::Font;

            if let Some(origin) = request.origin() {
                if connected.insert(origin.to_string()) {
                    hints.push(EarlyHint::Preconnect {
                        origin: origin.to_string(),
                        crossorigin,
                    });
                }
            }

            hints.push(EarlyHint::Preload {
                href: request.href().to_string(),
                as_kind: request.kind().preload_as().to_string(),
                mime_type: preload_mime_type(request),
                crossorigin,
            });
        }

        if critical.len() > self.early_hint_limit {
            debug!(
                "Early hints capped at {} of {} critical resources",
                self.early_hint_limit,
                critical.len()
            );
        }
        hints
    }
}

/// Type of the preloaded URL itself: its own variant entry, else its extension.
fn preload_mime_type(request: &ResourceRequest) -> Option<String> {
    let href = request.href();
    let codec = match request.variants().iter().find(|variant| variant.url == href) {
        Some(variant) => variant.codec,
        None => {
            let path = href.split(['?', '#']).next().unwrap_or(href);
            let (_, extension) = path.rsplit('/').next()?.rsplit_once('.')?;
            Codec::from_extension(extension)?
        }
    };
    Some(codec.mime_type().to_string())
}

#[cfg(test)]
mod tests {
    use progload_domain::Variant;

    use super::*;

    #[test]
    fn test_classify() {
        let manager = ResourcePriorityManager::new(3);
        assert_eq!(
            manager.classify(&ElementMeta::critical()),
            Hints {
                priority: Priority::High,
                decoding: DecodingHint::Sync
            }
        );
        assert_eq!(
            manager.classify(&ElementMeta::default()).decoding,
            DecodingHint::Async
        );
    }

    #[test]
    fn test_early_hints_are_bounded() {
        let manager = ResourcePriorityManager::new(2);
        let critical: Vec<ResourceRequest> = ["/a.jpg", "/b.jpg", "/c.jpg"]
            .iter()
            .map(|url| ResourceRequest::get(url).unwrap())
            .collect();

        let hints = manager.inject_early_hints(&critical);
        assert_eq!(hints.len(), 2);
        assert!(hints.iter().all(|h| matches!(h, EarlyHint::Preload { .. })));
    }

    #[test]
    fn test_cross_origin_gets_one_preconnect() {
        let manager = ResourcePriorityManager::new(5);
        let critical = vec![
            ResourceRequest::get("https://fonts.example.com/a.woff2").unwrap(),
            ResourceRequest::get("https://fonts.example.com/b.woff2").unwrap(),
        ];
        let hints = manager.inject_early_hints(&critical);

        assert_eq!(hints.len(), 3);
        assert_eq!(
            hints[0],
            EarlyHint::Preconnect {
                origin: "https://fonts.example.com".to_string(),
                crossorigin: true
            }
        );
        assert_eq!(
            hints[0].to_link_tag(),
            r#"<link rel="preconnect" href="https://fonts.example.com" crossorigin>"#
        );
    }

    #[test]
    fn test_preload_rendering() {
        let manager = ResourcePriorityManager::new(1);
        let hero = ResourceRequest::builder("/img/hero.avif")
            .variants(vec![Variant::new(Codec::Avif, "/img/hero.avif")])
            .build()
            .unwrap();
        let hints = manager.inject_early_hints(&[hero]);

        assert_eq!(
            hints[0].to_link_tag(),
            r#"<link rel="preload" href="/img/hero.avif" as="image" type="image/avif">"#
        );
        assert_eq!(
            hints[0].to_link_header(),
            r#"</img/hero.avif>; rel=preload; as=image; type="image/avif""#
        );
    }

    #[test]
    fn test_preload_type_matches_href() {
        let manager = ResourcePriorityManager::new(3);
        let variants = vec![
            Variant::new(Codec::Avif, "/img/hero.avif"),
            Variant::new(Codec::WebP, "/img/hero.webp"),
            Variant::new(Codec::Jpeg, "/img/hero.jpg"),
        ];
        let critical = vec![
            ResourceRequest::builder("/img/hero.webp")
                .variants(variants.clone())
                .build()
                .unwrap(),
            ResourceRequest::builder("/img/banner.PNG?v=2")
                .variants(variants)
                .build()
                .unwrap(),
            ResourceRequest::get("/css/app.css").unwrap(),
        ];
        let types: Vec<Option<String>> = manager
            .inject_early_hints(&critical)
            .into_iter()
            .map(|hint| match hint {
                EarlyHint::Preload { mime_type, .. } => mime_type,
                other => panic!("unexpected hint {other:?}"),
            })
            .collect();

        assert_eq!(
            types,
            vec![
                Some("image/webp".to_string()),
                Some("image/png".to_string()),
                None
            ]
        );
    }
}
