//! Resource requests and their canonical cache keys

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::DomainError;
use crate::Result;

/// Origin used to resolve relative request URLs. Relative requests are keyed
/// by path and query only, so this value never leaks into a key.
const LOCAL_ORIGIN: &str = "http://origin.local/";

/// Kind of resource being requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Image,
    Font,
    Script,
    Style,
    Api,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Image => "image",
            ResourceKind::Font => "font",
            ResourceKind::Script => "script",
            ResourceKind::Style => "style",
            ResourceKind::Api => "api",
        }
    }

    /// Value of the `as` attribute used when preloading this kind.
    pub fn preload_as(&self) -> &'static str {
        match self {
            ResourceKind::Image => "image",
            ResourceKind::Font => "font",
            ResourceKind::Script => "script",
            ResourceKind::Style => "style",
            ResourceKind::Api => "fetch",
        }
    }

    /// Best-effort guess from a URL path.
    pub fn from_path(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or(path);
        if path.contains("/api/") || path.ends_with(".json") {
            return ResourceKind::Api;
        }
        let extension = path
            .rsplit('/')
            .next()
            .and_then(|file| file.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());

        match extension.as_deref() {
            Some("css") => ResourceKind::Style,
            Some("js") | Some("mjs") => ResourceKind::Script,
            Some("woff") | Some("woff2") | Some("ttf") | Some("otf") => ResourceKind::Font,
            Some(ext) if Codec::from_extension(ext).is_some() => ResourceKind::Image,
            _ => ResourceKind::Script,
        }
    }
}

/// Relative fetch priority hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Low,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Low => "low",
        }
    }
}

/// Credentials mode of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialsMode {
    Omit,
    #[default]
    SameOrigin,
    Include,
}

/// HTTP method. Only safe methods are ever cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Head,
    Post,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
        }
    }

    pub fn is_cacheable(&self) -> bool {
        matches!(self, Method::Get)
    }
}

/// Media encodings a variant can be offered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Avif,
    WebP,
    Jpeg,
    Png,
    Gif,
    Svg,
}

impl Codec {
    pub const ALL: [Codec; 6] = [
        Codec::Avif,
        Codec::WebP,
        Codec::Jpeg,
        Codec::Png,
        Codec::Gif,
        Codec::Svg,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Avif => "avif",
            Codec::WebP => "webp",
            Codec::Jpeg => "jpg",
            Codec::Png => "png",
            Codec::Gif => "gif",
            Codec::Svg => "svg",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Codec::Avif => "image/avif",
            Codec::WebP => "image/webp",
            Codec::Jpeg => "image/jpeg",
            Codec::Png => "image/png",
            Codec::Gif => "image/gif",
            Codec::Svg => "image/svg+xml",
        }
    }

    /// Codecs every runtime is assumed to decode; these are never probed.
    pub fn is_baseline(&self) -> bool {
        !matches!(self, Codec::Avif | Codec::WebP)
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "avif" => Some(Codec::Avif),
            "webp" => Some(Codec::WebP),
            "jpg" | "jpeg" => Some(Codec::Jpeg),
            "png" => Some(Codec::Png),
            "gif" => Some(Codec::Gif),
            "svg" => Some(Codec::Svg),
            _ => None,
        }
    }
}

impl FromStr for Codec {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self> {
        Codec::from_extension(s).ok_or_else(|| DomainError::UnknownCodec(s.to_string()))
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One encoding alternative of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub codec: Codec,
    pub url: String,
}

impl Variant {
    pub fn new(codec: Codec, url: impl Into<String>) -> Self {
        Self {
            codec,
            url: url.into(),
        }
    }
}

/// Canonical identity of a request: method plus fragment-free URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Canonicalize `raw` and build the key for `method`.
    pub fn for_url(method: Method, raw: &str) -> Result<Self> {
        let (href, _) = canonicalize(raw)?;
        Ok(Self(format!("{} {}", method.as_str(), href)))
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the canonical href and the parsed URL. Relative input resolves
/// against [`LOCAL_ORIGIN`] but keeps a path-only href.
fn canonicalize(raw: &str) -> Result<(String, Url)> {
    let invalid = |reason: String| DomainError::InvalidUrl {
        url: raw.to_string(),
        reason,
    };

    match Url::parse(raw) {
        Ok(mut url) => {
            url.set_fragment(None);
            Ok((url.to_string(), url))
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            let base = Url::parse(LOCAL_ORIGIN).map_err(|e| invalid(e.to_string()))?;
            let mut url = base.join(raw).map_err(|e| invalid(e.to_string()))?;
            url.set_fragment(None);
            let href = match url.query() {
                Some(query) => format!("{}?{}", url.path(), query),
                None => url.path().to_string(),
            };
            Ok((href, url))
        }
        Err(e) => Err(invalid(e.to_string())),
    }
}

/// A single load attempt. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    key: RequestKey,
    href: String,
    path: String,
    origin: Option<String>,
    method: Method,
    kind: ResourceKind,
    variants: Vec<Variant>,
    priority: Priority,
    credentials: CredentialsMode,
}

impl ResourceRequest {
    pub fn builder(url: impl Into<String>) -> ResourceRequestBuilder {
        ResourceRequestBuilder::new(url)
    }

    /// GET request whose kind is guessed from the path.
    pub fn get(url: &str) -> Result<Self> {
        Self::builder(url).build()
    }

    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// Canonical URL (path and query for same-origin requests).
    pub fn href(&self) -> &str {
        &self.href
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Serialized origin for absolute URLs, `None` for same-origin requests.
    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn variants(&self) -> &[Variant] {
        &self.variants
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn credentials(&self) -> CredentialsMode {
        self.credentials
    }
}

/// Builder for [`ResourceRequest`]
#[derive(Debug, Clone)]
pub struct ResourceRequestBuilder {
    url: String,
    method: Method,
    kind: Option<ResourceKind>,
    variants: Vec<Variant>,
    priority: Priority,
    credentials: CredentialsMode,
}

impl ResourceRequestBuilder {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::default(),
            kind: None,
            variants: Vec::new(),
            priority: Priority::default(),
            credentials: CredentialsMode::default(),
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    pub fn kind(mut self, kind: ResourceKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn variants(mut self, variants: Vec<Variant>) -> Self {
        self.variants = variants;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn credentials(mut self, credentials: CredentialsMode) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn build(self) -> Result<ResourceRequest> {
        let (href, url) = canonicalize(&self.url)?;
        let relative = !href.contains("://");
        let origin = if relative {
            None
        } else {
            Some(url.origin().ascii_serialization())
        };
        let path = url.path().to_string();
        let kind = self.kind.unwrap_or_else(|| ResourceKind::from_path(&path));

        Ok(ResourceRequest {
            key: RequestKey(format!("{} {}", self.method.as_str(), href)),
            href,
            path,
            origin,
            method: self.method,
            kind,
            variants: self.variants,
            priority: self.priority,
            credentials: self.credentials,
        })
    }
}
