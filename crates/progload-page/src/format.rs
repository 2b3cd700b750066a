//! Image format negotiation
//!
//! Support for each optional codec is probed once by decoding a tiny embedded
//! sample and memoized for the lifetime of the negotiator. Baseline codecs
//! (JPEG, PNG, GIF, SVG) are assumed and never probed.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use progload_domain::{Codec, Variant};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

/// 1x1 lossy WebP
const WEBP_SAMPLE: &str = "UklGRiIAAABXRUJQVlA4IBYAAAAwAQCdASoBAAEADsD+JaQAA3AAAAAA";

/// 1x1 AVIF
const AVIF_SAMPLE: &str = concat!(
    "AAAAIGZ0eXBhdmlmAAAAAGF2aWZtaWYxbWlhZk1BMUIAAADybWV0YQAAAAAAAAAoaGRscgAAAAAAAAAAcGljdAAAAAAA",
    "AAAAAAAAAGxpYmF2aWYAAAAADnBpdG0AAAAAAAEAAAAeaWxvYwAAAABEAAABAAEAAAABAAABGgAAAB0AAAAoaWluZgAA",
    "AAAAAQAAABppbmZlAgAAAAABAABhdjAxQ29sb3IAAAAAamlwcnAAAABLaXBjbwAAABRpc3BlAAAAAAAAAAIAAAACAAAA",
    "EHBpeGkAAAAAAwgICAAAAAxhdjFDgQ0MAAAAABNjb2xybmNseAACAAIAAYAAAAAXaXBtYQAAAAAAAAABAAEEAQKDBAAA",
    "ACVtZGF0EgAKCBgANogQEAwgMg8f8D///8WfhwB8+ErK42A="
);

/// Answers whether the runtime can decode a codec. Implementations resolve
/// `false` on any failure instead of erroring.
#[async_trait]
pub trait CodecProbe: Send + Sync {
    async fn probe(&self, codec: Codec) -> bool;
}

/// Probes by decoding an embedded sample with the `image` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImageDecodeProbe;

impl ImageDecodeProbe {
    fn sample(codec: Codec) -> Option<&'static str> {
        match codec {
            Codec::WebP => Some(WEBP_SAMPLE),
            Codec::Avif => Some(AVIF_SAMPLE),
            _ => None,
        }
    }

    fn decode(codec: Codec) -> bool {
        let Some(sample) = Self::sample(codec) else {
            return codec.is_baseline();
        };
        let Ok(bytes) = STANDARD.decode(sample) else {
            return false;
        };
        let format = match codec {
            Codec::WebP => image::ImageFormat::WebP,
            Codec::Avif => image::ImageFormat::Avif,
            _ => return false,
        };
        match image::load_from_memory_with_format(&bytes, format) {
            Ok(decoded) => decoded.width() == 1 && decoded.height() == 1,
            Err(e) => {
                debug!("Probe decode of {} failed: {}", codec, e);
                false
            }
        }
    }
}

#[async_trait]
impl CodecProbe for ImageDecodeProbe {
    async fn probe(&self, codec: Codec) -> bool {
        // A panicking decoder counts as unsupported too
        tokio::task::spawn_blocking(move || Self::decode(codec))
            .await
            .unwrap_or(false)
    }
}

/// Resolved support of the optional codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapabilityFlags {
    pub avif: bool,
    pub webp: bool,
}

impl CapabilityFlags {
    pub fn supports(&self, codec: Codec) -> bool {
        match codec {
            Codec::Avif => self.avif,
            Codec::WebP => self.webp,
            _ => true,
        }
    }
}

/// Pick the first variant the flags support, else the last variant.
pub fn choose_variant_with<'a>(
    flags: &CapabilityFlags,
    variants: &'a [Variant],
) -> Option<&'a Variant> {
    variants
        .iter()
        .find(|variant| flags.supports(variant.codec))
        .or_else(|| variants.last())
}

/// Detects codec support once and chooses among variants.
pub struct FormatNegotiator {
    probe: Arc<dyn CodecProbe>,
    avif: OnceCell<bool>,
    webp: OnceCell<bool>,
    flags: OnceCell<CapabilityFlags>,
}

impl FormatNegotiator {
    pub fn new(probe: Arc<dyn CodecProbe>) -> Self {
        Self {
            probe,
            avif: OnceCell::new(),
            webp: OnceCell::new(),
            flags: OnceCell::new(),
        }
    }

    /// Negotiator backed by [`ImageDecodeProbe`]
    pub fn with_image_probe() -> Self {
        Self::new(Arc::new(ImageDecodeProbe))
    }

    /// Whether `codec` decodes here. Probed at most once per codec.
    pub async fn detect_support(&self, codec: Codec) -> bool {
        let cell = match codec {
            Codec::Avif => &self.avif,
            Codec::WebP => &self.webp,
            _ => return true,
        };
        *cell
            .get_or_init(|| async {
                let supported = self.probe.probe(codec).await;
                debug!("Codec {} supported: {}", codec, supported);
                supported
            })
            .await
    }

    /// All flags, resolved on first call
    pub async fn capabilities(&self) -> CapabilityFlags {
        *self
            .flags
            .get_or_init(|| async {
                CapabilityFlags {
                    avif: self.detect_support(Codec::Avif).await,
                    webp: self.detect_support(Codec::WebP).await,
                }
            })
            .await
    }

    /// Flags if already resolved
    pub fn resolved(&self) -> Option<CapabilityFlags> {
        self.flags.get().copied()
    }

    /// URL of the best supported variant; `None` only for an empty list.
    pub async fn choose_variant<'a>(&self, variants: &'a [Variant]) -> Option<&'a str> {
        let flags = self.capabilities().await;
        choose_variant_with(&flags, variants).map(|variant| variant.url.as_str())
    }
}
