//! Test doubles shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use progload::cache::{FetchError, NetworkFetcher, NetworkResponse};
use progload::domain::{Codec, ResourceRequest, Response};
use progload::page::{CapabilityFlags, CodecProbe, DeferredElement, Rect, Viewport, ViewportSource};

pub const VIEWPORT: Viewport = Viewport {
    width: 1280.0,
    height: 720.0,
};

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// Network double answering from a table keyed by href. Unknown hrefs and
/// an offline fetcher reject.
#[derive(Default)]
pub struct ScriptedNetwork {
    answers: Mutex<HashMap<String, NetworkResponse>>,
    offline: Mutex<bool>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
}

impl ScriptedNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, href: &str, response: NetworkResponse) {
        self.answers.lock().insert(href.to_string(), response);
    }

    pub fn image(&self, href: &str, body: &[u8]) {
        self.answer(
            href,
            NetworkResponse::new(200, body.to_vec()).with_header("content-type", "image/jpeg"),
        );
    }

    pub fn json(&self, href: &str, body: &str) {
        self.answer(
            href,
            NetworkResponse::new(200, body.as_bytes().to_vec())
                .with_header("content-type", "application/json"),
        );
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().clone()
    }
}

#[async_trait]
impl NetworkFetcher for ScriptedNetwork {
    async fn fetch(&self, request: &ResourceRequest) -> Result<NetworkResponse, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().push(request.href().to_string());

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.offline.lock() {
            return Err(FetchError::Rejected("network unreachable".to_string()));
        }
        self.answers
            .lock()
            .get(request.href())
            .cloned()
            .ok_or_else(|| FetchError::Rejected(format!("no route to {}", request.href())))
    }
}

/// Codec support fixed up front.
pub struct FixedCodecs(pub CapabilityFlags);

#[async_trait]
impl CodecProbe for FixedCodecs {
    async fn probe(&self, codec: Codec) -> bool {
        self.0.supports(codec)
    }
}

/// Deferred `<img>` stand-in.
pub struct Img {
    attributes: Mutex<HashMap<String, String>>,
    rect: Mutex<Rect>,
    committed: Mutex<Vec<Response>>,
}

impl Img {
    pub fn lazy(data_src: &str, top: f64) -> Arc<Self> {
        let mut attributes = HashMap::new();
        attributes.insert("data-src".to_string(), data_src.to_string());
        Arc::new(Self {
            attributes: Mutex::new(attributes),
            rect: Mutex::new(Rect::new(0.0, top, 300.0, 200.0)),
            committed: Mutex::new(Vec::new()),
        })
    }

    pub fn attr(&self, name: &str) -> Option<String> {
        self.attributes.lock().get(name).cloned()
    }

    pub fn scroll_to(&self, top: f64) {
        self.rect.lock().y = top;
    }

    pub fn committed(&self) -> Vec<Response> {
        self.committed.lock().clone()
    }
}

impl DeferredElement for Img {
    fn attribute(&self, name: &str) -> Option<String> {
        self.attr(name)
    }

    fn set_attribute(&self, name: &str, value: &str) {
        self.attributes
            .lock()
            .insert(name.to_string(), value.to_string());
    }

    fn remove_attribute(&self, name: &str) {
        self.attributes.lock().remove(name);
    }

    fn bounding_rect(&self) -> Rect {
        *self.rect.lock()
    }

    fn commit(&self, response: &Response) -> Result<(), String> {
        self.committed.lock().push(response.clone());
        Ok(())
    }
}

pub struct FixedViewport;

impl ViewportSource for FixedViewport {
    fn viewport(&self) -> Viewport {
        VIEWPORT
    }
}
