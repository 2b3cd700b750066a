//! Performance and error signals fed to the observer bridge

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::ErrorKind;

/// Effective connection class as reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NetworkClass {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl NetworkClass {
    /// Parse an `effectiveType` string (`slow-2g`, `2g`, `3g`, `4g`).
    pub fn from_effective_type(value: &str) -> Option<Self> {
        match value {
            "slow-2g" => Some(NetworkClass::Slow2g),
            "2g" => Some(NetworkClass::TwoG),
            "3g" => Some(NetworkClass::ThreeG),
            "4g" => Some(NetworkClass::FourG),
            _ => None,
        }
    }

    pub fn is_constrained(&self) -> bool {
        matches!(self, NetworkClass::Slow2g | NetworkClass::TwoG)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaintKind {
    FirstPaint,
    FirstContentfulPaint,
}

/// One observation delivered to the performance bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum PerformanceSignal {
    Paint { kind: PaintKind, at_ms: f64 },
    LargestContentfulPaint { render_ms: f64 },
    LongTask { duration_ms: f64 },
    Network { class: NetworkClass, save_data: bool },
    /// Main thread reported idle time
    Idle,
    Error { kind: ErrorKind, key: String },
}

/// Cloneable sending half of the signal channel. A disconnected reporter
/// silently drops everything.
#[derive(Debug, Clone, Default)]
pub struct SignalReporter {
    sender: Option<mpsc::UnboundedSender<PerformanceSignal>>,
}

impl SignalReporter {
    pub fn new(sender: mpsc::UnboundedSender<PerformanceSignal>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Reporter plus the receiving end to hand to the bridge.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PerformanceSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn disconnected() -> Self {
        Self::default()
    }

    pub fn report(&self, signal: PerformanceSignal) {
        if let Some(ref sender) = self.sender {
            // Receiver gone means nobody is observing; not an error.
            let _ = sender.send(signal);
        }
    }

    pub fn report_error(&self, kind: ErrorKind, key: impl Into<String>) {
        self.report(PerformanceSignal::Error {
            kind,
            key: key.into(),
        });
    }
}
