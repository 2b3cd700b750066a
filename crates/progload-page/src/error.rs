//! Page-side error types

use progload_domain::{DomainError, ErrorKind, LoadError};
use thiserror::Error;

use crate::scheduler::{ElementId, ElementState};

/// Errors raised by the page-side components
#[derive(Error, Debug)]
pub enum PageError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Element has neither data-src nor data-srcset")]
    MissingSource,

    #[error("Unknown element {0}")]
    UnknownElement(ElementId),

    #[error("Element {id} cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        id: ElementId,
        from: ElementState,
        to: ElementState,
    },

    #[error("Unsupported feature: {feature}")]
    UnsupportedFeature { feature: String },

    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    #[error("Invalid request: {0}")]
    Request(#[from] DomainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PageError::UnsupportedFeature { .. } => ErrorKind::UnsupportedFeature,
            PageError::Load(e) => e.kind(),
            _ => ErrorKind::Network,
        }
    }
}

impl From<serde_yaml::Error> for PageError {
    fn from(err: serde_yaml::Error) -> Self {
        PageError::Config {
            message: err.to_string(),
        }
    }
}
