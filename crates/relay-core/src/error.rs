use std::sync::Arc;

use thiserror::Error;

use crate::types::RequestConfig;

/// The rule a target violated when checked against a `UrlPolicy`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UrlViolation {
    #[error("target is empty")]
    Empty,

    #[error("malformed target: {0}")]
    Malformed(String),

    #[error("protocol not permitted: {0}")]
    ProtocolNotAllowed(String),

    #[error("localhost blocked: {0}")]
    LocalhostBlocked(String),

    #[error("private range {range} blocked: {host}")]
    PrivateRangeBlocked { range: String, host: String },
}

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    // Transport errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Request aborted: {0}")]
    Aborted(String),

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        /// Status carried on the response, if the transport got one.
        status: Option<u16>,
        /// Raw error body or adapter-specific detail.
        details: Option<serde_json::Value>,
    },

    #[error("Stream error: {0}")]
    Stream(String),

    // Validation errors
    #[error("URL rejected by policy: {0}")]
    UrlPolicy(UrlViolation),

    #[error("Concurrency must be a positive integer, got {0}")]
    InvalidConcurrency(i64),

    #[error("No adapter configured for request stage")]
    MissingAdapter,

    #[error("Flow nesting exceeded {limit} levels (depth {depth})")]
    NestingTooDeep { depth: usize, limit: usize },

    // Stage pipeline errors
    #[error("Pipeline error: {0}")]
    Pipeline(String),

    #[error("Stage {index} failed: {source}")]
    Stage {
        index: usize,
        /// Resolved request config, `None` for a nested flow stage.
        config: Option<Box<RequestConfig>>,
        #[source]
        source: Box<RelayError>,
    },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<std::io::Error> for RelayError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(Arc::new(e))
    }
}

impl From<UrlViolation> for RelayError {
    fn from(v: UrlViolation) -> Self {
        Self::UrlPolicy(v)
    }
}

const NETWORK_KEYWORDS: [&str; 4] = ["network", "connection", "timeout", "fetch"];

impl RelayError {
    /// Shorthand for a transport failure without status or body.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: None,
            details: None,
        }
    }

    /// Transport failure that carries the response status.
    pub fn http_status(status: u16, message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            status: Some(status),
            details: None,
        }
    }

    /// Wrap this error with the context of the stage it escaped from.
    pub fn in_stage(self, index: usize, config: Option<RequestConfig>) -> Self {
        Self::Stage {
            index,
            config: config.map(Box::new),
            source: Box::new(self),
        }
    }

    /// The request config of the outermost failing stage.
    ///
    /// `None` when the failure is not stage-scoped or the outermost stage
    /// delegated to a nested flow.
    pub fn request_config(&self) -> Option<&RequestConfig> {
        match self {
            Self::Stage { config, .. } => config.as_deref(),
            _ => None,
        }
    }

    /// Index of the outermost failing stage.
    pub fn stage_index(&self) -> Option<usize> {
        match self {
            Self::Stage { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// The error as originally raised, with all stage wrappers removed.
    pub fn root_cause(&self) -> &RelayError {
        let mut err = self;
        while let Self::Stage { source, .. } = err {
            err = source;
        }
        err
    }

    /// Recover an HTTP-like status from the error.
    ///
    /// Looks at the explicit response status first, then `status` and
    /// `statusCode` inside the details object. Non-finite or out of range
    /// numbers are ignored.
    pub fn status(&self) -> Option<u16> {
        match self.root_cause() {
            Self::Transport {
                status, details, ..
            } => (*status).or_else(|| {
                let details = details.as_ref()?;
                finite_status(details.pointer("/response/status"))
                    .or_else(|| finite_status(details.get("status")))
                    .or_else(|| finite_status(details.get("statusCode")))
            }),
            _ => None,
        }
    }

    /// Whether the error belongs to the network class (connection drops,
    /// timeouts, aborts, or a transport message naming one of those).
    pub fn is_network_class(&self) -> bool {
        match self.root_cause() {
            Self::Network(_) | Self::Timeout(_) | Self::Aborted(_) => true,
            Self::Transport { message, .. } | Self::Stream(message) => {
                let lower = message.to_lowercase();
                NETWORK_KEYWORDS.iter().any(|k| lower.contains(k))
            }
            _ => false,
        }
    }

    /// Validation failures are raised before any network activity.
    pub fn is_validation(&self) -> bool {
        matches!(
            self.root_cause(),
            Self::UrlPolicy(_)
                | Self::InvalidConcurrency(_)
                | Self::MissingAdapter
                | Self::NestingTooDeep { .. }
                | Self::Config(_)
        )
    }
}

fn finite_status(value: Option<&serde_json::Value>) -> Option<u16> {
    let n = value?.as_f64()?;
    if n.is_finite() && n >= 0.0 && n <= f64::from(u16::MAX) && n.fract() == 0.0 {
        Some(n as u16)
    } else {
        None
    }
}
