use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CrawlError {
    /// Shutdown or timeout signal observed mid-operation. The worker loop
    /// unwinds without ack/nack; lease expiry handles recovery.
    #[error("canceled")]
    Canceled,

    #[error("denied by robots.txt")]
    RobotsDenied,

    #[error("body too large: {size} bytes (max {max})")]
    TooLarge { size: u64, max: u64 },

    #[error("transient: {reason}")]
    Transient {
        reason: String,
        retry_after: Option<Duration>,
    },

    #[error("permanent: {reason}")]
    Permanent {
        status: Option<u16>,
        reason: String,
    },

    #[error("redirect chain exceeded {hops} hops")]
    RedirectLoop { hops: u32 },

    #[error("renderer error: {0}")]
    Renderer(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("parse error: {reason}")]
    Parse { permanent: bool, reason: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("config error: {0}")]
    Config(String),
}

impl CrawlError {
    pub fn transient(reason: impl Into<String>) -> Self {
        Self::Transient {
            reason: reason.into(),
            retry_after: None,
        }
    }

    pub fn permanent(status: Option<u16>, reason: impl Into<String>) -> Self {
        Self::Permanent {
            status,
            reason: reason.into(),
        }
    }

    /// Whether a nack-with-back-off is warranted. Canceled is neither: the
    /// caller must drop the record without acking and let the lease expire.
    pub fn retryable(&self) -> bool {
        match self {
            Self::Transient { .. } | Self::Renderer(_) | Self::Queue(_) | Self::Storage(_) => true,
            Self::Parse { permanent, .. } => !permanent,
            _ => false,
        }
    }

    /// Server-supplied retry hint, if the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Transient { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}
