use reqwest::StatusCode;

/// Error raised while composing a page.
///
/// Fragment-local failures never surface here: they are reported through
/// [`crate::events::FragmentEventKind`] and replaced inline by fallback
/// content. This type covers the failures that decide the response head.
#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("template `{name}` not found")]
    TemplateNotFound {
        name: String,
        presentable: Option<String>,
    },

    #[error("failed to fetch template: {reason}")]
    TemplateFetch {
        reason: String,
        presentable: Option<String>,
    },

    #[error("failed to parse template: {reason}")]
    TemplateParse { reason: String },

    #[error("context fetch failed: {reason}")]
    Context { reason: String },

    #[error("primary fragment failed: {kind}")]
    PrimaryFragment { kind: FragmentErrorKind },

    #[error("downstream writer closed")]
    Downstream,

    #[error("composition cancelled")]
    Cancelled,

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl ComposeError {
    pub fn template_not_found(name: impl Into<String>) -> Self {
        Self::TemplateNotFound {
            name: name.into(),
            presentable: None,
        }
    }

    pub fn template_fetch(reason: impl Into<String>) -> Self {
        Self::TemplateFetch {
            reason: reason.into(),
            presentable: None,
        }
    }

    pub fn template_parse(reason: impl Into<String>) -> Self {
        Self::TemplateParse {
            reason: reason.into(),
        }
    }

    pub fn context(reason: impl Into<String>) -> Self {
        Self::Context {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Response status for errors raised before the head was written.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TemplateNotFound { .. } => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Optional error body safe to show to the client.
    pub fn presentable(&self) -> Option<&str> {
        match self {
            Self::TemplateNotFound { presentable, .. }
            | Self::TemplateFetch { presentable, .. } => presentable.as_deref(),
            _ => None,
        }
    }
}

/// Classification of a single fragment failure, carried in lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FragmentErrorKind {
    /// No response head within the fragment's timeout.
    Timeout,
    /// Transport-level failure (connect, reset, TLS).
    Transport { reason: String },
    /// Upstream answered with a non-success status.
    Status { status: StatusCode },
    /// The body stream failed after the response head was accepted.
    Body { reason: String },
    /// The request was cancelled before completing.
    Cancelled,
}

impl std::fmt::Display for FragmentErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timed out waiting for response"),
            Self::Transport { reason } => write!(f, "transport error: {reason}"),
            Self::Status { status } => write!(f, "upstream status {status}"),
            Self::Body { reason } => write!(f, "body error: {reason}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
