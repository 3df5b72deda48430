use thiserror::Error;

/// The fixed error taxonomy surfaced by provider adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Auth,
    RateLimit,
    ModelUnknown,
    Timeout,
    Transport,
    Other,
}

/// A classified upstream failure.
///
/// The adapter is the only place raw upstream errors are interpreted;
/// everything downstream branches on [`ProviderError::kind`].
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} rejected the credentials: {message}")]
    Auth { provider: String, message: String },

    #[error("{provider} rate limited the request: {message}")]
    RateLimit { provider: String, message: String },

    #[error("model not available on {provider}: {message}")]
    ModelUnknown { provider: String, message: String },

    #[error("request to {provider} timed out: {message}")]
    Timeout { provider: String, message: String },

    #[error("transport failure talking to {provider}: {message}")]
    Transport { provider: String, message: String },

    #[error("{provider} call failed: {message}")]
    Other { provider: String, message: String },
}

impl ProviderError {
    #[must_use]
    pub fn new(kind: ErrorKind, provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = message.into();
        match kind {
            ErrorKind::Auth => Self::Auth { provider, message },
            ErrorKind::RateLimit => Self::RateLimit { provider, message },
            ErrorKind::ModelUnknown => Self::ModelUnknown { provider, message },
            ErrorKind::Timeout => Self::Timeout { provider, message },
            ErrorKind::Transport => Self::Transport { provider, message },
            ErrorKind::Other => Self::Other { provider, message },
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth { .. } => ErrorKind::Auth,
            Self::RateLimit { .. } => ErrorKind::RateLimit,
            Self::ModelUnknown { .. } => ErrorKind::ModelUnknown,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Transport { .. } => ErrorKind::Transport,
            Self::Other { .. } => ErrorKind::Other,
        }
    }

    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Auth { provider, .. }
            | Self::RateLimit { provider, .. }
            | Self::ModelUnknown { provider, .. }
            | Self::Timeout { provider, .. }
            | Self::Transport { provider, .. }
            | Self::Other { provider, .. } => provider,
        }
    }
}
