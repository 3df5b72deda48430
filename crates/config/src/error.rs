use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),

    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidVar {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("unknown provider {0:?} (known providers: grok, openai)")]
    UnknownProvider(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
