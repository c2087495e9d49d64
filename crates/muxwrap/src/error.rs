use crate::directive::DirectiveError;

/// Errors that stop a request before any process is spawned.
#[derive(Debug, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Missing required input: {0}")]
    MissingInput(&'static str),

    #[error("Malformed directive: {0}")]
    Directive(#[from] DirectiveError),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Conflicting options: {0}")]
    Conflict(String),

    #[error("Invalid proxy configuration: {0}")]
    Proxy(String),

    #[error("Invalid option '{name}': {reason}")]
    InvalidOption { name: &'static str, reason: String },

    #[error("Tool '{name}' not found: {reason}")]
    ToolNotFound { name: String, reason: String },
}

impl ConfigurationError {
    pub fn invalid_option(name: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            name,
            reason: reason.into(),
        }
    }

    pub fn invalid_url(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether the error comes from the input URL rather than static options.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            Self::MissingInput(_) | Self::Directive(_) | Self::InvalidUrl { .. }
        )
    }
}
