//! Error types for token endpoint exchanges

/// Provider error codes meaning the refresh token itself is dead.
///
/// `invalid_grant` is the RFC 6749 code, the others are spellings used by
/// providers that report their own `status` field.
const INVALID_REFRESH_TOKEN_CODES: &[&str] =
    &["invalid_grant", "BAD_REFRESH_TOKEN", "invalid_refresh_token"];

/// Errors from a token endpoint exchange.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Network, DNS, timeout, or a response body we could not interpret.
    #[error("token endpoint transport failure: {0}")]
    Transport(String),

    /// The provider answered with a well-formed OAuth error.
    #[error("token endpoint rejected the grant ({code}): {description}")]
    Rejected { code: String, description: String },
}

impl ExchangeError {
    /// Whether the provider reported the refresh token as unusable, in which
    /// case the caller should forget it.
    pub fn invalidates_refresh_token(&self) -> bool {
        match self {
            ExchangeError::Rejected { code, .. } => INVALID_REFRESH_TOKEN_CODES
                .iter()
                .any(|known| known.eq_ignore_ascii_case(code)),
            ExchangeError::Transport(_) => false,
        }
    }

    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ExchangeError::Transport(_) => "transport",
            ExchangeError::Rejected { .. } => "rejected",
        }
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
