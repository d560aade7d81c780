//! Error types for token lifecycle operations

use oauth_exchange::ExchangeError;

/// Errors from `TokenLifecycleManager::get_access_token`.
///
/// `Clone` so a single in-flight refresh can hand the same outcome to every
/// waiting caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenError {
    /// No refresh token on file; the user has to go through the
    /// authorization flow again.
    #[error("identity is not authorized")]
    NotAuthorized,

    #[error("access token refresh failed: {0}")]
    RefreshFailed(ExchangeError),
}

pub type Result<T> = std::result::Result<T, TokenError>;
