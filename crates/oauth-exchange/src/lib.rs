//! OAuth2 authorization-code token endpoint client
//!
//! Translates the two grants this integration uses into the provider's
//! token endpoint wire format and maps every outcome into a typed result.
//! It keeps no state and never retries; the lifecycle crate decides what
//! to do with a failure.
//!
//! Flow:
//! 1. Route layer redirects the user to `authorize::authorization_url()`
//! 2. Provider calls back with a one-time code
//! 3. `TokenExchangeClient::exchange()` with `AuthorizationCodeGrant`
//! 4. Later, `TokenExchangeClient::exchange()` with `RefreshTokenGrant`

pub mod authorize;
pub mod constants;
pub mod error;
pub mod grant;
pub mod token;

pub use authorize::{authorization_url, normalize_scopes};
pub use constants::*;
pub use error::{ExchangeError, Result};
pub use grant::{ClientCredentials, TokenExchangeRequest};
pub use token::{HttpExchangeClient, TokenExchangeClient, TokenExchangeResponse};
