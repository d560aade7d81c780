//! Provider endpoint defaults
//!
//! Used when the gateway config does not override them.

use std::time::Duration;

/// Authorization page the user is redirected to.
pub const DEFAULT_AUTHORIZE_URL: &str = "https://app.hubspot.com/oauth/authorize";

/// Token endpoint for code exchange and token refresh.
pub const DEFAULT_TOKEN_URL: &str = "https://api.hubapi.com/oauth/v1/token";

/// Upper bound on a single token endpoint round-trip.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);
