//! Access and refresh token lifecycle for an OAuth2 authorization-code
//! integration
//!
//! Turns a one-time authorization code into a refresh token plus a cached
//! access token, and transparently refreshes the access token once its
//! effective lifetime (75% of what the provider states) has elapsed.
//!
//! Per-identity lifecycle:
//! 1. Callback → `exchange_authorization_code()` → both stores written → fresh
//! 2. Effective lifetime elapses → cache reports the token absent → stale
//! 3. `get_access_token()` → single refresh grant per identity → fresh again
//! 4. Provider reports the refresh token invalid → identity unauthorized
//!
//! Failures never write partial state. The route layer only calls
//! `is_authorized()`, `get_access_token()` and `exchange_authorization_code()`.

pub mod access_cache;
pub mod clock;
pub mod error;
mod flight;
pub mod manager;
pub mod metrics;
pub mod refresh_store;
pub mod sweep;

pub use access_cache::{AccessToken, AccessTokenCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Result, TokenError};
pub use manager::{TokenLifecycleManager, effective_lifetime};
pub use refresh_store::RefreshTokenStore;
pub use sweep::spawn_sweep_task;
