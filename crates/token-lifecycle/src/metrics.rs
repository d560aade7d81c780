//! Lifecycle counters
//!
//! Emitted through the `metrics` facade; the gateway installs the
//! Prometheus recorder. Without a recorder these calls are no-ops.
//!
//! - `token_exchanges_total` (counter): labels `grant`, `outcome`
//! - `token_cache_lookups_total` (counter): label `result`
//! - `token_refresh_tokens_invalidated_total` (counter)

/// Record one token endpoint exchange. `outcome` is `success`,
/// `transport` or `rejected`.
pub fn record_exchange(grant: &'static str, outcome: &'static str) {
    metrics::counter!("token_exchanges_total", "grant" => grant, "outcome" => outcome)
        .increment(1);
}

/// Record an access token cache lookup.
pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    metrics::counter!("token_cache_lookups_total", "result" => result).increment(1);
}

/// Record a refresh token dropped because the provider declared it invalid.
pub fn record_refresh_token_invalidated() {
    metrics::counter!("token_refresh_tokens_invalidated_total").increment(1);
}
