//! Token lifecycle orchestration
//!
//! `TokenLifecycleManager` owns both stores and is the only writer to them.
//! Writes of a refresh/access token pair happen under the write half of
//! `commit_gate` with both store locks held and no yield between the two
//! inserts; lookups that read both stores take the read half, so a reader
//! never sees half of an update.
//!
//! Concurrent `get_access_token` misses for the same identity share one
//! refresh grant. The grant and its commit run in a spawned task, so a
//! caller that goes away (client disconnect) neither aborts the refresh nor
//! leaves its waiters to start another one.

use std::sync::Arc;
use std::time::Duration;

use common::Secret;
use oauth_exchange::{ClientCredentials, ExchangeError, TokenExchangeClient, TokenExchangeResponse};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::access_cache::{AccessToken, AccessTokenCache};
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TokenError};
use crate::flight::{Flight, SingleFlight};
use crate::refresh_store::RefreshTokenStore;

/// Share of the provider-stated lifetime we trust, in thousandths.
const EFFECTIVE_LIFETIME_PERMILLE: u64 = 750;

/// Cache TTL for a token the provider says lives `expires_in` seconds.
///
/// 75% of the stated lifetime, so a token is dropped well before the
/// provider would reject it.
pub fn effective_lifetime(expires_in: u64) -> Duration {
    Duration::from_millis(expires_in.saturating_mul(EFFECTIVE_LIFETIME_PERMILLE))
}

/// What a combined read of both stores found.
enum Lookup {
    Fresh(AccessToken),
    Stale(Option<Secret<String>>),
}

pub struct TokenLifecycleManager {
    inner: Arc<Lifecycle>,
    refreshes: SingleFlight<Result<AccessToken>>,
}

/// State shared with spawned refresh tasks.
struct Lifecycle {
    credentials: ClientCredentials,
    exchange: Arc<dyn TokenExchangeClient>,
    refresh_tokens: RefreshTokenStore,
    access_tokens: AccessTokenCache,
    commit_gate: RwLock<()>,
}

impl TokenLifecycleManager {
    pub fn new(credentials: ClientCredentials, exchange: Arc<dyn TokenExchangeClient>) -> Self {
        Self::with_clock(credentials, exchange, Arc::new(SystemClock))
    }

    pub fn with_clock(
        credentials: ClientCredentials,
        exchange: Arc<dyn TokenExchangeClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        info!(client_id = %credentials.client_id, "token lifecycle manager initialized");
        Self {
            inner: Arc::new(Lifecycle {
                credentials,
                exchange,
                refresh_tokens: RefreshTokenStore::new(),
                access_tokens: AccessTokenCache::new(clock),
                commit_gate: RwLock::new(()),
            }),
            refreshes: SingleFlight::new(),
        }
    }

    /// Trade a one-time authorization code for tokens.
    ///
    /// On success the refresh token (when the provider sent one) and the
    /// access token are stored for `identity`. On failure, or if the caller
    /// is dropped before the call returns, nothing is written.
    pub async fn exchange_authorization_code(
        &self,
        identity: &str,
        code: &str,
    ) -> std::result::Result<AccessToken, ExchangeError> {
        let inner = &self.inner;
        let request = inner.credentials.authorization_code_grant(code);
        match inner.exchange.exchange(request).await {
            Ok(response) => {
                crate::metrics::record_exchange("authorization_code", "success");
                let token = inner.commit(identity, response, None).await;
                info!(identity, "authorization code exchanged");
                Ok(token)
            }
            Err(e) => {
                crate::metrics::record_exchange("authorization_code", e.kind());
                warn!(identity, error = %e, "authorization code exchange failed");
                Err(e)
            }
        }
    }

    /// Whether a refresh token is on file for `identity`. Never touches the
    /// network or the access token cache.
    pub async fn is_authorized(&self, identity: &str) -> bool {
        let _gate = self.inner.commit_gate.read().await;
        self.inner.refresh_tokens.contains(identity).await
    }

    /// Return a live access token, refreshing it if the cached one is gone.
    ///
    /// Fails with `NotAuthorized` without any network call when no refresh
    /// token is stored.
    pub async fn get_access_token(&self, identity: &str) -> Result<AccessToken> {
        let mut retrying = false;
        loop {
            let lookup = self.inner.lookup(identity).await;
            if !retrying {
                crate::metrics::record_cache_lookup(matches!(lookup, Lookup::Fresh(_)));
            }
            let refresh_token = match lookup {
                Lookup::Fresh(token) => return Ok(token),
                Lookup::Stale(refresh_token) => refresh_token,
            };

            if refresh_token.is_none() {
                debug!(identity, "no refresh token on file");
                return Err(TokenError::NotAuthorized);
            }

            let mut waiting = match self.refreshes.join(identity) {
                Flight::Leader(leader) => {
                    let waiting = leader.subscribe();
                    let inner = self.inner.clone();
                    let identity = identity.to_owned();
                    tokio::spawn(async move {
                        let outcome = inner.refresh(&identity).await;
                        leader.finish(outcome);
                    });
                    waiting
                }
                Flight::Follower(waiting) => waiting,
            };

            match waiting.recv().await {
                Ok(outcome) => return outcome,
                Err(_) => {
                    debug!(identity, "refresh task went away, retrying");
                    retrying = true;
                }
            }
        }
    }

    /// Forget both tokens for `identity`.
    pub async fn invalidate(&self, identity: &str) {
        let inner = &self.inner;
        let _gate = inner.commit_gate.write().await;
        let mut refresh_tokens = inner.refresh_tokens.lock().await;
        let mut access_tokens = inner.access_tokens.lock().await;
        refresh_tokens.remove(identity);
        access_tokens.remove(identity);
        info!(identity, "tokens invalidated");
    }

    /// Read-only view of the refresh token store.
    pub fn refresh_tokens(&self) -> &RefreshTokenStore {
        &self.inner.refresh_tokens
    }

    /// Read-only view of the access token cache.
    pub fn access_tokens(&self) -> &AccessTokenCache {
        &self.inner.access_tokens
    }
}

impl Lifecycle {
    async fn lookup(&self, identity: &str) -> Lookup {
        let _gate = self.commit_gate.read().await;
        match self.access_tokens.get(identity).await {
            Some(token) => Lookup::Fresh(token),
            None => Lookup::Stale(self.refresh_tokens.get(identity).await),
        }
    }

    /// Run the refresh grant. Only the flight leader's task calls this.
    async fn refresh(&self, identity: &str) -> Result<AccessToken> {
        // A previous leader may have committed between our miss and taking the lead
        let refresh_token = match self.lookup(identity).await {
            Lookup::Fresh(token) => return Ok(token),
            Lookup::Stale(Some(refresh_token)) => refresh_token,
            Lookup::Stale(None) => return Err(TokenError::NotAuthorized),
        };

        debug!(identity, "access token stale, refreshing");
        let request = self.credentials.refresh_token_grant(refresh_token.clone());
        match self.exchange.exchange(request).await {
            Ok(response) => {
                crate::metrics::record_exchange("refresh_token", "success");
                let token = self.commit(identity, response, Some(&refresh_token)).await;
                info!(identity, "access token refreshed");
                Ok(token)
            }
            Err(e) => {
                crate::metrics::record_exchange("refresh_token", e.kind());
                if e.invalidates_refresh_token() {
                    self.forget_refresh_token(identity, &refresh_token).await;
                } else {
                    warn!(identity, error = %e, "access token refresh failed, keeping refresh token");
                }
                Err(TokenError::RefreshFailed(e))
            }
        }
    }

    /// Store a successful exchange result as one atomic update.
    ///
    /// `used` is the refresh token a refresh grant was made with. If the
    /// stored token no longer matches it (a code exchange or `invalidate`
    /// landed meanwhile) the newer state wins and nothing is written.
    async fn commit(
        &self,
        identity: &str,
        response: TokenExchangeResponse,
        used: Option<&Secret<String>>,
    ) -> AccessToken {
        let ttl = effective_lifetime(response.expires_in);
        let token = AccessToken::new(response.access_token);

        let _gate = self.commit_gate.write().await;
        let mut refresh_tokens = self.refresh_tokens.lock().await;
        if used.is_some_and(|used| refresh_tokens.get(identity) != Some(used)) {
            debug!(identity, "refresh token replaced during refresh, discarding result");
            return token;
        }
        let mut access_tokens = self.access_tokens.lock().await;

        // No await from here on: both stores change together or not at all
        if let Some(refresh_token) = response.refresh_token {
            refresh_tokens.insert(identity.to_owned(), Secret::new(refresh_token));
        }
        access_tokens.insert(identity, token.clone(), ttl);
        token
    }

    async fn forget_refresh_token(&self, identity: &str, used: &Secret<String>) {
        let _gate = self.commit_gate.write().await;
        if self.refresh_tokens.remove_if(identity, used).await {
            self.access_tokens.remove(identity).await;
            crate::metrics::record_refresh_token_invalidated();
            warn!(identity, "provider rejected refresh token, identity no longer authorized");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use oauth_exchange::TokenExchangeRequest;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Scripted {
        Reply(oauth_exchange::Result<TokenExchangeResponse>),
        Panic,
    }

    /// Token endpoint stand-in that replays queued outcomes and records
    /// every request it sees. Outcomes are taken in call order; refresh
    /// grants then wait `refresh_delay` before answering.
    #[derive(Default)]
    struct ScriptedExchange {
        outcomes: Mutex<VecDeque<Scripted>>,
        requests: Mutex<Vec<TokenExchangeRequest>>,
        calls: AtomicUsize,
        refresh_delay: Duration,
    }

    impl ScriptedExchange {
        fn with_refresh_delay(refresh_delay: Duration) -> Self {
            Self {
                refresh_delay,
                ..Self::default()
            }
        }

        fn then_ok(&self, access: &str, refresh: Option<&str>, expires_in: u64) -> &Self {
            self.outcomes
                .lock()
                .unwrap()
                .push_back(Scripted::Reply(Ok(TokenExchangeResponse {
                    access_token: access.into(),
                    refresh_token: refresh.map(Into::into),
                    expires_in,
                })));
            self
        }

        fn then_err(&self, error: ExchangeError) -> &Self {
            self.outcomes
                .lock()
                .unwrap()
                .push_back(Scripted::Reply(Err(error)));
            self
        }

        fn then_panic(&self) -> &Self {
            self.outcomes.lock().unwrap().push_back(Scripted::Panic);
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn last_grant_type(&self) -> Option<&'static str> {
            self.requests.lock().unwrap().last().map(|r| r.grant_type())
        }
    }

    impl TokenExchangeClient for ScriptedExchange {
        fn exchange(
            &self,
            request: TokenExchangeRequest,
        ) -> Pin<Box<dyn Future<Output = oauth_exchange::Result<TokenExchangeResponse>> + Send + '_>>
        {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let is_refresh = matches!(request, TokenExchangeRequest::RefreshTokenGrant { .. });
                self.requests.lock().unwrap().push(request);
                let outcome = self.outcomes.lock().unwrap().pop_front();
                if is_refresh && !self.refresh_delay.is_zero() {
                    tokio::time::sleep(self.refresh_delay).await;
                }
                match outcome {
                    Some(Scripted::Reply(result)) => result,
                    Some(Scripted::Panic) => panic!("scripted token endpoint crash"),
                    None => Err(ExchangeError::Transport("no scripted outcome".into())),
                }
            })
        }
    }

    fn rejected(code: &str) -> ExchangeError {
        ExchangeError::Rejected {
            code: code.into(),
            description: "rejected by test".into(),
        }
    }

    fn manager(exchange: Arc<ScriptedExchange>) -> (Arc<ManualClock>, TokenLifecycleManager) {
        let clock = Arc::new(ManualClock::new());
        let credentials =
            ClientCredentials::new("app-id", "app-secret", "http://localhost:3000/oauth-callback");
        let manager = TokenLifecycleManager::with_clock(credentials, exchange, clock.clone());
        (clock, manager)
    }

    async fn stored_refresh_token(manager: &TokenLifecycleManager, identity: &str) -> Option<String> {
        manager
            .refresh_tokens()
            .get(identity)
            .await
            .map(|token| token.expose().clone())
    }

    #[test]
    fn effective_lifetime_is_three_quarters() {
        assert_eq!(effective_lifetime(1800), Duration::from_secs(1350));
        assert_eq!(effective_lifetime(1), Duration::from_millis(750));
        assert_eq!(effective_lifetime(0), Duration::ZERO);
        assert_eq!(
            effective_lifetime(u64::MAX),
            Duration::from_millis(u64::MAX),
            "saturates instead of overflowing"
        );
    }

    #[tokio::test]
    async fn end_to_end_exchange_then_refresh_keeps_refresh_token() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_ok("AT2", None, 1800);
        let (clock, manager) = manager(exchange.clone());

        let token = manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        assert_eq!(token.as_str(), "AT1");
        assert!(manager.is_authorized("u1").await);
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT1");
        assert_eq!(exchange.calls(), 1, "cache hit must not call the provider");

        clock.advance(Duration::from_secs(1351));
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT2");
        assert_eq!(exchange.calls(), 2);
        assert_eq!(exchange.last_grant_type(), Some("refresh_token"));
        assert_eq!(stored_refresh_token(&manager, "u1").await.as_deref(), Some("RT1"));
    }

    #[tokio::test]
    async fn refresh_grant_carries_stored_refresh_token() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 60)
            .then_ok("AT2", Some("RT2"), 60);
        let (clock, manager) = manager(exchange.clone());

        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(60));
        manager.get_access_token("u1").await.unwrap();

        let requests = exchange.requests.lock().unwrap();
        assert_eq!(requests[0].form_fields()[4], ("code", "abc123"));
        assert_eq!(requests[1].form_fields()[4], ("refresh_token", "RT1"));
        drop(requests);
        assert_eq!(stored_refresh_token(&manager, "u1").await.as_deref(), Some("RT2"));
    }

    #[tokio::test]
    async fn token_is_served_until_three_quarters_of_lifetime() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 100)
            .then_ok("AT2", None, 100);
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();

        clock.advance(Duration::from_millis(74_999));
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT1");
        assert_eq!(exchange.calls(), 1);

        clock.advance(Duration::from_millis(1));
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT2");
        assert_eq!(exchange.calls(), 2, "expiry at exactly 0.75T must trigger refresh");
    }

    #[tokio::test]
    async fn authorization_outlives_access_token() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange.then_ok("AT1", Some("RT1"), 1800);
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();

        clock.advance(Duration::from_secs(7200));
        assert!(manager.access_tokens().get("u1").await.is_none());
        assert!(manager.is_authorized("u1").await);
        assert_eq!(exchange.calls(), 1, "is_authorized must not refresh");
    }

    #[tokio::test]
    async fn unknown_identity_is_not_authorized_without_network() {
        let exchange = Arc::new(ScriptedExchange::default());
        let (_clock, manager) = manager(exchange.clone());

        assert_eq!(
            manager.get_access_token("nobody").await,
            Err(TokenError::NotAuthorized)
        );
        assert!(!manager.is_authorized("nobody").await);
        assert_eq!(exchange.calls(), 0);
    }

    #[tokio::test]
    async fn failed_code_exchange_stores_nothing() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_err(rejected("BAD_AUTH_CODE"))
            .then_err(ExchangeError::Transport("connection refused".into()));
        let (_clock, manager) = manager(exchange.clone());

        let err = manager.exchange_authorization_code("u1", "stale").await.unwrap_err();
        assert_eq!(err, rejected("BAD_AUTH_CODE"));
        assert!(manager
            .exchange_authorization_code("u1", "abc123")
            .await
            .is_err());

        assert!(!manager.is_authorized("u1").await);
        assert!(manager.refresh_tokens().is_empty().await);
        assert!(manager.access_tokens().is_empty().await);
    }

    #[tokio::test]
    async fn failed_reexchange_keeps_prior_tokens() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_err(rejected("BAD_AUTH_CODE"));
        let (_clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();

        assert!(manager.exchange_authorization_code("u1", "used").await.is_err());
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT1");
        assert_eq!(stored_refresh_token(&manager, "u1").await.as_deref(), Some("RT1"));
    }

    #[tokio::test]
    async fn code_exchange_without_refresh_token_is_not_authorized() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange.then_ok("AT1", None, 1800);
        let (_clock, manager) = manager(exchange.clone());

        let token = manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        assert_eq!(token.as_str(), "AT1");
        assert!(!manager.is_authorized("u1").await);
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT1");
    }

    #[tokio::test]
    async fn transport_failure_on_refresh_keeps_refresh_token() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_err(ExchangeError::Transport("timed out".into()))
            .then_ok("AT2", None, 1800);
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        let err = manager.get_access_token("u1").await.unwrap_err();
        assert_eq!(
            err,
            TokenError::RefreshFailed(ExchangeError::Transport("timed out".into()))
        );
        assert!(manager.is_authorized("u1").await);
        assert_eq!(stored_refresh_token(&manager, "u1").await.as_deref(), Some("RT1"));
        assert!(manager.access_tokens().is_empty().await, "expired entry stays evicted");

        // Caller-driven retry succeeds with the same refresh token
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT2");
    }

    #[tokio::test]
    async fn unrelated_rejection_keeps_refresh_token() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_err(rejected("invalid_client"));
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        assert_eq!(
            manager.get_access_token("u1").await,
            Err(TokenError::RefreshFailed(rejected("invalid_client")))
        );
        assert!(manager.is_authorized("u1").await);
    }

    #[tokio::test]
    async fn invalidated_refresh_token_deauthorizes_identity() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_err(rejected("BAD_REFRESH_TOKEN"));
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        assert_eq!(
            manager.get_access_token("u1").await,
            Err(TokenError::RefreshFailed(rejected("BAD_REFRESH_TOKEN")))
        );
        assert!(!manager.is_authorized("u1").await);
        assert_eq!(
            manager.get_access_token("u1").await,
            Err(TokenError::NotAuthorized)
        );
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn sequential_refreshes_with_same_values_converge() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_ok("AT2", Some("RT1"), 1800)
            .then_ok("AT2", Some("RT1"), 1800);
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        let first = manager.get_access_token("u1").await.unwrap();
        let second = manager.get_access_token("u1").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(exchange.calls(), 2, "second call is a cache hit");

        clock.advance(Duration::from_secs(1351));
        let third = manager.get_access_token("u1").await.unwrap();
        assert_eq!(third, first);
        assert_eq!(manager.access_tokens().len().await, 1);
        assert_eq!(manager.refresh_tokens().len().await, 1);
        assert_eq!(stored_refresh_token(&manager, "u1").await.as_deref(), Some("RT1"));
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_refresh() {
        let exchange = Arc::new(ScriptedExchange::with_refresh_delay(Duration::from_millis(50)));
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_ok("AT2", None, 1800);
        let (clock, manager) = manager(exchange.clone());
        let manager = Arc::new(manager);
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_access_token("u1").await })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().as_str(), "AT2");
        }
        assert_eq!(exchange.calls(), 2, "one code exchange plus exactly one refresh");
    }

    #[tokio::test]
    async fn concurrent_misses_share_one_failure() {
        let exchange = Arc::new(ScriptedExchange::with_refresh_delay(Duration::from_millis(50)));
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_err(ExchangeError::Transport("timed out".into()));
        let (clock, manager) = manager(exchange.clone());
        let manager = Arc::new(manager);
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.get_access_token("u1").await })
            })
            .collect();

        for handle in handles {
            assert_eq!(
                handle.await.unwrap(),
                Err(TokenError::RefreshFailed(ExchangeError::Transport(
                    "timed out".into()
                )))
            );
        }
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test]
    async fn identities_refresh_independently() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT-a", Some("RT-a"), 1800)
            .then_ok("AT-b", Some("RT-b"), 3600)
            .then_ok("AT-a2", None, 1800);
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("a", "code-a").await.unwrap();
        manager.exchange_authorization_code("b", "code-b").await.unwrap();

        clock.advance(Duration::from_secs(1351));
        assert_eq!(manager.get_access_token("a").await.unwrap().as_str(), "AT-a2");
        assert_eq!(manager.get_access_token("b").await.unwrap().as_str(), "AT-b");
        assert_eq!(exchange.calls(), 3);
    }

    #[tokio::test]
    async fn invalidate_clears_both_stores() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange.then_ok("AT1", Some("RT1"), 1800);
        let (_clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();

        manager.invalidate("u1").await;
        assert!(!manager.is_authorized("u1").await);
        assert_eq!(
            manager.get_access_token("u1").await,
            Err(TokenError::NotAuthorized)
        );
    }

    fn spawn_get(
        manager: &Arc<TokenLifecycleManager>,
        identity: &'static str,
    ) -> tokio::task::JoinHandle<Result<AccessToken>> {
        let manager = manager.clone();
        tokio::spawn(async move { manager.get_access_token(identity).await })
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_caller_does_not_abort_refresh() {
        let exchange = Arc::new(ScriptedExchange::with_refresh_delay(Duration::from_millis(50)));
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_ok("AT2", Some("RT2"), 1800);
        let (clock, manager) = manager(exchange.clone());
        let manager = Arc::new(manager);
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        let leader = spawn_get(&manager, "u1");
        tokio::time::sleep(Duration::from_millis(1)).await;
        let followers: Vec<_> = (0..4).map(|_| spawn_get(&manager, "u1")).collect();
        tokio::time::sleep(Duration::from_millis(1)).await;

        leader.abort();
        assert!(leader.await.unwrap_err().is_cancelled());

        for follower in followers {
            assert_eq!(follower.await.unwrap().unwrap().as_str(), "AT2");
        }
        assert_eq!(exchange.calls(), 2, "one code exchange plus exactly one refresh");
        assert_eq!(stored_refresh_token(&manager, "u1").await.as_deref(), Some("RT2"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_commits_whole_pair_after_caller_is_dropped() {
        let exchange = Arc::new(ScriptedExchange::with_refresh_delay(Duration::from_millis(50)));
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_ok("AT2", Some("RT2"), 1800);
        let (clock, manager) = manager(exchange.clone());
        let manager = Arc::new(manager);
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        let caller = spawn_get(&manager, "u1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exchange.calls(), 2, "refresh grant is in flight");

        // Hold the cache so the commit has to wait for it
        let held = manager.inner.access_tokens.lock().await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(held);

        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT2");
        assert_eq!(stored_refresh_token(&manager, "u1").await.as_deref(), Some("RT2"));
        assert_eq!(exchange.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_code_exchange_writes_nothing() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange.then_ok("AT1", Some("RT1"), 1800);
        let (_clock, manager) = manager(exchange.clone());
        let manager = Arc::new(manager);

        let held = manager.inner.access_tokens.lock().await;
        let callback = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.exchange_authorization_code("u1", "abc123").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(exchange.calls(), 1, "provider answered, commit is waiting");

        callback.abort();
        assert!(callback.await.unwrap_err().is_cancelled());
        drop(held);

        assert!(!manager.is_authorized("u1").await);
        assert!(manager.refresh_tokens().is_empty().await);
        assert!(manager.access_tokens().is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn reader_waits_for_pending_commit() {
        let exchange = Arc::new(ScriptedExchange::default());
        exchange.then_ok("AT1", Some("RT1"), 1800);
        let (_clock, manager) = manager(exchange.clone());
        let manager = Arc::new(manager);

        let held = manager.inner.access_tokens.lock().await;
        let callback = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.exchange_authorization_code("u1", "abc123").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let reader = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.is_authorized("u1").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!reader.is_finished(), "reader must not see the refresh token alone");

        drop(held);
        assert!(reader.await.unwrap());
        assert_eq!(callback.await.unwrap().unwrap().as_str(), "AT1");
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT1");
    }

    #[tokio::test(start_paused = true)]
    async fn code_exchange_during_refresh_wins() {
        let exchange = Arc::new(ScriptedExchange::with_refresh_delay(Duration::from_millis(50)));
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_ok("AT-refreshed", Some("RT-refreshed"), 1800)
            .then_ok("AT-reinstall", Some("RT-reinstall"), 1800);
        let (clock, manager) = manager(exchange.clone());
        let manager = Arc::new(manager);
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        let refreshing = spawn_get(&manager, "u1");
        tokio::time::sleep(Duration::from_millis(10)).await;
        manager.exchange_authorization_code("u1", "second").await.unwrap();

        // The refreshing caller still gets the token the provider issued
        assert_eq!(refreshing.await.unwrap().unwrap().as_str(), "AT-refreshed");
        assert_eq!(
            stored_refresh_token(&manager, "u1").await.as_deref(),
            Some("RT-reinstall")
        );
        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT-reinstall");
        assert_eq!(exchange.calls(), 3);
    }

    #[tokio::test]
    async fn crashed_refresh_is_retried_and_counted_once() {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        let _guard = ::metrics::set_default_local_recorder(&recorder);

        let exchange = Arc::new(ScriptedExchange::default());
        exchange
            .then_ok("AT1", Some("RT1"), 1800)
            .then_panic()
            .then_ok("AT2", None, 1800);
        let (clock, manager) = manager(exchange.clone());
        manager.exchange_authorization_code("u1", "abc123").await.unwrap();
        clock.advance(Duration::from_secs(1351));

        assert_eq!(manager.get_access_token("u1").await.unwrap().as_str(), "AT2");
        assert_eq!(exchange.calls(), 3);

        let output = handle.render();
        assert!(
            output.contains("token_cache_lookups_total{result=\"miss\"} 1"),
            "got: {output}"
        );
        assert!(!output.contains("result=\"hit\""), "got: {output}");
    }
}
