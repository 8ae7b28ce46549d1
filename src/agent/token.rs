//! Access token acquisition, caching and validation.
//!
//! Tokens are minted by presenting a fresh client assertion to the token
//! endpoint. The last token is cached in memory and in the configuration
//! store. The cache mutex is held for the whole acquisition, so concurrent
//! callers wait for the one request in flight and then share its result.
//!
//! Validation checks the token's RS256 signature against the tenant key set.
//! The key set rotates independently of the agent, so a failed check triggers
//! exactly one refetch before the token is declared invalid and discarded.

use super::Context;
use super::assertion::{AssertionBuilder, CLIENT_ASSERTION_TYPE};
use super::error::{AgentError, Operation};
use super::jwt;
use super::model::{AccessToken, CachedToken, Jwks, now_epoch_secs};
use crate::config::GrantStyle;
use crate::network::{Body, Request};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

pub struct TokenManager {
    ctx: Arc<Context>,
    cache: Mutex<Option<CachedToken>>,
    jwks: RwLock<Option<Jwks>>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("client_id", &self.ctx.client_id())
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    pub(crate) fn new(ctx: Arc<Context>, cached: Option<CachedToken>) -> Self {
        Self {
            ctx,
            cache: Mutex::new(cached),
            jwks: RwLock::new(None),
        }
    }

    /// The cached token, or a new one when the cache is empty or about to expire.
    pub async fn get_token(&self) -> Result<AccessToken, AgentError> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref() {
            if self.is_usable(cached) {
                return Ok(cached.token.clone());
            }
        }
        let fresh = self.request_token().await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }

    /// Always contacts the token endpoint and replaces the cache.
    pub async fn acquire_token(&self) -> Result<AccessToken, AgentError> {
        let mut cache = self.cache.lock().await;
        let fresh = self.request_token().await?;
        let token = fresh.token.clone();
        *cache = Some(fresh);
        Ok(token)
    }

    /// Forces an acquisition and reports whether the token actually changed.
    pub async fn renew_token(&self) -> Result<bool, AgentError> {
        let mut cache = self.cache.lock().await;
        let fresh = self.request_token().await?;
        let changed = cache.as_ref().is_none_or(|old| {
            old.token.access_token != fresh.token.access_token || old.token.jti != fresh.token.jti
        });
        *cache = Some(fresh);
        Ok(changed)
    }

    /// Verifies the current token against the tenant key set.
    ///
    /// Returns `Ok(true)` when the signature verifies. A token that still fails
    /// after one key set refresh is dropped from the cache and the store, and
    /// [`AgentError::InvalidTokenSignature`] is returned; the next
    /// [`get_token`](Self::get_token) acquires a replacement.
    pub async fn validate_token(&self) -> Result<bool, AgentError> {
        let token = self.get_token().await?.access_token;

        let known = self.jwks.read().await.clone();
        let jwks = match known {
            Some(jwks) => jwks,
            None => self.refresh_jwks().await?,
        };
        if jwt::verify_rs256(&token, &jwks).is_ok() {
            return Ok(true);
        }

        tracing::debug!(client_id = %self.ctx.client_id(), "token failed validation, refreshing key set");
        let jwks = self.refresh_jwks().await?;
        match jwt::verify_rs256(&token, &jwks) {
            Ok(_) => Ok(true),
            Err(err) => {
                tracing::warn!(client_id = %self.ctx.client_id(), %err, "discarding token with invalid signature");
                self.discard(Some(token.as_str())).await?;
                Err(AgentError::InvalidTokenSignature {
                    client_id: self.ctx.client_id().to_owned(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Fetches the tenant key set and makes it the one tokens are checked against.
    pub async fn refresh_jwks(&self) -> Result<Jwks, AgentError> {
        let op = Operation::FetchJwks;
        let client_id = self.ctx.client_id();
        tracing::debug!(client_id, url = %self.ctx.endpoints.jwks, "fetching key set");

        let response = self
            .ctx
            .send(op, Request::get(&self.ctx.endpoints.jwks))
            .await?;
        if !response.is_success() {
            return Err(self.ctx.unexpected(op, &response));
        }
        let jwks: Jwks = response
            .json()
            .map_err(|e| AgentError::invalid(op, client_id, e.to_string()))?;

        *self.jwks.write().await = Some(jwks.clone());
        Ok(jwks)
    }

    /// Drops the cached token so the next [`get_token`](Self::get_token) acquires.
    pub async fn invalidate(&self) -> Result<(), AgentError> {
        self.discard(None).await
    }

    /// Drops `access_token` if it is still the cached one. A token the
    /// platform refused may already have been replaced by a concurrent caller.
    pub async fn reject(&self, access_token: &str) -> Result<(), AgentError> {
        self.discard(Some(access_token)).await
    }

    /// Runs `change` with acquisition held off, dropping the cached token when
    /// it succeeds. Registration changes go through here so a token request
    /// never signs with a secret that is replaced while it is in flight.
    pub(crate) async fn exclusive<T, F>(&self, change: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>>,
    {
        let mut cache = self.cache.lock().await;
        let result = change.await;
        if result.is_ok() {
            *cache = None;
        }
        result
    }

    pub(crate) async fn cached(&self) -> Option<CachedToken> {
        self.cache.lock().await.clone()
    }

    fn is_usable(&self, cached: &CachedToken) -> bool {
        let now = now_epoch_secs();
        let margin = self.ctx.settings.token_refresh_margin_secs;
        if cached.is_expired(now, margin) {
            return false;
        }
        // The encoded expiry wins when the platform's clock disagrees with ours.
        match jwt::decode(&cached.token.access_token)
            .ok()
            .and_then(|d| d.expires_at())
        {
            Some(exp) => now.saturating_add(margin) < exp,
            None => true,
        }
    }

    /// Clears the cache, or only `token` when given and still cached.
    async fn discard(&self, token: Option<&str>) -> Result<(), AgentError> {
        let matches = |cached: &CachedToken| token.is_none_or(|t| cached.token.access_token == t);

        let mut cache = self.cache.lock().await;
        if cache.as_ref().is_some_and(matches) {
            *cache = None;
        }
        self.ctx
            .update(Operation::AcquireToken, |cfg| {
                if cfg.access_token.as_ref().is_some_and(matches) {
                    cfg.access_token = None;
                }
            })
            .await?;
        Ok(())
    }

    /// Runs one token request and persists the result. Caller holds the cache lock.
    async fn request_token(&self) -> Result<CachedToken, AgentError> {
        let op = Operation::AcquireToken;
        let client_id = self.ctx.client_id();
        let registration = self.ctx.registration(op).await?;
        let endpoint = &self.ctx.endpoints.token;

        let assertion = AssertionBuilder::new(self.ctx.settings.assertion_lifetime()).build(
            &self.ctx.credential,
            &self.ctx.content,
            &registration,
            endpoint,
        )?;
        let form = match self.ctx.settings.grant {
            GrantStyle::JwtBearer => vec![
                ("grant_type".to_owned(), JWT_BEARER_GRANT.to_owned()),
                ("assertion".to_owned(), assertion),
            ],
            GrantStyle::ClientCredentials => vec![
                ("grant_type".to_owned(), "client_credentials".to_owned()),
                ("client_id".to_owned(), client_id.to_owned()),
                ("client_assertion_type".to_owned(), CLIENT_ASSERTION_TYPE.to_owned()),
                ("client_assertion".to_owned(), assertion),
            ],
        };

        tracing::debug!(client_id, url = %endpoint, "requesting access token");
        let response = self
            .ctx
            .send(op, Request::post(endpoint, Body::Form(form)))
            .await?;
        if !response.is_success() {
            return Err(self.ctx.unexpected(op, &response));
        }
        let token: AccessToken = response
            .json()
            .map_err(|e| AgentError::invalid(op, client_id, e.to_string()))?;

        let cached = CachedToken::issued(token, now_epoch_secs());
        let stored = cached.clone();
        self.ctx
            .update(op, move |cfg| cfg.access_token = Some(stored))
            .await?;
        tracing::info!(client_id, jti = %cached.token.jti, expires_at = cached.expires_at, "access token acquired");
        Ok(cached)
    }
}
