//! # Agent identity and token lifecycle
//!
//! An [`Agent`] is one device identity on the platform. It is created from a
//! boarding key, onboards once, and from then on keeps a rotating client
//! credential and short-lived access tokens under it.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Onboarding    │    │  TokenManager   │    │  KeyRotation    │
//! │  state machine  │    │  single-flight  │    │  serialized     │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!           │                   │    ▲                   │
//!           │                   │    │ get_token()       │
//!           │                   │ ┌─────────────────┐    │
//!           │                   │ │    Uploader     │    │
//!           │                   │ └─────────────────┘    │
//!           ▼                   ▼                        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │      Context: boarding content, credential, transport, store    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The configuration store is the single source of truth for registration
//! state. Each engine reads the current registration from it and writes back
//! through [`ConfigStore::update`], so there is no agent-wide mutable copy.
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use libiot_agent::agent::{Agent, Credential};
//! use libiot_agent::agent::model::BoardingKey;
//! use libiot_agent::config::AgentSettings;
//!
//! # async fn run(boarding_key: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let key: BoardingKey = serde_json::from_str(boarding_key)?;
//! let settings = AgentSettings::from_env()?;
//! let agent = Agent::connect(key.content, Credential::SharedSecret, settings).await?;
//!
//! agent.onboard().await?;
//! let token = agent.get_token().await?;
//! println!("{} valid for {}s", token.token_type, token.expires_in);
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]

use crate::config::AgentSettings;
use crate::network::http::ReqwestTransport;
use crate::network::{Request, Response, Transport};
use crate::storage::ConfigStore;
use crate::upload::Uploader;
use std::sync::Arc;

pub mod assertion;
pub mod error;
pub mod jwt;
pub mod model;
pub mod onboarding;
pub mod rotation;
pub mod token;

pub use assertion::{AssertionBuilder, Credential, RsaCredential};
pub use error::{AgentError, Operation, TransientCause};
pub use onboarding::Onboarding;
pub use rotation::KeyRotation;
pub use token::TokenManager;

use model::{
    AccessToken, AgentConfiguration, Endpoints, OnboardingStatus, RegistrationContent,
    RegistrationResponse,
};

/// State shared by the engines of one agent.
pub(crate) struct Context {
    pub(crate) content: RegistrationContent,
    pub(crate) credential: Credential,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) store: ConfigStore,
    pub(crate) settings: AgentSettings,
    pub(crate) endpoints: Endpoints,
}

impl Context {
    pub(crate) fn client_id(&self) -> &str {
        &self.content.client_id
    }

    pub(crate) async fn config(&self, op: Operation) -> Result<AgentConfiguration, AgentError> {
        self.store
            .get_config(self.client_id())
            .await
            .map_err(|e| AgentError::storage(op, self.client_id(), e))?
            .ok_or_else(|| {
                AgentError::storage(
                    op,
                    self.client_id(),
                    crate::storage::error::Error::NotFound(self.client_id().to_owned()),
                )
            })
    }

    /// The registration currently in the store.
    pub(crate) async fn registration(
        &self,
        op: Operation,
    ) -> Result<RegistrationResponse, AgentError> {
        self.config(op)
            .await?
            .response
            .ok_or_else(|| AgentError::NotOnboarded {
                operation: op,
                client_id: self.client_id().to_owned(),
            })
    }

    pub(crate) async fn update<F>(
        &self,
        op: Operation,
        f: F,
    ) -> Result<AgentConfiguration, AgentError>
    where
        F: FnOnce(&mut AgentConfiguration) + Send,
    {
        self.store
            .update(self.client_id(), f)
            .await
            .map_err(|e| AgentError::storage(op, self.client_id(), e))
    }

    pub(crate) async fn send(&self, op: Operation, request: Request) -> Result<Response, AgentError> {
        self.transport
            .execute(request)
            .await
            .map_err(|e| AgentError::transient(op, self.client_id(), e))
    }

    /// Maps a non-success response: `5xx` is transient, anything else is not.
    pub(crate) fn unexpected(&self, op: Operation, response: &Response) -> AgentError {
        if response.is_server_error() {
            AgentError::transient(
                op,
                self.client_id(),
                TransientCause::Status {
                    status: response.status_code,
                    body: response.text(),
                },
            )
        } else {
            AgentError::invalid(
                op,
                self.client_id(),
                format!("unexpected status {}: {}", response.status_code, response.text()),
            )
        }
    }
}

/// One onboarded (or onboardable) device identity.
pub struct Agent {
    ctx: Arc<Context>,
    onboarding: Onboarding,
    tokens: Arc<TokenManager>,
    rotation: KeyRotation,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("client_id", &self.ctx.client_id())
            .field("status", &self.onboarding.status())
            .finish_non_exhaustive()
    }
}

impl Agent {
    /// Creates an agent over the given transport and store.
    ///
    /// Loads any stored state for the boarding content's client id. Stored
    /// state from a different boarding key is discarded.
    pub async fn new(
        content: RegistrationContent,
        credential: Credential,
        transport: impl Transport + 'static,
        store: ConfigStore,
        settings: AgentSettings,
    ) -> Result<Self, AgentError> {
        let op = Operation::Configuration;
        if !content.allows(credential.profile()) {
            return Err(AgentError::invalid(
                op,
                &content.client_id,
                format!("boarding key does not allow {:?}", credential.profile()),
            ));
        }
        if content.base_url().is_empty() {
            return Err(AgentError::invalid(op, &content.client_id, "empty base url"));
        }

        let config = store
            .load_or_init(&content)
            .await
            .map_err(|e| AgentError::storage(op, &content.client_id, e))?;
        let endpoints = Endpoints::for_content(&content, settings.jwks_url.as_deref());
        tracing::debug!(
            client_id = %content.client_id,
            onboarded = config.is_onboarded(),
            "agent loaded"
        );

        let ctx = Arc::new(Context {
            content,
            credential,
            transport: Arc::new(transport),
            store,
            settings,
            endpoints,
        });
        Ok(Self {
            onboarding: Onboarding::new(ctx.clone(), config.is_onboarded()),
            tokens: Arc::new(TokenManager::new(ctx.clone(), config.access_token)),
            rotation: KeyRotation::new(ctx.clone()),
            ctx,
        })
    }

    /// Creates an agent with the HTTPS transport and file store described by `settings`.
    pub async fn connect(
        content: RegistrationContent,
        credential: Credential,
        settings: AgentSettings,
    ) -> Result<Self, AgentError> {
        let transport = ReqwestTransport::new(settings.request_timeout(), settings.proxy.as_deref())
            .map_err(|e| {
                AgentError::invalid(Operation::Configuration, &content.client_id, e.to_string())
            })?;
        let store = ConfigStore::file(settings.storage_dir.clone());
        Self::new(content, credential, transport, store, settings).await
    }

    pub fn client_id(&self) -> &str {
        self.ctx.client_id()
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.ctx.settings
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.ctx.endpoints
    }

    pub fn status(&self) -> OnboardingStatus {
        self.onboarding.status()
    }

    /// Onboards the agent, retrying transient failures under the configured policy.
    pub async fn onboard(&self) -> Result<OnboardingStatus, AgentError> {
        crate::network::retry::retry(self.ctx.settings.retry, || self.onboarding.onboard()).await
    }

    /// Like [`onboard`](Self::onboard), calling `hook` after every failed attempt.
    pub async fn onboard_with_hook<H>(&self, hook: H) -> Result<OnboardingStatus, AgentError>
    where
        H: FnMut(u32, &AgentError),
    {
        crate::network::retry::retry_with_hook(
            self.ctx.settings.retry,
            || self.onboarding.onboard(),
            hook,
        )
        .await
    }

    /// Whether the stored configuration holds a registration. No network I/O.
    pub async fn is_onboarded(&self) -> Result<bool, AgentError> {
        Ok(self.configuration().await?.is_onboarded())
    }

    pub async fn configuration(&self) -> Result<AgentConfiguration, AgentError> {
        self.ctx.config(Operation::Configuration).await
    }

    pub async fn get_token(&self) -> Result<AccessToken, AgentError> {
        self.tokens.get_token().await
    }

    pub async fn acquire_token(&self) -> Result<AccessToken, AgentError> {
        self.tokens.acquire_token().await
    }

    /// Forces a new access token, rotating the client secret first when it is
    /// about to expire. Returns whether the token changed.
    pub async fn renew_token(&self) -> Result<bool, AgentError> {
        let margin = self.ctx.settings.secret_rotation_margin_secs;
        if self.rotation.secret_expiring(margin).await? {
            tracing::info!(client_id = %self.client_id(), "client secret expiring, rotating before renewal");
            self.rotate_key().await?;
        }
        self.tokens.renew_token().await
    }

    pub async fn validate_token(&self) -> Result<bool, AgentError> {
        self.tokens.validate_token().await
    }

    pub async fn refresh_jwks(&self) -> Result<model::Jwks, AgentError> {
        self.tokens.refresh_jwks().await
    }

    pub async fn invalidate_token(&self) -> Result<(), AgentError> {
        self.tokens.invalidate().await
    }

    /// Rotates the client credential. Token requests already in flight
    /// finish first; the cached token is dropped with the old registration.
    pub async fn rotate_key(&self) -> Result<RegistrationResponse, AgentError> {
        self.tokens.exclusive(self.rotation.rotate_key()).await
    }

    pub async fn restore_registration(
        &self,
        snapshot: RegistrationResponse,
    ) -> Result<AgentConfiguration, AgentError> {
        self.tokens
            .exclusive(self.rotation.restore_registration(snapshot))
            .await
    }

    pub async fn secret_expiring(&self, margin_secs: u64) -> Result<bool, AgentError> {
        self.rotation.secret_expiring(margin_secs).await
    }

    /// Previously active registrations, newest first.
    pub async fn recovery_snapshots(&self) -> Result<Vec<RegistrationResponse>, AgentError> {
        Ok(self.configuration().await?.recovery)
    }

    pub async fn data_source_configuration(
        &self,
    ) -> Result<Option<serde_json::Value>, AgentError> {
        Ok(self.configuration().await?.data_source_configuration)
    }

    pub async fn put_data_source_configuration(
        &self,
        value: serde_json::Value,
    ) -> Result<AgentConfiguration, AgentError> {
        self.ctx
            .update(Operation::Configuration, move |cfg| {
                cfg.data_source_configuration = Some(value)
            })
            .await
    }

    pub async fn mapping_configuration(&self) -> Result<Option<serde_json::Value>, AgentError> {
        Ok(self.configuration().await?.mapping_configuration)
    }

    pub async fn put_mapping_configuration(
        &self,
        value: serde_json::Value,
    ) -> Result<AgentConfiguration, AgentError> {
        self.ctx
            .update(Operation::Configuration, move |cfg| {
                cfg.mapping_configuration = Some(value)
            })
            .await
    }

    /// The token currently cached in memory, if any.
    pub async fn cached_token(&self) -> Option<model::CachedToken> {
        self.tokens.cached().await
    }

    pub fn uploader(&self) -> Uploader {
        Uploader::new(self.ctx.clone(), self.tokens.clone())
    }
}
