//! Onboarding state machine.
//!
//! ```text
//!  NotOnboarded ──onboard()──▶ Onboarding ──2xx──▶ Onboarded
//!        ▲                        │  │
//!        └────────4xx─────────────┘  └──5xx / network──▶ Onboarding (retry)
//! ```
//!
//! `Onboarded` is terminal for the life of a registration. A configuration
//! that already holds a registration response starts there and `onboard()`
//! returns without contacting the platform.

use super::Context;
use super::error::{AgentError, Operation};
use super::model::{OnboardingStatus, RegistrationResponse};
use crate::network::{Body, Request};
use crate::network::retry::Retryable;
use serde_json::json;
use std::sync::{Arc, Mutex};
use tokio::sync::Mutex as AsyncMutex;

pub struct Onboarding {
    ctx: Arc<Context>,
    status: Mutex<OnboardingStatus>,
    lock: AsyncMutex<()>,
}

impl std::fmt::Debug for Onboarding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Onboarding")
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Onboarding {
    pub(crate) fn new(ctx: Arc<Context>, onboarded: bool) -> Self {
        let status = if onboarded {
            OnboardingStatus::Onboarded
        } else {
            OnboardingStatus::NotOnboarded
        };
        Self {
            ctx,
            status: Mutex::new(status),
            lock: AsyncMutex::new(()),
        }
    }

    pub fn status(&self) -> OnboardingStatus {
        *self.status.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_status(&self, status: OnboardingStatus) {
        let mut current = self.status.lock().unwrap_or_else(|p| p.into_inner());
        // Onboarded only ends with the registration itself.
        if *current == OnboardingStatus::Onboarded {
            return;
        }
        if *current != status {
            tracing::debug!(client_id = %self.ctx.client_id(), from = ?*current, to = ?status, "onboarding status");
            *current = status;
        }
    }

    /// One registration attempt. Retrying is left to the caller.
    ///
    /// Concurrent calls are serialized; a caller that waited behind a
    /// successful attempt sees the stored registration and returns without
    /// registering again.
    pub async fn onboard(&self) -> Result<OnboardingStatus, AgentError> {
        let _guard = self.lock.lock().await;
        let config = self.ctx.config(Operation::Onboard).await?;
        if config.is_onboarded() {
            self.set_status(OnboardingStatus::Onboarded);
            return Ok(OnboardingStatus::Onboarded);
        }

        self.set_status(OnboardingStatus::Onboarding);
        match self.register().await {
            Ok(response) => {
                let depth = self.ctx.settings.recovery_depth;
                let endpoints = self.ctx.endpoints.clone();
                self.ctx
                    .update(Operation::Onboard, move |cfg| {
                        cfg.install_response(response, depth);
                        cfg.endpoints = Some(endpoints);
                    })
                    .await?;
                self.set_status(OnboardingStatus::Onboarded);
                tracing::info!(client_id = %self.ctx.client_id(), "agent onboarded");
                Ok(OnboardingStatus::Onboarded)
            }
            Err(err) => {
                if !err.is_retryable() {
                    self.set_status(OnboardingStatus::NotOnboarded);
                }
                Err(err)
            }
        }
    }

    async fn register(&self) -> Result<RegistrationResponse, AgentError> {
        let op = Operation::Onboard;
        let client_id = self.ctx.client_id();
        let mut body = json!({ "client_id": client_id });
        if let Some(jwks) = self.ctx.credential.attestation() {
            body["jwks"] = json!(jwks);
        }

        tracing::debug!(client_id, url = %self.ctx.endpoints.register, "registering agent");
        let request = Request::post(&self.ctx.endpoints.register, Body::Json(body))
            .bearer(&self.ctx.content.iat)
            .map_err(|e| AgentError::invalid(op, client_id, e.to_string()))?;
        let response = self.ctx.send(op, request).await?;

        if response.is_client_error() {
            return Err(AgentError::OnboardingRejected {
                client_id: client_id.to_owned(),
                status: response.status_code,
                message: response.text(),
            });
        }
        if !response.is_success() {
            return Err(self.ctx.unexpected(op, &response));
        }

        let registration: RegistrationResponse = response
            .json()
            .map_err(|e| AgentError::invalid(op, client_id, e.to_string()))?;
        if registration.client_id != client_id {
            return Err(AgentError::invalid(
                op,
                client_id,
                format!("platform registered client id {}", registration.client_id),
            ));
        }
        Ok(registration)
    }
}
