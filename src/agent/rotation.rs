//! Client credential rotation against the registration-management endpoint.
//!
//! Each successful rotation returns a new client secret (or re-attests the RSA
//! key) and a new registration access token. The platform invalidates the old
//! registration access token at the same moment, so the new registration is
//! installed with a single store update: the old one moves to the recovery
//! list and the cached access token is cleared, all in one write.

use super::Context;
use super::error::{AgentError, Operation};
use super::model::{AgentConfiguration, RegistrationResponse, now_epoch_secs};
use crate::network::{Body, Request};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

pub struct KeyRotation {
    ctx: Arc<Context>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for KeyRotation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyRotation")
            .field("client_id", &self.ctx.client_id())
            .finish_non_exhaustive()
    }
}

impl KeyRotation {
    pub(crate) fn new(ctx: Arc<Context>) -> Self {
        Self {
            ctx,
            lock: Mutex::new(()),
        }
    }

    /// Rotates the registered credential and returns the new registration.
    ///
    /// Not idempotent: a request that reached the platform has already
    /// invalidated the current registration access token, so callers must not
    /// blindly repeat it.
    pub async fn rotate_key(&self) -> Result<RegistrationResponse, AgentError> {
        let _guard = self.lock.lock().await;
        let op = Operation::RotateKey;
        let client_id = self.ctx.client_id();
        let current = self.ctx.registration(op).await?;

        let mut body = json!({ "client_id": current.client_id });
        if let Some(jwks) = self.ctx.credential.attestation() {
            body["jwks"] = json!(jwks);
        }
        tracing::debug!(client_id, url = %current.registration_client_uri, "rotating client credential");
        let request = Request::post(&current.registration_client_uri, Body::Json(body))
            .bearer(&current.registration_access_token)
            .map_err(|e| AgentError::invalid(op, client_id, e.to_string()))?;
        let response = self.ctx.send(op, request).await?;

        match response.status_code {
            401 | 403 => {
                return Err(AgentError::StaleRegistrationToken {
                    client_id: client_id.to_owned(),
                    status: response.status_code,
                });
            }
            _ if !response.is_success() => return Err(self.ctx.unexpected(op, &response)),
            _ => {}
        }

        let rotated: RegistrationResponse = response
            .json()
            .map_err(|e| AgentError::invalid(op, client_id, e.to_string()))?;
        if rotated.client_id != current.client_id {
            return Err(AgentError::invalid(
                op,
                client_id,
                format!("rotation changed client id to {}", rotated.client_id),
            ));
        }
        if rotated.client_secret_expires_at < current.client_secret_expires_at {
            tracing::warn!(
                client_id,
                previous = ?current.client_secret_expires_at,
                rotated = ?rotated.client_secret_expires_at,
                "rotated secret expires earlier than the previous one"
            );
        }

        let depth = self.ctx.settings.recovery_depth;
        let installed = rotated.clone();
        self.ctx
            .update(op, move |cfg| cfg.install_response(installed, depth))
            .await?;
        tracing::info!(client_id, "client credential rotated");
        Ok(rotated)
    }

    /// Installs an earlier registration, typically one of the recovery snapshots.
    ///
    /// Rotating afterwards only works if the snapshot's registration access
    /// token is still live on the platform, which stops being true as soon as
    /// a later rotation has happened.
    pub async fn restore_registration(
        &self,
        snapshot: RegistrationResponse,
    ) -> Result<AgentConfiguration, AgentError> {
        let _guard = self.lock.lock().await;
        let op = Operation::RotateKey;
        let client_id = self.ctx.client_id();
        if snapshot.client_id != client_id {
            return Err(AgentError::invalid(
                op,
                client_id,
                format!("snapshot belongs to {}", snapshot.client_id),
            ));
        }

        let depth = self.ctx.settings.recovery_depth;
        let config = self
            .ctx
            .update(op, move |cfg| cfg.install_response(snapshot, depth))
            .await?;
        tracing::info!(client_id, "registration restored from snapshot");
        Ok(config)
    }

    /// True when the client secret expires within `margin_secs`.
    ///
    /// Registrations without a secret expiry (RSA agents, or an expiry of
    /// zero) never report expiring.
    pub async fn secret_expiring(&self, margin_secs: u64) -> Result<bool, AgentError> {
        let current = self.ctx.registration(Operation::RotateKey).await?;
        Ok(match current.client_secret_expires_at {
            Some(0) | None => false,
            Some(expires_at) => expires_at <= now_epoch_secs().saturating_add(margin_secs),
        })
    }
}
