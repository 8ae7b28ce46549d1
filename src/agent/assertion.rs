//! Client assertions proving possession of the registered credential.
//!
//! An assertion is a short-lived JWT with `iss = sub = client_id` and
//! `aud = token endpoint`. Shared-secret agents sign it with `HS256` keyed by
//! the current client secret; RSA agents sign it with `RS256` using a private
//! key the caller supplies and this crate never stores. Every call produces a
//! new `jti`, so an assertion is never reused.

use super::error::{AgentError, Operation};
use super::jwt::{self, JwtError};
use super::model::{
    CredentialProfile, JsonWebKey, Jwks, RegistrationContent, RegistrationResponse,
    now_epoch_secs,
};
use crate::config::MAX_ASSERTION_LIFETIME_SECS;
use rsa::RsaPrivateKey;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const CLIENT_ASSERTION_TYPE: &str = "urn:ietf:params:oauth:client-assertion-type:jwt-bearer";

/// An RSA signing key held in memory for the lifetime of the agent.
#[derive(Clone)]
pub struct RsaCredential {
    key: RsaPrivateKey,
    kid: String,
}

impl RsaCredential {
    pub fn new(key: RsaPrivateKey, kid: impl Into<String>) -> Self {
        Self {
            key,
            kid: kid.into(),
        }
    }

    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`) PEM.
    pub fn from_pem(pem: &str, kid: impl Into<String>) -> Result<Self, JwtError> {
        use rsa::pkcs1::DecodeRsaPrivateKey;
        use rsa::pkcs8::DecodePrivateKey;

        let key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|e| JwtError::InvalidKey(e.to_string()))?;
        Ok(Self::new(key, kid))
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub fn public_jwk(&self) -> JsonWebKey {
        jwt::to_jwk(&self.key.to_public_key(), &self.kid)
    }
}

impl fmt::Debug for RsaCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RsaCredential")
            .field("kid", &self.kid)
            .finish_non_exhaustive()
    }
}

/// The credential kind an agent was constructed with.
#[derive(Debug, Clone)]
pub enum Credential {
    /// Signs with the client secret from the current registration.
    SharedSecret,
    Rsa(RsaCredential),
}

impl Credential {
    pub fn profile(&self) -> CredentialProfile {
        match self {
            Credential::SharedSecret => CredentialProfile::SharedSecret,
            Credential::Rsa(_) => CredentialProfile::Rsa3072,
        }
    }

    /// Public key material sent with onboarding and rotation requests.
    pub fn attestation(&self) -> Option<Jwks> {
        match self {
            Credential::SharedSecret => None,
            Credential::Rsa(rsa) => Some(Jwks {
                keys: vec![rsa.public_jwk()],
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssertionClaims {
    pub iss: String,
    pub sub: String,
    pub aud: String,
    pub iat: u64,
    pub nbf: u64,
    pub exp: u64,
    pub jti: String,
    pub ten: String,
}

#[derive(Debug, Clone, Copy)]
pub struct AssertionBuilder {
    lifetime_secs: u64,
}

impl AssertionBuilder {
    pub fn new(lifetime_secs: u64) -> Self {
        Self {
            lifetime_secs: lifetime_secs.clamp(1, MAX_ASSERTION_LIFETIME_SECS),
        }
    }

    pub fn build(
        &self,
        credential: &Credential,
        content: &RegistrationContent,
        response: &RegistrationResponse,
        audience: &str,
    ) -> Result<String, AgentError> {
        self.build_at(credential, content, response, audience, now_epoch_secs())
    }

    pub fn build_at(
        &self,
        credential: &Credential,
        content: &RegistrationContent,
        response: &RegistrationResponse,
        audience: &str,
        now: u64,
    ) -> Result<String, AgentError> {
        let client_id = &response.client_id;
        let claims = AssertionClaims {
            iss: client_id.clone(),
            sub: client_id.clone(),
            aud: audience.to_owned(),
            iat: now,
            nbf: now,
            exp: now + self.lifetime_secs,
            jti: uuid::Uuid::new_v4().to_string(),
            ten: content.tenant.clone(),
        };

        let signed = match credential {
            Credential::SharedSecret => {
                let secret = response.client_secret.as_deref().ok_or_else(|| {
                    AgentError::invalid(
                        Operation::AcquireToken,
                        client_id,
                        "registration has no client secret",
                    )
                })?;
                jwt::sign_hs256(None, &claims, secret.as_bytes())
            }
            Credential::Rsa(rsa) => jwt::sign_rs256(Some(&rsa.kid), &claims, &rsa.key),
        };
        signed.map_err(|e| AgentError::invalid(Operation::AcquireToken, client_id, e.to_string()))
    }
}
