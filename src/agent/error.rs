//! Error taxonomy for agent operations.
//!
//! Every variant names the operation that failed and the client id it failed
//! for, so callers can decide between retrying, re-onboarding and giving up
//! without parsing messages.

use crate::network::retry::Retryable;
use std::fmt;

/// The agent operation an error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Onboard,
    AcquireToken,
    ValidateToken,
    FetchJwks,
    RotateKey,
    Upload,
    Configuration,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Onboard => "onboard",
            Operation::AcquireToken => "acquire token",
            Operation::ValidateToken => "validate token",
            Operation::FetchJwks => "fetch jwks",
            Operation::RotateKey => "rotate key",
            Operation::Upload => "upload",
            Operation::Configuration => "configuration",
        })
    }
}

/// Why a transient failure happened.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransientCause {
    #[error(transparent)]
    Network(#[from] crate::network::Error),
    #[error("server returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("access token rejected")]
    Unauthorized,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// Connection failures, timeouts and 5xx responses. Safe to retry.
    #[error("{operation} failed for {client_id}: {cause}")]
    Transient {
        operation: Operation,
        client_id: String,
        #[source]
        cause: TransientCause,
    },

    /// The platform refused the boarding content (4xx on registration).
    #[error("onboarding rejected for {client_id} ({status}): {message}")]
    OnboardingRejected {
        client_id: String,
        status: u16,
        message: String,
    },

    /// Local state or a platform answer does not make sense; retrying will not help.
    #[error("{operation} failed for {client_id}: invalid configuration: {reason}")]
    InvalidConfiguration {
        operation: Operation,
        client_id: String,
        reason: String,
    },

    /// An operation that needs a registration was called before onboarding.
    #[error("{operation} failed for {client_id}: agent is not onboarded")]
    NotOnboarded {
        operation: Operation,
        client_id: String,
    },

    /// The registration access token was superseded by a later rotation.
    /// Only re-onboarding recovers from this.
    #[error("registration access token for {client_id} is no longer valid ({status})")]
    StaleRegistrationToken { client_id: String, status: u16 },

    /// The token does not verify against the tenant key set, even after a refresh.
    #[error("token for {client_id} failed signature validation: {reason}")]
    InvalidTokenSignature { client_id: String, reason: String },

    /// The platform's digest of the uploaded file differs from the local one.
    #[error("checksum mismatch uploading {path} for {client_id}: local {local}, remote {remote}")]
    ChecksumMismatch {
        client_id: String,
        path: String,
        local: String,
        remote: String,
    },

    /// A chunk kept failing; resume with `start_chunk = index`.
    #[error("chunk {index} of {path} failed for {client_id}: {source}")]
    ChunkFailed {
        client_id: String,
        path: String,
        index: usize,
        #[source]
        source: Box<AgentError>,
    },

    /// The local configuration store failed.
    #[error("{operation} failed for {client_id}: storage: {source}")]
    Storage {
        operation: Operation,
        client_id: String,
        #[source]
        source: crate::storage::error::Error,
    },

    /// Reading the upload source failed.
    #[error("reading {path} for {client_id} failed: {source}")]
    Io {
        client_id: String,
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    pub fn operation(&self) -> Operation {
        match self {
            AgentError::Transient { operation, .. }
            | AgentError::InvalidConfiguration { operation, .. }
            | AgentError::NotOnboarded { operation, .. }
            | AgentError::Storage { operation, .. } => *operation,
            AgentError::OnboardingRejected { .. } => Operation::Onboard,
            AgentError::StaleRegistrationToken { .. } => Operation::RotateKey,
            AgentError::InvalidTokenSignature { .. } => Operation::ValidateToken,
            AgentError::ChecksumMismatch { .. }
            | AgentError::ChunkFailed { .. }
            | AgentError::Io { .. } => Operation::Upload,
        }
    }

    pub fn client_id(&self) -> &str {
        match self {
            AgentError::Transient { client_id, .. }
            | AgentError::OnboardingRejected { client_id, .. }
            | AgentError::InvalidConfiguration { client_id, .. }
            | AgentError::NotOnboarded { client_id, .. }
            | AgentError::StaleRegistrationToken { client_id, .. }
            | AgentError::InvalidTokenSignature { client_id, .. }
            | AgentError::ChecksumMismatch { client_id, .. }
            | AgentError::ChunkFailed { client_id, .. }
            | AgentError::Storage { client_id, .. }
            | AgentError::Io { client_id, .. } => client_id,
        }
    }

    /// True when the agent must be onboarded again before it can continue.
    pub fn requires_reonboarding(&self) -> bool {
        matches!(
            self,
            AgentError::StaleRegistrationToken { .. } | AgentError::OnboardingRejected { .. }
        )
    }

    pub(crate) fn invalid(
        operation: Operation,
        client_id: &str,
        reason: impl Into<String>,
    ) -> Self {
        AgentError::InvalidConfiguration {
            operation,
            client_id: client_id.to_owned(),
            reason: reason.into(),
        }
    }

    pub(crate) fn transient(
        operation: Operation,
        client_id: &str,
        cause: impl Into<TransientCause>,
    ) -> Self {
        AgentError::Transient {
            operation,
            client_id: client_id.to_owned(),
            cause: cause.into(),
        }
    }

    pub(crate) fn storage(
        operation: Operation,
        client_id: &str,
        source: crate::storage::error::Error,
    ) -> Self {
        AgentError::Storage {
            operation,
            client_id: client_id.to_owned(),
            source,
        }
    }
}

impl Retryable for AgentError {
    fn is_retryable(&self) -> bool {
        match self {
            AgentError::Transient { cause, .. } => match cause {
                TransientCause::Network(err) => err.is_transient(),
                TransientCause::Status { .. } | TransientCause::Unauthorized => true,
            },
            _ => false,
        }
    }
}
