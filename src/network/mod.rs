//! Network abstraction layer for the device agent
//!
//! Everything the agent sends to the platform goes through the [`Transport`]
//! trait: onboarding, token exchange, JWKS fetches, registration management and
//! chunk uploads. The trait is the seam between the agent's protocol logic and
//! the HTTP stack, so tests can drive the whole agent against an in-process
//! platform and production code can plug in [`http::ReqwestTransport`].
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Onboarding    │    │  Token / Key    │    │    Chunked      │
//! │                 │    │   Rotation      │    │    Upload       │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!           │                        │                        │
//!           ▼                        ▼                        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │              retry::retry  (bounded attempts + hook)            │
//! └─────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Transport::execute                         │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![allow(missing_docs)]
#![deny(unsafe_code)]

/// Common error types for network operations
pub mod error;

/// HTTP request/response types and the reqwest-backed transport.
pub mod http;

/// Bounded retry with exponential backoff.
pub mod retry;

pub use error::Error;
pub use http::{Body, Header, Method, Part, Request, Response};

/// Re-exports of common traits
pub mod prelude {
    pub use super::Transport;
    pub use super::retry::Retryable;
}

/// Executes HTTP requests on behalf of the agent.
///
/// Implementations must not interpret status codes: a `5xx` is a successful
/// transport round trip and is returned as a [`Response`]. Only failures to
/// complete the exchange (refused connection, timeout, broken body) are
/// reported as [`Error`].
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the complete response.
    async fn execute(&self, request: Request) -> Result<Response, Error>;
}

#[async_trait::async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn execute(&self, request: Request) -> Result<Response, Error> {
        (**self).execute(request).await
    }
}
