//! HTTP request and response types for the agent's platform calls.
//!
//! The agent only needs two verbs and four body shapes: JSON for onboarding and
//! registration management, URL-encoded forms for the token exchange, and
//! `multipart/form-data` for chunk uploads. Request headers are kept in a
//! bounded list; no agent request ever carries more than a handful.
//!
//! # Usage
//!
//! ```rust,no_run
//! use libiot_agent::network::http::{Body, ReqwestTransport, Request};
//! use libiot_agent::network::Transport;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), libiot_agent::network::Error> {
//! let transport = ReqwestTransport::new(Duration::from_secs(30), None)?;
//! let request = Request::post("https://platform.example/register", Body::Json(serde_json::json!({})))
//!     .bearer("initial-access-token")?;
//! let response = transport.execute(request).await?;
//! assert!(response.status_code > 0);
//! # Ok(())
//! # }
//! ```

/// HTTP client implementation and supporting types.
pub mod client;

pub use client::{Body, Header, MAX_HEADERS, Method, Part, ReqwestTransport, Request, Response};
