//! # libiot-agent - device identity for cloud IoT platforms
//!
//! The device-side agent of the libiot SDK. It onboards a device to a
//! multi-tenant IoT platform with a boarding key, keeps a rotating client
//! credential and short-lived access tokens under it, and uploads data with
//! resumable, checksum-verified chunked transfers.
//!
//! ## Features
//!
//! ### Identity
//! - **Onboarding**: `NotOnboarded → Onboarding → Onboarded` with transient
//!   failures retried and rejections surfaced immediately
//! - **Client assertions**: `HS256` for shared-secret agents, `RS256` for RSA agents
//! - **Key rotation**: atomic replacement of the client secret and registration
//!   access token, with a bounded history of earlier registrations
//!
//! ### Tokens
//! - Single-flight acquisition: concurrent callers share one token request
//! - Validation against the tenant key set, refreshing it once on failure
//!
//! ### Data
//! - Chunked uploads with bounded parallelism, per-chunk retry, resume and MD5
//!   verification
//!
//! ### Storage
//! - Crash-safe configuration files (temp file, fsync, rename) with CRC32
//!   integrity checks and per-client-id locking
//!
//! ## Usage
//!
//! Add this to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! libiot-agent = "0.1.0"
//! ```
//!
//! ### Onboard and upload
//!
//! ```rust,no_run
//! use libiot_agent::{Agent, AgentSettings, Credential};
//! use libiot_agent::agent::model::BoardingKey;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let key: BoardingKey = serde_json::from_str(&std::fs::read_to_string("boarding.json")?)?;
//! let agent = Agent::connect(key.content, Credential::SharedSecret, AgentSettings::default()).await?;
//! agent.onboard().await?;
//!
//! let uploader = agent.uploader();
//! let request = uploader
//!     .request("telemetry.csv", "text/csv")
//!     .chunked(1024 * 1024);
//! let outcome = uploader.upload(&request).await?;
//! println!("stored {} ({} chunks)", outcome.md5, outcome.total_chunks);
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! Any target with `std` and tokio: Linux gateways, Raspberry Pi class
//! devices and servers. TLS is provided by rustls.

#![deny(missing_docs)]
#![warn(missing_debug_implementations)]
#![doc(html_root_url = "https://shishir-dey.github.io/libiot/")]

/// Agent identity: onboarding, client assertions, tokens and key rotation.
pub mod agent;

/// Agent settings loaded from TOML or the environment.
pub mod config;

/// Transport abstraction, HTTP types and the retry utility.
pub mod network;

/// Durable, lock-synchronized storage for agent configurations.
pub mod storage;

/// Chunked, resumable, checksum-verified uploads.
pub mod upload;

pub use agent::{Agent, AgentError, Credential, RsaCredential};
pub use config::AgentSettings;
pub use storage::ConfigStore;
pub use upload::{UploadOutcome, UploadRequest, Uploader};
