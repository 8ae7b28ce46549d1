//! # Local configuration store
//!
//! Durable storage for the agent's registration state: the boarding content,
//! the rotating client registration, the cached access token and any
//! data-source configuration. One [`AgentConfiguration`] is kept per client id.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Onboarding    │    │  Key Rotation   │    │  Token Cache    │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!           │                        │                        │
//!           ▼                        ▼                        ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                ConfigStore (one async mutex per client id)      │
//! └─────────────────────────────────────────────────────────────────┘
//!           │                                                 │
//!           ▼                                                 ▼
//! ┌─────────────────────────────┐             ┌─────────────────────────────┐
//! │  FileBackend                │             │  MemoryBackend              │
//! │  temp file + fsync + rename │             │  serialized values in a map │
//! └─────────────────────────────┘             └─────────────────────────────┘
//! ```
//!
//! # Guarantees
//!
//! - Writes for the same client id are serialized. Concurrent
//!   [`ConfigStore::save_config`] calls land in some total order and the stored
//!   value is always exactly one caller's configuration.
//! - [`FileBackend`] never exposes a half-written file: the new content is
//!   written to a sibling temp file, synced, then renamed over the old one.
//!   Each file carries a CRC32 of the configuration so corruption from outside
//!   the agent is detected on load instead of being parsed.
//! - [`ConfigStore::update`] is a linearized read-modify-write. Key rotation
//!   uses it so the new secret and the new registration access token become
//!   visible together.
//!
//! # Usage Examples
//!
//! ```rust,no_run
//! use libiot_agent::storage::ConfigStore;
//! use libiot_agent::agent::model::{AgentConfiguration, CredentialProfile, RegistrationContent};
//!
//! # async fn run() -> Result<(), libiot_agent::storage::error::Error> {
//! let store = ConfigStore::file("/var/lib/agent");
//! let content = RegistrationContent {
//!     base_url: "https://southgate.example".into(),
//!     iat: "eyJ...".into(),
//!     client_credential_profile: vec![CredentialProfile::SharedSecret],
//!     client_id: "a1b2c3".into(),
//!     tenant: "acme".into(),
//! };
//! let config = store.load_or_init(&content).await?;
//! assert!(!config.is_onboarded());
//! # Ok(())
//! # }
//! ```

#![allow(missing_docs)]
#![deny(unsafe_code)]

use crate::agent::model::{AgentConfiguration, RegistrationContent};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncWriteExt;

/// Common error types for storage operations
pub mod error;


use error::Error;

const ENVELOPE_VERSION: u32 = 1;

/// Where configurations are kept.
///
/// Backends only need atomic single-value writes; the per-key mutual exclusion
/// lives in [`ConfigStore`].
#[async_trait::async_trait]
pub trait ConfigBackend: Send + Sync {
    /// Returns the last durably written configuration for `client_id`.
    async fn load(&self, client_id: &str) -> Result<Option<AgentConfiguration>, Error>;

    /// Durably replaces the configuration stored under `config.client_id()`.
    async fn persist(&self, config: &AgentConfiguration) -> Result<(), Error>;
}

/// On-disk layout of one configuration file.
#[derive(Serialize, Deserialize)]
struct Envelope<'a> {
    version: u32,
    crc32: u32,
    #[serde(borrow)]
    config: &'a RawValue,
}

/// Stores each configuration as `<dir>/<client_id>.json`.
#[derive(Debug, Clone)]
pub struct FileBackend {
    dir: PathBuf,
}

impl FileBackend {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Client ids come from the platform; only plain file-name characters are
    /// accepted so a key can never escape the directory.
    fn path_for(&self, client_id: &str) -> Result<PathBuf, Error> {
        let valid = !client_id.is_empty()
            && !client_id.starts_with('.')
            && client_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(Error::InvalidKey(client_id.to_owned()));
        }
        Ok(self.dir.join(format!("{client_id}.json")))
    }
}

fn encode(config: &AgentConfiguration) -> Result<Vec<u8>, Error> {
    let raw = RawValue::from_string(serde_json::to_string(config)?)?;
    let envelope = Envelope {
        version: ENVELOPE_VERSION,
        crc32: crc32fast::hash(raw.get().as_bytes()),
        config: &*raw,
    };
    Ok(serde_json::to_vec(&envelope)?)
}

fn decode(client_id: &str, bytes: &[u8]) -> Result<AgentConfiguration, Error> {
    let envelope: Envelope<'_> = serde_json::from_slice(bytes)?;
    let actual = crc32fast::hash(envelope.config.get().as_bytes());
    if actual != envelope.crc32 {
        return Err(Error::Corrupt {
            client_id: client_id.to_owned(),
            expected: envelope.crc32,
            actual,
        });
    }
    Ok(serde_json::from_str(envelope.config.get())?)
}

#[async_trait::async_trait]
impl ConfigBackend for FileBackend {
    async fn load(&self, client_id: &str) -> Result<Option<AgentConfiguration>, Error> {
        let path = self.path_for(client_id)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::ReadError(e)),
        };
        decode(client_id, &bytes).map(Some)
    }

    async fn persist(&self, config: &AgentConfiguration) -> Result<(), Error> {
        let path = self.path_for(config.client_id())?;
        let bytes = encode(config)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(Error::WriteError)?;

        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", config.client_id(), uuid::Uuid::new_v4()));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(Error::WriteError(e));
        }

        // Make the rename itself durable.
        #[cfg(unix)]
        {
            if let Ok(dir) = tokio::fs::File::open(&self.dir).await {
                let _ = dir.sync_all().await;
            }
        }
        Ok(())
    }
}

/// Keeps serialized configurations in process memory.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConfigBackend for MemoryBackend {
    async fn load(&self, client_id: &str) -> Result<Option<AgentConfiguration>, Error> {
        let bytes = {
            let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.get(client_id).cloned()
        };
        bytes.map(|b| decode(client_id, &b)).transpose()
    }

    async fn persist(&self, config: &AgentConfiguration) -> Result<(), Error> {
        let bytes = encode(config)?;
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(config.client_id().to_owned(), bytes);
        Ok(())
    }
}

/// Lock-synchronized handle to a [`ConfigBackend`]. Cheap to clone.
#[derive(Clone)]
pub struct ConfigStore {
    backend: Arc<dyn ConfigBackend>,
    locks: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl std::fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigStore").finish_non_exhaustive()
    }
}

impl ConfigStore {
    pub fn new(backend: impl ConfigBackend + 'static) -> Self {
        Self {
            backend: Arc::new(backend),
            locks: Arc::default(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(MemoryBackend::new())
    }

    pub fn file(dir: impl Into<PathBuf>) -> Self {
        Self::new(FileBackend::new(dir))
    }

    /// Lock for `client_id`. Entries nobody holds are pruned on the way in,
    /// so the map only grows with the number of keys in use at once.
    fn key_lock(&self, client_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
        locks.retain(|key, lock| key == client_id || Arc::strong_count(lock) > 1);
        locks.entry(client_id.to_owned()).or_default().clone()
    }

    /// Returns the last durably written configuration.
    pub async fn get_config(&self, client_id: &str) -> Result<Option<AgentConfiguration>, Error> {
        self.backend.load(client_id).await
    }

    /// Returns the stored configuration for `content`, starting over when the
    /// boarding content on disk is not the caller's.
    ///
    /// A changed boarding key means a new registration: the stored response,
    /// token, derived endpoints and recovery history all belong to the old one
    /// and are discarded rather than merged.
    pub async fn load_or_init(
        &self,
        content: &RegistrationContent,
    ) -> Result<AgentConfiguration, Error> {
        let lock = self.key_lock(&content.client_id);
        let _guard = lock.lock().await;

        match self.backend.load(&content.client_id).await? {
            Some(stored) if stored.content == *content => Ok(stored),
            stored => {
                if stored.is_some() {
                    tracing::info!(
                        client_id = %content.client_id,
                        "boarding content changed, discarding stored registration"
                    );
                }
                let fresh = AgentConfiguration::new(content.clone());
                self.backend.persist(&fresh).await?;
                Ok(fresh)
            }
        }
    }

    /// Durably writes `config` and returns the value as stored.
    pub async fn save_config(
        &self,
        config: &AgentConfiguration,
    ) -> Result<AgentConfiguration, Error> {
        let lock = self.key_lock(config.client_id());
        let _guard = lock.lock().await;

        self.backend.persist(config).await?;
        self.backend
            .load(config.client_id())
            .await?
            .ok_or_else(|| Error::NotFound(config.client_id().to_owned()))
    }

    /// Applies `f` to the stored configuration and persists the result, with
    /// no other writer for this client id in between.
    pub async fn update<F>(&self, client_id: &str, f: F) -> Result<AgentConfiguration, Error>
    where
        F: FnOnce(&mut AgentConfiguration) + Send,
    {
        let lock = self.key_lock(client_id);
        let _guard = lock.lock().await;

        let mut config = self
            .backend
            .load(client_id)
            .await?
            .ok_or_else(|| Error::NotFound(client_id.to_owned()))?;
        f(&mut config);
        self.backend.persist(&config).await?;
        Ok(config)
    }
}
