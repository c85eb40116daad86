//! Credential persistence for the passkey signer
//!
//! Stores generated credentials and derived addresses in credentials.json,
//! keyed by fixed string keys. Read once at adapter construction, written
//! on first successful connect.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

/// One persisted credential record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredCredential {
    /// Generated credential identifier
    pub credential_id: String,

    /// Random salt mixed into address derivation
    pub salt: String,

    /// Address derived from the credential material
    pub derived_address: String,

    /// When the credential was first created
    pub created_at: DateTime<Utc>,
}

/// Credential file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CredentialFile {
    /// File format version
    #[serde(default = "default_version")]
    version: String,

    /// Records by fixed string key
    entries: HashMap<String, StoredCredential>,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for CredentialFile {
    fn default() -> Self {
        Self {
            version: default_version(),
            entries: HashMap::new(),
        }
    }
}

/// Key-value store backed by credentials.json
pub struct CredentialStore {
    /// Path to the credentials file
    path: PathBuf,

    /// In-memory records
    entries: HashMap<String, StoredCredential>,
}

impl CredentialStore {
    /// Load the store from a file path
    ///
    /// A missing or unreadable file yields an empty store; credentials are
    /// regenerable, so a corrupt file must not block startup.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(content) => match serde_json::from_str::<CredentialFile>(&content) {
                Ok(file) => {
                    info!("Loaded {} credential record(s)", file.entries.len());
                    file.entries
                }
                Err(e) => {
                    warn!("Credential file {} is corrupt, starting empty: {}", path.display(), e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    /// Get a record by key
    pub fn get(&self, key: &str) -> Option<&StoredCredential> {
        self.entries.get(key)
    }

    /// Insert a record and persist the file
    pub fn put(&mut self, key: &str, record: StoredCredential) -> Result<()> {
        self.entries.insert(key.to_string(), record);
        self.save()
    }

    /// Save all records to the credentials file
    fn save(&self) -> Result<()> {
        let file = CredentialFile {
            version: default_version(),
            entries: self.entries.clone(),
        };

        let json = serde_json::to_string_pretty(&file)
            .map_err(|e| Error::Store(format!("Failed to serialize credentials: {}", e)))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| Error::Store(format!("Failed to create {}: {}", parent.display(), e)))?;
            }
        }

        std::fs::write(&self.path, json)
            .map_err(|e| Error::Store(format!("Failed to write {}: {}", self.path.display(), e)))?;

        info!("Saved credential store");
        Ok(())
    }
}
