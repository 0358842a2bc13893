//! Key registry used by decrypting and verifying converters.
//!
//! Keys come from three places: the configuration (operator supplied), key
//! folders, and message content (e.g. traced session keys). Lower precedence
//! values are more authoritative and are tried first.
//!
//! ```
//! use rbel_core::keys::{RbelKey, RbelKeyManager, PRECEDENCE_OPERATOR_KEY, PRECEDENCE_TRACED_KEY};
//!
//! let manager = RbelKeyManager::new();
//! manager.add_key(RbelKey::symmetric("traced", vec![1; 32], "AES-GCM", PRECEDENCE_TRACED_KEY));
//! manager.add_key(RbelKey::symmetric("operator", vec![2; 32], "AES-GCM", PRECEDENCE_OPERATOR_KEY));
//!
//! let names: Vec<_> = manager.get_all_keys().iter().map(|k| k.name().to_string()).collect();
//! assert_eq!(names, vec!["operator", "traced"]);
//! ```

use std::path::Path;
use std::sync::Arc;

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::config::{KeyConfig, RbelConfig};
use crate::error::{CoreError, Result};

/// Precedence of keys given in the configuration.
pub const PRECEDENCE_OPERATOR_KEY: i32 = 0;

/// Precedence of keys loaded from key folders.
pub const PRECEDENCE_KEY_FOLDER: i32 = 10;

/// Precedence of session keys traced in message headers.
pub const PRECEDENCE_TRACED_KEY: i32 = 100;

/// Precedence of keys found inside message content.
pub const PRECEDENCE_MESSAGE_KEY: i32 = 110;

/// File extensions recognised in key folders.
const KEY_FILE_EXTENSIONS: &[&str] = &["key", "hex", "b64"];

/// What a key is used for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyKind {
    /// Secret key for a symmetric algorithm (`AES-GCM`, `HS256`, ...).
    Symmetric { algorithm: String },
    /// Private half of a key pair.
    Private,
    /// Public half of a key pair.
    Public,
}

/// A named piece of key material.
pub struct RbelKey {
    name: String,
    material: Zeroizing<Vec<u8>>,
    kind: KeyKind,
    precedence: i32,
    matching_public_key: Option<Arc<RbelKey>>,
    content_hash: [u8; 32],
}

impl std::fmt::Debug for RbelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RbelKey")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("precedence", &self.precedence)
            .field("len", &self.material.len())
            .field("matching_public_key", &self.matching_public_key.as_ref().map(|k| &k.name))
            .finish()
    }
}

impl PartialEq for RbelKey {
    fn eq(&self, other: &Self) -> bool {
        self.content_hash == other.content_hash
    }
}

impl Eq for RbelKey {}

impl RbelKey {
    fn build(name: String, material: Vec<u8>, kind: KeyKind, precedence: i32) -> Self {
        let content_hash: [u8; 32] = Sha256::digest(&material).into();
        Self {
            name,
            material: Zeroizing::new(material),
            kind,
            precedence,
            matching_public_key: None,
            content_hash,
        }
    }

    /// Creates a symmetric key.
    pub fn symmetric(
        name: impl Into<String>,
        material: Vec<u8>,
        algorithm: impl Into<String>,
        precedence: i32,
    ) -> Self {
        Self::build(
            name.into(),
            material,
            KeyKind::Symmetric {
                algorithm: algorithm.into(),
            },
            precedence,
        )
    }

    /// Creates a public key.
    pub fn public(name: impl Into<String>, material: Vec<u8>, precedence: i32) -> Self {
        Self::build(name.into(), material, KeyKind::Public, precedence)
    }

    /// Creates a private key without a known public counterpart.
    pub fn private(name: impl Into<String>, material: Vec<u8>, precedence: i32) -> Self {
        Self::build(name.into(), material, KeyKind::Private, precedence)
    }

    /// Creates a private key paired with its public key.
    ///
    /// This is the only way to set a matching key, so public keys never
    /// point at private keys.
    pub fn private_with_public(
        name: impl Into<String>,
        material: Vec<u8>,
        precedence: i32,
        public_key: RbelKey,
    ) -> Self {
        let mut key = Self::private(name, material, precedence);
        key.matching_public_key = Some(Arc::new(public_key));
        key
    }

    /// Builds a symmetric key from a configuration entry.
    pub fn from_config(config: &KeyConfig, precedence: i32) -> Result<Self> {
        let material = match (&config.hex, &config.base64) {
            (Some(hex), _) => decode_hex(&config.name, hex)?,
            (None, Some(b64)) => decode_base64(&config.name, b64)?,
            (None, None) => {
                return Err(CoreError::KeyMaterial {
                    name: config.name.clone(),
                    reason: "neither hex nor base64 given".to_string(),
                })
            }
        };
        Ok(Self::symmetric(
            config.name.clone(),
            material,
            config.algorithm.clone(),
            precedence,
        ))
    }

    /// Key name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw key material.
    ///
    /// Handle with care - this exposes sensitive key material.
    pub fn material(&self) -> &[u8] {
        &self.material
    }

    /// Key kind.
    pub fn kind(&self) -> &KeyKind {
        &self.kind
    }

    /// Symmetric algorithm, if this is a symmetric key.
    pub fn algorithm(&self) -> Option<&str> {
        match &self.kind {
            KeyKind::Symmetric { algorithm } => Some(algorithm),
            _ => None,
        }
    }

    /// Precedence (lower = tried first).
    pub fn precedence(&self) -> i32 {
        self.precedence
    }

    /// Public counterpart of a private key.
    pub fn matching_public_key(&self) -> Option<&Arc<RbelKey>> {
        self.matching_public_key.as_ref()
    }

    /// SHA-256 of the key material, used for deduplication.
    pub fn content_hash(&self) -> &[u8; 32] {
        &self.content_hash
    }
}

fn decode_hex(name: &str, text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(cleaned).map_err(|e| CoreError::KeyMaterial {
        name: name.to_string(),
        reason: e.to_string(),
    })
}

fn decode_base64(name: &str, text: &str) -> Result<Vec<u8>> {
    let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(&cleaned)
        .or_else(|_| URL_SAFE_NO_PAD.decode(cleaned.trim_end_matches('=')))
        .map_err(|e| CoreError::KeyMaterial {
            name: name.to_string(),
            reason: e.to_string(),
        })
}

/// Decodes the content of a key file: hex first, then base64.
fn decode_key_file(name: &str, text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    let looks_hex = !trimmed.is_empty()
        && trimmed.len() % 2 == 0
        && trimmed.chars().all(|c| c.is_ascii_hexdigit());
    if looks_hex {
        decode_hex(name, trimmed)
    } else {
        decode_base64(name, trimmed)
    }
}

/// Thread-safe registry of keys.
#[derive(Debug, Default)]
pub struct RbelKeyManager {
    keys: RwLock<Vec<Arc<RbelKey>>>,
}

impl RbelKeyManager {
    /// Creates an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a manager holding the configured keys and key folders.
    pub fn from_config(config: &RbelConfig) -> Result<Self> {
        let manager = Self::new();
        for key in &config.keys {
            manager.add_key(RbelKey::from_config(key, PRECEDENCE_OPERATOR_KEY)?);
        }
        for folder in &config.key_folders {
            manager.load_key_folder(folder, PRECEDENCE_KEY_FOLDER)?;
        }
        Ok(manager)
    }

    /// Registers a key. Returns false if it was empty or already known.
    ///
    /// Keys are identified by content: the same material under another name
    /// is not added again, and the first registration wins.
    pub fn add_key(&self, key: RbelKey) -> bool {
        if key.material.is_empty() {
            tracing::debug!("Ignoring empty key '{}'", key.name);
            return false;
        }
        let mut keys = self.keys.write();
        if keys.iter().any(|k| k.content_hash == key.content_hash) {
            tracing::trace!("Key '{}' already registered", key.name);
            return false;
        }
        tracing::debug!(
            "Registered key '{}' with precedence {}",
            key.name,
            key.precedence
        );
        keys.push(Arc::new(key));
        true
    }

    /// Snapshot of all keys, most authoritative first.
    pub fn get_all_keys(&self) -> Vec<Arc<RbelKey>> {
        let mut keys = self.keys.read().clone();
        keys.sort_by_key(|k| k.precedence);
        keys
    }

    /// Looks up a key by name.
    pub fn find_key_by_name(&self, name: &str) -> Option<Arc<RbelKey>> {
        self.keys.read().iter().find(|k| k.name == name).cloned()
    }

    /// Finds the private key whose matching public key has the given name.
    pub fn find_corresponding_private_key(&self, public_key_name: &str) -> Option<Arc<RbelKey>> {
        self.keys
            .read()
            .iter()
            .find(|k| {
                k.kind == KeyKind::Private
                    && k
                        .matching_public_key
                        .as_ref()
                        .is_some_and(|p| p.name == public_key_name)
            })
            .cloned()
    }

    /// Symmetric keys for an algorithm, most authoritative first.
    pub fn keys_for_algorithm(&self, algorithm: &str) -> Vec<Arc<RbelKey>> {
        self.get_all_keys()
            .into_iter()
            .filter(|k| {
                k.algorithm()
                    .is_some_and(|a| a.eq_ignore_ascii_case(algorithm))
            })
            .collect()
    }

    /// Loads every key file in a folder. Returns the number of new keys.
    ///
    /// Files with unreadable content are skipped with a warning.
    pub fn load_key_folder(&self, folder: impl AsRef<Path>, precedence: i32) -> Result<usize> {
        let folder = folder.as_ref();
        let mut added = 0;
        let mut entries: Vec<_> = std::fs::read_dir(folder)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .collect();
        entries.sort();

        for path in entries {
            let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
            if !path.is_file() || !KEY_FILE_EXTENSIONS.contains(&extension) {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let text = std::fs::read_to_string(&path)?;
            match decode_key_file(name, &text) {
                Ok(material) => {
                    let algorithm = if name.to_ascii_lowercase().contains("hmac") {
                        "HS256"
                    } else {
                        "AES-GCM"
                    };
                    if self.add_key(RbelKey::symmetric(name, material, algorithm, precedence)) {
                        added += 1;
                    }
                }
                Err(e) => tracing::warn!("Skipping key file {:?}: {}", path, e),
            }
        }
        tracing::info!("Loaded {} keys from {:?}", added, folder);
        Ok(added)
    }

    /// Number of registered keys.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Returns true if no keys are registered.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}
