// SPDX-License-Identifier: MIT OR Apache-2.0
//! gwo-keyring
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! Labeled signing secrets with rotation. The keyring holds opaque key
//! records (HMAC-SHA256 or Ed25519), keeps at most one *active* key per
//! algorithm, signs with the active key, and verifies against the named
//! key, then the active keys, then every historical key so consumers keep
//! working across a rotation. Signatures travel as URL-safe base64 without
//! padding inside an envelope that always names the algorithm.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer, Verifier};
use gwo_core::{ZERO_DIGEST, sha256_hex};
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeMap;
use std::path::Path;

type HmacSha256 = Hmac<Sha256>;

/// Header naming the key id that signed a request or webhook body.
pub const HEADER_KEY_ID: &str = "X-Codex-KeyId";

/// Header carrying the body signature (URL-safe base64, no padding).
pub const HEADER_SIG: &str = "X-Codex-Sig";

/// Errors from keyring operations.
#[derive(Debug, thiserror::Error)]
pub enum KeyringError {
    /// No active key exists for the requested algorithm.
    #[error("no active {alg} key")]
    NoActiveKey {
        /// The algorithm that has no active key.
        alg: KeyAlgorithm,
    },
    /// The named key id is not in the ring.
    #[error("unknown key id: {key_id}")]
    UnknownKey {
        /// The missing key id.
        key_id: String,
    },
    /// A stored secret could not be used with its declared algorithm.
    #[error("malformed key material for {key_id}")]
    BadKeyMaterial {
        /// The offending key id.
        key_id: String,
    },
    /// Keyring persistence failed.
    #[error("keyring io: {0}")]
    Io(#[from] std::io::Error),
    /// Keyring document (de)serialization failed.
    #[error("keyring serde: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Supported signing algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyAlgorithm {
    /// HMAC over SHA-256 with an opaque shared secret.
    HmacSha256,
    /// Ed25519 with a stored 32-byte seed.
    Ed25519,
}

impl std::fmt::Display for KeyAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::HmacSha256 => f.write_str("hmac-sha256"),
            Self::Ed25519 => f.write_str("ed25519"),
        }
    }
}

/// Whether a key is the current signer for its algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    /// The current signer.
    Active,
    /// Demoted by a rotation; still valid for verification.
    Rotated,
}

/// One labeled key record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Key {
    /// Stable label.
    pub key_id: String,
    /// Signing algorithm.
    pub algorithm: KeyAlgorithm,
    /// Opaque secret: the HMAC secret itself, or a base64 Ed25519 seed.
    pub secret: String,
    /// Active or rotated.
    pub status: KeyStatus,
    /// When the key was created.
    pub created_ts: DateTime<Utc>,
    /// When the key was demoted, if it has been.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_ts: Option<DateTime<Utc>>,
}

/// Key metadata safe to expose over the API (no secret).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyInfo {
    /// Stable label.
    pub key_id: String,
    /// Signing algorithm.
    pub algorithm: KeyAlgorithm,
    /// Active or rotated.
    pub status: KeyStatus,
    /// When the key was created.
    pub created_ts: DateTime<Utc>,
    /// When the key was demoted, if it has been.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotated_ts: Option<DateTime<Utc>>,
}

/// A detached signature bound to its algorithm and key id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    /// Algorithm that produced the signature.
    pub alg: KeyAlgorithm,
    /// Key id that produced the signature.
    pub key_id: String,
    /// URL-safe base64 (no padding) signature bytes.
    pub sig: String,
}

/// One rotation-ledger line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Newly activated key id.
    pub kid: String,
    /// SHA-256 of the new key's secret (the secret itself never leaves).
    pub secret_sha256: String,
    /// When the rotation happened.
    pub ts: DateTime<Utc>,
    /// SHA-256 of the previous ledger line, or the zero digest for the first.
    pub prev: String,
}

/// Serialized keyring document (`keyring.json`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct KeyringDoc {
    keys: BTreeMap<String, Key>,
    active: BTreeMap<KeyAlgorithm, String>,
}

/// Labeled key store with a single active pointer per algorithm.
#[derive(Debug, Clone, Default)]
pub struct Keyring {
    keys: BTreeMap<String, Key>,
    active: BTreeMap<KeyAlgorithm, String>,
}

impl Keyring {
    /// Create an empty keyring.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a keyring with one active HMAC key (the bootstrap path).
    #[must_use]
    pub fn with_hmac_key(key_id: impl Into<String>, secret: impl Into<String>) -> Self {
        let mut ring = Self::new();
        ring.install(Key {
            key_id: key_id.into(),
            algorithm: KeyAlgorithm::HmacSha256,
            secret: secret.into(),
            status: KeyStatus::Active,
            created_ts: Utc::now(),
            rotated_ts: None,
        });
        ring
    }

    /// Install a key record. An `Active` key displaces the algorithm's
    /// previous active pointer (the old key is demoted to `Rotated`).
    pub fn install(&mut self, key: Key) {
        if key.status == KeyStatus::Active {
            if let Some(prev_id) = self.active.insert(key.algorithm, key.key_id.clone()) {
                if prev_id != key.key_id {
                    if let Some(prev) = self.keys.get_mut(&prev_id) {
                        prev.status = KeyStatus::Rotated;
                        prev.rotated_ts = Some(Utc::now());
                    }
                }
            }
        }
        self.keys.insert(key.key_id.clone(), key);
    }

    /// Next unused timestamp-based key id.
    fn fresh_key_id(&self) -> String {
        let base = format!("key-{}", Utc::now().timestamp_millis());
        if !self.keys.contains_key(&base) {
            return base;
        }
        let mut n = 1u32;
        loop {
            let id = format!("{base}-{n}");
            if !self.keys.contains_key(&id) {
                return id;
            }
            n += 1;
        }
    }

    /// Generate and activate a fresh key for `alg`, returning its id.
    ///
    /// HMAC secrets are 32 random bytes hex-encoded; Ed25519 stores a
    /// base64 seed.
    pub fn generate(&mut self, alg: KeyAlgorithm) -> String {
        let key_id = self.fresh_key_id();
        let secret = match alg {
            KeyAlgorithm::HmacSha256 => {
                let mut bytes = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut bytes);
                sha256_hex(&bytes)
            }
            KeyAlgorithm::Ed25519 => {
                let mut seed = [0u8; 32];
                rand::rngs::OsRng.fill_bytes(&mut seed);
                URL_SAFE_NO_PAD.encode(seed)
            }
        };
        self.install(Key {
            key_id: key_id.clone(),
            algorithm: alg,
            secret,
            status: KeyStatus::Active,
            created_ts: Utc::now(),
            rotated_ts: None,
        });
        key_id
    }

    /// Rotate the active key for `alg`: demote it, activate a new key
    /// (generated unless `secret` is given), and return the ledger entry to
    /// append.
    pub fn rotate(&mut self, alg: KeyAlgorithm, secret: Option<String>, prev_line_hash: String) -> LedgerEntry {
        let key_id = match secret {
            Some(secret) => {
                let key_id = self.fresh_key_id();
                self.install(Key {
                    key_id: key_id.clone(),
                    algorithm: alg,
                    secret,
                    status: KeyStatus::Active,
                    created_ts: Utc::now(),
                    rotated_ts: None,
                });
                key_id
            }
            None => self.generate(alg),
        };
        let secret_sha256 = sha256_hex(self.keys[&key_id].secret.as_bytes());
        LedgerEntry {
            kid: key_id,
            secret_sha256,
            ts: Utc::now(),
            prev: prev_line_hash,
        }
    }

    /// The active key id for `alg`, if any.
    #[must_use]
    pub fn active_key_id(&self, alg: KeyAlgorithm) -> Option<&str> {
        self.active.get(&alg).map(String::as_str)
    }

    /// Metadata for every key, secrets excluded, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<KeyInfo> {
        self.keys
            .values()
            .map(|k| KeyInfo {
                key_id: k.key_id.clone(),
                algorithm: k.algorithm,
                status: k.status,
                created_ts: k.created_ts,
                rotated_ts: k.rotated_ts,
            })
            .collect()
    }

    /// Sign with the active HMAC key.
    ///
    /// # Errors
    ///
    /// [`KeyringError::NoActiveKey`] when no HMAC key is active.
    pub fn sign(&self, body: &[u8]) -> Result<SignatureEnvelope, KeyringError> {
        self.sign_with(KeyAlgorithm::HmacSha256, body)
    }

    /// Sign with the active key of the given algorithm.
    ///
    /// # Errors
    ///
    /// [`KeyringError::NoActiveKey`] when the algorithm has no active key;
    /// [`KeyringError::BadKeyMaterial`] when the stored secret is unusable.
    pub fn sign_with(
        &self,
        alg: KeyAlgorithm,
        body: &[u8],
    ) -> Result<SignatureEnvelope, KeyringError> {
        let key_id = self
            .active
            .get(&alg)
            .ok_or(KeyringError::NoActiveKey { alg })?
            .clone();
        let key = &self.keys[&key_id];
        let sig = sign_raw(key, body)?;
        Ok(SignatureEnvelope {
            alg,
            key_id,
            sig: URL_SAFE_NO_PAD.encode(sig),
        })
    }

    /// Verify a signature.
    ///
    /// Tries the named key first (when given), then the active keys, then
    /// every remaining historical key so that verification keeps working
    /// across a rotation. Comparison is constant-time for HMAC.
    #[must_use]
    pub fn verify(&self, body: &[u8], sig_b64: &str, key_id: Option<&str>) -> bool {
        let Ok(sig) = URL_SAFE_NO_PAD.decode(sig_b64) else {
            return false;
        };

        if let Some(id) = key_id {
            return self
                .keys
                .get(id)
                .is_some_and(|k| verify_raw(k, body, &sig));
        }

        let mut tried: Vec<&str> = Vec::new();
        for id in self.active.values() {
            if let Some(k) = self.keys.get(id) {
                if verify_raw(k, body, &sig) {
                    return true;
                }
                tried.push(id);
            }
        }
        self.keys
            .values()
            .filter(|k| !tried.contains(&k.key_id.as_str()))
            .any(|k| verify_raw(k, body, &sig))
    }

    /// Verify against a full envelope (named key, algorithm must match).
    #[must_use]
    pub fn verify_envelope(&self, body: &[u8], envelope: &SignatureEnvelope) -> bool {
        match self.keys.get(&envelope.key_id) {
            Some(k) if k.algorithm == envelope.alg => {
                self.verify(body, &envelope.sig, Some(&envelope.key_id))
            }
            _ => false,
        }
    }

    /// Persist the keyring document to `path`.
    ///
    /// # Errors
    ///
    /// I/O or serialization failures.
    pub fn save(&self, path: &Path) -> Result<(), KeyringError> {
        let doc = KeyringDoc {
            keys: self.keys.clone(),
            active: self.active.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&doc)?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Load a keyring document from `path`.
    ///
    /// # Errors
    ///
    /// I/O or deserialization failures.
    pub fn load(path: &Path) -> Result<Self, KeyringError> {
        let raw = std::fs::read(path)?;
        let doc: KeyringDoc = serde_json::from_slice(&raw)?;
        Ok(Self {
            keys: doc.keys,
            active: doc.active,
        })
    }
}

/// Append a ledger entry as one JSON line, returning the line's hash for
/// chaining the next entry.
///
/// # Errors
///
/// I/O or serialization failures.
pub fn append_ledger(path: &Path, entry: &LedgerEntry) -> Result<String, KeyringError> {
    use std::io::Write;
    let line = serde_json::to_string(entry)?;
    let mut f = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(f, "{line}")?;
    Ok(sha256_hex(line.as_bytes()))
}

/// Hash of the last ledger line, or the zero digest for an empty ledger.
///
/// # Errors
///
/// I/O failures other than the file not existing.
pub fn last_ledger_hash(path: &Path) -> Result<String, KeyringError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .next_back()
            .map(|l| sha256_hex(l.as_bytes()))
            .unwrap_or_else(|| ZERO_DIGEST.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ZERO_DIGEST.to_string()),
        Err(e) => Err(e.into()),
    }
}

/// The last ledger entry, if the ledger has any.
///
/// # Errors
///
/// I/O failures other than the file not existing, or a corrupt line.
pub fn last_ledger_entry(path: &Path) -> Result<Option<LedgerEntry>, KeyringError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .next_back()
            .map(|l| serde_json::from_str(l).map_err(KeyringError::from))
            .transpose(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn sign_raw(key: &Key, body: &[u8]) -> Result<Vec<u8>, KeyringError> {
    match key.algorithm {
        KeyAlgorithm::HmacSha256 => {
            let mut mac = HmacSha256::new_from_slice(key.secret.as_bytes()).map_err(|_| {
                KeyringError::BadKeyMaterial {
                    key_id: key.key_id.clone(),
                }
            })?;
            mac.update(body);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        KeyAlgorithm::Ed25519 => {
            let signing = ed25519_signing_key(key)?;
            Ok(signing.sign(body).to_bytes().to_vec())
        }
    }
}

fn verify_raw(key: &Key, body: &[u8], sig: &[u8]) -> bool {
    match key.algorithm {
        KeyAlgorithm::HmacSha256 => {
            let Ok(mut mac) = HmacSha256::new_from_slice(key.secret.as_bytes()) else {
                return false;
            };
            mac.update(body);
            mac.verify_slice(sig).is_ok()
        }
        KeyAlgorithm::Ed25519 => {
            let Ok(signing) = ed25519_signing_key(key) else {
                return false;
            };
            let Ok(signature) = ed25519_dalek::Signature::from_slice(sig) else {
                return false;
            };
            signing.verifying_key().verify(body, &signature).is_ok()
        }
    }
}

fn ed25519_signing_key(key: &Key) -> Result<ed25519_dalek::SigningKey, KeyringError> {
    let seed = URL_SAFE_NO_PAD
        .decode(&key.secret)
        .map_err(|_| KeyringError::BadKeyMaterial {
            key_id: key.key_id.clone(),
        })?;
    let seed: [u8; 32] = seed.try_into().map_err(|_| KeyringError::BadKeyMaterial {
        key_id: key.key_id.clone(),
    })?;
    Ok(ed25519_dalek::SigningKey::from_bytes(&seed))
}
