//! Signing identities: ed25519 keypairs, persistence, and `public_id` derivation.
//!
//! The dispatcher host keeps a persistent identity under `work_dir`:
//! ```text
//! ~/.agentic/
//! └── dispatcher-pkey{8-hex-chars}/
//!     ├── id_ed25519       (32-byte signing key seed, mode 0600)
//!     └── id_ed25519.pub   (32-byte verifying key, mode 0644)
//! ```
//!
//! Agent runtimes use [`Identity::ephemeral`] and advertise the verifying key
//! in their heartbeats. `public_id` is the first 8 hex characters of
//! `SHA256(verifying_key_bytes)`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::{config::Config, error::AppError};

const DIR_PREFIX: &str = "dispatcher-pkey";

/// Why a signature check failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("malformed public key: {0}")]
    MalformedKey(String),
    #[error("malformed signature: {0}")]
    MalformedSignature(String),
    #[error("signature does not match")]
    Mismatch,
}

/// A loaded or freshly generated signing identity.
#[derive(Clone)]
pub struct Identity {
    /// First 8 hex chars of `SHA256(verifying_key)`.
    pub public_id: String,
    /// Where the keypair is persisted; `None` for ephemeral identities.
    pub identity_dir: Option<PathBuf>,
    signing_key: SigningKey,
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("public_id", &self.public_id)
            .field("identity_dir", &self.identity_dir)
            .finish_non_exhaustive()
    }
}

impl Identity {
    /// In-memory identity that is never written to disk.
    pub fn ephemeral() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng), None)
    }

    fn from_signing_key(signing_key: SigningKey, identity_dir: Option<PathBuf>) -> Self {
        let public_id = compute_public_id(&signing_key.verifying_key().to_bytes());
        Self { public_id, identity_dir, signing_key }
    }

    pub fn verifying_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Hex-encoded verifying key, the form carried in heartbeats and registry records.
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.verifying_key_bytes())
    }

    /// Sign `message`, returning the base64 signature.
    pub fn sign(&self, message: &[u8]) -> String {
        BASE64.encode(self.signing_key.sign(message).to_bytes())
    }
}

/// Check a base64 `signature` over `message` against a hex public key.
pub fn verify_signature(
    public_key_hex: &str,
    message: &[u8],
    signature: &str,
) -> Result<(), SignatureError> {
    let key_bytes: [u8; 32] = hex::decode(public_key_hex)
        .map_err(|e| SignatureError::MalformedKey(e.to_string()))?
        .try_into()
        .map_err(|_| SignatureError::MalformedKey("expected 32 bytes".into()))?;
    let key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| SignatureError::MalformedKey(e.to_string()))?;

    let sig_bytes: [u8; 64] = BASE64
        .decode(signature)
        .map_err(|e| SignatureError::MalformedSignature(e.to_string()))?
        .try_into()
        .map_err(|_| SignatureError::MalformedSignature("expected 64 bytes".into()))?;

    key.verify(message, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| SignatureError::Mismatch)
}

/// Load or create the dispatcher identity under `config.work_dir`.
pub fn setup(config: &Config) -> Result<Identity, AppError> {
    let dir = match &config.identity_dir {
        Some(dir) => dir.clone(),
        None => {
            let found = find_existing_identity_dirs(&config.work_dir)?;
            match found.as_slice() {
                [] => {
                    let identity = Identity::ephemeral();
                    let dir = config.work_dir.join(format!("{DIR_PREFIX}{}", identity.public_id));
                    return persist(identity, dir);
                }
                [only] => only.clone(),
                many => {
                    let names: Vec<String> = many
                        .iter()
                        .map(|d| {
                            d.file_name()
                                .map(|n| n.to_string_lossy().to_string())
                                .unwrap_or_else(|| d.display().to_string())
                        })
                        .collect();
                    return Err(AppError::Identity(format!(
                        "multiple identity directories found in {} ({}); set [runtime].identity_dir explicitly",
                        config.work_dir.display(),
                        names.join(", ")
                    )));
                }
            }
        }
    };

    if dir.join("id_ed25519").exists() {
        let signing_key = load_keypair(&dir)?;
        Ok(Identity::from_signing_key(signing_key, Some(dir)))
    } else {
        persist(Identity::ephemeral(), dir)
    }
}

// ── internals ────────────────────────────────────────────────────────────────

/// Derive `public_id`: first 8 hex chars of `SHA256(verifying_key_bytes)`.
pub fn compute_public_id(verifying_key_bytes: &[u8; 32]) -> String {
    let digest = Sha256::digest(verifying_key_bytes);
    hex::encode(digest)[..8].to_string()
}

fn persist(identity: Identity, dir: PathBuf) -> Result<Identity, AppError> {
    fs::create_dir_all(&dir)
        .map_err(|e| AppError::Identity(format!("cannot create identity dir: {e}")))?;
    save_keypair(&dir, &identity.signing_key)?;
    Ok(Identity { identity_dir: Some(dir), ..identity })
}

/// Save the seed to `dir/id_ed25519` (0600) and the verifying key to
/// `dir/id_ed25519.pub` (0644).
fn save_keypair(dir: &Path, signing_key: &SigningKey) -> Result<(), AppError> {
    let secret_path = dir.join("id_ed25519");
    let pub_path = dir.join("id_ed25519.pub");

    fs::write(&secret_path, signing_key.to_bytes())
        .map_err(|e| AppError::Identity(format!("cannot write id_ed25519: {e}")))?;
    fs::write(&pub_path, signing_key.verifying_key().to_bytes())
        .map_err(|e| AppError::Identity(format!("cannot write id_ed25519.pub: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&secret_path, fs::Permissions::from_mode(0o600))
            .map_err(|e| AppError::Identity(format!("cannot set permissions on id_ed25519: {e}")))?;
        fs::set_permissions(&pub_path, fs::Permissions::from_mode(0o644)).map_err(|e| {
            AppError::Identity(format!("cannot set permissions on id_ed25519.pub: {e}"))
        })?;
    }

    Ok(())
}

/// Load and cross-check the keypair stored in `dir`.
fn load_keypair(dir: &Path) -> Result<SigningKey, AppError> {
    let read32 = |name: &str| -> Result<[u8; 32], AppError> {
        fs::read(dir.join(name))
            .map_err(|e| AppError::Identity(format!("cannot read {name}: {e}")))?
            .try_into()
            .map_err(|_| AppError::Identity(format!("{name} is not 32 bytes")))
    };
    let seed = read32("id_ed25519")?;
    let vk = read32("id_ed25519.pub")?;

    let signing_key = SigningKey::from_bytes(&seed);
    if signing_key.verifying_key().to_bytes() != vk {
        return Err(AppError::Identity(
            "keypair mismatch: verifying key does not match signing key seed".into(),
        ));
    }
    Ok(signing_key)
}

/// `dispatcher-pkey*` subdirectories of `work_dir` that hold a seed file.
fn find_existing_identity_dirs(work_dir: &Path) -> Result<Vec<PathBuf>, AppError> {
    if !work_dir.exists() {
        return Ok(Vec::new());
    }
    let entries = fs::read_dir(work_dir)
        .map_err(|e| AppError::Identity(format!("cannot read work_dir: {e}")))?;
    let mut candidates: Vec<PathBuf> = entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(DIR_PREFIX))
        .map(|entry| entry.path())
        .filter(|path| path.join("id_ed25519").exists())
        .collect();
    candidates.sort();
    Ok(candidates)
}

// ── tests ────────────────────────────────────────────────────────────────────
