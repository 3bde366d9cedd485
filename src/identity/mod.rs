// Copyright (c) 2026 Amunchain
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! Persistent Ed25519 node identity.
//!
//! A node has exactly one identity: an Ed25519 keypair and a `node_id`
//! derived as the lowercase hex of the first 16 bytes of SHA-256(public_key).
//! Identity is created on first open and immutable thereafter.
//!
//! Identity lives outside the repository it's signing for: `open_for_repo`
//! resolves the backing directory via `VCS_IDENTITY_DIR`, falling back to
//! the platform config dir keyed by `hex(SHA-256(absolute repo path))`.

use base64::{engine::general_purpose::STANDARD as b64, Engine as _};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;
use zeroize::Zeroize;

/// Identity vault errors.
#[derive(Debug, Error)]
pub enum IdentityError {
    /// Underlying filesystem operation failed.
    #[error("io error: {0}")]
    Io(String),
    /// Identity file is present but fails one of the load-time invariants.
    #[error("identity_corrupt")]
    Corrupt,
}

impl From<std::io::Error> for IdentityError {
    fn from(e: std::io::Error) -> Self {
        IdentityError::Io(e.to_string())
    }
}

/// Environment variable overriding the identity directory (see spec section 6.1).
pub const IDENTITY_DIR_ENV: &str = "VCS_IDENTITY_DIR";

/// Resolve the identity directory for `repo_path` per spec sections 6.1/9:
/// `VCS_IDENTITY_DIR` wins if set; otherwise the platform config dir, keyed
/// by `hex(SHA-256(absolute repo path))`, e.g.
/// `$XDG_CONFIG_HOME/vcs/gossip/identities/<repoHash>/`.
pub fn identity_dir_for_repo(repo_path: impl AsRef<Path>) -> PathBuf {
    if let Ok(dir) = std::env::var(IDENTITY_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    let abs = fs::canonicalize(repo_path.as_ref()).unwrap_or_else(|_| repo_path.as_ref().to_path_buf());
    let digest = ring::digest::digest(&ring::digest::SHA256, abs.to_string_lossy().as_bytes());
    let repo_hash = hex::encode(digest.as_ref());

    platform_config_dir()
        .join("vcs")
        .join("gossip")
        .join("identities")
        .join(repo_hash)
}

/// `$XDG_CONFIG_HOME`, falling back to `$HOME/.config`, falling back to the
/// system temp dir on platforms with neither set.
fn platform_config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg);
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        if !home.is_empty() {
            return PathBuf::from(home).join(".config");
        }
    }
    std::env::temp_dir()
}

/// On-disk identity document (pkcs8 private key, public key, derived node id).
#[derive(Serialize, Deserialize)]
struct IdentityFile {
    node_id: String,
    public_key_b64: String,
    pkcs8_b64: String,
}

/// Persistent Ed25519 keypair plus derived node id.
pub struct IdentityVault {
    keypair: Ed25519KeyPair,
    node_id: String,
    public_key_b64: String,
}

/// Derive `node_id` from a raw Ed25519 public key: lowercase hex of the
/// first 16 bytes of SHA-256(public_key).
pub fn node_id_from_public_key(public_key: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, public_key);
    hex::encode(&digest.as_ref()[..16])
}

fn atomic_write_private(path: &Path, bytes: &[u8]) -> Result<(), IdentityError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    {
        let mut f = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)?;
        f.write_all(bytes)?;
        let _ = f.sync_all();
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600));
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl IdentityVault {
    /// Open (or create) the identity for `repo_path`, resolving the identity
    /// directory per spec sections 6.1/9 (`VCS_IDENTITY_DIR` env override,
    /// else the platform config dir keyed by the repo's path hash).
    pub fn open_for_repo(repo_path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        Self::open(identity_dir_for_repo(repo_path))
    }

    /// Open (or create on first use) the identity stored in `data_dir/identity.json`.
    pub fn open(data_dir: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)?;
        let path: PathBuf = dir.join("identity.json");

        if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: IdentityFile =
                serde_json::from_str(&raw).map_err(|_| IdentityError::Corrupt)?;
            let pkcs8 = b64.decode(&file.pkcs8_b64).map_err(|_| IdentityError::Corrupt)?;
            let keypair =
                Ed25519KeyPair::from_pkcs8(&pkcs8).map_err(|_| IdentityError::Corrupt)?;

            let derived_pk = keypair.public_key().as_ref().to_vec();
            let stored_pk = b64
                .decode(&file.public_key_b64)
                .map_err(|_| IdentityError::Corrupt)?;
            if derived_pk != stored_pk {
                return Err(IdentityError::Corrupt);
            }
            let derived_id = node_id_from_public_key(&derived_pk);
            if derived_id != file.node_id {
                return Err(IdentityError::Corrupt);
            }

            return Ok(Self {
                keypair,
                node_id: file.node_id,
                public_key_b64: file.public_key_b64,
            });
        }

        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| IdentityError::Corrupt)?;
        let keypair =
            Ed25519KeyPair::from_pkcs8(pkcs8.as_ref()).map_err(|_| IdentityError::Corrupt)?;
        let public_key = keypair.public_key().as_ref().to_vec();
        let node_id = node_id_from_public_key(&public_key);
        let public_key_b64 = b64.encode(&public_key);

        let file = IdentityFile {
            node_id: node_id.clone(),
            public_key_b64: public_key_b64.clone(),
            pkcs8_b64: b64.encode(pkcs8.as_ref()),
        };
        let mut serialized = serde_json::to_vec(&file).map_err(|_| IdentityError::Corrupt)?;
        atomic_write_private(&path, &serialized)?;
        serialized.zeroize();

        Ok(Self {
            keypair,
            node_id,
            public_key_b64,
        })
    }

    /// This node's id: lowercase hex of the first 16 bytes of SHA-256(public_key).
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Base64 (standard encoding) of the Ed25519 public key.
    pub fn public_key_b64(&self) -> &str {
        &self.public_key_b64
    }

    /// Sign arbitrary bytes with this node's private key.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.keypair.sign(msg).as_ref().to_vec()
    }
}

/// Verify an Ed25519 signature given base64-encoded public key, raw signed
/// bytes, and a raw signature. Used by `OpLog` to validate incoming
/// operations (the replaceable `SignatureSuite` boundary named in spec
/// section 1).
pub fn verify(public_key_b64: &str, msg: &[u8], signature: &[u8]) -> bool {
    let Ok(pk) = b64.decode(public_key_b64) else {
        return false;
    };
    if pk.len() != 32 || signature.len() != 64 {
        return false;
    }
    let unparsed = ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, &pk);
    unparsed.verify(msg, signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_then_reopens_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let v1 = IdentityVault::open(dir.path()).unwrap();
        let (id1, pk1) = (v1.node_id().to_string(), v1.public_key_b64().to_string());

        let v2 = IdentityVault::open(dir.path()).unwrap();
        assert_eq!(id1, v2.node_id());
        assert_eq!(pk1, v2.public_key_b64());
    }

    #[test]
    fn sign_verifies_with_public_key() {
        let dir = tempfile::tempdir().unwrap();
        let v = IdentityVault::open(dir.path()).unwrap();
        let sig = v.sign(b"hello");
        assert!(verify(v.public_key_b64(), b"hello", &sig));
        assert!(!verify(v.public_key_b64(), b"other", &sig));
    }

    #[test]
    fn identity_dir_for_repo_honors_env_override() {
        std::env::set_var(IDENTITY_DIR_ENV, "/tmp/some-override-dir");
        let dir = identity_dir_for_repo("/any/repo/path");
        std::env::remove_var(IDENTITY_DIR_ENV);
        assert_eq!(dir, PathBuf::from("/tmp/some-override-dir"));
    }

    #[test]
    fn identity_dir_for_repo_is_keyed_by_repo_path_without_override() {
        std::env::remove_var(IDENTITY_DIR_ENV);
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let resolved_a1 = identity_dir_for_repo(dir_a.path());
        let resolved_a2 = identity_dir_for_repo(dir_a.path());
        let resolved_b = identity_dir_for_repo(dir_b.path());

        assert_eq!(resolved_a1, resolved_a2, "same repo path must resolve to the same dir");
        assert_ne!(resolved_a1, resolved_b, "distinct repo paths must resolve to distinct dirs");
        assert!(resolved_a1
            .to_string_lossy()
            .contains("vcs/gossip/identities/"));
    }

    #[test]
    fn open_for_repo_resolves_under_env_override() {
        let base = tempfile::tempdir().unwrap();
        std::env::set_var(IDENTITY_DIR_ENV, base.path());
        let repo = tempfile::tempdir().unwrap();
        let v1 = IdentityVault::open_for_repo(repo.path()).unwrap();
        let v2 = IdentityVault::open_for_repo(repo.path()).unwrap();
        std::env::remove_var(IDENTITY_DIR_ENV);

        assert_eq!(v1.node_id(), v2.node_id());
        assert!(base.path().join("identity.json").exists());
    }

    #[test]
    fn corrupt_node_id_is_rejected_on_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let _ = IdentityVault::open(dir.path()).unwrap();
        let path = dir.path().join("identity.json");
        let raw = fs::read_to_string(&path).unwrap();
        let mut file: IdentityFile = serde_json::from_str(&raw).unwrap();
        file.node_id = "deadbeefdeadbeefdeadbeefdeadbeef".to_string();
        fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

        let err = IdentityVault::open(dir.path()).unwrap_err();
        assert!(matches!(err, IdentityError::Corrupt));
    }
}
