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

//! Normalized, persistent set of peer base URLs (`<repo>/.vcs/gossip/peers.json`).

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use url::Url;

/// Peer registry errors.
#[derive(Debug, Error)]
pub enum PeerRegistryError {
    /// The URL could not be normalized per the rules in spec section 4.3.
    #[error("invalid peer url: {0}")]
    InvalidUrl(String),
    /// Underlying file I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PeerRegistryError {
    fn from(e: std::io::Error) -> Self {
        PeerRegistryError::Io(e.to_string())
    }
}

/// Normalize a peer base URL:
///
/// trim; prepend `http://` if no scheme; parse; reject scheme not in
/// {http,https}, empty host, or query/fragment present; strip a trailing
/// `/` from the path (a lone `/` path becomes empty).
pub fn normalize(raw: &str) -> Result<String, PeerRegistryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(PeerRegistryError::InvalidUrl("empty".to_string()));
    }

    let candidate = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };

    let mut url = Url::parse(&candidate)
        .map_err(|e| PeerRegistryError::InvalidUrl(format!("{raw}: {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(PeerRegistryError::InvalidUrl(format!(
            "{raw}: unsupported scheme {}",
            url.scheme()
        )));
    }
    if url.host_str().unwrap_or("").is_empty() {
        return Err(PeerRegistryError::InvalidUrl(format!("{raw}: empty host")));
    }
    if url.query().is_some() || url.fragment().is_some() {
        return Err(PeerRegistryError::InvalidUrl(format!(
            "{raw}: query/fragment not allowed"
        )));
    }

    let path = url.path().trim_end_matches('/').to_string();
    url.set_path(&path);

    Ok(url.to_string().trim_end_matches('/').to_string())
}

#[derive(Serialize, Deserialize, Default)]
struct PeersFile {
    peers: Vec<String>,
}

struct Inner {
    peers: BTreeSet<String>,
}

/// Persistent, normalized set of peer base URLs.
pub struct PeerRegistry {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl PeerRegistry {
    /// Open (or create) the registry at `<dir>/peers.json`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PeerRegistryError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("peers.json");

        let peers = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: PeersFile = serde_json::from_str(&raw)
                .map_err(|e| PeerRegistryError::InvalidUrl(e.to_string()))?;
            let mut set = BTreeSet::new();
            for p in file.peers {
                set.insert(normalize(&p)?);
            }
            set
        } else {
            BTreeSet::new()
        };

        Ok(Self {
            path,
            inner: Mutex::new(Inner { peers }),
        })
    }

    /// Normalize and add a peer, returning its normalized form. Duplicates
    /// are silently absorbed.
    pub fn add_peer(&self, raw: &str) -> Result<String, PeerRegistryError> {
        let normalized = normalize(raw)?;
        let mut guard = self.inner.lock().expect("peer registry lock poisoned");
        guard.peers.insert(normalized.clone());
        self.persist(&guard)?;
        Ok(normalized)
    }

    /// Remove a peer by its normalized form (or raw form, which is
    /// normalized first).
    pub fn remove_peer(&self, raw: &str) -> Result<bool, PeerRegistryError> {
        let normalized = normalize(raw)?;
        let mut guard = self.inner.lock().expect("peer registry lock poisoned");
        let removed = guard.peers.remove(&normalized);
        if removed {
            self.persist(&guard)?;
        }
        Ok(removed)
    }

    /// All peers, sorted.
    pub fn list(&self) -> Vec<String> {
        let guard = self.inner.lock().expect("peer registry lock poisoned");
        guard.peers.iter().cloned().collect()
    }

    fn persist(&self, guard: &Inner) -> Result<(), PeerRegistryError> {
        let file = PeersFile {
            peers: guard.peers.iter().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)
            .map_err(|e| PeerRegistryError::InvalidUrl(e.to_string()))?;
        let mut tmp = self.path.clone();
        tmp.set_extension("tmp");
        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&bytes)?;
            let _ = f.sync_all();
        }
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_collapses_equivalent_forms() {
        let a = normalize("127.0.0.1:8787").unwrap();
        let b = normalize("127.0.0.1:8787/").unwrap();
        let c = normalize("http://127.0.0.1:8787").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn normalization_is_idempotent() {
        let once = normalize("HTTPS://Example.com:9000/api/").unwrap();
        let twice = normalize(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn rejects_bad_scheme_and_query_and_fragment() {
        assert!(normalize("ftp://example.com").is_err());
        assert!(normalize("http://example.com/path?x=1").is_err());
        assert!(normalize("http://example.com/path#frag").is_err());
        assert!(normalize("http:///noHost").is_err());
    }

    #[test]
    fn add_peer_persists_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let reg = PeerRegistry::open(dir.path()).unwrap();
        reg.add_peer("127.0.0.1:9000").unwrap();
        reg.add_peer("http://127.0.0.1:9000/").unwrap();
        assert_eq!(reg.list(), vec!["http://127.0.0.1:9000".to_string()]);

        let reopened = PeerRegistry::open(dir.path()).unwrap();
        assert_eq!(reopened.list(), vec!["http://127.0.0.1:9000".to_string()]);
    }
}
