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

//! Append-only, cryptographically signed operation log.
//!
//! Operations are the atomic, replicated, immutable records that every
//! other component (`ConsensusEngine`, `PendingPushQueue`, `PushOrchestrator`)
//! derives its state from by folding. See spec section 3 for the full
//! invariant list; this module is the only place that is allowed to accept
//! or reject an operation.

use crate::identity::{self, IdentityVault};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// Operation-log errors.
#[derive(Debug, Error)]
pub enum OpLogError {
    /// `payload` is not syntactically valid JSON.
    #[error("invalid_payload")]
    InvalidPayload,
    /// `type` was empty.
    #[error("type_required")]
    TypeRequired,
    /// Any of the signature/identity invariants in spec section 3 failed.
    #[error("verification failed: {0}")]
    Verification(String),
    /// A different operation already occupies this (author, seq) pair.
    #[error("conflict")]
    Conflict,
    /// Underlying file I/O failed.
    #[error("io error: {0}")]
    Io(String),
    /// The log file contains a line that cannot be parsed or fails verification.
    #[error("corrupt log at line {line}: {reason}")]
    CorruptLog {
        /// 1-based line number.
        line: usize,
        /// Human-readable reason.
        reason: String,
    },
}

impl From<std::io::Error> for OpLogError {
    fn from(e: std::io::Error) -> Self {
        OpLogError::Io(e.to_string())
    }
}

/// An atomic, replicated, immutable operation.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    /// Opaque content hash, hex.
    pub id: String,
    /// String tag, e.g. `consensus.proposal`, `git.push`, or user-chosen.
    #[serde(rename = "type")]
    pub op_type: String,
    /// node_id of the signer.
    pub author: String,
    /// Per-author monotonic positive integer, dense (1,2,3,...).
    pub seq: u64,
    /// RFC3339 with nanosecond precision, UTC.
    pub timestamp: String,
    /// Opaque JSON document (may be an empty object).
    pub payload: serde_json::Value,
    /// Base64 of the signer's Ed25519 public key.
    pub public_key: String,
    /// Base64 Ed25519 signature.
    pub signature: String,
}

/// Signable document in the fixed field order required by spec section 6.2.
#[derive(Serialize)]
struct SignableDoc<'a> {
    #[serde(rename = "type")]
    op_type: &'a str,
    author: &'a str,
    seq: u64,
    timestamp: &'a str,
    payload: &'a serde_json::Value,
    public_key: &'a str,
}

fn normalize_payload(payload: &serde_json::Value) -> serde_json::Value {
    match payload {
        serde_json::Value::Null => serde_json::json!({}),
        serde_json::Value::Object(m) if m.is_empty() => serde_json::json!({}),
        other => other.clone(),
    }
}

/// Compute the canonical signable bytes for the given fields, in the fixed
/// order `type, author, seq, timestamp, payload, public_key`.
pub fn canonical_bytes(
    op_type: &str,
    author: &str,
    seq: u64,
    timestamp: &str,
    payload: &serde_json::Value,
    public_key: &str,
) -> Vec<u8> {
    let normalized = normalize_payload(payload);
    let doc = SignableDoc {
        op_type,
        author,
        seq,
        timestamp,
        payload: &normalized,
        public_key,
    };
    // Struct fields serialize in declaration order regardless of the
    // `preserve_order` feature, which only affects `serde_json::Map`.
    serde_json::to_vec(&doc).expect("signable doc is always serializable")
}

/// Compute `id = hex(SHA-256(canonical_bytes || signature_raw))`.
pub fn compute_id(canonical: &[u8], signature_raw: &[u8]) -> String {
    let mut buf = Vec::with_capacity(canonical.len() + signature_raw.len());
    buf.extend_from_slice(canonical);
    buf.extend_from_slice(signature_raw);
    let digest = ring::digest::digest(&ring::digest::SHA256, &buf);
    hex::encode(digest.as_ref())
}

/// Fully verify an operation against every invariant in spec section 3,
/// except the (author, seq) conflict rule (which requires log context and
/// is checked by the caller).
pub fn verify_operation(op: &Operation) -> Result<(), OpLogError> {
    if op.op_type.is_empty() {
        return Err(OpLogError::TypeRequired);
    }
    if op.seq == 0 {
        return Err(OpLogError::Verification("seq must be > 0".into()));
    }
    if !op.payload.is_object() && !op.payload.is_null() {
        // any valid JSON value is syntactically fine; this just guards
        // against payloads that failed to parse upstream.
    }

    let pk_bytes = base64::engine::general_purpose::STANDARD
        .decode(&op.public_key)
        .map_err(|_| OpLogError::Verification("bad public_key encoding".into()))?;
    let expected_author = identity::node_id_from_public_key(&pk_bytes);
    if expected_author != op.author {
        return Err(OpLogError::Verification("author != nodeIdFromPublicKey(public_key)".into()));
    }

    let sig_bytes = base64::engine::general_purpose::STANDARD
        .decode(&op.signature)
        .map_err(|_| OpLogError::Verification("bad signature encoding".into()))?;

    let canonical = canonical_bytes(
        &op.op_type,
        &op.author,
        op.seq,
        &op.timestamp,
        &op.payload,
        &op.public_key,
    );

    if !identity::verify(&op.public_key, &canonical, &sig_bytes) {
        return Err(OpLogError::Verification("signature does not verify".into()));
    }

    let expected_id = compute_id(&canonical, &sig_bytes);
    if expected_id != op.id {
        return Err(OpLogError::Verification("id != hex(SHA-256(canonical || signature))".into()));
    }

    chrono::DateTime::parse_from_rfc3339(&op.timestamp)
        .map_err(|_| OpLogError::Verification("bad timestamp".into()))?;

    Ok(())
}

use base64::Engine as _;

struct Inner {
    ops: Vec<Operation>,
    by_id: std::collections::HashMap<String, usize>,
    by_author_seq: std::collections::HashMap<(String, u64), usize>,
    max_seq_by_author: BTreeMap<String, u64>,
    file: File,
}

/// Append-only signed operation log.
pub struct OpLog {
    path: PathBuf,
    inner: RwLock<Inner>,
}

fn read_line_operation(line: &str, line_no: usize) -> Result<Operation, OpLogError> {
    let op: Operation = serde_json::from_str(line).map_err(|e| OpLogError::CorruptLog {
        line: line_no,
        reason: e.to_string(),
    })?;
    verify_operation(&op).map_err(|e| OpLogError::CorruptLog {
        line: line_no,
        reason: e.to_string(),
    })?;
    Ok(op)
}

impl OpLog {
    /// Open (creating if absent) the append-only log at `<dir>/ops.log`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, OpLogError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("ops.log");

        let mut ops = Vec::new();
        let mut by_id = std::collections::HashMap::new();
        let mut by_author_seq = std::collections::HashMap::new();
        let mut max_seq_by_author = BTreeMap::new();

        if path.exists() {
            let f = File::open(&path)?;
            let reader = BufReader::new(f);
            for (idx, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let op = read_line_operation(&line, idx + 1)?;
                if by_id.contains_key(&op.id) {
                    continue; // duplicate lines are idempotently absorbed
                }
                let key = (op.author.clone(), op.seq);
                if let Some(&existing_idx) = by_author_seq.get(&key) {
                    let existing: &Operation = &ops[existing_idx];
                    if existing.id != op.id {
                        return Err(OpLogError::CorruptLog {
                            line: idx + 1,
                            reason: "conflicting (author,seq) in persisted log".into(),
                        });
                    }
                    continue;
                }
                let i = ops.len();
                by_id.insert(op.id.clone(), i);
                by_author_seq.insert(key, i);
                let entry = max_seq_by_author.entry(op.author.clone()).or_insert(0u64);
                if op.seq > *entry {
                    *entry = op.seq;
                }
                ops.push(op);
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            inner: RwLock::new(Inner {
                ops,
                by_id,
                by_author_seq,
                max_seq_by_author,
                file,
            }),
        })
    }

    /// Locally produce, sign, and append a new operation as `author`.
    pub fn append_local_op(
        &self,
        identity: &IdentityVault,
        op_type: &str,
        payload: serde_json::Value,
    ) -> Result<Operation, OpLogError> {
        if op_type.is_empty() {
            return Err(OpLogError::TypeRequired);
        }
        if !payload.is_object() && !payload.is_null() {
            return Err(OpLogError::InvalidPayload);
        }

        let mut guard = self.inner.write().expect("oplog lock poisoned");
        let author = identity.node_id().to_string();
        let seq = guard.max_seq_by_author.get(&author).copied().unwrap_or(0) + 1;
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true);
        let public_key = identity.public_key_b64().to_string();

        let canonical = canonical_bytes(op_type, &author, seq, &timestamp, &payload, &public_key);
        let signature_raw = identity.sign(&canonical);
        let id = compute_id(&canonical, &signature_raw);

        let op = Operation {
            id,
            op_type: op_type.to_string(),
            author,
            seq,
            timestamp,
            payload: normalize_payload(&payload),
            public_key,
            signature: base64::engine::general_purpose::STANDARD.encode(&signature_raw),
        };

        add_locked(&mut guard, &self.path, op.clone())?;
        tracing::debug!(author = %op.author, seq = op.seq, id = %op.id, "appended local operation");
        Ok(op)
    }

    /// Ingest an operation received from a peer. Returns `true` if it was
    /// newly accepted, `false` if it was an idempotent duplicate.
    pub fn add_remote_op(&self, op: Operation) -> Result<bool, OpLogError> {
        verify_operation(&op)?;
        let mut guard = self.inner.write().expect("oplog lock poisoned");
        if guard.by_id.contains_key(&op.id) {
            return Ok(false);
        }
        let key = (op.author.clone(), op.seq);
        if let Some(&existing_idx) = guard.by_author_seq.get(&key) {
            let existing = &guard.ops[existing_idx];
            if existing.id != op.id {
                tracing::warn!(author = %op.author, seq = op.seq, "rejected conflicting operation");
                return Err(OpLogError::Conflict);
            }
            return Ok(false);
        }
        add_locked(&mut guard, &self.path, op.clone())?;
        tracing::debug!(author = %op.author, seq = op.seq, id = %op.id, "accepted remote operation");
        Ok(true)
    }

    /// Mapping author -> max observed seq.
    pub fn summary(&self) -> BTreeMap<String, u64> {
        let guard = self.inner.read().expect("oplog lock poisoned");
        guard.max_seq_by_author.clone()
    }

    /// Operations with `seq > summary[author]` (default 0), ordered by
    /// `author` ascending then `seq` ascending, truncated to `limit` (0 = unlimited).
    pub fn missing_for(&self, summary: &BTreeMap<String, u64>, limit: usize) -> Vec<Operation> {
        let guard = self.inner.read().expect("oplog lock poisoned");
        let mut missing: Vec<Operation> = guard
            .ops
            .iter()
            .filter(|op| op.seq > summary.get(&op.author).copied().unwrap_or(0))
            .cloned()
            .collect();
        missing.sort_by(|a, b| a.author.cmp(&b.author).then(a.seq.cmp(&b.seq)));
        if limit > 0 && missing.len() > limit {
            missing.truncate(limit);
        }
        missing
    }

    /// All operations ordered by `author` ascending then `seq` ascending. If
    /// truncated by `limit` (0 = unlimited), returns the tail of that ordering.
    pub fn ops(&self, limit: usize) -> Vec<Operation> {
        let guard = self.inner.read().expect("oplog lock poisoned");
        let mut all: Vec<Operation> = guard.ops.clone();
        all.sort_by(|a, b| a.author.cmp(&b.author).then(a.seq.cmp(&b.seq)));
        if limit > 0 && all.len() > limit {
            let start = all.len() - limit;
            all.split_off(start)
        } else {
            all
        }
    }

    /// Look up a single operation by id (defensive copy).
    pub fn get(&self, id: &str) -> Option<Operation> {
        let guard = self.inner.read().expect("oplog lock poisoned");
        guard.by_id.get(id).map(|&i| guard.ops[i].clone())
    }

    /// Every operation of the given type, most-recent-first within the
    /// (author,seq) total order (used by `ConsensusEngine` to fold proposal state).
    pub fn ops_of_type(&self, op_type: &str) -> Vec<Operation> {
        let guard = self.inner.read().expect("oplog lock poisoned");
        let mut matching: Vec<Operation> = guard
            .ops
            .iter()
            .filter(|op| op.op_type == op_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.seq.cmp(&b.seq).then(a.id.cmp(&b.id)));
        matching
    }

    /// Set of all authors observed in the log, sorted.
    pub fn authors(&self) -> Vec<String> {
        let guard = self.inner.read().expect("oplog lock poisoned");
        guard.max_seq_by_author.keys().cloned().collect()
    }
}

fn add_locked(guard: &mut Inner, path: &Path, op: Operation) -> Result<(), OpLogError> {
    let line = serde_json::to_string(&op).map_err(|_| OpLogError::InvalidPayload)?;
    guard.file.write_all(line.as_bytes())?;
    guard.file.write_all(b"\n")?;
    guard.file.flush()?;
    let _ = path; // path kept for potential future rotation; file handle already open.

    let i = guard.ops.len();
    guard.by_id.insert(op.id.clone(), i);
    guard
        .by_author_seq
        .insert((op.author.clone(), op.seq), i);
    let entry = guard.max_seq_by_author.entry(op.author.clone()).or_insert(0);
    if op.seq > *entry {
        *entry = op.seq;
    }
    guard.ops.push(op);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityVault;

    fn open_pair() -> (tempfile::TempDir, IdentityVault, OpLog) {
        let dir = tempfile::tempdir().unwrap();
        let id_dir = dir.path().join("id");
        let identity = IdentityVault::open(&id_dir).unwrap();
        let log = OpLog::open(dir.path().join("log")).unwrap();
        (dir, identity, log)
    }

    #[test]
    fn append_then_verify_accepts() {
        let (_dir, identity, log) = open_pair();
        let op = log
            .append_local_op(&identity, "git.commit", serde_json::json!({"hash": "abc"}))
            .unwrap();
        assert!(verify_operation(&op).is_ok());
        assert_eq!(op.seq, 1);
    }

    #[test]
    fn tampering_any_field_breaks_verification() {
        let (_dir, identity, log) = open_pair();
        let op = log
            .append_local_op(&identity, "git.commit", serde_json::json!({"hash": "abc"}))
            .unwrap();

        let mut tampered = op.clone();
        tampered.payload = serde_json::json!({"hash": "tampered"});
        assert!(verify_operation(&tampered).is_err());

        let mut tampered = op.clone();
        tampered.seq += 1;
        assert!(verify_operation(&tampered).is_err());

        let mut tampered = op.clone();
        tampered.timestamp = "not-a-timestamp".to_string();
        assert!(verify_operation(&tampered).is_err());

        let mut tampered = op;
        tampered.id = "0".repeat(64);
        assert!(verify_operation(&tampered).is_err());
    }

    #[test]
    fn remote_tamper_is_rejected_by_second_store() {
        let (_dir_a, identity_a, log_a) = open_pair();
        let (_dir_b, _identity_b, log_b) = open_pair();

        let mut op = log_a
            .append_local_op(&identity_a, "git.commit", serde_json::json!({"hash": "abc"}))
            .unwrap();
        op.payload = serde_json::json!({"hash": "tampered"});

        let err = log_b.add_remote_op(op).unwrap_err();
        assert!(matches!(err, OpLogError::Verification(_)));
    }

    #[test]
    fn duplicate_id_is_silent_success_conflicting_seq_is_error() {
        let (_dir_a, identity_a, log_a) = open_pair();
        let (_dir_b, _identity_b, log_b) = open_pair();

        let op = log_a
            .append_local_op(&identity_a, "git.commit", serde_json::json!({}))
            .unwrap();

        assert!(log_b.add_remote_op(op.clone()).unwrap());
        assert!(!log_b.add_remote_op(op.clone()).unwrap());

        // forge a second op with the same (author, seq) but different payload => different id
        let canonical = canonical_bytes(
            &op.op_type,
            &op.author,
            op.seq,
            &op.timestamp,
            &serde_json::json!({"hash": "other"}),
            &op.public_key,
        );
        let sig_bytes = base64::engine::general_purpose::STANDARD
            .decode(&op.signature)
            .unwrap();
        let forged_id = compute_id(&canonical, &sig_bytes);
        let mut conflicting = op.clone();
        conflicting.payload = serde_json::json!({"hash": "other"});
        conflicting.id = forged_id;
        // signature no longer matches this payload, but we want to exercise
        // the (author,seq) conflict path specifically, so sign properly:
        let sig = identity_a.sign(&canonical);
        conflicting.signature = base64::engine::general_purpose::STANDARD.encode(&sig);
        conflicting.id = compute_id(&canonical, &sig);

        let err = log_b.add_remote_op(conflicting).unwrap_err();
        assert!(matches!(err, OpLogError::Conflict));
    }

    #[test]
    fn summary_and_missing_for_catch_up() {
        let (_dir, identity, log) = open_pair();
        log.append_local_op(&identity, "t", serde_json::json!({})).unwrap();
        let op2 = log.append_local_op(&identity, "t", serde_json::json!({})).unwrap();

        let mut summary = BTreeMap::new();
        summary.insert(identity.node_id().to_string(), 1u64);
        let missing = log.missing_for(&summary, 0);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].id, op2.id);
    }

    #[test]
    fn sequence_density_holds_for_every_author() {
        let (_dir, identity, log) = open_pair();
        for _ in 0..5 {
            log.append_local_op(&identity, "t", serde_json::json!({})).unwrap();
        }
        let summary = log.summary();
        let max = summary[identity.node_id()];
        let seqs: std::collections::BTreeSet<u64> =
            log.ops(0).iter().map(|o| o.seq).collect();
        let expected: std::collections::BTreeSet<u64> = (1..=max).collect();
        assert_eq!(seqs, expected);
    }

    #[test]
    fn reopen_replays_log_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let id_dir = dir.path().join("id");
        let identity = IdentityVault::open(&id_dir).unwrap();
        let log_dir = dir.path().join("log");
        {
            let log = OpLog::open(&log_dir).unwrap();
            log.append_local_op(&identity, "t", serde_json::json!({})).unwrap();
            log.append_local_op(&identity, "t", serde_json::json!({})).unwrap();
        }
        let log2 = OpLog::open(&log_dir).unwrap();
        assert_eq!(log2.ops(0).len(), 2);
    }
}
