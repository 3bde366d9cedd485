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

//! Durable queue of push intents, tracked until their proposals are certified.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Pending-push queue errors.
#[derive(Debug, Error)]
pub enum PendingPushError {
    /// `status`, `proposal_id`, or `target_ref` failed normalization.
    #[error("invalid pending push: {0}")]
    Invalid(String),
    /// No such `proposal_id` in the queue.
    #[error("not_found")]
    NotFound,
    /// Underlying file I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for PendingPushError {
    fn from(e: std::io::Error) -> Self {
        PendingPushError::Io(e.to_string())
    }
}

/// Status of a pending push.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushStatus {
    /// Waiting on quorum/certification/backend invocation.
    Pending,
    /// The last attempt failed.
    Failed,
    /// The backend push succeeded.
    Completed,
}

/// A durable push intent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PendingPush {
    /// The consensus proposal gating this push.
    pub proposal_id: String,
    /// Remote name (e.g. `origin`).
    pub remote: String,
    /// Local source ref.
    pub source_ref: String,
    /// Remote target ref.
    pub target_ref: String,
    /// New commit OID this push would set `target_ref` to.
    pub new_oid: String,
    /// Original argv passed to the push command, captured verbatim.
    pub git_args: Vec<String>,
    /// Current status.
    pub status: PushStatus,
    /// Monotonically non-decreasing across updates.
    pub attempts: u64,
    /// RFC3339 creation time (retained across upserts).
    pub created_at: String,
    /// RFC3339 last-update time.
    pub updated_at: String,
    /// RFC3339 time of the last attempt, if any.
    pub last_tried_at: Option<String>,
    /// RFC3339 completion time, if completed.
    pub completed_at: Option<String>,
    /// The last error message, if pending/failed.
    pub last_error: Option<String>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn validate(push: &PendingPush) -> Result<(), PendingPushError> {
    if push.proposal_id.is_empty() {
        return Err(PendingPushError::Invalid("proposal_id required".into()));
    }
    if push.target_ref.is_empty() {
        return Err(PendingPushError::Invalid("target_ref required".into()));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Default)]
struct QueueFile {
    pushes: Vec<PendingPush>,
}

struct Inner {
    pushes: Vec<PendingPush>,
}

/// Durable list of push intents, persisted as one JSON file sorted by
/// `(created_at, proposal_id)`.
pub struct PendingPushQueue {
    path: PathBuf,
    inner: Mutex<Inner>,
}

impl PendingPushQueue {
    /// Open (or create) the queue at `<dir>/pending_pushes.json`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, PendingPushError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("pending_pushes.json");

        let pushes = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            let file: QueueFile =
                serde_json::from_str(&raw).map_err(|e| PendingPushError::Invalid(e.to_string()))?;
            for p in &file.pushes {
                validate(p)?;
            }
            file.pushes
        } else {
            Vec::new()
        };

        Ok(Self {
            path,
            inner: Mutex::new(Inner { pushes }),
        })
    }

    /// Insert or replace a push, keyed by `proposal_id`.
    ///
    /// On replace: retains the existing `created_at`, sets
    /// `attempts := max(existing.attempts, new.attempts)`, and overwrites
    /// other fields. On first insert: `created_at = updated_at = now`.
    pub fn upsert(&self, mut push: PendingPush) -> Result<(), PendingPushError> {
        validate(&push)?;
        let now = now_rfc3339();
        let mut guard = self.inner.lock().expect("pending push lock poisoned");

        if let Some(existing) = guard
            .pushes
            .iter()
            .find(|p| p.proposal_id == push.proposal_id)
            .cloned()
        {
            push.created_at = existing.created_at;
            push.attempts = existing.attempts.max(push.attempts);
            push.updated_at = now;
        } else {
            push.created_at = now.clone();
            push.updated_at = now;
        }

        guard.pushes.retain(|p| p.proposal_id != push.proposal_id);
        guard.pushes.push(push);
        sort_and_persist(&self.path, &mut guard.pushes)
    }

    /// Mark `proposal_id` pending with `message`, incrementing `attempts`.
    pub fn mark_pending(&self, proposal_id: &str, message: &str) -> Result<(), PendingPushError> {
        self.transition(proposal_id, PushStatus::Pending, Some(message), false)
    }

    /// Mark `proposal_id` failed with `message`, incrementing `attempts`.
    pub fn mark_failed(&self, proposal_id: &str, message: &str) -> Result<(), PendingPushError> {
        self.transition(proposal_id, PushStatus::Failed, Some(message), false)
    }

    /// Mark `proposal_id` completed, incrementing `attempts`, clearing
    /// `last_error`, and setting `completed_at`.
    pub fn mark_completed(&self, proposal_id: &str) -> Result<(), PendingPushError> {
        self.transition(proposal_id, PushStatus::Completed, None, true)
    }

    fn transition(
        &self,
        proposal_id: &str,
        status: PushStatus,
        message: Option<&str>,
        completed: bool,
    ) -> Result<(), PendingPushError> {
        let mut guard = self.inner.lock().expect("pending push lock poisoned");
        let now = now_rfc3339();
        let push = guard
            .pushes
            .iter_mut()
            .find(|p| p.proposal_id == proposal_id)
            .ok_or(PendingPushError::NotFound)?;

        push.status = status;
        push.updated_at = now.clone();
        push.last_tried_at = Some(now.clone());
        push.attempts += 1;
        if completed {
            push.completed_at = Some(now);
            push.last_error = None;
        } else {
            push.last_error = message.map(|s| s.to_string());
        }
        sort_and_persist(&self.path, &mut guard.pushes)
    }

    /// All pushes, in stored order (defensive copy).
    pub fn list(&self) -> Vec<PendingPush> {
        let guard = self.inner.lock().expect("pending push lock poisoned");
        guard.pushes.clone()
    }

    /// Look up a single push by proposal id.
    pub fn get(&self, proposal_id: &str) -> Option<PendingPush> {
        let guard = self.inner.lock().expect("pending push lock poisoned");
        guard.pushes.iter().find(|p| p.proposal_id == proposal_id).cloned()
    }
}

fn sort_and_persist(path: &Path, pushes: &mut [PendingPush]) -> Result<(), PendingPushError> {
    pushes.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.proposal_id.cmp(&b.proposal_id)));
    let file = QueueFile {
        pushes: pushes.to_vec(),
    };
    let bytes =
        serde_json::to_vec_pretty(&file).map_err(|e| PendingPushError::Invalid(e.to_string()))?;
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(&bytes)?;
        let _ = f.sync_all();
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

impl PendingPush {
    /// Build a fresh pending push with `status=pending, attempts=0`.
    pub fn new_pending(
        proposal_id: impl Into<String>,
        remote: impl Into<String>,
        source_ref: impl Into<String>,
        target_ref: impl Into<String>,
        new_oid: impl Into<String>,
        git_args: Vec<String>,
    ) -> Self {
        let now = now_rfc3339();
        Self {
            proposal_id: proposal_id.into(),
            remote: remote.into(),
            source_ref: source_ref.into(),
            target_ref: target_ref.into(),
            new_oid: new_oid.into(),
            git_args,
            status: PushStatus::Pending,
            attempts: 0,
            created_at: now.clone(),
            updated_at: now,
            last_tried_at: None,
            completed_at: None,
            last_error: None,
        }
    }
}
