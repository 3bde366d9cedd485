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

//! Resolves a push intent, drives it through consensus, and invokes the
//! external `VCSBackend` once certified.
//!
//! The backend is an external collaborator (spec section 1): this crate
//! never interprets a repository itself, it only records intents and
//! forwards opaque argument vectors.

use crate::consensus::{ConsensusEngine, Decision, ProposeParams};
use crate::identity::IdentityVault;
use crate::oplog::OpLog;
use crate::pending_push::{PendingPush, PendingPushQueue, PushStatus};
use std::time::Duration;
use thiserror::Error;

/// Push orchestration errors.
#[derive(Debug, Error)]
pub enum PushError {
    /// HEAD is not on a branch.
    #[error("detached_head")]
    DetachedHead,
    /// The backend failed to resolve a ref/rev.
    #[error("backend error: {0}")]
    Backend(String),
    /// Underlying consensus engine rejected the call.
    #[error("consensus error: {0}")]
    Consensus(#[from] crate::consensus::ConsensusError),
    /// Underlying op log rejected the call.
    #[error("oplog error: {0}")]
    OpLog(#[from] crate::oplog::OpLogError),
    /// Underlying pending-push queue rejected the call.
    #[error("pending push error: {0}")]
    PendingPush(#[from] crate::pending_push::PendingPushError),
}

/// Abstraction over the underlying VCS (out of scope per spec section 1:
/// only invoked via opaque argument vectors, never interpreted here).
pub trait VCSBackend: Send + Sync {
    /// Run a VCS command with opaque arguments, returning trimmed stdout.
    fn run(&self, args: &[String]) -> Result<String, PushError>;
}

/// `VCSBackend` that shells out to the `git` binary on `PATH`.
pub struct GitProcessBackend {
    /// Working directory the commands run in.
    pub repo_dir: std::path::PathBuf,
}

impl VCSBackend for GitProcessBackend {
    fn run(&self, args: &[String]) -> Result<String, PushError> {
        let output = std::process::Command::new("git")
            .arg("-C")
            .arg(&self.repo_dir)
            .args(args)
            .output()
            .map_err(|e| PushError::Backend(e.to_string()))?;
        if !output.status.success() {
            return Err(PushError::Backend(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// A resolved push intent, prior to proposal creation.
#[derive(Clone, Debug)]
pub struct PushIntent {
    /// Remote name.
    pub remote: String,
    /// Local source ref.
    pub source_ref: String,
    /// Remote target ref.
    pub target_ref: String,
    /// Current source commit OID.
    pub new_oid: String,
    /// Remote-tracking tip for `target_ref`, empty if unknown.
    pub old_oid: String,
}

fn expand_branch(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("refs/heads/{name}")
    }
}

/// Resolve `remote`, `source_ref`, `target_ref`, `new_oid`, and `old_oid`
/// from raw push argv, per spec section 4.7 ambiguity rules:
///
/// - no refspec: current branch name on both sides
/// - `remote/branch` upstream form: overrides target
/// - `src:dst` refspec: splits accordingly
/// - bare names: expanded to `refs/heads/<name>`
pub fn resolve_push_intent(
    backend: &dyn VCSBackend,
    git_args: &[String],
) -> Result<PushIntent, PushError> {
    let remote = git_args
        .iter()
        .find(|a| !a.starts_with('-') && !a.contains(':') && !a.contains('/'))
        .cloned()
        .unwrap_or_else(|| "origin".to_string());

    let refspec = git_args
        .iter()
        .find(|a| a != &&remote && !a.starts_with('-'))
        .cloned();

    let current_branch = backend
        .run(&["symbolic-ref".to_string(), "--short".to_string(), "HEAD".to_string()])
        .map_err(|_| PushError::DetachedHead)?;
    if current_branch.is_empty() {
        return Err(PushError::DetachedHead);
    }

    let (source_name, target_name) = match refspec {
        None => (current_branch.clone(), current_branch.clone()),
        Some(spec) if spec.contains(':') => {
            let mut parts = spec.splitn(2, ':');
            let src = parts.next().unwrap_or_default().to_string();
            let dst = parts.next().unwrap_or_default().to_string();
            let src = if src.is_empty() { current_branch.clone() } else { src };
            let dst = if dst.is_empty() { src.clone() } else { dst };
            (src, dst)
        }
        Some(spec) if spec.contains('/') => {
            // `remote/branch` upstream form overrides the target only.
            let branch = spec.rsplit('/').next().unwrap_or(&spec).to_string();
            (current_branch.clone(), branch)
        }
        Some(spec) => (spec.clone(), spec),
    };

    let source_ref = expand_branch(&source_name);
    let target_ref = expand_branch(&target_name);

    let new_oid = backend
        .run(&["rev-parse".to_string(), source_ref.clone()])
        .map_err(|e| PushError::Backend(e.to_string()))?;

    let tracking = format!("refs/remotes/{remote}/{target_name}");
    let old_oid = backend.run(&["rev-parse".to_string(), tracking]).unwrap_or_default();

    Ok(PushIntent {
        remote,
        source_ref,
        target_ref,
        new_oid,
        old_oid,
    })
}

/// Summary of one `process_pending` sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessPendingSummary {
    /// Pushes examined.
    pub checked: usize,
    /// Pushes whose backend invocation succeeded this sweep.
    pub executed: usize,
    /// Pushes left in `pending` status after this sweep.
    pub pending: usize,
    /// Pushes left in `failed` status after this sweep.
    pub failed: usize,
}

/// Drives a push intent from proposal through quorum, certification, and
/// the external backend invocation.
pub struct PushOrchestrator<'a> {
    oplog: &'a OpLog,
    identity: &'a IdentityVault,
    consensus: &'a ConsensusEngine,
    queue: &'a PendingPushQueue,
    backend: &'a dyn VCSBackend,
}

const DEFAULT_PROPOSAL_TTL: Duration = Duration::from_secs(24 * 3600);

impl<'a> PushOrchestrator<'a> {
    /// Build an orchestrator over the given components.
    pub fn new(
        oplog: &'a OpLog,
        identity: &'a IdentityVault,
        consensus: &'a ConsensusEngine,
        queue: &'a PendingPushQueue,
        backend: &'a dyn VCSBackend,
    ) -> Self {
        Self {
            oplog,
            identity,
            consensus,
            queue,
            backend,
        }
    }

    /// Resolve `git_args` into a push intent, create a proposal, auto-cast a
    /// yes vote, upsert the pending push, and drive it one step via
    /// `process_pending`.
    pub fn push(&self, git_args: Vec<String>) -> Result<String, PushError> {
        let intent = resolve_push_intent(self.backend, &git_args)?;

        let proposal = self.consensus.propose_ref_update(
            self.oplog,
            self.identity,
            ProposeParams {
                proposal_id: None,
                ref_name: intent.target_ref.clone(),
                old_oid: intent.old_oid.clone(),
                new_oid: intent.new_oid.clone(),
                epoch: 0,
                ttl: DEFAULT_PROPOSAL_TTL,
            },
        )?;

        self.consensus.cast_vote(
            self.oplog,
            self.identity,
            &proposal.proposal_id,
            Decision::Yes,
        )?;

        self.queue.upsert(PendingPush::new_pending(
            proposal.proposal_id.clone(),
            intent.remote,
            intent.source_ref,
            intent.target_ref,
            intent.new_oid,
            git_args,
        ))?;

        self.process_pending(Some(&proposal.proposal_id))?;
        Ok(proposal.proposal_id)
    }

    /// Iterate the queue (skipping completed items, and restricted to
    /// `only_proposal_id` when set), advancing each push through
    /// quorum-check, certification, and backend invocation.
    pub fn process_pending(
        &self,
        only_proposal_id: Option<&str>,
    ) -> Result<ProcessPendingSummary, PushError> {
        let mut summary = ProcessPendingSummary::default();
        let mut first_error: Option<PushError> = None;

        for push in self.queue.list() {
            if push.status == PushStatus::Completed {
                continue;
            }
            if let Some(only) = only_proposal_id {
                if push.proposal_id != only {
                    continue;
                }
            }
            summary.checked += 1;

            match self.advance_one(&push) {
                Ok(true) => summary.executed += 1,
                Ok(false) => {}
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        for push in self.queue.list() {
            match push.status {
                PushStatus::Pending => summary.pending += 1,
                PushStatus::Failed => summary.failed += 1,
                PushStatus::Completed => {}
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    /// Advance a single pending push by one step. Returns `Ok(true)` if the
    /// backend was invoked successfully this call.
    fn advance_one(&self, push: &PendingPush) -> Result<bool, PushError> {
        let status = match self.consensus.status(self.oplog, &push.proposal_id) {
            Ok(s) => s,
            Err(e) => {
                self.queue.mark_failed(&push.proposal_id, &e.to_string())?;
                return Ok(false);
            }
        };

        if status.expired {
            self.queue.mark_failed(&push.proposal_id, "proposal_expired")?;
            return Ok(false);
        }

        if !status.certified {
            if !status.has_quorum {
                let message = format!(
                    "awaiting quorum {}/{} required",
                    status.yes_voters.len(),
                    status.required_yes
                );
                self.queue.mark_pending(&push.proposal_id, &message)?;
                return Ok(false);
            }
            if let Err(e) =
                self.consensus
                    .certify_proposal(self.oplog, self.identity, &push.proposal_id, false)
            {
                self.queue.mark_failed(&push.proposal_id, &e.to_string())?;
                return Ok(false);
            }
        }

        match self.backend.run(&push.git_args) {
            Ok(_) => {
                self.queue.mark_completed(&push.proposal_id)?;
                self.oplog.append_local_op(
                    self.identity,
                    "git.push",
                    serde_json::json!({
                        "proposal_id": push.proposal_id,
                        "remote": push.remote,
                        "target_ref": push.target_ref,
                        "new_oid": push.new_oid,
                    }),
                )?;
                Ok(true)
            }
            Err(e) => {
                self.queue.mark_failed(&push.proposal_id, &e.to_string())?;
                Ok(false)
            }
        }
    }
}
