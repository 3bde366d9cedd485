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

//! Proposal / vote / certification state machine.
//!
//! All consensus state is *derived*: folding `consensus.proposal`,
//! `consensus.vote` and `consensus.cert` operations out of the `OpLog`
//! plus the persisted `ConsensusConfig`. This module never stores state of
//! its own beyond the config.

use crate::identity::IdentityVault;
use crate::oplog::OpLog;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

/// Consensus errors.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// `ref` missing from a propose call.
    #[error("ref_required")]
    RefRequired,
    /// `new_oid` missing from a propose call.
    #[error("new_oid_required")]
    NewOidRequired,
    /// No such `proposal_id` in the log.
    #[error("proposal_not_found")]
    ProposalNotFound,
    /// `now >= proposal.expires_at`.
    #[error("proposal_expired")]
    ProposalExpired,
    /// `decision` was neither `yes` nor `no`.
    #[error("invalid_decision")]
    InvalidDecision,
    /// Certify called without `force` and without quorum.
    #[error("no_quorum")]
    NoQuorum,
    /// Certify called on an already-certified proposal.
    #[error("already_certified")]
    AlreadyCertified,
    /// Underlying op log rejected the operation.
    #[error("oplog error: {0}")]
    OpLog(#[from] crate::oplog::OpLogError),
    /// Underlying file I/O failed.
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ConsensusError {
    fn from(e: std::io::Error) -> Self {
        ConsensusError::Io(e.to_string())
    }
}

/// Vote decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    /// Vote in favor.
    Yes,
    /// Vote against.
    No,
}

/// `consensus.proposal` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProposalPayload {
    /// Unique id for this proposal.
    pub proposal_id: String,
    /// The ref being updated, e.g. `refs/heads/main`.
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// The remote-tracking tip prior to this push (may be empty).
    pub old_oid: String,
    /// The new commit OID this push would set `ref` to.
    pub new_oid: String,
    /// Epoch under which votes for this proposal are counted.
    pub epoch: u64,
    /// RFC3339 expiry, set by the proposer's clock.
    pub expires_at: String,
}

/// `consensus.vote` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VotePayload {
    /// Proposal being voted on.
    pub proposal_id: String,
    /// Copied verbatim from the proposal at cast time.
    pub epoch: u64,
    /// The cast decision.
    pub decision: Decision,
}

/// `consensus.cert` payload.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CertPayload {
    /// Proposal being certified.
    pub proposal_id: String,
    /// Epoch at certification time.
    pub epoch: u64,
    /// Threshold in effect at certification time.
    pub threshold: f64,
    /// Full membership considered.
    pub members: Vec<String>,
    /// Members whose latest vote was yes.
    pub yes_voters: Vec<String>,
    /// Members whose latest vote was no.
    pub no_voters: Vec<String>,
    /// Minimum yes-vote count required for quorum.
    pub required_yes: usize,
    /// `yes_voters.len() + no_voters.len()`.
    pub total_voters: usize,
    /// The real quorum state at the moment of emission (even when forced).
    pub certified: bool,
}

/// Derived status of a proposal.
#[derive(Clone, Debug)]
pub struct ProposalStatus {
    /// The proposal payload itself.
    pub proposal: ProposalPayload,
    /// Members whose latest (epoch-matching) vote is yes.
    pub yes_voters: BTreeSet<String>,
    /// Members whose latest (epoch-matching) vote is no.
    pub no_voters: BTreeSet<String>,
    /// `floor(threshold * |members|) + 1`.
    pub required_yes: usize,
    /// `yes_voters.len() >= required_yes`.
    pub has_quorum: bool,
    /// `now >= proposal.expires_at` and not yet certified.
    pub expired: bool,
    /// Whether a `consensus.cert` operation exists for this proposal.
    pub certified: bool,
    /// The id of the first certifying operation, if any.
    pub certified_op_id: Option<String>,
}

/// Threshold + membership configuration (`<repo>/.vcs/gossip/consensus.json`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Strict-majority-of-threshold ratio, in `[0,1)`. Default `0.5`.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Unique, sorted member node ids. Empty means auto-discover from the
    /// set of authors observed in the log.
    #[serde(default)]
    pub members: Vec<String>,
}

fn default_threshold() -> f64 {
    0.5
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            members: Vec::new(),
        }
    }
}

/// Parameters for `propose_ref_update`.
#[derive(Clone, Debug, Default)]
pub struct ProposeParams {
    /// Explicit proposal id; generated from `ref`/`new_oid`/`epoch`/now if absent.
    pub proposal_id: Option<String>,
    /// The ref being updated.
    pub ref_name: String,
    /// The remote-tracking tip prior to this push.
    pub old_oid: String,
    /// The new commit OID.
    pub new_oid: String,
    /// Epoch under which votes are counted.
    pub epoch: u64,
    /// Time-to-live for the proposal.
    pub ttl: Duration,
}

/// Pure derivation layer over `OpLog` plus the persisted `ConsensusConfig`.
pub struct ConsensusEngine {
    path: PathBuf,
    config: Mutex<ConsensusConfig>,
}

impl ConsensusEngine {
    /// Open (or create with defaults) `<dir>/consensus.json`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, ConsensusError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join("consensus.json");

        let config = if path.exists() {
            let raw = fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| ConsensusError::Io(e.to_string()))?
        } else {
            let cfg = ConsensusConfig::default();
            let bytes =
                serde_json::to_vec_pretty(&cfg).map_err(|e| ConsensusError::Io(e.to_string()))?;
            write_atomic(&path, &bytes)?;
            cfg
        };

        Ok(Self {
            path,
            config: Mutex::new(config),
        })
    }

    /// Current config (defensive copy).
    pub fn config(&self) -> ConsensusConfig {
        self.config.lock().expect("consensus config lock poisoned").clone()
    }

    /// Replace the config and persist it.
    pub fn set_config(&self, new_config: ConsensusConfig) -> Result<(), ConsensusError> {
        let mut guard = self.config.lock().expect("consensus config lock poisoned");
        let bytes = serde_json::to_vec_pretty(&new_config)
            .map_err(|e| ConsensusError::Io(e.to_string()))?;
        write_atomic(&self.path, &bytes)?;
        *guard = new_config;
        Ok(())
    }

    /// Emit a signed `consensus.proposal` operation.
    pub fn propose_ref_update(
        &self,
        oplog: &OpLog,
        identity: &IdentityVault,
        params: ProposeParams,
    ) -> Result<ProposalPayload, ConsensusError> {
        if params.ref_name.is_empty() {
            return Err(ConsensusError::RefRequired);
        }
        if params.new_oid.is_empty() {
            return Err(ConsensusError::NewOidRequired);
        }

        let now = Utc::now();
        let proposal_id = params.proposal_id.unwrap_or_else(|| {
            let seed = format!(
                "{}\0{}\0{}\0{}",
                params.ref_name,
                params.new_oid,
                params.epoch,
                now.timestamp_nanos_opt().unwrap_or_default()
            );
            let digest = ring::digest::digest(&ring::digest::SHA256, seed.as_bytes());
            hex::encode(digest.as_ref())
        });

        let expires_at = rfc3339_nanos(now + chrono::Duration::from_std(params.ttl).unwrap_or_default());

        let payload = ProposalPayload {
            proposal_id,
            ref_name: params.ref_name,
            old_oid: params.old_oid,
            new_oid: params.new_oid,
            epoch: params.epoch,
            expires_at,
        };

        let value = serde_json::to_value(&payload).expect("proposal payload always serializes");
        oplog.append_local_op(identity, "consensus.proposal", value)?;
        tracing::info!(proposal_id = %payload.proposal_id, ref_name = %payload.ref_name, "proposal created");
        Ok(payload)
    }

    /// Emit a signed `consensus.vote` for `proposal_id`.
    pub fn cast_vote(
        &self,
        oplog: &OpLog,
        identity: &IdentityVault,
        proposal_id: &str,
        decision: Decision,
    ) -> Result<(), ConsensusError> {
        let proposal = find_proposal(oplog, proposal_id).ok_or(ConsensusError::ProposalNotFound)?;
        let now = Utc::now();
        let expires_at = DateTime::parse_from_rfc3339(&proposal.expires_at)
            .map_err(|_| ConsensusError::ProposalNotFound)?;
        if now >= expires_at {
            return Err(ConsensusError::ProposalExpired);
        }

        let payload = VotePayload {
            proposal_id: proposal_id.to_string(),
            epoch: proposal.epoch,
            decision,
        };
        let value = serde_json::to_value(&payload).expect("vote payload always serializes");
        oplog.append_local_op(identity, "consensus.vote", value)?;
        tracing::info!(proposal_id, ?decision, "vote cast");
        Ok(())
    }

    /// Derive the current status of `proposal_id`.
    pub fn status(&self, oplog: &OpLog, proposal_id: &str) -> Result<ProposalStatus, ConsensusError> {
        let proposal = find_proposal(oplog, proposal_id).ok_or(ConsensusError::ProposalNotFound)?;
        let config = self.config();

        let members: BTreeSet<String> = if !config.members.is_empty() {
            config.members.iter().cloned().collect()
        } else {
            oplog.authors().into_iter().collect()
        };

        let required_yes = (config.threshold * members.len() as f64).floor() as usize + 1;

        let mut latest_vote: BTreeMap<String, Decision> = BTreeMap::new();
        for op in oplog.ops_of_type("consensus.vote") {
            let Ok(vote): Result<VotePayload, _> = serde_json::from_value(op.payload.clone())
            else {
                continue;
            };
            if vote.proposal_id != proposal_id || vote.epoch != proposal.epoch {
                continue;
            }
            if !members.contains(&op.author) {
                continue;
            }
            // `ops_of_type` is sorted ascending by (seq,id), so later entries
            // for the same author overwrite earlier ones here, leaving the
            // latest (seq,id)-ordered vote.
            latest_vote.insert(op.author.clone(), vote.decision);
        }

        let mut yes_voters = BTreeSet::new();
        let mut no_voters = BTreeSet::new();
        for (author, decision) in latest_vote {
            match decision {
                Decision::Yes => {
                    yes_voters.insert(author);
                }
                Decision::No => {
                    no_voters.insert(author);
                }
            }
        }

        let has_quorum = yes_voters.len() >= required_yes;

        let certs = find_certs(oplog, proposal_id);
        let certified = !certs.is_empty();
        let certified_op_id = certs.first().map(|op| op.id.clone());

        let now = Utc::now();
        let expires_at = DateTime::parse_from_rfc3339(&proposal.expires_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or(now);
        let expired = !certified && now >= expires_at;

        Ok(ProposalStatus {
            proposal,
            yes_voters,
            no_voters,
            required_yes,
            has_quorum,
            expired,
            certified,
            certified_op_id,
        })
    }

    /// Emit a `consensus.cert` snapshot operation.
    ///
    /// Without `force`, fails on `no_quorum`, `proposal_expired`, or
    /// `already_certified`. With `force`, bypasses quorum and expiry, but
    /// the emitted `certified` field always reflects the real quorum state.
    pub fn certify_proposal(
        &self,
        oplog: &OpLog,
        identity: &IdentityVault,
        proposal_id: &str,
        force: bool,
    ) -> Result<CertPayload, ConsensusError> {
        let status = self.status(oplog, proposal_id)?;
        if status.certified {
            return Err(ConsensusError::AlreadyCertified);
        }
        if !force {
            if status.expired {
                return Err(ConsensusError::ProposalExpired);
            }
            if !status.has_quorum {
                return Err(ConsensusError::NoQuorum);
            }
        }

        let config = self.config();
        let members: BTreeSet<String> = if !config.members.is_empty() {
            config.members.iter().cloned().collect()
        } else {
            oplog.authors().into_iter().collect()
        };

        let cert = CertPayload {
            proposal_id: proposal_id.to_string(),
            epoch: status.proposal.epoch,
            threshold: config.threshold,
            members: members.into_iter().collect(),
            yes_voters: status.yes_voters.iter().cloned().collect(),
            no_voters: status.no_voters.iter().cloned().collect(),
            required_yes: status.required_yes,
            total_voters: status.yes_voters.len() + status.no_voters.len(),
            certified: status.has_quorum,
        };

        if force && !status.has_quorum {
            tracing::warn!(proposal_id, "forced certification without quorum");
        } else {
            tracing::info!(proposal_id, "proposal certified");
        }

        let value = serde_json::to_value(&cert).expect("cert payload always serializes");
        oplog.append_local_op(identity, "consensus.cert", value)?;
        Ok(cert)
    }

    /// Proposal payloads in descending timestamp order, truncated to `limit`
    /// (0 = unlimited).
    pub fn proposal_summaries(&self, oplog: &OpLog, limit: usize) -> Vec<ProposalPayload> {
        let mut props: Vec<(String, ProposalPayload)> = oplog
            .ops_of_type("consensus.proposal")
            .into_iter()
            .filter_map(|op| {
                serde_json::from_value::<ProposalPayload>(op.payload.clone())
                    .ok()
                    .map(|p| (op.timestamp.clone(), p))
            })
            .collect();
        props.sort_by(|a, b| b.0.cmp(&a.0));
        let mut out: Vec<ProposalPayload> = props.into_iter().map(|(_, p)| p).collect();
        if limit > 0 && out.len() > limit {
            out.truncate(limit);
        }
        out
    }
}

fn find_proposal(oplog: &OpLog, proposal_id: &str) -> Option<ProposalPayload> {
    oplog
        .ops_of_type("consensus.proposal")
        .into_iter()
        .find_map(|op| {
            let p: ProposalPayload = serde_json::from_value(op.payload.clone()).ok()?;
            (p.proposal_id == proposal_id).then_some(p)
        })
}

fn find_certs(oplog: &OpLog, proposal_id: &str) -> Vec<crate::oplog::Operation> {
    oplog
        .ops_of_type("consensus.cert")
        .into_iter()
        .filter(|op| {
            serde_json::from_value::<CertPayload>(op.payload.clone())
                .map(|c| c.proposal_id == proposal_id)
                .unwrap_or(false)
        })
        .collect()
}

fn rfc3339_nanos(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), ConsensusError> {
    let mut tmp = path.to_path_buf();
    tmp.set_extension("tmp");
    {
        let mut f = fs::File::create(&tmp)?;
        f.write_all(bytes)?;
        let _ = f.sync_all();
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
