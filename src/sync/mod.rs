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

//! Anti-entropy sync protocol: summary exchange plus missing-ops pull/push
//! over HTTP, with a per-round termination rule.

use crate::oplog::{OpLog, Operation, OpLogError};
use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Sync protocol errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The HTTP call itself failed (connection, timeout, non-2xx, bad body).
    #[error("network error: {0}")]
    Network(String),
    /// The sync was cancelled via the caller's `CancellationToken`.
    #[error("cancelled")]
    Cancelled,
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        SyncError::Network(e.to_string())
    }
}

/// `GET /gossip/summary` response.
#[derive(Serialize, Deserialize)]
pub struct SummaryResponse {
    /// author -> max observed seq.
    pub summary: BTreeMap<String, u64>,
}

/// `POST /gossip/missing` request.
#[derive(Serialize, Deserialize)]
pub struct MissingRequest {
    /// The caller's summary, to compute what it's missing.
    pub summary: BTreeMap<String, u64>,
    /// Cap on the number of ops returned (0 = unlimited).
    #[serde(default)]
    pub limit: usize,
}

/// `POST /gossip/missing` response.
#[derive(Serialize, Deserialize)]
pub struct MissingResponse {
    /// The ops the caller is missing, relative to `summary`.
    pub ops: Vec<Operation>,
}

/// `POST /gossip/ops` request.
#[derive(Serialize, Deserialize)]
pub struct OpsRequest {
    /// Ops the caller is pushing to us.
    pub ops: Vec<Operation>,
}

/// `POST /gossip/ops` response.
#[derive(Serialize, Deserialize)]
pub struct OpsResponse {
    /// Newly accepted ops.
    pub accepted: usize,
    /// Ops rejected for failing verification or conflicting.
    pub rejected: usize,
    /// Ops that were idempotent duplicates.
    pub dropped: usize,
}

/// `GET /health` response.
#[derive(Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always true if the process is serving requests.
    pub ok: bool,
    /// This node's id.
    pub node_id: String,
}

async fn handle_summary(State(state): State<Arc<SyncState>>) -> Json<SummaryResponse> {
    Json(SummaryResponse {
        summary: state.oplog.summary(),
    })
}

async fn handle_missing(
    State(state): State<Arc<SyncState>>,
    Json(req): Json<MissingRequest>,
) -> Json<MissingResponse> {
    Json(MissingResponse {
        ops: state.oplog.missing_for(&req.summary, req.limit),
    })
}

async fn handle_ops(
    State(state): State<Arc<SyncState>>,
    Json(req): Json<OpsRequest>,
) -> Json<OpsResponse> {
    let mut accepted = 0usize;
    let mut rejected = 0usize;
    let mut dropped = 0usize;
    for op in req.ops {
        match state.oplog.add_remote_op(op) {
            Ok(true) => accepted += 1,
            Ok(false) => dropped += 1,
            Err(_) => rejected += 1,
        }
    }
    Json(OpsResponse { accepted, rejected, dropped })
}

async fn handle_health(State(state): State<Arc<SyncState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        node_id: state.node_id.clone(),
    })
}

/// Shared state backing the sync HTTP handlers.
pub struct SyncState {
    /// The log being served.
    pub oplog: Arc<OpLog>,
    /// This node's id, echoed by `/health`.
    pub node_id: String,
}

/// Build the stateless sync + health router.
pub fn router(state: Arc<SyncState>) -> Router {
    Router::new()
        .route("/gossip/summary", get(handle_summary))
        .route("/gossip/missing", post(handle_missing))
        .route("/gossip/ops", post(handle_ops))
        .route("/health", get(handle_health))
        .with_state(state)
}

/// Per-peer result of one `sync_peer` call.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// The peer base URL synced against.
    pub peer: String,
    /// Number of anti-entropy rounds actually run.
    pub rounds: usize,
    /// Total ops pushed to the peer.
    pub sent: usize,
    /// Total ops pulled from the peer (before verification).
    pub pulled: usize,
    /// Of the pulled ops, how many were newly accepted.
    pub accepted: usize,
    /// Of the pulled ops, how many failed verification/conflicted.
    pub rejected: usize,
    /// Of the pulled ops, how many were idempotent duplicates.
    pub dropped: usize,
}

/// Run bounded anti-entropy against `peer_base_url`: repeatedly push what we
/// have that the peer is missing and pull what the peer has that we're
/// missing, stopping early once a round exchanges zero ops in both
/// directions, or after `max_rounds`.
pub async fn sync_peer(
    oplog: &OpLog,
    client: &reqwest::Client,
    peer_base_url: &str,
    limit: usize,
    max_rounds: usize,
    cancel: &CancellationToken,
) -> Result<SyncStats, SyncError> {
    let mut stats = SyncStats {
        peer: peer_base_url.to_string(),
        ..Default::default()
    };

    for round in 0..max_rounds.max(1) {
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        stats.rounds = round + 1;

        let remote_summary: SummaryResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            resp = client.get(format!("{peer_base_url}/gossip/summary")).send() => {
                resp?.error_for_status()?.json().await?
            }
        };

        let to_push = oplog.missing_for(&remote_summary.summary, limit);
        let pushed_this_round = to_push.len();
        if pushed_this_round > 0 {
            let resp: OpsResponse = tokio::select! {
                _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                resp = client
                    .post(format!("{peer_base_url}/gossip/ops"))
                    .json(&OpsRequest { ops: to_push })
                    .send() => {
                    resp?.error_for_status()?.json().await?
                }
            };
            let _ = resp; // peer-side counters are informational; ours come from our own ingest below
        }
        stats.sent += pushed_this_round;

        let local_summary = oplog.summary();
        let missing: MissingResponse = tokio::select! {
            _ = cancel.cancelled() => return Err(SyncError::Cancelled),
            resp = client
                .post(format!("{peer_base_url}/gossip/missing"))
                .json(&MissingRequest { summary: local_summary, limit })
                .send() => {
                resp?.error_for_status()?.json().await?
            }
        };

        let pulled_this_round = missing.ops.len();
        stats.pulled += pulled_this_round;
        for op in missing.ops {
            match oplog.add_remote_op(op) {
                Ok(true) => stats.accepted += 1,
                Ok(false) => stats.dropped += 1,
                Err(OpLogError::Conflict) | Err(OpLogError::Verification(_)) => stats.rejected += 1,
                Err(_) => stats.rejected += 1,
            }
        }

        if pushed_this_round == 0 && pulled_this_round == 0 {
            break;
        }
    }

    Ok(stats)
}

/// Default per-request HTTP client timeout (spec section 5).
pub fn default_client(request_timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .build()
        .expect("reqwest client builds with a plain timeout")
}
