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

//! Binds the op log, peer registry, consensus engine, pending-push queue,
//! and push orchestrator together behind one HTTP server and gossip loop.

use crate::consensus::ConsensusEngine;
use crate::identity::IdentityVault;
use crate::oplog::OpLog;
use crate::peers::PeerRegistry;
use crate::pending_push::PendingPushQueue;
use crate::push::{PushOrchestrator, VCSBackend};
use crate::sync::{self, SyncState};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tunables for one daemon run (spec section 10.5 env var mapping lives in
/// the `vcsd` binary; this struct is the parsed, validated result).
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    /// Address the gossip + health HTTP server binds to.
    pub listen_addr: SocketAddr,
    /// Interval between gossip rounds against every known peer.
    pub gossip_interval: Duration,
    /// Per-peer cap on ops exchanged per `sync_peer` request.
    pub sync_limit: usize,
    /// Per-peer cap on anti-entropy rounds per gossip tick.
    pub max_sync_rounds: usize,
    /// Per-request HTTP client timeout.
    pub request_timeout: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7420".parse().expect("static addr parses"),
            gossip_interval: Duration::from_secs(30),
            sync_limit: 256,
            max_sync_rounds: 8,
            request_timeout: Duration::from_secs(10),
        }
    }
}

/// The long-running process: serves gossip + health over HTTP, and on a
/// timer syncs against every registered peer before draining the pending
/// push queue.
pub struct Daemon {
    config: DaemonConfig,
    identity: Arc<IdentityVault>,
    oplog: Arc<OpLog>,
    peers: Arc<PeerRegistry>,
    consensus: Arc<ConsensusEngine>,
    queue: Arc<PendingPushQueue>,
    backend: Arc<dyn VCSBackend>,
    client: reqwest::Client,
}

impl Daemon {
    /// Assemble a daemon from its already-open component stores.
    pub fn new(
        config: DaemonConfig,
        identity: Arc<IdentityVault>,
        oplog: Arc<OpLog>,
        peers: Arc<PeerRegistry>,
        consensus: Arc<ConsensusEngine>,
        queue: Arc<PendingPushQueue>,
        backend: Arc<dyn VCSBackend>,
    ) -> Self {
        let client = sync::default_client(config.request_timeout);
        Self {
            config,
            identity,
            oplog,
            peers,
            consensus,
            queue,
            backend,
            client,
        }
    }

    /// Serve HTTP and run the gossip/push-drain loop until `cancel` fires.
    /// On shutdown, the HTTP server is given a graceful drain.
    pub async fn run(&self, cancel: CancellationToken) -> std::io::Result<()> {
        let sync_state = Arc::new(SyncState {
            oplog: self.oplog.clone(),
            node_id: self.identity.node_id().to_string(),
        });
        let app = sync::router(sync_state);
        let listener = tokio::net::TcpListener::bind(self.config.listen_addr).await?;
        tracing::info!(addr = %self.config.listen_addr, "gossip server listening");

        let server_cancel = cancel.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_cancel.cancelled().await })
                .await
        });

        let gossip_cancel = cancel.clone();
        let gossip = self.gossip_loop(gossip_cancel);

        tokio::select! {
            res = server => { res??; }
            _ = gossip => {}
        }
        Ok(())
    }

    async fn gossip_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.gossip_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("gossip loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.gossip_round(&cancel).await;
                }
            }
        }
    }

    /// One gossip tick: sync against every known peer (never aborting the
    /// loop on a single peer's failure), then drain the pending push queue.
    async fn gossip_round(&self, cancel: &CancellationToken) {
        for peer in self.peers.list() {
            match sync::sync_peer(
                &self.oplog,
                &self.client,
                &peer,
                self.config.sync_limit,
                self.config.max_sync_rounds,
                cancel,
            )
            .await
            {
                Ok(stats) => {
                    tracing::info!(
                        peer = %stats.peer,
                        rounds = stats.rounds,
                        sent = stats.sent,
                        accepted = stats.accepted,
                        rejected = stats.rejected,
                        "gossip round complete"
                    );
                }
                Err(e) => {
                    tracing::warn!(peer = %peer, error = %e, "gossip round failed");
                }
            }
        }

        let orchestrator = PushOrchestrator::new(
            &self.oplog,
            &self.identity,
            &self.consensus,
            &self.queue,
            self.backend.as_ref(),
        );
        match orchestrator.process_pending(None) {
            Ok(summary) => {
                tracing::info!(
                    checked = summary.checked,
                    executed = summary.executed,
                    pending = summary.pending,
                    failed = summary.failed,
                    "pending push sweep complete"
                );
            }
            Err(e) => {
                tracing::warn!(error = %e, "pending push sweep hit an error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::ConsensusConfig;
    use crate::push::GitProcessBackend;

    #[tokio::test]
    async fn health_endpoint_responds_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(IdentityVault::open(dir.path().join("id")).unwrap());
        let oplog = Arc::new(OpLog::open(dir.path().join("log")).unwrap());
        let peers = Arc::new(PeerRegistry::open(dir.path().join("peers")).unwrap());
        let consensus = Arc::new(ConsensusEngine::open(dir.path().join("c")).unwrap());
        consensus.set_config(ConsensusConfig::default()).unwrap();
        let queue = Arc::new(PendingPushQueue::open(dir.path().join("q")).unwrap());
        let backend = Arc::new(GitProcessBackend {
            repo_dir: dir.path().to_path_buf(),
        });

        let mut config = DaemonConfig::default();
        config.listen_addr = "127.0.0.1:0".parse().unwrap();
        config.gossip_interval = Duration::from_secs(3600);

        let daemon = Daemon::new(config, identity, oplog, peers, consensus, queue, backend);

        let sync_state = Arc::new(SyncState {
            oplog: daemon.oplog.clone(),
            node_id: daemon.identity.node_id().to_string(),
        });
        let app = sync::router(sync_state);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let resp = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert!(resp.status().is_success());
        handle.abort();
    }
}
