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

//! The `vcsd` gossip/consensus daemon entrypoint.
//!
//! Reads its tunables from the environment (see crate docs for the full
//! list), opens every durable store under `<repo>/.vcs/gossip/`, and runs
//! until `SIGINT`/`SIGTERM`.

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vcs_gossip_core::consensus::ConsensusEngine;
use vcs_gossip_core::daemon::{Daemon, DaemonConfig};
use vcs_gossip_core::identity::IdentityVault;
use vcs_gossip_core::oplog::OpLog;
use vcs_gossip_core::peers::PeerRegistry;
use vcs_gossip_core::pending_push::PendingPushQueue;
use vcs_gossip_core::push::GitProcessBackend;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let repo_dir = PathBuf::from(env_or("VCS_REPO_DIR", "."));
    let gossip_dir = repo_dir.join(".vcs").join("gossip");

    let listen_addr = env_or("VCS_LISTEN_ADDR", "0.0.0.0:7420")
        .parse()
        .context("VCS_LISTEN_ADDR must be a socket address")?;
    let gossip_interval = Duration::from_secs(env_parse("VCS_GOSSIP_INTERVAL_SECS", 30));
    let sync_limit = env_parse("VCS_SYNC_LIMIT", 256usize);
    let max_sync_rounds = env_parse("VCS_MAX_SYNC_ROUNDS", 8usize);

    let identity = Arc::new(
        IdentityVault::open_for_repo(&repo_dir).context("opening identity vault")?,
    );
    let oplog = Arc::new(OpLog::open(gossip_dir.join("log")).context("opening op log")?);
    let peers = Arc::new(PeerRegistry::open(gossip_dir.join("peers")).context("opening peer registry")?);
    let consensus =
        Arc::new(ConsensusEngine::open(gossip_dir.join("consensus")).context("opening consensus config")?);
    let queue = Arc::new(
        PendingPushQueue::open(gossip_dir.join("pending_pushes")).context("opening pending push queue")?,
    );
    let backend = Arc::new(GitProcessBackend {
        repo_dir: repo_dir.clone(),
    });

    tracing::info!(node_id = %identity.node_id(), repo_dir = %repo_dir.display(), "starting vcsd");

    let config = DaemonConfig {
        listen_addr,
        gossip_interval,
        sync_limit,
        max_sync_rounds,
        request_timeout: Duration::from_secs(10),
    };
    let daemon = Daemon::new(config, identity, oplog, peers, consensus, queue, backend);

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        tracing::info!("shutdown signal received, draining");
        shutdown_cancel.cancel();
    });

    daemon.run(cancel).await.context("daemon run loop failed")?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
