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

//! End-to-end anti-entropy convergence across more than two stores,
//! exercised over real HTTP servers rather than in-process log splicing.

#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use vcs_gossip_core::identity::IdentityVault;
use vcs_gossip_core::oplog::OpLog;
use vcs_gossip_core::sync::{default_client, router, sync_peer, SyncState};

async fn spawn_node() -> (tempfile::TempDir, IdentityVault, Arc<OpLog>, SocketAddr) {
    let dir = tempfile::tempdir().unwrap();
    let identity = IdentityVault::open(dir.path().join("id")).unwrap();
    let oplog = Arc::new(OpLog::open(dir.path().join("log")).unwrap());
    let state = Arc::new(SyncState {
        oplog: oplog.clone(),
        node_id: identity.node_id().to_string(),
    });
    let app = router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (dir, identity, oplog, addr)
}

// P5: given three stores that have each produced a disjoint slice of
// operations, repeated pairwise SyncPeer calls in a ring converge every
// store to the union of all three slices.
#[tokio::test]
async fn three_node_ring_converges_to_union() {
    let (_d1, id1, log1, addr1) = spawn_node().await;
    let (_d2, id2, log2, addr2) = spawn_node().await;
    let (_d3, id3, log3, addr3) = spawn_node().await;

    for _ in 0..4 {
        log1.append_local_op(&id1, "git.commit", serde_json::json!({"n": 1})).unwrap();
    }
    for _ in 0..3 {
        log2.append_local_op(&id2, "git.commit", serde_json::json!({"n": 2})).unwrap();
    }
    for _ in 0..2 {
        log3.append_local_op(&id3, "git.commit", serde_json::json!({"n": 3})).unwrap();
    }

    let client = default_client(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    // A few rounds around the ring is enough for a 3-node, fully-connected
    // reachability graph to reach a fixed point.
    for _ in 0..3 {
        sync_peer(&log1, &client, &format!("http://{addr2}"), 0, 8, &cancel).await.unwrap();
        sync_peer(&log2, &client, &format!("http://{addr3}"), 0, 8, &cancel).await.unwrap();
        sync_peer(&log3, &client, &format!("http://{addr1}"), 0, 8, &cancel).await.unwrap();
    }

    assert_eq!(log1.ops(0).len(), 9);
    assert_eq!(log2.ops(0).len(), 9);
    assert_eq!(log3.ops(0).len(), 9);

    let ids1: std::collections::BTreeSet<String> = log1.ops(0).into_iter().map(|o| o.id).collect();
    let ids2: std::collections::BTreeSet<String> = log2.ops(0).into_iter().map(|o| o.id).collect();
    let ids3: std::collections::BTreeSet<String> = log3.ops(0).into_iter().map(|o| o.id).collect();
    assert_eq!(ids1, ids2);
    assert_eq!(ids2, ids3);
}

// A peer that is briefly unreachable must not wedge the anti-entropy call
// for peers that are.
#[tokio::test]
async fn unreachable_peer_surfaces_a_network_error() {
    let (_d1, _id1, log1, _addr1) = spawn_node().await;
    let client = default_client(Duration::from_millis(200));
    let cancel = CancellationToken::new();

    let err = sync_peer(&log1, &client, "http://127.0.0.1:1", 0, 8, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, vcs_gossip_core::sync::SyncError::Network(_)));
}
