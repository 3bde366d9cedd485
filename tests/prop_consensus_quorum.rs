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

use proptest::prelude::*;
use std::time::Duration;
use vcs_gossip_core::consensus::{ConsensusConfig, ConsensusEngine, Decision, ProposeParams};
use vcs_gossip_core::identity::IdentityVault;
use vcs_gossip_core::oplog::OpLog;

struct Node {
    _dir: tempfile::TempDir,
    identity: IdentityVault,
    oplog: OpLog,
}

fn make_node() -> Node {
    let dir = tempfile::tempdir().unwrap();
    let identity = IdentityVault::open(dir.path().join("id")).unwrap();
    let oplog = OpLog::open(dir.path().join("log")).unwrap();
    Node { _dir: dir, identity, oplog }
}

fn sync_all(logs: &[&OpLog]) {
    for i in 0..logs.len() {
        for j in 0..logs.len() {
            if i == j {
                continue;
            }
            for op in logs[i].ops(0) {
                let _ = logs[j].add_remote_op(op);
            }
        }
    }
}

proptest! {
    // P7: required_yes == floor(threshold * |members|) + 1, and has_quorum
    // flips exactly at that count regardless of vote arrival order.
    #[test]
    fn prop_quorum_flips_at_required_yes_count(
        member_count in 2usize..6,
        threshold_pct in 0u32..95u32,
        yes_count in 0usize..6,
    ) {
        let yes_count = yes_count.min(member_count);
        let threshold = threshold_pct as f64 / 100.0;

        let nodes: Vec<Node> = (0..member_count).map(|_| make_node()).collect();
        let logs: Vec<&OpLog> = nodes.iter().map(|n| &n.oplog).collect();
        let members: Vec<String> = nodes.iter().map(|n| n.identity.node_id().to_string()).collect();

        let engine = ConsensusEngine::open(nodes[0]._dir.path().join("c")).unwrap();
        engine.set_config(ConsensusConfig { threshold, members: members.clone() }).unwrap();

        let proposal = engine
            .propose_ref_update(
                &nodes[0].oplog,
                &nodes[0].identity,
                ProposeParams {
                    ref_name: "refs/heads/main".into(),
                    new_oid: "deadbeef".into(),
                    ttl: Duration::from_secs(3600),
                    ..Default::default()
                },
            )
            .unwrap();

        sync_all(&logs);

        for node in nodes.iter().take(yes_count) {
            engine
                .cast_vote(&node.oplog, &node.identity, &proposal.proposal_id, Decision::Yes)
                .unwrap();
        }
        sync_all(&logs);

        let status = engine.status(&nodes[0].oplog, &proposal.proposal_id).unwrap();
        let expected_required = (threshold * member_count as f64).floor() as usize + 1;

        prop_assert_eq!(status.required_yes, expected_required);
        prop_assert_eq!(status.has_quorum, yes_count >= expected_required);
    }
}
