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

//! S7: a push stays pending until a remote peer gossips back a yes vote,
//! at which point a later `process_pending` sweep certifies and executes it.

#![forbid(unsafe_code)]

use std::sync::Mutex;
use vcs_gossip_core::consensus::{ConsensusConfig, ConsensusEngine, Decision};
use vcs_gossip_core::identity::IdentityVault;
use vcs_gossip_core::oplog::OpLog;
use vcs_gossip_core::pending_push::{PendingPushQueue, PushStatus};
use vcs_gossip_core::push::{PushError, PushOrchestrator, VCSBackend};

struct FakeBackend {
    push_calls: Mutex<Vec<Vec<String>>>,
}

impl VCSBackend for FakeBackend {
    fn run(&self, args: &[String]) -> Result<String, PushError> {
        match args.first().map(|s| s.as_str()) {
            Some("symbolic-ref") => Ok("main".to_string()),
            Some("rev-parse") => Ok("cafef00d".to_string()),
            Some("push") => {
                self.push_calls.lock().unwrap().push(args.to_vec());
                Ok(String::new())
            }
            _ => Err(PushError::Backend("unhandled".into())),
        }
    }
}

#[test]
fn pending_push_waits_for_remote_vote_then_completes() {
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();

    let identity_a = IdentityVault::open(dir_a.path().join("id")).unwrap();
    let identity_b = IdentityVault::open(dir_b.path().join("id")).unwrap();
    let oplog_a = OpLog::open(dir_a.path().join("log")).unwrap();
    let oplog_b = OpLog::open(dir_b.path().join("log")).unwrap();

    let members = vec![identity_a.node_id().to_string(), identity_b.node_id().to_string()];
    let consensus_a = ConsensusEngine::open(dir_a.path().join("c")).unwrap();
    consensus_a
        .set_config(ConsensusConfig { threshold: 0.5, members: members.clone() })
        .unwrap();
    let consensus_b = ConsensusEngine::open(dir_b.path().join("c")).unwrap();
    consensus_b.set_config(ConsensusConfig { threshold: 0.5, members }).unwrap();

    let queue_a = PendingPushQueue::open(dir_a.path().join("q")).unwrap();
    let backend_a = FakeBackend { push_calls: Mutex::new(Vec::new()) };

    let orchestrator_a =
        PushOrchestrator::new(&oplog_a, &identity_a, &consensus_a, &queue_a, &backend_a);
    let proposal_id = orchestrator_a.push(vec!["origin".to_string()]).unwrap();

    // Only A has voted; the proposal isn't synced to B yet, so A still
    // lacks quorum and the push remains queued.
    let pending = queue_a.get(&proposal_id).unwrap();
    assert_eq!(pending.status, PushStatus::Pending);
    assert_eq!(backend_a.push_calls.lock().unwrap().len(), 0);

    // Gossip: B pulls the proposal, casts a yes vote, and A pulls it back.
    for op in oplog_a.ops(0) {
        oplog_b.add_remote_op(op).unwrap();
    }
    consensus_b
        .cast_vote(&oplog_b, &identity_b, &proposal_id, Decision::Yes)
        .unwrap();
    for op in oplog_b.ops(0) {
        let _ = oplog_a.add_remote_op(op);
    }

    let summary = orchestrator_a.process_pending(Some(&proposal_id)).unwrap();
    assert_eq!(summary.executed, 1);

    let completed = queue_a.get(&proposal_id).unwrap();
    assert_eq!(completed.status, PushStatus::Completed);
    assert_eq!(backend_a.push_calls.lock().unwrap().len(), 1);
}
