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
#![warn(missing_docs)]

//! Decentralized metadata core for a Git-compatible VCS wrapper.
//!
//! This crate provides:
//! - A per-repository, append-only, Ed25519-signed operation log (`oplog`)
//! - Anti-entropy gossip replication of that log over HTTP (`sync`)
//! - A derived propose/vote/certify consensus layer gating pushes on
//!   quorum (`consensus`)
//! - A durable queue of in-flight push intents (`pending_push`)
//! - A push orchestrator driving intents through consensus to an external,
//!   opaque VCS backend (`push`)
//! - The daemon binding all of the above behind one process (`daemon`)
//!
//! Actual repository mutation is delegated entirely to an external
//! `VCSBackend`; this crate never shells out to parse or interpret a
//! repository itself.
//!
//! Each component owns a narrow `thiserror` error type of its own
//! (`IdentityError`, `OpLogError`, `PeerRegistryError`, `ConsensusError`,
//! `PendingPushError`, `SyncError`, `PushError`) rather than funnelling
//! through one crate-wide enum; composition layers (`push`, `daemon`)
//! convert a sibling's error into their own via `From` where they call into
//! it. Binaries report errors with `anyhow` at the process boundary.

/// Persistent Ed25519 node identity.
pub mod identity;
/// Append-only, signed operation log.
pub mod oplog;
/// Normalized, persistent set of peer base URLs.
pub mod peers;
/// Proposal / vote / certification state machine.
pub mod consensus;
/// Durable queue of push intents.
pub mod pending_push;
/// Anti-entropy sync protocol.
pub mod sync;
/// Push orchestration against an external VCS backend.
pub mod push;
/// The long-running daemon process.
pub mod daemon;
