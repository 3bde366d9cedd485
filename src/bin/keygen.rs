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

//! Bootstraps (or inspects) a node's persistent identity without running
//! the daemon. Usage: `keygen [identity-dir]`, defaulting to `./data/identity`.

use anyhow::Result;
use std::path::PathBuf;
use vcs_gossip_core::identity::IdentityVault;

fn main() -> Result<()> {
    tracing_subscriber::fmt::try_init().ok();

    let dir = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("data/identity"));

    let vault = IdentityVault::open(&dir)?;
    println!("node_id:    {}", vault.node_id());
    println!("public_key: {}", vault.public_key_b64());
    Ok(())
}
