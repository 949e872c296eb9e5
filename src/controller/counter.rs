/*
 * Copyright 2024 The Garrison Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

//! In-memory count of live game servers per node, maintained from the change
//! feed and consulted by the packing-aware victim sort. Counts are advisory:
//! staleness only weakens sort quality.

use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{api::GameServer, gameservers::predicates};

#[derive(Default)]
pub struct NodeCounter {
    nodes: RwLock<HashMap<String, u64>>,
}

impl NodeCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of game servers counted on the node, if any.
    pub fn count(&self, node: &str) -> Option<u64> {
        self.nodes.read().get(node).copied()
    }

    pub fn inc(&self, node: &str) {
        *self.nodes.write().entry(node.to_string()).or_insert(0) += 1;
    }

    /// Decrements the node's count, dropping the entry at zero. Unknown
    /// nodes are ignored.
    pub fn dec(&self, node: &str) {
        let mut nodes = self.nodes.write();
        let Some(count) = nodes.get_mut(node) else {
            return;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            nodes.remove(node);
        }
    }
}

/// Applies one change-feed event to the counter. `old`/`new` follow the feed
/// shape: add is `(None, Some)`, update `(Some, Some)`, delete `(Some, None)`.
pub fn apply_feed_event(counter: &NodeCounter, old: Option<&GameServer>, new: Option<&GameServer>) {
    match (old, new) {
        (None, Some(gs)) => {
            if !predicates::is_being_deleted(gs) && !gs.status.node_name.is_empty() {
                counter.inc(&gs.status.node_name);
            }
        }
        (Some(old), Some(new)) => {
            if old.status.node_name.is_empty() && !new.status.node_name.is_empty() {
                counter.inc(&new.status.node_name);
            }
        }
        (Some(old), None) => {
            if !old.status.node_name.is_empty() {
                counter.dec(&old.status.node_name);
            }
        }
        (None, None) => {}
    }
}
