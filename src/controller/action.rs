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

//! Computes what a single reconciliation tick may do: a bounded number of
//! creations, a bounded list of deletions, and whether the tick was partial.

use super::{
    counter::NodeCounter,
    selector::{classify_game_servers, sort_game_servers},
};
use crate::{
    api::{GameServer, GameServerSet, GameServerState},
    gameservers::predicates,
    metadata,
};

/// Budgets keeping one reconciliation tick bounded. These caps are the single
/// source of backpressure for the worker pool.
#[derive(Clone, Copy, Debug)]
pub struct Budgets {
    /// Most game servers created per tick.
    pub max_creations: usize,
    /// Most game servers deleted or marked per tick.
    pub max_deletions: usize,
    /// Ceiling on pending (pod-less or starting) game servers per set.
    pub max_pending: usize,
}

impl Default for Budgets {
    fn default() -> Self {
        Self {
            max_creations: 64,
            max_deletions: 64,
            max_pending: 5000,
        }
    }
}

/// The outcome of [`compute_reconciliation_action`].
#[derive(Debug, Default)]
pub struct ReconciliationAction {
    pub to_add: usize,
    pub to_delete: Vec<GameServer>,
    /// A budget was hit; the caller should requeue the set immediately.
    pub partial: bool,
}

/// Decides the bounded add count and delete list for one tick, given the
/// owned game servers that were found and the target replica count.
pub fn compute_reconciliation_action(
    gss: &GameServerSet,
    list: &[GameServer],
    counter: &NodeCounter,
    budgets: Budgets,
) -> ReconciliationAction {
    let scaling = metadata::is_scaling(gss);
    let exclude_constrained = gss.spec.exclude_constraints.unwrap_or(false);

    let mut up_count = 0i32;
    let mut pending_count = 0i32;
    let mut potential_deletions: Vec<GameServer> = Vec::new();
    let mut to_delete: Vec<GameServer> = Vec::new();

    for gs in list {
        if predicates::is_being_deleted(gs) {
            continue;
        }
        match gs.status.state {
            GameServerState::Unknown | GameServerState::Starting => {
                pending_count += 1;
                up_count += 1;
            }
            GameServerState::Running => {
                // Constrained from outside and the set excludes such servers:
                // it is already draining under external intent, so it neither
                // counts as up nor competes for deletion.
                if predicates::is_out_of_service(gs)
                    && exclude_constrained
                    && !metadata::is_inplace_updating(gs)
                {
                    tracing::debug!(
                        name = gs.metadata.name.as_deref().unwrap_or_default(),
                        "excluding out-of-service game server from replica accounting"
                    );
                    continue;
                }
                if predicates::is_deletable_with_gates(gs) {
                    // Fully drained; deletable this tick regardless of diff.
                    to_delete.push(gs.clone());
                } else {
                    up_count += 1;
                }
            }
            state => {
                tracing::debug!(?state, "game server in unexpected state");
            }
        }
        potential_deletions.push(gs.clone());
    }

    let diff = gss.spec.replicas - up_count;
    let mut partial = false;
    let mut to_add = 0usize;

    if diff > 0 {
        let desired = diff as usize;
        to_add = desired.min(budgets.max_creations);
        if to_add + pending_count as usize > budgets.max_pending {
            to_add = budgets.max_pending.saturating_sub(pending_count as usize);
        }
        partial = to_add != desired;
    } else if diff < 0 {
        let need = (-diff) as usize;
        let ordered = if scaling {
            let classified = classify_game_servers(potential_deletions, false);
            let runnings =
                sort_game_servers(classified.runnings, gss.spec.scheduling, counter);
            let mut ordered = classified.deletables;
            ordered.extend(classified.candidates);
            ordered.extend(runnings);
            ordered
        } else {
            sort_game_servers(potential_deletions, gss.spec.scheduling, counter)
        };

        let mut take = need.min(ordered.len());
        if take > budgets.max_deletions {
            take = budgets.max_deletions;
            partial = true;
        }
        to_delete.extend(ordered.into_iter().take(take));
    }

    ReconciliationAction {
        to_add,
        to_delete,
        partial,
    }
}
