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

//! The condition/gate algebra over a game-server snapshot.
//!
//! Every other component decides through these predicates; duplicating the
//! gate logic at call sites is how drain bugs happen. When the same condition
//! type is reported more than once, the latest entry wins.

use std::collections::HashMap;

use crate::{
    api::{ConditionStatus, ConstraintType, GameServer, GameServerState},
    metadata,
};

fn condition_map(gs: &GameServer) -> HashMap<&str, ConditionStatus> {
    gs.status
        .conditions
        .iter()
        .map(|condition| (condition.type_.as_str(), condition.status))
        .collect()
}

fn gates_passed(gs: &GameServer, gates: &[String]) -> bool {
    let conditions = condition_map(gs);
    gates
        .iter()
        .all(|gate| conditions.get(gate.as_str()) == Some(&ConditionStatus::True))
}

/// The server has a deletion timestamp, or reached a terminal state.
pub fn is_being_deleted(gs: &GameServer) -> bool {
    gs.metadata.deletion_timestamp.is_some()
        || matches!(
            gs.status.state,
            GameServerState::Failed | GameServerState::Exited
        )
}

/// The server has yet to reach `Ready`: it is still pending, or one of its
/// readiness-gate conditions is absent or not `True`.
pub fn is_before_ready(gs: &GameServer) -> bool {
    if matches!(
        gs.status.state,
        GameServerState::Unknown | GameServerState::Starting
    ) {
        return true;
    }
    !gates_passed(gs, &gs.spec.readiness_gates)
}

/// Every readiness-gate condition is present and `True`.
pub fn is_ready(gs: &GameServer) -> bool {
    gates_passed(gs, &gs.spec.readiness_gates)
}

/// The server declares readiness gates at all. Used together with
/// [`is_ready`] when double-checking against the authoritative store.
pub fn has_readiness_gates(gs: &GameServer) -> bool {
    !gs.spec.readiness_gates.is_empty()
}

/// An effective `NotInService` constraint marks the server as draining.
pub fn is_out_of_service(gs: &GameServer) -> bool {
    gs.spec
        .constraints
        .iter()
        .any(|constraint| {
            constraint.type_ == ConstraintType::NotInService && constraint.effective == Some(true)
        })
}

/// Every deletable-gate condition is present and `True`.
fn delete_ready(gs: &GameServer) -> bool {
    gates_passed(gs, &gs.spec.deletable_gates)
}

/// The server may be deleted: it is not mid in-place update and all deletable
/// gates are `True`.
pub fn is_deletable(gs: &GameServer) -> bool {
    if metadata::is_inplace_updating(gs) {
        return false;
    }
    delete_ready(gs)
}

/// [`is_deletable`], restricted to servers that declare deletable gates.
pub fn is_deletable_with_gates(gs: &GameServer) -> bool {
    !gs.spec.deletable_gates.is_empty() && is_deletable(gs)
}

/// Whether the server may be touched by the in-place update engine.
pub fn can_inplace_update(gs: &GameServer) -> bool {
    if is_being_deleted(gs) {
        return false;
    }
    if is_before_ready(gs) {
        return true;
    }
    metadata::is_inplace_updating(gs) && delete_ready(gs)
}
