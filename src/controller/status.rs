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

//! Derives the set status from the owned game servers.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::{
    api::{
        ConditionStatus, GameServer, GameServerSet, GameServerSetCondition,
        GameServerSetConditionType, GameServerSetStatus, GameServerState,
    },
    gameservers::predicates,
};

/// Counts replicas and ready replicas over the owned game servers. Servers
/// being deleted are invisible; drained servers awaiting deletion count as
/// replicas but not as ready.
pub fn compute_status(list: &[GameServer]) -> GameServerSetStatus {
    let mut status = GameServerSetStatus::default();
    for gs in list {
        if predicates::is_being_deleted(gs) {
            continue;
        }
        status.replicas += 1;
        if gs.status.state == GameServerState::Running && !predicates::is_deletable_with_gates(gs)
        {
            status.ready_replicas += 1;
        }
    }
    status
}

/// Returns the set's conditions with the `Scaling` condition upserted to the
/// given state. The transition time only moves when the state flips, keeping
/// steady-state reconciliations write-free.
pub fn scaling_conditions(gss: &GameServerSet, scaling: bool) -> Vec<GameServerSetCondition> {
    let target = if scaling {
        ConditionStatus::True
    } else {
        ConditionStatus::False
    };
    let mut conditions = gss.status.conditions.clone();
    let existing = conditions
        .iter_mut()
        .find(|condition| condition.type_ == GameServerSetConditionType::Scaling);

    match existing {
        Some(condition) if condition.status == target => {}
        Some(condition) => {
            condition.status = target;
            condition.last_transition_time = Some(Time(chrono::Utc::now()));
            condition.reason = scaling_reason(scaling).to_string();
        }
        None => conditions.push(GameServerSetCondition {
            type_: GameServerSetConditionType::Scaling,
            status: target,
            last_transition_time: Some(Time(chrono::Utc::now())),
            reason: scaling_reason(scaling).to_string(),
            message: String::new(),
        }),
    }
    conditions
}

fn scaling_reason(scaling: bool) -> &'static str {
    if scaling {
        "ScalingReplicas"
    } else {
        "ReplicasSettled"
    }
}
