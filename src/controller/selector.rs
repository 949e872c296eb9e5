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

//! Deletion victim selection: classification decides which bucket a server
//! falls into, sorting decides who inside a bucket goes first.

use super::counter::NodeCounter;
use crate::{
    api::{GameServer, SchedulingStrategy},
    gameservers::predicates,
    metadata,
};

/// Victim buckets, in deletion-preference order.
#[derive(Debug, Default)]
pub struct ClassifiedGameServers {
    /// Servers deletable right now: in-place-updating (when classifying for
    /// an update), not yet ready, or with every deletable gate `True`.
    pub deletables: Vec<GameServer>,
    /// Servers already marked out of service, still draining.
    pub candidates: Vec<GameServer>,
    /// Everything else: serving traffic.
    pub runnings: Vec<GameServer>,
}

/// Buckets the servers for victim selection. Servers being deleted are
/// skipped; in-place-updating servers only participate when `updating`.
pub fn classify_game_servers(list: Vec<GameServer>, updating: bool) -> ClassifiedGameServers {
    let mut inplace_updatings = Vec::new();
    let mut not_readys = Vec::new();
    let mut deletables = Vec::new();
    let mut candidates = Vec::new();
    let mut runnings = Vec::new();

    for gs in list {
        if predicates::is_being_deleted(&gs) {
            continue;
        }
        if metadata::is_inplace_updating(&gs) {
            if updating {
                inplace_updatings.push(gs);
            }
        } else if predicates::is_before_ready(&gs) {
            not_readys.push(gs);
        } else if predicates::is_deletable(&gs) {
            deletables.push(gs);
        } else if predicates::is_out_of_service(&gs) {
            candidates.push(gs);
        } else {
            runnings.push(gs);
        }
    }

    let mut merged = inplace_updatings;
    merged.append(&mut not_readys);
    merged.append(&mut deletables);

    ClassifiedGameServers {
        deletables: merged,
        candidates,
        runnings,
    }
}

fn creation_time(gs: &GameServer) -> Option<chrono::DateTime<chrono::Utc>> {
    gs.metadata.creation_timestamp.as_ref().map(|time| time.0)
}

/// Stable ascending sort by the deletion-cost annotation; servers without
/// one sort first.
pub fn sort_by_deletion_cost(servers: &mut [GameServer]) {
    servers.sort_by_key(metadata::deletion_cost);
}

/// Oldest first.
pub fn sort_by_creation_time(servers: &mut [GameServer]) {
    servers.sort_by_key(creation_time);
}

/// Fewest game servers on the same node first, consolidating the fleet by
/// freeing the least-packed nodes; ties break to the older server.
pub fn sort_by_node_count(servers: &mut [GameServer], counter: &NodeCounter) {
    servers.sort_by_key(|gs| {
        (
            counter.count(&gs.status.node_name).unwrap_or(0),
            creation_time(gs),
        )
    });
}

/// The scale-down ordering: deletion cost first; when even the head carries
/// the `i64::MAX` do-not-delete sentinel, fall back to the packing strategy
/// or plain age.
pub fn sort_game_servers(
    mut servers: Vec<GameServer>,
    strategy: Option<SchedulingStrategy>,
    counter: &NodeCounter,
) -> Vec<GameServer> {
    if servers.is_empty() {
        return servers;
    }
    sort_by_deletion_cost(&mut servers);
    if metadata::deletion_cost(&servers[0]) == i64::MAX {
        if strategy == Some(SchedulingStrategy::MostAllocated) {
            sort_by_node_count(&mut servers, counter);
        } else {
            sort_by_creation_time(&mut servers);
        }
    }
    servers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConditionStatus, GameServerCondition, GameServerSpec, GameServerState};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn server(name: &str, state: GameServerState) -> GameServer {
        let mut gs = GameServer::new(name, GameServerSpec::default());
        gs.status.state = state;
        gs
    }

    fn drained(name: &str) -> GameServer {
        let mut gs = server(name, GameServerState::Running);
        gs.spec.deletable_gates = vec!["no-players".into()];
        gs.status.conditions = vec![GameServerCondition {
            type_: "no-players".into(),
            status: ConditionStatus::True,
            reason: String::new(),
            message: String::new(),
        }];
        gs
    }

    fn with_cost(mut gs: GameServer, cost: i64) -> GameServer {
        gs.metadata.annotations = Some(
            [(metadata::DELETION_COST_ANNOTATION.to_string(), cost.to_string())].into(),
        );
        gs
    }

    fn with_creation(mut gs: GameServer, secs: i64) -> GameServer {
        gs.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::from_timestamp(secs, 0).unwrap(),
        ));
        gs
    }

    fn names(servers: &[GameServer]) -> Vec<&str> {
        servers
            .iter()
            .map(|gs| gs.metadata.name.as_deref().unwrap())
            .collect()
    }

    #[test]
    fn classify_buckets_by_drainability() {
        let mut marked = server("marked", GameServerState::Running);
        marked.spec.constraints = vec![crate::gameservers::not_in_service_constraint()];
        marked.spec.deletable_gates = vec!["no-players".into()];

        let mut updating = drained("updating");
        metadata::set_inplace_updating(&mut updating, true);

        let list = vec![
            server("pending", GameServerState::Starting),
            drained("drained"),
            marked,
            server("serving", GameServerState::Running),
            server("exited", GameServerState::Exited),
            updating,
        ];

        let classified = classify_game_servers(list.clone(), false);
        assert_eq!(names(&classified.deletables), vec!["pending", "drained"]);
        assert_eq!(names(&classified.candidates), vec!["marked"]);
        assert_eq!(names(&classified.runnings), vec!["serving"]);

        // The updating server only participates when selecting for updates.
        let classified = classify_game_servers(list, true);
        assert_eq!(names(&classified.deletables), vec!["updating", "pending", "drained"]);
    }

    #[test]
    fn cost_sort_is_ascending_with_missing_first() {
        let mut servers = vec![
            with_cost(server("expensive", GameServerState::Running), 10),
            server("unpriced", GameServerState::Running),
            with_cost(server("cheap", GameServerState::Running), 0),
        ];
        sort_by_deletion_cost(&mut servers);
        assert_eq!(names(&servers), vec!["unpriced", "cheap", "expensive"]);
    }

    #[test]
    fn head_with_real_cost_skips_the_fallback() {
        let counter = NodeCounter::new();
        let servers = vec![
            with_cost(server("keep-1", GameServerState::Running), i64::MAX),
            with_cost(server("cheap", GameServerState::Running), 100),
            with_cost(server("keep-2", GameServerState::Running), i64::MAX),
        ];
        let sorted = sort_game_servers(servers, Some(SchedulingStrategy::MostAllocated), &counter);
        assert_eq!(names(&sorted), vec!["cheap", "keep-1", "keep-2"]);
    }

    #[test]
    fn all_sentinel_costs_fall_back_to_node_packing() {
        let counter = NodeCounter::new();
        for _ in 0..3 {
            counter.inc("node-a");
        }
        counter.inc("node-b");

        let mut on_a = with_cost(server("on-a", GameServerState::Running), i64::MAX);
        on_a.status.node_name = "node-a".into();
        let mut on_b = with_cost(server("on-b", GameServerState::Running), i64::MAX);
        on_b.status.node_name = "node-b".into();

        let sorted = sort_game_servers(
            vec![on_a, on_b],
            Some(SchedulingStrategy::MostAllocated),
            &counter,
        );
        // The server on the least-packed node is evicted first.
        assert_eq!(names(&sorted), vec!["on-b", "on-a"]);
    }

    #[test]
    fn all_sentinel_costs_fall_back_to_age_without_packing() {
        let counter = NodeCounter::new();
        let sorted = sort_game_servers(
            vec![
                with_creation(with_cost(server("young", GameServerState::Running), i64::MAX), 200),
                with_creation(with_cost(server("old", GameServerState::Running), i64::MAX), 100),
            ],
            Some(SchedulingStrategy::LeastAllocated),
            &counter,
        );
        assert_eq!(names(&sorted), vec!["old", "young"]);
    }

    #[test]
    fn node_count_ties_break_by_age() {
        let counter = NodeCounter::new();
        counter.inc("node-a");
        counter.inc("node-b");

        let mut young = with_creation(server("young", GameServerState::Running), 300);
        young.status.node_name = "node-a".into();
        let mut old = with_creation(server("old", GameServerState::Running), 100);
        old.status.node_name = "node-b".into();

        let mut servers = vec![young, old];
        sort_by_node_count(&mut servers, &counter);
        assert_eq!(names(&servers), vec!["old", "young"]);
    }
}
