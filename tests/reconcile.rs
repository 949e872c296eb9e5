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

use std::sync::Arc;

use garrison::{
    api::{ConditionStatus, GameServerState, SchedulingStrategy},
    controller::queue::SetKey,
    events::{REASON_SUCCESSFUL_DELETE, REASON_SUCCESSFUL_MARK},
    gameservers::predicates,
    metadata, signal,
    test_utils::{game_server_set, owned_game_server, set_condition, InMemoryStore, RecordingEvents},
    Controller,
};
use pretty_assertions::assert_eq;

fn harness() -> (
    Arc<Controller>,
    Arc<InMemoryStore>,
    Arc<RecordingEvents>,
    signal::ShutdownTx,
) {
    let store = Arc::new(InMemoryStore::new());
    let events = Arc::new(RecordingEvents::new());
    let (tx, rx) = signal::channel();
    let controller = Arc::new(Controller::new(store.clone(), events.clone(), rx));
    (controller, store, events, tx)
}

#[tokio::test]
async fn scale_up_runs_in_bounded_batches() {
    let (controller, store, _events, _shutdown) = harness();
    store.seed_game_server_set(game_server_set("fleet", "default", 100));
    let key = SetKey::new("default", "fleet");

    // First tick can only realize 64 of 100 and reports the shortfall.
    assert!(controller.sync(&key).await.is_err());
    assert_eq!(store.game_servers().len(), 64);
    let requeued = controller.queue().next().await.unwrap();
    assert_eq!(requeued, key);
    controller.queue().done(requeued, false);

    for gs in store.game_servers() {
        assert_eq!(gs.status.state, GameServerState::Starting);
        assert!(gs
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|finalizers| finalizers.iter().any(|f| f == "garrison.dev")));
        assert!(garrison::gameservers::is_controlled_by(
            &gs,
            &store.game_server_set("default", "fleet").unwrap()
        ));
    }

    // Second tick tops the set up; third observes a full fleet.
    controller.sync(&key).await.unwrap();
    assert_eq!(store.game_servers().len(), 100);
    controller.sync(&key).await.unwrap();

    let gss = store.game_server_set("default", "fleet").unwrap();
    assert_eq!(gss.status.replicas, 100);
}

#[tokio::test]
async fn thousand_replica_scale_up_converges_within_the_batch_bound() {
    let (controller, store, _events, _shutdown) = harness();
    store.seed_game_server_set(game_server_set("fleet", "default", 1000));
    let key = SetKey::new("default", "fleet");

    let mut created_before = 0;
    for tick in 1..=16 {
        let result = controller.sync(&key).await;
        let created = store.game_servers().len();
        assert!(created - created_before <= 64, "tick {tick} overshot the batch cap");
        created_before = created;
        if tick == 16 {
            result.unwrap();
        }
    }
    assert_eq!(store.game_servers().len(), 1000);
}

#[tokio::test]
async fn scale_down_deletes_drained_servers_and_completes() {
    let (controller, store, events, _shutdown) = harness();
    let mut gss = game_server_set("fleet", "default", 3);
    gss.metadata.annotations = Some(
        [(metadata::SCALING_REPLICAS_ANNOTATION.to_string(), "true".to_string())].into(),
    );
    store.seed_game_server_set(gss.clone());

    for (name, cost, drained) in [
        ("fleet-1", Some(0), true),
        ("fleet-2", Some(10), true),
        ("fleet-3", None, false),
        ("fleet-4", None, false),
        ("fleet-5", None, false),
    ] {
        let mut gs = owned_game_server(&gss, name, GameServerState::Running);
        gs.spec.deletable_gates = vec!["no-players".into()];
        set_condition(
            &mut gs,
            "no-players",
            if drained { ConditionStatus::True } else { ConditionStatus::False },
        );
        if let Some(cost) = cost {
            gs.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert(metadata::DELETION_COST_ANNOTATION.to_string(), cost.to_string());
        }
        store.seed_game_server(gs);
    }

    controller.sync(&SetKey::new("default", "fleet")).await.unwrap();

    // The two drained servers are soft-deleted; the serving three untouched.
    for name in ["fleet-1", "fleet-2"] {
        assert_eq!(
            store.game_server("default", name).unwrap().status.state,
            GameServerState::Exited
        );
    }
    for name in ["fleet-3", "fleet-4", "fleet-5"] {
        let gs = store.game_server("default", name).unwrap();
        assert_eq!(gs.status.state, GameServerState::Running);
        assert!(!predicates::is_out_of_service(&gs));
    }
    assert_eq!(
        events
            .reasons()
            .iter()
            .filter(|reason| *reason == REASON_SUCCESSFUL_DELETE)
            .count(),
        2
    );

    // Realized deletions match observed minus desired: the scale completes.
    let gss = store.game_server_set("default", "fleet").unwrap();
    assert!(!metadata::is_scaling(&gss));
    // The soft-deleted servers still count until their teardown finalizes.
    assert_eq!(gss.status.replicas, 5);
    assert_eq!(gss.status.ready_replicas, 3);
}

#[tokio::test]
async fn scale_down_marks_serving_victims_out_of_service() {
    let (controller, store, events, _shutdown) = harness();
    let mut gss = game_server_set("fleet", "default", 3);
    gss.metadata.annotations = Some(
        [(metadata::SCALING_REPLICAS_ANNOTATION.to_string(), "true".to_string())].into(),
    );
    store.seed_game_server_set(gss.clone());

    for i in 1..=5 {
        let mut gs = owned_game_server(&gss, &format!("fleet-{i}"), GameServerState::Running);
        gs.spec.deletable_gates = vec!["no-players".into()];
        set_condition(&mut gs, "no-players", ConditionStatus::False);
        store.seed_game_server(gs);
    }

    controller.sync(&SetKey::new("default", "fleet")).await.unwrap();

    let marked: Vec<_> = store
        .game_servers()
        .into_iter()
        .filter(predicates::is_out_of_service)
        .collect();
    assert_eq!(marked.len(), 2);
    assert!(store
        .game_servers()
        .iter()
        .all(|gs| gs.status.state == GameServerState::Running));
    assert_eq!(
        events
            .reasons()
            .iter()
            .filter(|reason| *reason == REASON_SUCCESSFUL_MARK)
            .count(),
        2
    );

    // Nothing was actually deleted yet, so the scale is still in progress.
    let gss = store.game_server_set("default", "fleet").unwrap();
    assert!(metadata::is_scaling(&gss));
    assert!(gss
        .status
        .conditions
        .iter()
        .any(|condition| condition.status == ConditionStatus::True));
}

#[tokio::test]
async fn deletion_cost_head_overrides_packing() {
    let (controller, store, _events, _shutdown) = harness();
    let mut gss = game_server_set("fleet", "default", 2);
    gss.metadata.annotations = Some(
        [(metadata::SCALING_REPLICAS_ANNOTATION.to_string(), "true".to_string())].into(),
    );
    gss.spec.scheduling = Some(SchedulingStrategy::MostAllocated);
    store.seed_game_server_set(gss.clone());

    for (name, cost) in [
        ("fleet-1", 100),
        ("fleet-2", i64::MAX),
        ("fleet-3", i64::MAX),
    ] {
        let mut gs = owned_game_server(&gss, name, GameServerState::Running);
        gs.spec.deletable_gates = vec!["no-players".into()];
        set_condition(&mut gs, "no-players", ConditionStatus::False);
        gs.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(metadata::DELETION_COST_ANNOTATION.to_string(), cost.to_string());
        store.seed_game_server(gs);
    }

    controller.sync(&SetKey::new("default", "fleet")).await.unwrap();

    let marked: Vec<_> = store
        .game_servers()
        .into_iter()
        .filter(predicates::is_out_of_service)
        .map(|gs| gs.metadata.name.unwrap())
        .collect();
    assert_eq!(marked, vec!["fleet-1"]);
}

#[tokio::test]
async fn sentinel_costs_fall_back_to_least_packed_node() {
    let (controller, store, _events, _shutdown) = harness();
    let mut gss = game_server_set("fleet", "default", 2);
    gss.metadata.annotations = Some(
        [(metadata::SCALING_REPLICAS_ANNOTATION.to_string(), "true".to_string())].into(),
    );
    gss.spec.scheduling = Some(SchedulingStrategy::MostAllocated);
    store.seed_game_server_set(gss.clone());

    for _ in 0..3 {
        controller.counter().inc("node-a");
    }
    controller.counter().inc("node-b");

    for (name, node) in [("fleet-1", "node-a"), ("fleet-2", "node-a"), ("fleet-3", "node-b")] {
        let mut gs = owned_game_server(&gss, name, GameServerState::Running);
        gs.spec.deletable_gates = vec!["no-players".into()];
        set_condition(&mut gs, "no-players", ConditionStatus::False);
        gs.status.node_name = node.to_string();
        gs.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(metadata::DELETION_COST_ANNOTATION.to_string(), i64::MAX.to_string());
        store.seed_game_server(gs);
    }

    controller.sync(&SetKey::new("default", "fleet")).await.unwrap();

    let marked: Vec<_> = store
        .game_servers()
        .into_iter()
        .filter(predicates::is_out_of_service)
        .map(|gs| gs.metadata.name.unwrap())
        .collect();
    // node-b is the least packed; evicting from it consolidates the fleet.
    assert_eq!(marked, vec!["fleet-3"]);
}

#[tokio::test]
async fn cache_lag_skips_deletion_of_freshly_ready_server() {
    let (controller, store, _events, _shutdown) = harness();
    let gss = game_server_set("fleet", "default", 0);
    store.seed_game_server_set(gss.clone());

    let mut cached = owned_game_server(&gss, "fleet-1", GameServerState::Running);
    cached.spec.readiness_gates = vec!["session-manager".into()];

    let mut authoritative = cached.clone();
    set_condition(&mut authoritative, "session-manager", ConditionStatus::True);

    store.seed_game_server_lagged(cached, authoritative);

    controller.sync(&SetKey::new("default", "fleet")).await.unwrap();

    // The double check against the store of record saw a ready server and
    // issued no state update at all.
    store.with_ops(|ops| assert!(ops.game_server_status_updates.is_empty()));
    assert_eq!(
        store.game_server("default", "fleet-1").unwrap().status.state,
        GameServerState::Running
    );
}

#[tokio::test]
async fn steady_state_reconciliation_writes_nothing() {
    let (controller, store, _events, _shutdown) = harness();
    let gss = game_server_set("fleet", "default", 2);
    store.seed_game_server_set(gss.clone());
    for name in ["fleet-1", "fleet-2"] {
        store.seed_game_server(owned_game_server(&gss, name, GameServerState::Running));
    }
    let key = SetKey::new("default", "fleet");

    controller.sync(&key).await.unwrap();
    let (status_updates, patches) =
        store.with_ops(|ops| (ops.set_status_updates, ops.set_status_patches));

    controller.sync(&key).await.unwrap();
    store.with_ops(|ops| {
        assert_eq!(ops.set_status_updates, status_updates);
        assert_eq!(ops.set_status_patches, patches);
        assert!(ops.game_server_status_updates.is_empty());
        assert!(ops.game_server_updates.is_empty());
    });
}

#[tokio::test]
async fn game_server_events_feed_counter_and_queue() {
    use futures::StreamExt;
    use kube::runtime::watcher::Event;

    let (controller, store, _events, _shutdown) = harness();
    let gss = game_server_set("fleet", "default", 1);
    store.seed_game_server_set(gss.clone());

    let mut gs = owned_game_server(&gss, "fleet-1", GameServerState::Running);
    gs.status.node_name = "node-a".to_string();

    let feed = futures::stream::iter(vec![
        Ok(Event::Apply(gs.clone())),
        Ok(Event::Delete(gs.clone())),
    ])
    .boxed();
    let _ = Arc::clone(&controller).watch_game_servers(feed).await;

    // Counted on apply, released on delete.
    assert_eq!(controller.counter().count("node-a"), None);

    // The owner was enqueued at high priority.
    let key = controller.queue().next().await.unwrap();
    assert_eq!(key, SetKey::new("default", "fleet"));
}
