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
    api::{ConditionStatus, GameServer, GameServerSet, GameServerState},
    controller::queue::SetKey,
    gameservers::predicates,
    metadata, signal,
    test_utils::{game_server_set, owned_game_server, set_condition, InMemoryStore, RecordingEvents},
    Controller,
};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
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

fn server_pod_template(image: &str) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: None,
        spec: Some(PodSpec {
            containers: vec![Container {
                name: metadata::GAME_SERVER_CONTAINER.to_string(),
                image: Some(image.to_string()),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

/// A set at hash `h2` with a pending rollout of the given size.
fn rollout_set(threshold: i32) -> GameServerSet {
    let mut gss = game_server_set("fleet", "default", 1);
    gss.metadata.labels = Some(
        [(metadata::GAME_SERVER_HASH_LABEL.to_string(), "h2".to_string())].into(),
    );
    gss.metadata.annotations = Some(
        [(metadata::INPLACE_UPDATE_ANNOTATION.to_string(), threshold.to_string())].into(),
    );
    gss.spec.template.spec.template = server_pod_template("game:v2");
    gss
}

/// A running server still on hash `h1`, with players keeping its deletable
/// gate `False` for now. A gate already `True` would route the server through
/// the drained-deletion path instead of the in-place engine.
fn old_hash_server(gss: &GameServerSet, name: &str) -> GameServer {
    let mut gs = owned_game_server(gss, name, GameServerState::Running);
    gs.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(metadata::GAME_SERVER_HASH_LABEL.to_string(), "h1".to_string());
    gs.spec.template = server_pod_template("game:v1");
    gs.spec.deletable_gates = vec!["no-players".into()];
    set_condition(&mut gs, "no-players", ConditionStatus::False);
    gs
}

/// The players left: the per-GameServer controller reports the gate `True`.
fn finish_draining(store: &InMemoryStore, name: &str) {
    let mut gs = store.game_server("default", name).unwrap();
    set_condition(&mut gs, "no-players", ConditionStatus::True);
    store.seed_game_server(gs);
}

#[tokio::test]
async fn inplace_rollout_drains_then_swaps() {
    let (controller, store, _events, _shutdown) = harness();
    let gss = rollout_set(1);
    store.seed_game_server_set(gss.clone());
    store.seed_game_server(old_hash_server(&gss, "fleet-1"));
    let key = SetKey::new("default", "fleet");

    // First tick: the candidate is taken out of service and flagged for the
    // update, in one write.
    controller.sync(&key).await.unwrap();
    let gs = store.game_server("default", "fleet-1").unwrap();
    assert!(metadata::is_inplace_updating(&gs));
    assert!(predicates::is_out_of_service(&gs));
    assert_eq!(
        gs.spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
        Some("game:v1"),
        "image must not move before the drain flag is visible"
    );

    // Still draining: the flagged server is not touched.
    controller.sync(&key).await.unwrap();
    let gss_now = store.game_server_set("default", "fleet").unwrap();
    assert_eq!(metadata::inplace_updated_replicas(&gss_now), 0);

    // Drained: the swap goes through and progress lands on the set.
    finish_draining(&store, "fleet-1");
    controller.sync(&key).await.unwrap();

    let gs = store.game_server("default", "fleet-1").unwrap();
    assert_eq!(
        gs.spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
        Some("game:v2")
    );
    assert_eq!(
        gs.metadata.labels.as_ref().unwrap()[metadata::GAME_SERVER_HASH_LABEL],
        "h2"
    );
    assert!(gs.spec.constraints.is_empty());
    assert!(!metadata::is_inplace_updating(&gs));
    assert!(gs.status.conditions.is_empty(), "gates must be re-reported");

    let gss = store.game_server_set("default", "fleet").unwrap();
    assert_eq!(metadata::inplace_updated_replicas(&gss), 1);
}

#[tokio::test]
async fn updated_count_is_monotonic_across_ticks() {
    let (controller, store, _events, _shutdown) = harness();
    let gss = rollout_set(1);
    store.seed_game_server_set(gss.clone());
    store.seed_game_server(old_hash_server(&gss, "fleet-1"));
    let key = SetKey::new("default", "fleet");

    let mut last = 0;
    for tick in 0..5 {
        if tick == 2 {
            finish_draining(&store, "fleet-1");
        }
        controller.sync(&key).await.unwrap();
        let gss = store.game_server_set("default", "fleet").unwrap();
        let updated = metadata::inplace_updated_replicas(&gss);
        assert!(updated >= last, "progress went backwards: {last} -> {updated}");
        last = updated;
    }
    assert_eq!(last, 1);
}

#[tokio::test]
async fn scale_up_on_new_hash_reconciles_the_counter() {
    let (controller, store, _events, _shutdown) = harness();
    let mut gss = rollout_set(2);
    gss.spec.replicas = 2;
    store.seed_game_server_set(gss.clone());

    // Both replicas already carry the new hash (a scale-up landed them).
    for name in ["fleet-1", "fleet-2"] {
        store.seed_game_server(owned_game_server(&gss, name, GameServerState::Running));
    }

    controller.sync(&SetKey::new("default", "fleet")).await.unwrap();

    let gss = store.game_server_set("default", "fleet").unwrap();
    assert_eq!(metadata::inplace_updated_replicas(&gss), 2);
}

#[tokio::test(start_paused = true)]
async fn progress_publish_retries_on_not_found() {
    let (controller, store, _events, _shutdown) = harness();
    let gss = rollout_set(1);
    store.seed_game_server_set(gss.clone());

    // Seed a candidate that is already drained and flagged, so a single tick
    // reaches the swap and the progress write.
    let mut gs = old_hash_server(&gss, "fleet-1");
    set_condition(&mut gs, "no-players", ConditionStatus::True);
    metadata::set_inplace_updating(&mut gs, true);
    gs.spec.constraints = vec![garrison::gameservers::not_in_service_constraint()];
    store.seed_game_server(gs);

    store.fail_set_updates_not_found(2);
    controller.sync(&SetKey::new("default", "fleet")).await.unwrap();

    let gss = store.game_server_set("default", "fleet").unwrap();
    assert_eq!(metadata::inplace_updated_replicas(&gss), 1);
}

#[tokio::test]
async fn rollout_leaves_new_hash_servers_alone() {
    let (controller, store, _events, _shutdown) = harness();
    let mut gss = rollout_set(2);
    gss.spec.replicas = 2;
    store.seed_game_server_set(gss.clone());

    // One server already upgraded, one still old.
    let mut upgraded = owned_game_server(&gss, "fleet-1", GameServerState::Running);
    upgraded.spec.template = server_pod_template("game:v2");
    store.seed_game_server(upgraded);
    store.seed_game_server(old_hash_server(&gss, "fleet-2"));

    let key = SetKey::new("default", "fleet");
    controller.sync(&key).await.unwrap();
    finish_draining(&store, "fleet-2");
    controller.sync(&key).await.unwrap();

    let upgraded = store.game_server("default", "fleet-1").unwrap();
    assert!(!metadata::is_inplace_updating(&upgraded));
    assert!(upgraded.spec.constraints.is_empty());

    let swapped = store.game_server("default", "fleet-2").unwrap();
    assert_eq!(
        swapped.spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
        Some("game:v2")
    );
}
