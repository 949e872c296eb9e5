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

//! In-memory collaborators for driving full reconciliations in tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, Time};
use parking_lot::Mutex;

use crate::{
    api::{
        ConditionStatus, GameServer, GameServerCondition, GameServerSet, GameServerSetStatus,
        GameServerSpec, GameServerState,
    },
    events::EventSink,
    store::{selector_matches, ObjectStore, StoreError},
};

/// Everything the reconciler did to the store, for assertions.
#[derive(Debug, Default)]
pub struct OpLog {
    /// `(name, state)` per game-server status write, in issue order.
    pub game_server_status_updates: Vec<(String, GameServerState)>,
    pub game_server_updates: Vec<String>,
    pub game_server_creates: u32,
    pub set_updates: u32,
    pub set_status_updates: u32,
    pub set_status_patches: u32,
}

#[derive(Default)]
struct State {
    /// What the watch cache sees. Lags `authoritative` when a test says so.
    cached: BTreeMap<String, GameServer>,
    /// The store of record.
    authoritative: BTreeMap<String, GameServer>,
    sets: BTreeMap<String, GameServerSet>,
    generated: u64,
    ops: OpLog,
    set_update_not_found_budget: u32,
}

/// An [`ObjectStore`] over plain maps. Game-server reads can be served from
/// a deliberately lagging cache to exercise the anti-race double checks.
#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

fn object_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

fn key_of(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    object_key(
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default(),
    )
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts the game server into both the cache and the store of record.
    pub fn seed_game_server(&self, gs: GameServer) {
        let mut state = self.state.lock();
        let key = key_of(&gs.metadata);
        state.cached.insert(key.clone(), gs.clone());
        state.authoritative.insert(key, gs);
    }

    /// Inserts diverging views: the watch cache sees `cached`, the store of
    /// record `authoritative`.
    pub fn seed_game_server_lagged(&self, cached: GameServer, authoritative: GameServer) {
        let mut state = self.state.lock();
        state.cached.insert(key_of(&cached.metadata), cached);
        state
            .authoritative
            .insert(key_of(&authoritative.metadata), authoritative);
    }

    pub fn seed_game_server_set(&self, gss: GameServerSet) {
        self.state.lock().sets.insert(key_of(&gss.metadata), gss);
    }

    /// Makes the next `n` set updates fail with a not-found error.
    pub fn fail_set_updates_not_found(&self, n: u32) {
        self.state.lock().set_update_not_found_budget = n;
    }

    pub fn game_server(&self, namespace: &str, name: &str) -> Option<GameServer> {
        self.state
            .lock()
            .authoritative
            .get(&object_key(namespace, name))
            .cloned()
    }

    pub fn game_servers(&self) -> Vec<GameServer> {
        self.state.lock().authoritative.values().cloned().collect()
    }

    pub fn game_server_set(&self, namespace: &str, name: &str) -> Option<GameServerSet> {
        self.state
            .lock()
            .sets
            .get(&object_key(namespace, name))
            .cloned()
    }

    pub fn with_ops<T>(&self, f: impl FnOnce(&OpLog) -> T) -> T {
        f(&self.state.lock().ops)
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_game_server_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GameServerSet, StoreError> {
        self.state
            .lock()
            .sets
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "GameServerSet",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn list_game_servers(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<GameServer>, StoreError> {
        Ok(self
            .state
            .lock()
            .cached
            .values()
            .filter(|gs| gs.metadata.namespace.as_deref() == Some(namespace))
            .filter(|gs| selector_matches(selector, &gs.metadata.labels))
            .cloned()
            .collect())
    }

    async fn get_game_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GameServer, StoreError> {
        self.state
            .lock()
            .authoritative
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "GameServer",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn create_game_server(&self, gs: &GameServer) -> Result<GameServer, StoreError> {
        let mut state = self.state.lock();
        let mut gs = gs.clone();
        if gs.metadata.name.is_none() {
            let prefix = gs.metadata.generate_name.clone().unwrap_or_default();
            state.generated += 1;
            gs.metadata.name = Some(format!("{prefix}{:05}", state.generated));
        }
        let serial = state.generated;
        gs.metadata.uid = Some(format!("uid-{serial}"));
        gs.metadata.creation_timestamp = Some(Time(
            chrono::DateTime::from_timestamp(serial as i64, 0)
                .unwrap_or(chrono::DateTime::UNIX_EPOCH),
        ));
        let key = key_of(&gs.metadata);
        state.cached.insert(key.clone(), gs.clone());
        state.authoritative.insert(key, gs.clone());
        state.ops.game_server_creates += 1;
        Ok(gs)
    }

    async fn update_game_server(&self, gs: &GameServer) -> Result<GameServer, StoreError> {
        let mut state = self.state.lock();
        let key = key_of(&gs.metadata);
        let existing = state.authoritative.get(&key).cloned().ok_or_else(|| {
            StoreError::NotFound {
                kind: "GameServer",
                namespace: gs.metadata.namespace.clone().unwrap_or_default(),
                name: gs.metadata.name.clone().unwrap_or_default(),
            }
        })?;
        // A plain replace cannot move the status subresource.
        let mut updated = gs.clone();
        updated.status = existing.status;
        state.cached.insert(key.clone(), updated.clone());
        state.authoritative.insert(key, updated.clone());
        state
            .ops
            .game_server_updates
            .push(updated.metadata.name.clone().unwrap_or_default());
        Ok(updated)
    }

    async fn update_game_server_status(&self, gs: &GameServer) -> Result<GameServer, StoreError> {
        let mut state = self.state.lock();
        let key = key_of(&gs.metadata);
        let mut existing = state.authoritative.get(&key).cloned().ok_or_else(|| {
            StoreError::NotFound {
                kind: "GameServer",
                namespace: gs.metadata.namespace.clone().unwrap_or_default(),
                name: gs.metadata.name.clone().unwrap_or_default(),
            }
        })?;
        existing.status = gs.status.clone();
        state.cached.insert(key.clone(), existing.clone());
        state.authoritative.insert(key, existing.clone());
        state.ops.game_server_status_updates.push((
            existing.metadata.name.clone().unwrap_or_default(),
            existing.status.state,
        ));
        Ok(existing)
    }

    async fn update_game_server_set(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, StoreError> {
        let mut state = self.state.lock();
        if state.set_update_not_found_budget > 0 {
            state.set_update_not_found_budget -= 1;
            return Err(StoreError::NotFound {
                kind: "GameServerSet",
                namespace: gss.metadata.namespace.clone().unwrap_or_default(),
                name: gss.metadata.name.clone().unwrap_or_default(),
            });
        }
        let key = key_of(&gss.metadata);
        let existing = state.sets.get(&key).cloned().ok_or_else(|| {
            StoreError::NotFound {
                kind: "GameServerSet",
                namespace: gss.metadata.namespace.clone().unwrap_or_default(),
                name: gss.metadata.name.clone().unwrap_or_default(),
            }
        })?;
        let mut updated = gss.clone();
        updated.status = existing.status;
        state.sets.insert(key, updated.clone());
        state.ops.set_updates += 1;
        Ok(updated)
    }

    async fn update_game_server_set_status(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, StoreError> {
        let mut state = self.state.lock();
        let key = key_of(&gss.metadata);
        let mut existing = state.sets.get(&key).cloned().ok_or_else(|| {
            StoreError::NotFound {
                kind: "GameServerSet",
                namespace: gss.metadata.namespace.clone().unwrap_or_default(),
                name: gss.metadata.name.clone().unwrap_or_default(),
            }
        })?;
        existing.status = gss.status.clone();
        state.sets.insert(key, existing.clone());
        state.ops.set_status_updates += 1;
        Ok(existing)
    }

    async fn patch_game_server_set_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GameServerSetStatus,
    ) -> Result<GameServerSet, StoreError> {
        let mut state = self.state.lock();
        let key = object_key(namespace, name);
        let mut existing = state.sets.get(&key).cloned().ok_or_else(|| {
            StoreError::NotFound {
                kind: "GameServerSet",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }
        })?;
        existing.status = status.clone();
        state.sets.insert(key, existing.clone());
        state.ops.set_status_patches += 1;
        Ok(existing)
    }
}

/// Event sink remembering `(reason, note)` pairs.
#[derive(Default)]
pub struct RecordingEvents {
    published: Mutex<Vec<(String, String)>>,
}

impl RecordingEvents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reasons(&self) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .map(|(reason, _)| reason.clone())
            .collect()
    }

    pub fn notes_for(&self, reason: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(r, _)| r == reason)
            .map(|(_, note)| note.clone())
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingEvents {
    async fn publish(&self, _gss: &GameServerSet, reason: &str, note: String) {
        self.published
            .lock()
            .push((reason.to_string(), note));
    }
}

/// A game server owned by the set, in the given state.
pub fn owned_game_server(
    gss: &GameServerSet,
    name: &str,
    state: GameServerState,
) -> GameServer {
    let mut gs = crate::gameservers::game_server_from_set(gss);
    gs.metadata.name = Some(name.to_string());
    gs.metadata.generate_name = None;
    gs.metadata.uid = Some(format!("uid-{name}"));
    gs.status.state = state;
    gs
}

/// Sets a condition on the game server, as the per-GameServer controller
/// would report it.
pub fn set_condition(gs: &mut GameServer, type_: &str, status: ConditionStatus) {
    gs.status
        .conditions
        .retain(|condition| condition.type_ != type_);
    gs.status.conditions.push(GameServerCondition {
        type_: type_.to_string(),
        status,
        reason: String::new(),
        message: String::new(),
    });
}

/// A minimal set spec in `namespace` with the given replica target.
pub fn game_server_set(name: &str, namespace: &str, replicas: i32) -> GameServerSet {
    let mut gss = GameServerSet::new(name, Default::default());
    gss.metadata.namespace = Some(namespace.to_string());
    gss.metadata.uid = Some(format!("uid-{name}"));
    gss.spec.replicas = replicas;
    gss.spec.template.spec = GameServerSpec::default();
    gss
}
