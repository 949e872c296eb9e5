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

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    runtime::reflector::{ObjectRef, Store},
};

use super::{selector_matches, ObjectStore, StoreError};
use crate::api::{GameServer, GameServerSet, GameServerSetStatus};

/// Store backed by the kubernetes API, with reads served from reflector
/// caches kept warm by the controller's watch streams.
#[derive(Clone)]
pub struct KubeStore {
    client: kube::Client,
    game_servers: Store<GameServer>,
    game_server_sets: Store<GameServerSet>,
}

impl KubeStore {
    pub fn new(
        client: kube::Client,
        game_servers: Store<GameServer>,
        game_server_sets: Store<GameServerSet>,
    ) -> Self {
        Self {
            client,
            game_servers,
            game_server_sets,
        }
    }

    fn game_servers_api(&self, namespace: &str) -> Api<GameServer> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn game_server_sets_api(&self, namespace: &str) -> Api<GameServerSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn not_found(kind: &'static str, namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get_game_server_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GameServerSet, StoreError> {
        self.game_server_sets
            .get(&ObjectRef::new(name).within(namespace))
            .map(|gss| (*gss).clone())
            .ok_or_else(|| Self::not_found("GameServerSet", namespace, name))
    }

    async fn list_game_servers(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<GameServer>, StoreError> {
        Ok(self
            .game_servers
            .state()
            .into_iter()
            .filter(|gs| gs.metadata.namespace.as_deref() == Some(namespace))
            .filter(|gs| selector_matches(selector, &gs.metadata.labels))
            .map(|gs| (*gs).clone())
            .collect())
    }

    async fn get_game_server(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GameServer, StoreError> {
        self.game_servers_api(namespace)
            .get(name)
            .await
            .map_err(StoreError::from)
    }

    async fn create_game_server(&self, gs: &GameServer) -> Result<GameServer, StoreError> {
        let namespace = gs.metadata.namespace.as_deref().unwrap_or_default();
        self.game_servers_api(namespace)
            .create(&PostParams::default(), gs)
            .await
            .map_err(StoreError::from)
    }

    async fn update_game_server(&self, gs: &GameServer) -> Result<GameServer, StoreError> {
        let namespace = gs.metadata.namespace.as_deref().unwrap_or_default();
        let name = gs.metadata.name.as_deref().unwrap_or_default();
        self.game_servers_api(namespace)
            .replace(name, &PostParams::default(), gs)
            .await
            .map_err(StoreError::from)
    }

    async fn update_game_server_status(&self, gs: &GameServer) -> Result<GameServer, StoreError> {
        let namespace = gs.metadata.namespace.as_deref().unwrap_or_default();
        let name = gs.metadata.name.as_deref().unwrap_or_default();
        let body = serde_json::to_vec(gs).map_err(|err| StoreError::Other(err.to_string()))?;
        self.game_servers_api(namespace)
            .replace_status(name, &PostParams::default(), body)
            .await
            .map_err(StoreError::from)
    }

    async fn update_game_server_set(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, StoreError> {
        let namespace = gss.metadata.namespace.as_deref().unwrap_or_default();
        let name = gss.metadata.name.as_deref().unwrap_or_default();
        self.game_server_sets_api(namespace)
            .replace(name, &PostParams::default(), gss)
            .await
            .map_err(StoreError::from)
    }

    async fn update_game_server_set_status(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, StoreError> {
        let namespace = gss.metadata.namespace.as_deref().unwrap_or_default();
        let name = gss.metadata.name.as_deref().unwrap_or_default();
        let body = serde_json::to_vec(gss).map_err(|err| StoreError::Other(err.to_string()))?;
        self.game_server_sets_api(namespace)
            .replace_status(name, &PostParams::default(), body)
            .await
            .map_err(StoreError::from)
    }

    async fn patch_game_server_set_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GameServerSetStatus,
    ) -> Result<GameServerSet, StoreError> {
        let patch = serde_json::json!({ "status": status });
        self.game_server_sets_api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(StoreError::from)
    }
}
