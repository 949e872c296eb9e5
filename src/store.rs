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

//! The watched-store abstraction the reconciler runs against.
//!
//! List and set reads come from the watch cache; single game-server reads go
//! to the store of record, which is what the anti-race double checks rely on.

pub mod kube;

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::api::{GameServer, GameServerSet, GameServerSetStatus};

pub use self::kube::KubeStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },
    #[error("conflict writing {kind} {namespace}/{name}: {message}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        message: String,
    },
    #[error(transparent)]
    Api(#[from] ::kube::Error),
    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api(::kube::Error::Api(response)) => response.code == 404,
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            Self::Conflict { .. } => true,
            Self::Api(::kube::Error::Api(response)) => response.code == 409,
            _ => false,
        }
    }
}

/// Cluster object store with list/get, writes, and a status subresource.
///
/// The change feed counterpart is wired separately by the controller runner;
/// implementations only provide request/response operations.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Cached read of a set from the watch cache.
    async fn get_game_server_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<GameServerSet, StoreError>;

    /// Cached list of game servers matching the label selector.
    async fn list_game_servers(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<GameServer>, StoreError>;

    /// Authoritative read of a single game server from the store of record.
    async fn get_game_server(&self, namespace: &str, name: &str)
        -> Result<GameServer, StoreError>;

    async fn create_game_server(&self, gs: &GameServer) -> Result<GameServer, StoreError>;

    async fn update_game_server(&self, gs: &GameServer) -> Result<GameServer, StoreError>;

    async fn update_game_server_status(&self, gs: &GameServer) -> Result<GameServer, StoreError>;

    async fn update_game_server_set(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, StoreError>;

    async fn update_game_server_set_status(
        &self,
        gss: &GameServerSet,
    ) -> Result<GameServerSet, StoreError>;

    /// Merge-patch targeted at the status subresource, used when only
    /// conditions changed to sidestep optimistic-concurrency conflicts on
    /// the spec.
    async fn patch_game_server_set_status(
        &self,
        namespace: &str,
        name: &str,
        status: &GameServerSetStatus,
    ) -> Result<GameServerSet, StoreError>;
}

/// Whether the labels of an object satisfy the selector's match labels.
pub fn selector_matches(
    selector: &LabelSelector,
    labels: &Option<BTreeMap<String, String>>,
) -> bool {
    let Some(required) = selector.match_labels.as_ref() else {
        return true;
    };
    let empty = BTreeMap::new();
    let labels = labels.as_ref().unwrap_or(&empty);
    required
        .iter()
        .all(|(key, value)| labels.get(key) == Some(value))
}

/// Stringifies the selector's match labels the way the status field reports
/// them (`k1=v1,k2=v2`).
pub fn selector_string(selector: &LabelSelector) -> String {
    selector
        .match_labels
        .as_ref()
        .map(|labels| {
            labels
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",")
        })
        .unwrap_or_default()
}
