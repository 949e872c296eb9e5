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

//! Stable label and annotation keys, and the typed accessors wrapping them.
//!
//! The string-keyed metadata below is a protocol shared with the
//! per-GameServer controller and the Squad controller; everything else in the
//! crate goes through these helpers rather than reading the raw maps.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use crate::api::{GameServer, GameServerSet};

/// Label marking every owned pod and game server with its role.
pub const ROLE_LABEL: &str = "garrison.dev/role";
/// Value of [`ROLE_LABEL`] for game servers.
pub const GAME_SERVER_ROLE: &str = "gameserver";
/// Label on a pod naming the game server that owns it.
pub const GAME_SERVER_POD_LABEL: &str = "garrison.dev/gameserver";
/// Label on a game server naming the set that owns it.
pub const GAME_SERVER_SET_LABEL: &str = "garrison.dev/gameserverset";
/// Content hash of the desired template, written by the set's owner and used
/// to partition new from old during in-place rollouts.
pub const GAME_SERVER_HASH_LABEL: &str = "garrison.dev/gameserver-hash";

/// Game-server annotation flagging an in-place update in progress.
pub const INPLACE_UPDATING_ANNOTATION: &str = "garrison.dev/inplace-updating";
/// Set annotation carrying the desired updated count of an in-place rollout.
pub const INPLACE_UPDATE_ANNOTATION: &str = "garrison.dev/inplace-update";
/// Set annotation tracking how many replicas are already upgraded.
pub const INPLACE_UPDATED_REPLICAS_ANNOTATION: &str = "garrison.dev/inplace-updated-replicas";
/// Set annotation present while a scale operation is underway.
pub const SCALING_REPLICAS_ANNOTATION: &str = "garrison.dev/scaling-replicas";
/// Game-server annotation biasing victim selection; `i64::MAX` means "keep".
pub const DELETION_COST_ANNOTATION: &str = "garrison.dev/deletion-cost";

/// Well-known name of the game-server container inside the pod template.
pub const GAME_SERVER_CONTAINER: &str = "server";
/// Name of the SDK server sidecar container appended to built pods.
pub const SDK_SERVER_CONTAINER: &str = "sdkserver";
/// Environment variable carrying the sidecar gRPC port.
pub const SDK_GRPC_PORT_ENV: &str = "SDK_GRPC_PORT";
/// Environment variable carrying the sidecar HTTP port.
pub const SDK_HTTP_PORT_ENV: &str = "SDK_HTTP_PORT";

fn annotation<'a>(annotations: &'a Option<BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
    annotations
        .as_ref()
        .and_then(|map| map.get(key))
        .map(String::as_str)
}

fn set_annotation(meta: &mut ObjectMeta, key: &str, value: String) {
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(key.to_string(), value);
}

/// The signed deletion cost of a game server; missing or unparsable
/// annotations sort as the minimum (most deletable).
pub fn deletion_cost(gs: &GameServer) -> i64 {
    annotation(&gs.metadata.annotations, DELETION_COST_ANNOTATION)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(i64::MIN)
}

/// Whether the game server is flagged as being updated in place.
pub fn is_inplace_updating(gs: &GameServer) -> bool {
    annotation(&gs.metadata.annotations, INPLACE_UPDATING_ANNOTATION) == Some("true")
}

/// Flags (or unflags) an in-place update on the game server.
pub fn set_inplace_updating(gs: &mut GameServer, updating: bool) {
    set_annotation(
        &mut gs.metadata,
        INPLACE_UPDATING_ANNOTATION,
        if updating { "true" } else { "false" }.to_string(),
    );
}

/// Whether a scale operation is pending on the set.
pub fn is_scaling(gss: &GameServerSet) -> bool {
    annotation(&gss.metadata.annotations, SCALING_REPLICAS_ANNOTATION) == Some("true")
}

/// The desired updated count of a pending in-place rollout, if one is
/// advertised and positive.
pub fn inplace_update_threshold(gss: &GameServerSet) -> Option<i32> {
    annotation(&gss.metadata.annotations, INPLACE_UPDATE_ANNOTATION)
        .and_then(|raw| raw.parse::<i32>().ok())
        .filter(|threshold| *threshold > 0)
}

/// How many replicas the current rollout has already upgraded.
pub fn inplace_updated_replicas(gss: &GameServerSet) -> i32 {
    annotation(&gss.metadata.annotations, INPLACE_UPDATED_REPLICAS_ANNOTATION)
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(0)
}

/// Records rollout progress on the set.
pub fn set_inplace_updated_replicas(gss: &mut GameServerSet, count: i32) {
    set_annotation(
        &mut gss.metadata,
        INPLACE_UPDATED_REPLICAS_ANNOTATION,
        count.to_string(),
    );
}

/// The template hash label of an object, if present.
pub fn template_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.labels
        .as_ref()
        .and_then(|labels| labels.get(GAME_SERVER_HASH_LABEL))
        .map(String::as_str)
}
