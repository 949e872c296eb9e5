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

use crate::api::{
    self, GameServer, GameServerSpec, GameServerState, PortPolicy, SchedulingStrategy,
    SdkServerLogLevel,
};

const DEFAULT_SDK_GRPC_PORT: i32 = 9020;
const DEFAULT_SDK_HTTP_PORT: i32 = 9021;

/// Applies default values to a [`GameServer`] that are not already populated.
///
/// Applying defaults to an already-defaulted server is a fixed point.
pub fn apply_defaults(gs: &mut GameServer) {
    gs.metadata
        .annotations
        .get_or_insert_with(Default::default)
        .insert(api::GROUP.to_string(), api::API_VERSION.to_string());
    let finalizers = gs.metadata.finalizers.get_or_insert_with(Default::default);
    if !finalizers.iter().any(|finalizer| finalizer == api::GROUP) {
        finalizers.push(api::GROUP.to_string());
    }

    apply_spec_defaults(&mut gs.spec);

    if gs.status.state == GameServerState::Unknown {
        gs.status.state = GameServerState::Starting;
    }
}

fn apply_spec_defaults(spec: &mut GameServerSpec) {
    if is_host_port_network(spec) {
        apply_port_defaults(spec);
    }
    if spec.scheduling.is_none() {
        spec.scheduling = Some(SchedulingStrategy::MostAllocated);
    }
    apply_sdk_server_defaults(spec);
}

fn apply_port_defaults(spec: &mut GameServerSpec) {
    for port in &mut spec.ports {
        if port.port_policy.is_none() {
            port.port_policy = Some(PortPolicy::Dynamic);
        }
        if port.protocol.is_empty() {
            port.protocol = "UDP".to_string();
        }
    }
}

fn apply_sdk_server_defaults(spec: &mut GameServerSpec) {
    let sdk = &mut spec.sdk_server;
    if sdk.log_level.is_none() {
        sdk.log_level = Some(SdkServerLogLevel::Info);
    }
    if sdk.grpc_port == 0 {
        sdk.grpc_port = DEFAULT_SDK_GRPC_PORT;
    }
    if sdk.http_port == 0 {
        sdk.http_port = DEFAULT_SDK_HTTP_PORT;
    }
}

/// Whether the game server's pod template runs with host networking.
pub fn is_host_port_network(spec: &GameServerSpec) -> bool {
    spec.template
        .spec
        .as_ref()
        .and_then(|pod| pod.host_network)
        .unwrap_or(false)
}
