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

use k8s_openapi::{
    api::core::v1::PodTemplateSpec,
    apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time},
};
use kube::core::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A single game-server instance, backed by a pod materialized by the
/// per-GameServer controller.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq)]
pub struct GameServer {
    #[schemars(skip)]
    pub metadata: ObjectMeta,
    pub spec: GameServerSpec,
    #[serde(default)]
    pub status: GameServerStatus,
}

impl GameServer {
    pub fn new(name: &str, spec: GameServerSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: GameServerStatus::default(),
        }
    }
}

impl serde::Serialize for GameServer {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut obj = ser.serialize_struct("GameServer", 5)?;
        obj.serialize_field("apiVersion", &GameServer::api_version(&()))?;
        obj.serialize_field("kind", &GameServer::kind(&()))?;
        obj.serialize_field("metadata", &self.metadata)?;
        obj.serialize_field("spec", &self.spec)?;
        obj.serialize_field("status", &self.status)?;
        obj.end()
    }
}

impl Resource for GameServer {
    type DynamicType = ();
    type Scope = kube::core::NamespaceResourceScope;

    fn group(_: &()) -> std::borrow::Cow<'_, str> {
        super::GROUP.into()
    }

    fn kind(_: &()) -> std::borrow::Cow<'_, str> {
        "GameServer".into()
    }

    fn version(_: &()) -> std::borrow::Cow<'_, str> {
        super::VERSION.into()
    }

    fn api_version(_: &()) -> std::borrow::Cow<'_, str> {
        super::API_VERSION.into()
    }

    fn plural(_: &()) -> std::borrow::Cow<'_, str> {
        "gameservers".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl kube::core::object::HasSpec for GameServer {
    type Spec = GameServerSpec;

    fn spec(&self) -> &GameServerSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut GameServerSpec {
        &mut self.spec
    }
}

/// Desired configuration of a [`GameServer`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSpec {
    /// Ports exposed by the game server when the pod runs with host
    /// networking.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<GameServerPort>,
    /// Placement preference consulted by the packing-aware victim sort.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<SchedulingStrategy>,
    /// Parameters for the SDK server sidecar container.
    #[serde(default)]
    pub sdk_server: SdkServer,
    /// Constraints applied to the server; `NotInService` marks it for drain.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<Constraint>,
    /// Condition types that must all be `True` before the server counts as
    /// ready.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub readiness_gates: Vec<String>,
    /// Condition types that must all be `True` before the server may be
    /// deleted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deletable_gates: Vec<String>,
    /// Describes the pod that will be created for the game server.
    #[serde(default)]
    pub template: PodTemplateSpec,
}

/// Defines a port (or port range) exposed via the [`GameServer`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerPort {
    /// Descriptive name of the port.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// How the host port is populated; defaulted to `Dynamic` under host
    /// networking.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_policy: Option<PortPolicy>,
    /// Network protocol, defaulted to `UDP` under host networking.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port_range: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_port_range: Option<PortRange>,
}

/// An inclusive range of ports.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PortRange {
    pub min_port: i32,
    pub max_port: i32,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum PortPolicy {
    /// The system chooses an open host port for the game server.
    Dynamic,
    /// The user defines the host port in the configuration.
    Static,
}

/// The strategy used when scheduling game servers across a cluster.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SchedulingStrategy {
    /// Consolidate game servers on as few nodes as possible.
    #[default]
    MostAllocated,
    /// Spread game servers across many nodes.
    LeastAllocated,
}

/// Parameters for the SDK server sidecar container.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SdkServer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<SdkServerLogLevel>,
    /// Port the sidecar binds its gRPC server to; defaulted to 9020.
    #[serde(default)]
    pub grpc_port: i32,
    /// Port the sidecar binds its HTTP gateway to; defaulted to 9021.
    #[serde(default)]
    pub http_port: i32,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum SdkServerLogLevel {
    #[default]
    Info,
    Debug,
    Error,
}

/// A typed flag on a [`GameServer`]; `NotInService` marks it for drain.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Constraint {
    #[serde(rename = "type")]
    pub type_: ConstraintType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effective: Option<bool>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_added: Option<Time>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConstraintType {
    /// The game server must not take new traffic and should drain.
    NotInService,
}

/// Observed state of a [`GameServer`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerStatus {
    #[serde(default)]
    pub state: GameServerState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<GameServerCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer_status: Option<LoadBalancerStatus>,
}

/// Lifecycle state reported for a [`GameServer`].
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GameServerState {
    /// No state reported yet.
    #[default]
    #[serde(rename = "")]
    Unknown,
    Starting,
    Running,
    Failed,
    Exited,
}

/// A single observed condition, reported by external collaborators and
/// consulted through the readiness/deletable gates.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

/// Ingress details published for host-port networking.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ingress: Vec<LoadBalancerIngress>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerIngress {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ip: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<LoadBalancerPort>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_port_range: Option<PortRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_port_range: Option<PortRange>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub protocol: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_the_empty_string() {
        let state: GameServerState = serde_json::from_str("\"\"").unwrap();
        assert_eq!(state, GameServerState::Unknown);
        assert_eq!(serde_json::to_string(&GameServerState::Unknown).unwrap(), "\"\"");
        let state: GameServerState = serde_json::from_str("\"Running\"").unwrap();
        assert_eq!(state, GameServerState::Running);
    }

    #[test]
    fn serialize_includes_type_meta() {
        let gs = GameServer::new("gs-0", GameServerSpec::default());
        let value = serde_json::to_value(&gs).unwrap();
        assert_eq!(value["apiVersion"], "garrison.dev/v1alpha1");
        assert_eq!(value["kind"], "GameServer");
        assert_eq!(value["metadata"]["name"], "gs-0");
    }

    #[test]
    fn missing_status_deserializes_to_default() {
        let gs: GameServer = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "gs-0"},
            "spec": {},
        }))
        .unwrap();
        assert_eq!(gs.status.state, GameServerState::Unknown);
        assert!(gs.status.conditions.is_empty());
    }
}
