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

use k8s_openapi::apimachinery::pkg::{
    apis::meta::v1::{LabelSelector, ObjectMeta, Time},
    util::intstr::IntOrString,
};
use kube::core::Resource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::gameserver::{ConditionStatus, GameServerSpec, SchedulingStrategy};

/// Declarative replica controller for game servers of one template revision.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, PartialEq)]
pub struct GameServerSet {
    #[schemars(skip)]
    pub metadata: ObjectMeta,
    pub spec: GameServerSetSpec,
    #[serde(default)]
    pub status: GameServerSetStatus,
}

impl GameServerSet {
    pub fn new(name: &str, spec: GameServerSetSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: GameServerSetStatus::default(),
        }
    }
}

impl serde::Serialize for GameServerSet {
    fn serialize<S: serde::Serializer>(&self, ser: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut obj = ser.serialize_struct("GameServerSet", 5)?;
        obj.serialize_field("apiVersion", &GameServerSet::api_version(&()))?;
        obj.serialize_field("kind", &GameServerSet::kind(&()))?;
        obj.serialize_field("metadata", &self.metadata)?;
        obj.serialize_field("spec", &self.spec)?;
        obj.serialize_field("status", &self.status)?;
        obj.end()
    }
}

impl Resource for GameServerSet {
    type DynamicType = ();
    type Scope = kube::core::NamespaceResourceScope;

    fn group(_: &()) -> std::borrow::Cow<'_, str> {
        super::GROUP.into()
    }

    fn kind(_: &()) -> std::borrow::Cow<'_, str> {
        "GameServerSet".into()
    }

    fn version(_: &()) -> std::borrow::Cow<'_, str> {
        super::VERSION.into()
    }

    fn api_version(_: &()) -> std::borrow::Cow<'_, str> {
        super::API_VERSION.into()
    }

    fn plural(_: &()) -> std::borrow::Cow<'_, str> {
        "gameserversets".into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl kube::core::object::HasSpec for GameServerSet {
    type Spec = GameServerSetSpec;

    fn spec(&self) -> &GameServerSetSpec {
        &self.spec
    }
    fn spec_mut(&mut self) -> &mut GameServerSetSpec {
        &mut self.spec
    }
}

/// Desired state of a [`GameServerSet`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetSpec {
    /// Number of game servers the set should own.
    #[serde(default)]
    pub replicas: i32,
    /// Selector matching the labels of owned game servers.
    #[serde(default)]
    pub selector: LabelSelector,
    /// Placement preference, propagated to owned game servers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduling: Option<SchedulingStrategy>,
    /// When true, game servers draining under an external `NotInService`
    /// constraint are excluded from the replica count.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_constraints: Option<bool>,
    /// Template for owned game servers, carrying its own pod template.
    #[serde(default)]
    pub template: GameServerTemplateSpec,
    /// Rollout batching written by the set's owner; the in-place engine reads
    /// the annotation counterpart stamped alongside it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inplace_update: Option<InplaceUpdateStrategy>,
}

/// Template for a [`super::GameServer`] resource.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct GameServerTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMeta>,
    #[serde(default)]
    pub spec: GameServerSpec,
}

/// Batch size for in-place rollouts, as an integer or a percentage of the
/// replica count.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InplaceUpdateStrategy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<IntOrString>,
}

/// Observed state of a [`GameServerSet`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetStatus {
    /// Owned game servers that are not being deleted.
    #[serde(default)]
    pub replicas: i32,
    /// Owned game servers that are `Running` and not already drained for
    /// deletion.
    #[serde(default)]
    pub ready_replicas: i32,
    #[serde(default)]
    pub observed_generation: i64,
    /// Stringified match labels of the spec selector.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub selector: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<GameServerSetCondition>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerSetCondition {
    #[serde(rename = "type")]
    pub type_: GameServerSetConditionType,
    pub status: ConditionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum GameServerSetConditionType {
    /// A scale operation is currently in progress.
    Scaling,
}
