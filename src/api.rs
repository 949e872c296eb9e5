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

pub mod gameserver;
pub mod gameserverset;

pub use gameserver::{
    ConditionStatus, Constraint, ConstraintType, GameServer, GameServerCondition, GameServerPort,
    GameServerSpec, GameServerState, GameServerStatus, PortPolicy, PortRange, SchedulingStrategy,
    SdkServer, SdkServerLogLevel,
};
pub use gameserverset::{
    GameServerSet, GameServerSetCondition, GameServerSetConditionType, GameServerSetSpec,
    GameServerSetStatus, GameServerTemplateSpec, InplaceUpdateStrategy,
};

/// The API group all garrison resources belong to.
pub const GROUP: &str = "garrison.dev";
/// The storage version served for the group.
pub const VERSION: &str = "v1alpha1";
/// `group/version` as written into the group annotation of owned objects.
pub const API_VERSION: &str = "garrison.dev/v1alpha1";
