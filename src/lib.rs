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

//! Garrison keeps fleets of game servers at their declared size.
//!
//! The crate implements the GameServerSet reconciliation core of a
//! cluster-side game-server orchestrator: unlike a generic replica
//! controller, a game server with players connected cannot just be killed,
//! so scale-down and in-place updates are negotiated through readiness and
//! deletable gates reported by external collaborators.

pub mod api;
pub mod cli;
pub mod controller;
pub mod events;
pub mod gameservers;
pub mod metadata;
pub mod signal;
pub mod store;

#[doc(hidden)]
pub mod test_utils;

pub type Result<T, E = eyre::Error> = std::result::Result<T, E>;

#[doc(inline)]
pub use self::{cli::Cli, controller::Controller};
