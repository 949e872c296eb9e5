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

//! Normal-event publication for material controller actions.

use async_trait::async_trait;
use kube::{
    core::Resource,
    runtime::events::{Event, EventType, Recorder, Reporter},
};

use crate::api::GameServerSet;

pub const REASON_SUCCESSFUL_CREATE: &str = "SuccessfulCreate";
pub const REASON_TO_DELETE: &str = "ToDelete";
pub const REASON_SUCCESSFUL_DELETE: &str = "SuccessfulDelete";
pub const REASON_SUCCESSFUL_UPDATE: &str = "SuccessfulUpdate";
pub const REASON_SUCCESSFUL_MARK: &str = "SuccessfulMark";

/// Sink for the controller's normal events. Publication is best effort;
/// failures are logged, never propagated.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, gss: &GameServerSet, reason: &str, note: String);
}

/// Event sink recording against the kubernetes events API.
pub struct KubeEvents {
    client: kube::Client,
}

impl KubeEvents {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl EventSink for KubeEvents {
    async fn publish(&self, gss: &GameServerSet, reason: &str, note: String) {
        let event = Event {
            type_: EventType::Normal,
            reason: reason.to_string(),
            note: Some(note),
            action: "Reconciling".to_string(),
            secondary: None,
        };
        let recorder = Recorder::new(
            self.client.clone(),
            Reporter::from("gameserverset-controller".to_string()),
            gss.object_ref(&()),
        );
        if let Err(error) = recorder.publish(event).await {
            tracing::warn!(%error, reason, "failed to publish event");
        }
    }
}
