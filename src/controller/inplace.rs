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

//! The in-place update engine: instead of replacing game servers, old-hash
//! servers are drained, their image/resources/env swapped, and the rollout
//! progress published on the set.
//!
//! Per server the protocol is: mark out of service with
//! `inplace-updating=true` (one write, so observers see "draining for
//! update"), wait until it may be touched, clear its conditions, swap the
//! template, drop constraints, flip the annotation back.

use std::time::Duration;

use futures::{stream, StreamExt};

use super::{selector, Controller, MAX_DELETION_PARALLELISM};
use crate::{
    api::{GameServer, GameServerSet},
    events,
    gameservers::predicates,
    metadata,
};

const PROGRESS_PUBLISH_INTERVAL: Duration = Duration::from_secs(1);
const PROGRESS_PUBLISH_DEADLINE: Duration = Duration::from_secs(50);

impl Controller {
    /// Runs one in-place rollout step for the set, when one is pending.
    pub(crate) async fn do_inplace_update(&self, gss: &mut GameServerSet) -> crate::Result<()> {
        let Some(desired) = metadata::inplace_update_threshold(gss) else {
            return Ok(());
        };

        let list = self.list_owned(gss).await?;
        let set_hash = metadata::template_hash(&gss.metadata).map(str::to_string);
        let (new_servers, old_servers): (Vec<GameServer>, Vec<GameServer>) =
            list.into_iter().partition(|gs| {
                metadata::template_hash(&gs.metadata) == set_hash.as_deref()
            });

        let updated_count = metadata::inplace_updated_replicas(gss);
        let diff = desired - new_servers.len() as i32;
        if diff <= 0 || updated_count >= desired {
            tracing::debug!(
                desired,
                new = new_servers.len(),
                "in-place target satisfied"
            );
            // A scale-up landed fresh replicas already on the new hash;
            // reconcile the progress counter up to what exists.
            if new_servers.len() as i32 > updated_count {
                metadata::set_inplace_updated_replicas(gss, new_servers.len() as i32);
                *gss = self.store.update_game_server_set(gss).await?;
            }
            return Ok(());
        }

        let classified = selector::classify_game_servers(old_servers, true);
        let mut candidates = Vec::new();
        for mut bucket in [
            classified.deletables,
            classified.candidates,
            classified.runnings,
        ] {
            selector::sort_by_creation_time(&mut bucket);
            candidates.extend(bucket);
        }
        candidates.truncate(diff as usize);

        self.mark_game_servers_out_of_service(gss, candidates.clone(), &[
            |gs: &mut GameServer| metadata::set_inplace_updating(gs, true),
        ])
        .await?;

        let (updated, swap_result) = self.inplace_update_game_servers(gss, candidates).await;
        // Per-server successes are reported even when the progress publish
        // fails; the next reconciliation reconciles the counter.
        let publish_result = self
            .publish_updated_count(gss, updated_count + updated)
            .await;
        swap_result?;
        publish_result
    }

    /// Swaps image, resources, and env on every candidate that is currently
    /// allowed to be touched. Returns the success count alongside the
    /// aggregated failures.
    async fn inplace_update_game_servers(
        &self,
        gss: &GameServerSet,
        candidates: Vec<GameServer>,
    ) -> (i32, crate::Result<()>) {
        tracing::info!(
            set = gss.metadata.name.as_deref().unwrap_or_default(),
            count = candidates.len(),
            "updating game servers in place"
        );
        let results: Vec<_> = stream::iter(candidates.into_iter().map(|gs| {
            let store = std::sync::Arc::clone(&self.store);
            let gss = gss.clone();
            async move {
                let name = gs.metadata.name.clone().unwrap_or_default();
                if !predicates::can_inplace_update(&gs) {
                    return Ok(None);
                }
                // Same cache-lag double check as deletion.
                if predicates::is_before_ready(&gs) {
                    let namespace = gs.metadata.namespace.clone().unwrap_or_default();
                    match store.get_game_server(&namespace, &name).await {
                        Ok(fresh) => {
                            if predicates::is_ready(&fresh)
                                && predicates::has_readiness_gates(&fresh)
                            {
                                tracing::info!(%name, "game server became ready, skipping update");
                                return Ok(None);
                            }
                        }
                        Err(error) => {
                            return Err(format!("error checking game server {name}: {error}"));
                        }
                    }
                }

                // Dropping the conditions forces the readiness gates to be
                // re-reported after the swap.
                let mut gs = gs;
                gs.status.conditions.clear();
                let mut gs = match store.update_game_server_status(&gs).await {
                    Ok(updated) => updated,
                    Err(error) => {
                        return Err(format!(
                            "error clearing conditions of game server {name}: {error}"
                        ));
                    }
                };

                update_game_server_spec(&gss, &mut gs);
                match store.update_game_server(&gs).await {
                    Ok(updated) => Ok(Some(updated)),
                    Err(error) => Err(format!(
                        "error updating game server {name} in place: {error}"
                    )),
                }
            }
        }))
        .buffer_unordered(MAX_DELETION_PARALLELISM)
        .collect()
        .await;

        let mut updated = 0;
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(Some(gs)) => {
                    updated += 1;
                    self.events
                        .publish(
                            gss,
                            events::REASON_SUCCESSFUL_UPDATE,
                            format!(
                                "Updated game server {} in place",
                                gs.metadata.name.as_deref().unwrap_or_default()
                            ),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(error) => errors.push(error),
            }
        }
        let result = if errors.is_empty() {
            Ok(())
        } else {
            Err(eyre::eyre!(
                "error updating game servers in place: {}",
                errors.join("; ")
            ))
        };
        (updated, result)
    }

    /// Publishes the rollout progress with a short poll: retry on not-found
    /// with a re-get in between, bail on anything else, abort on shutdown.
    async fn publish_updated_count(
        &self,
        gss: &mut GameServerSet,
        total: i32,
    ) -> crate::Result<()> {
        let namespace = gss.metadata.namespace.clone().unwrap_or_default();
        let name = gss.metadata.name.clone().unwrap_or_default();
        let mut shutdown = self.shutdown.clone();
        let deadline = tokio::time::Instant::now() + PROGRESS_PUBLISH_DEADLINE;

        loop {
            metadata::set_inplace_updated_replicas(gss, total);
            match self.store.update_game_server_set(gss).await {
                Ok(updated) => {
                    *gss = updated;
                    return Ok(());
                }
                Err(error) if error.is_not_found() => {
                    if let Ok(fresh) = self.store.get_game_server_set(&namespace, &name).await {
                        *gss = fresh;
                    }
                }
                Err(error) => return Err(error.into()),
            }
            if tokio::time::Instant::now() >= deadline {
                eyre::bail!("timed out publishing in-place progress for {namespace}/{name}");
            }
            tokio::select! {
                _ = tokio::time::sleep(PROGRESS_PUBLISH_INTERVAL) => {}
                _ = shutdown.changed() => {
                    eyre::bail!("shutdown while publishing in-place progress");
                }
            }
        }
    }
}

/// Copies image, resources, and env of the game-server container from the
/// set's template into the game server's template, stamps the new hash,
/// drops the drain constraints, and clears the in-place flag.
fn update_game_server_spec(gss: &GameServerSet, gs: &mut GameServer) {
    if let Some(hash) = metadata::template_hash(&gss.metadata) {
        gs.metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert(metadata::GAME_SERVER_HASH_LABEL.to_string(), hash.to_string());
    }

    let desired = gss
        .spec
        .template
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|pod| {
            pod.containers
                .iter()
                .find(|container| container.name == metadata::GAME_SERVER_CONTAINER)
        })
        .cloned();

    if let Some(desired) = desired {
        if let Some(pod) = gs.spec.template.spec.as_mut() {
            for container in &mut pod.containers {
                if container.name != metadata::GAME_SERVER_CONTAINER {
                    continue;
                }
                container.image = desired.image.clone();
                container.resources = desired.resources.clone();
                container.env = desired.env.clone();
            }
        }
    }

    gs.spec.constraints.clear();
    metadata::set_inplace_updating(gs, false);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{GameServerSetSpec, GameServerSpec};
    use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};

    fn set_with_template(image: &str, hash: &str) -> GameServerSet {
        let mut gss = GameServerSet::new("set", GameServerSetSpec::default());
        gss.metadata.labels = Some(
            [(metadata::GAME_SERVER_HASH_LABEL.to_string(), hash.to_string())].into(),
        );
        gss.spec.template.spec.template = PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: metadata::GAME_SERVER_CONTAINER.to_string(),
                    image: Some(image.to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        };
        gss
    }

    #[test]
    fn swap_rewrites_container_hash_and_flags() {
        let gss = set_with_template("game:v2", "h2");
        let mut gs = GameServer::new("gs", GameServerSpec::default());
        gs.spec.template.spec = Some(PodSpec {
            containers: vec![Container {
                name: metadata::GAME_SERVER_CONTAINER.to_string(),
                image: Some("game:v1".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });
        gs.spec.constraints = vec![crate::gameservers::not_in_service_constraint()];
        metadata::set_inplace_updating(&mut gs, true);

        update_game_server_spec(&gss, &mut gs);

        assert_eq!(
            gs.spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("game:v2")
        );
        assert_eq!(
            gs.metadata.labels.as_ref().unwrap()[metadata::GAME_SERVER_HASH_LABEL],
            "h2"
        );
        assert!(gs.spec.constraints.is_empty());
        assert!(!metadata::is_inplace_updating(&gs));
    }

    #[test]
    fn swap_leaves_other_containers_alone() {
        let gss = set_with_template("game:v2", "h2");
        let mut gs = GameServer::new("gs", GameServerSpec::default());
        gs.spec.template.spec = Some(PodSpec {
            containers: vec![Container {
                name: "logging".to_string(),
                image: Some("fluentbit:v1".to_string()),
                ..Default::default()
            }],
            ..Default::default()
        });

        update_game_server_spec(&gss, &mut gs);
        assert_eq!(
            gs.spec.template.spec.as_ref().unwrap().containers[0].image.as_deref(),
            Some("fluentbit:v1")
        );
    }
}
