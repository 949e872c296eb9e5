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

//! The GameServerSet control loop: drives the owned game servers toward the
//! declared replica count, negotiating deletion through readiness and
//! deletable gates.

pub mod action;
pub mod counter;
pub mod inplace;
pub mod queue;
pub mod selector;
pub mod status;

use std::{collections::HashMap, sync::Arc};

use futures::{stream, stream::BoxStream, StreamExt};
use kube::{core::Resource, runtime::watcher};

use crate::{
    api::{GameServer, GameServerSet, GameServerSetStatus, GameServerState},
    events::{self, EventSink},
    gameservers::{self, predicates},
    metadata,
    signal::ShutdownRx,
    store::{self, ObjectStore},
};

use self::{
    action::{compute_reconciliation_action, Budgets},
    counter::NodeCounter,
    queue::{SetKey, WorkQueue},
    selector::classify_game_servers,
    status::{compute_status, scaling_conditions},
};

/// Parallelism cap for game-server creations within one tick.
pub const MAX_CREATION_PARALLELISM: usize = 16;
/// Parallelism cap for deletions, markings, and in-place swaps.
pub const MAX_DELETION_PARALLELISM: usize = 64;

/// The GameServerSet controller.
pub struct Controller {
    store: Arc<dyn ObjectStore>,
    events: Arc<dyn EventSink>,
    counter: Arc<NodeCounter>,
    queue: Arc<WorkQueue>,
    budgets: Budgets,
    shutdown: ShutdownRx,
}

impl Controller {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        events: Arc<dyn EventSink>,
        shutdown: ShutdownRx,
    ) -> Self {
        Self {
            store,
            events,
            counter: Arc::new(NodeCounter::new()),
            queue: WorkQueue::new(),
            budgets: Budgets::default(),
            shutdown,
        }
    }

    #[doc(hidden)]
    pub fn with_budgets(mut self, budgets: Budgets) -> Self {
        self.budgets = budgets;
        self
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn counter(&self) -> &Arc<NodeCounter> {
        &self.counter
    }

    /// Runs `workers` queue consumers until the shutdown signal closes the
    /// queue and the in-flight items drain.
    pub async fn run(self: &Arc<Self>, workers: usize) -> crate::Result<()> {
        let mut shutdown = self.shutdown.clone();
        let queue = Arc::clone(&self.queue);
        tokio::spawn(async move {
            let _ = shutdown.changed().await;
            queue.close();
        });

        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..workers {
            let controller = Arc::clone(self);
            tasks.spawn(async move { controller.worker(worker).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.map_err(eyre::Report::from)?;
        }
        Ok(())
    }

    async fn worker(&self, id: usize) {
        while let Some(key) = self.queue.next().await {
            tracing::debug!(worker = id, %key, "syncing game server set");
            let result = self.sync(&key).await;
            if let Err(error) = &result {
                tracing::error!(%key, %error, "error syncing game server set");
            }
            self.queue.done(key, result.is_err());
        }
    }

    /// Consumes the GameServerSet side of the change feed: adds and
    /// deep-unequal updates enqueue the set.
    pub async fn watch_game_server_sets(
        self: Arc<Self>,
        mut feed: BoxStream<'static, Result<watcher::Event<GameServerSet>, watcher::Error>>,
    ) -> crate::Result<()> {
        let mut known: HashMap<SetKey, GameServerSet> = HashMap::new();
        while let Some(event) = feed.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!(%error, "game server set watch error");
                    continue;
                }
            };
            match event {
                watcher::Event::Apply(gss) | watcher::Event::InitApply(gss) => {
                    let Some(key) = SetKey::of(&gss) else { continue };
                    match known.insert(key.clone(), gss.clone()) {
                        Some(old) if old == gss => {}
                        _ => self.queue.enqueue(key),
                    }
                }
                watcher::Event::Delete(gss) => {
                    if let Some(key) = SetKey::of(&gss) {
                        known.remove(&key);
                    }
                }
                watcher::Event::Init | watcher::Event::InitDone => {}
            }
        }
        Err(eyre::eyre!("game server set watch stream terminated"))
    }

    /// Consumes the GameServer side of the change feed: keeps the node
    /// counter current and enqueues the owning set at high priority.
    pub async fn watch_game_servers(
        self: Arc<Self>,
        mut feed: BoxStream<'static, Result<watcher::Event<GameServer>, watcher::Error>>,
    ) -> crate::Result<()> {
        let mut known: HashMap<SetKey, GameServer> = HashMap::new();
        while let Some(event) = feed.next().await {
            let event = match event {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!(%error, "game server watch error");
                    continue;
                }
            };
            match event {
                watcher::Event::Apply(gs) | watcher::Event::InitApply(gs) => {
                    let Some(name) = gs.metadata.name.clone() else { continue };
                    let key = SetKey::new(
                        gs.metadata.namespace.clone().unwrap_or_default(),
                        name,
                    );
                    let previous = known.insert(key, gs.clone());
                    counter::apply_feed_event(&self.counter, previous.as_ref(), Some(&gs));
                    // Updates of servers already being torn down are noise.
                    if previous.is_none() || gs.metadata.deletion_timestamp.is_none() {
                        self.enqueue_owner(&gs);
                    }
                }
                watcher::Event::Delete(gs) => {
                    if let Some(name) = gs.metadata.name.clone() {
                        known.remove(&SetKey::new(
                            gs.metadata.namespace.clone().unwrap_or_default(),
                            name,
                        ));
                    }
                    counter::apply_feed_event(&self.counter, Some(&gs), None);
                    self.enqueue_owner(&gs);
                }
                watcher::Event::Init | watcher::Event::InitDone => {}
            }
        }
        Err(eyre::eyre!("game server watch stream terminated"))
    }

    fn enqueue_owner(&self, gs: &GameServer) {
        let owner = gs.metadata.owner_references.iter().flatten().find(|owner| {
            owner.controller == Some(true) && owner.kind == GameServerSet::kind(&()).as_ref()
        });
        let Some(owner) = owner else {
            tracing::trace!(
                name = gs.metadata.name.as_deref().unwrap_or_default(),
                "game server without a set owner, dropping event"
            );
            return;
        };
        let Some(namespace) = gs.metadata.namespace.clone() else {
            return;
        };
        self.queue
            .enqueue_immediately(SetKey::new(namespace, owner.name.clone()));
    }

    /// One reconciliation of one set: scaling condition, replica management,
    /// status publication, then the in-place phase.
    pub async fn sync(&self, key: &SetKey) -> crate::Result<()> {
        let mut gss = match self
            .store
            .get_game_server_set(&key.namespace, &key.name)
            .await
        {
            Ok(gss) => gss,
            Err(error) if error.is_not_found() => {
                tracing::debug!(%key, "game server set no longer available for syncing");
                return Ok(());
            }
            Err(error) => return Err(error.into()),
        };

        let mut status = gss.status.clone();
        status.conditions = scaling_conditions(&gss, metadata::is_scaling(&gss));
        self.update_status_if_changed(&mut gss, status).await?;

        let list = self.list_owned(&gss).await?;
        self.manage_replicas(key, &list, &mut gss).await?;

        // Final publish pass over the same snapshot; a no-op unless the
        // scale or in-place phases moved the conditions underneath us.
        let mut status = compute_status(&list);
        status.conditions = gss.status.conditions.clone();
        self.update_status_if_changed(&mut gss, status).await?;
        Ok(())
    }

    pub(crate) async fn list_owned(
        &self,
        gss: &GameServerSet,
    ) -> crate::Result<Vec<GameServer>> {
        let namespace = gss.metadata.namespace.as_deref().unwrap_or_default();
        let list = self
            .store
            .list_game_servers(namespace, &gss.spec.selector)
            .await?;
        Ok(list
            .into_iter()
            .filter(|gs| gameservers::is_controlled_by(gs, gss))
            .collect())
    }

    async fn manage_replicas(
        &self,
        key: &SetKey,
        list: &[GameServer],
        gss: &mut GameServerSet,
    ) -> crate::Result<()> {
        let action = compute_reconciliation_action(gss, list, &self.counter, self.budgets);
        let status_before = compute_status(list);
        if action.partial {
            // Hit a batch cap; a fresh tick follows as soon as this one ends.
            self.queue.enqueue_immediately(key.clone());
        }
        tracing::debug!(
            %key,
            to_add = action.to_add,
            to_delete = action.to_delete.len(),
            "computed reconciliation action"
        );

        if action.to_add > 0 {
            if let Err(error) = self.create_game_servers(gss, action.to_add).await {
                tracing::error!(%key, %error, "error adding game servers");
            }
        }

        let mut deleted_now = 0usize;
        if !action.to_delete.is_empty() {
            let classified = classify_game_servers(action.to_delete.clone(), false);
            self.events
                .publish(
                    gss,
                    events::REASON_TO_DELETE,
                    format!(
                        "Selected {} of {} game servers for deletion",
                        action.to_delete.len(),
                        list.len()
                    ),
                )
                .await;
            tracing::debug!(
                %key,
                deletables = classified.deletables.len(),
                candidates = classified.candidates.len(),
                runnings = classified.runnings.len(),
                "classified deletion victims"
            );
            deleted_now = classified.deletables.len();
            self.delete_game_servers(gss, classified.deletables).await?;
            self.mark_game_servers_out_of_service(gss, classified.runnings, &[])
                .await?;
        }

        // Scale-down satisfied (or nothing pending): settle the Scaling
        // condition and drop the annotation.
        if deleted_now as i64 == i64::from(status_before.replicas - gss.spec.replicas) {
            let mut settled = gss.status.clone();
            settled.conditions = scaling_conditions(gss, false);
            self.patch_status_if_changed(gss, settled).await?;
            if let Some(annotations) = gss.metadata.annotations.as_mut() {
                if annotations
                    .remove(metadata::SCALING_REPLICAS_ANNOTATION)
                    .is_some()
                {
                    *gss = self.store.update_game_server_set(gss).await?;
                }
            }
        }

        let mut status = compute_status(list);
        status.conditions = gss.status.conditions.clone();
        self.update_status_if_changed(gss, status).await?;

        let realized =
            status_before.replicas - action.to_delete.len() as i32 + action.to_add as i32;
        if realized != gss.spec.replicas {
            eyre::bail!(
                "game server set {key} actual replicas: {}, desired: {}, to delete: {}, to add: {}",
                status_before.replicas,
                gss.spec.replicas,
                action.to_delete.len(),
                action.to_add
            );
        }

        self.do_inplace_update(gss).await
    }

    async fn create_game_servers(
        &self,
        gss: &GameServerSet,
        count: usize,
    ) -> crate::Result<()> {
        tracing::info!(
            set = gss.metadata.name.as_deref().unwrap_or_default(),
            count,
            "adding game servers"
        );
        let mut gs = gameservers::game_server_from_set(gss);
        gameservers::apply_defaults(&mut gs);

        let results: Vec<_> = stream::iter((0..count).map(|_| {
            let store = Arc::clone(&self.store);
            let gs = gs.clone();
            async move { store.create_game_server(&gs).await }
        }))
        .buffer_unordered(MAX_CREATION_PARALLELISM)
        .collect()
        .await;

        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(created) => {
                    self.events
                        .publish(
                            gss,
                            events::REASON_SUCCESSFUL_CREATE,
                            format!(
                                "Created game server {}",
                                created.metadata.name.as_deref().unwrap_or_default()
                            ),
                        )
                        .await;
                }
                Err(error) => errors.push(error.to_string()),
            }
        }
        aggregate("error creating game servers", errors)
    }

    /// Deletion is soft: flip the state to `Exited` through the status
    /// subresource and let the per-GameServer controller finalize teardown.
    async fn delete_game_servers(
        &self,
        gss: &GameServerSet,
        to_delete: Vec<GameServer>,
    ) -> crate::Result<()> {
        let results: Vec<_> = stream::iter(to_delete.into_iter().map(|mut gs| {
            let store = Arc::clone(&self.store);
            async move {
                let name = gs.metadata.name.clone().unwrap_or_default();
                // The watch cache can lag the store of record: a server that
                // looks before-ready here may have just come up. Re-check
                // against the source of truth before taking it down.
                if predicates::is_before_ready(&gs) {
                    let namespace = gs.metadata.namespace.clone().unwrap_or_default();
                    match store.get_game_server(&namespace, &name).await {
                        Ok(fresh) => {
                            if predicates::is_ready(&fresh)
                                && predicates::has_readiness_gates(&fresh)
                            {
                                tracing::info!(%name, "game server became ready, skipping deletion");
                                return Ok(None);
                            }
                        }
                        Err(error) => {
                            return Err(format!("error checking game server {name}: {error}"));
                        }
                    }
                }
                gs.status.state = GameServerState::Exited;
                match store.update_game_server_status(&gs).await {
                    Ok(updated) => Ok(Some(updated)),
                    Err(error) => Err(format!(
                        "error updating game server {name} to exited: {error}"
                    )),
                }
            }
        }))
        .buffer_unordered(MAX_DELETION_PARALLELISM)
        .collect()
        .await;

        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(Some(gs)) => {
                    self.events
                        .publish(
                            gss,
                            events::REASON_SUCCESSFUL_DELETE,
                            format!(
                                "Deleted game server {}",
                                gs.metadata.name.as_deref().unwrap_or_default()
                            ),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(error) => errors.push(error),
            }
        }
        aggregate("error deleting game servers", errors)
    }

    /// Marks still-serving victims out of service so draining can begin.
    /// Extra mutators are applied atomically with the constraint, which is
    /// how the in-place engine distinguishes "draining for update" from
    /// "draining for deletion".
    pub(crate) async fn mark_game_servers_out_of_service(
        &self,
        gss: &GameServerSet,
        to_mark: Vec<GameServer>,
        mutators: &[fn(&mut GameServer)],
    ) -> crate::Result<()> {
        let results: Vec<_> = stream::iter(to_mark.into_iter().map(|mut gs| {
            let store = Arc::clone(&self.store);
            async move {
                if predicates::is_before_ready(&gs)
                    || metadata::is_inplace_updating(&gs)
                    || predicates::is_being_deleted(&gs)
                {
                    return Ok(None);
                }
                for mutate in mutators {
                    mutate(&mut gs);
                }
                if !gs.spec.deletable_gates.is_empty() {
                    gameservers::add_not_in_service_constraint(&mut gs);
                }
                match store.update_game_server(&gs).await {
                    Ok(updated) => Ok(Some(updated)),
                    Err(error) => Err(format!(
                        "error marking game server {} out of service: {error}",
                        gs.metadata.name.as_deref().unwrap_or_default()
                    )),
                }
            }
        }))
        .buffer_unordered(MAX_DELETION_PARALLELISM)
        .collect()
        .await;

        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(Some(gs)) => {
                    self.events
                        .publish(
                            gss,
                            events::REASON_SUCCESSFUL_MARK,
                            format!(
                                "Marked game server {} not in service",
                                gs.metadata.name.as_deref().unwrap_or_default()
                            ),
                        )
                        .await;
                }
                Ok(None) => {}
                Err(error) => errors.push(error),
            }
        }
        aggregate("error marking game servers out of service", errors)
    }

    pub(crate) async fn update_status_if_changed(
        &self,
        gss: &mut GameServerSet,
        mut status: GameServerSetStatus,
    ) -> crate::Result<()> {
        status.observed_generation = gss.metadata.generation.unwrap_or_default();
        status.selector = store::selector_string(&gss.spec.selector);
        if gss.status != status {
            gss.status = status;
            *gss = self.store.update_game_server_set_status(gss).await?;
        }
        Ok(())
    }

    /// Condition-only deltas go through a merge patch on the status
    /// subresource, sidestepping optimistic-concurrency conflicts on spec.
    async fn patch_status_if_changed(
        &self,
        gss: &mut GameServerSet,
        mut status: GameServerSetStatus,
    ) -> crate::Result<()> {
        status.observed_generation = gss.metadata.generation.unwrap_or_default();
        status.selector = store::selector_string(&gss.spec.selector);
        if gss.status == status {
            return Ok(());
        }
        let namespace = gss.metadata.namespace.clone().unwrap_or_default();
        let name = gss.metadata.name.clone().unwrap_or_default();
        *gss = self
            .store
            .patch_game_server_set_status(&namespace, &name, &status)
            .await?;
        Ok(())
    }
}

fn aggregate(context: &str, errors: Vec<String>) -> crate::Result<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        tracing::error!(context, count = errors.len(), ?errors, "batch errors");
        Err(eyre::eyre!("{context}: {}", errors.join("; ")))
    }
}
