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

use std::sync::Arc;

use futures::StreamExt;
use kube::{
    api::Api,
    runtime::{reflector, watcher},
};

use crate::{
    api::{GameServer, GameServerSet},
    events::KubeEvents,
    signal,
    store::KubeStore,
    Controller,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(clap::Parser)]
#[command(about = "Runs the garrison game server set controller.")]
pub struct Cli {
    /// Number of parallel reconciliation workers.
    #[clap(long, env = "GARRISON_WORKERS", default_value_t = 2)]
    workers: usize,
    /// The namespace whose game server sets are reconciled.
    #[clap(long, env = "GARRISON_NAMESPACE", default_value = "default")]
    namespace: String,
    #[clap(
        short,
        long,
        env,
        help = "Whether garrison will report any results to stdout/stderr."
    )]
    quiet: bool,
}

impl Cli {
    /// Drives the controller lifecycle using the command line arguments.
    pub async fn drive(self) -> crate::Result<()> {
        if !self.quiet {
            let env_filter = tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing_subscriber::filter::LevelFilter::INFO.into())
                .from_env_lossy();
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(env_filter)
                .init();
        }

        tracing::info!(version = VERSION, "starting garrison");

        let client = kube::Client::try_default().await?;

        let game_servers: Api<GameServer> = Api::namespaced(client.clone(), &self.namespace);
        let gs_writer = reflector::store::Writer::<GameServer>::default();
        let gs_reader = gs_writer.as_reader();
        let gs_feed = reflector(gs_writer, watcher(game_servers, watcher::Config::default()));

        let game_server_sets: Api<GameServerSet> =
            Api::namespaced(client.clone(), &self.namespace);
        let gss_writer = reflector::store::Writer::<GameServerSet>::default();
        let gss_reader = gss_writer.as_reader();
        let gss_feed = reflector(
            gss_writer,
            watcher(game_server_sets, watcher::Config::default()),
        );

        let store = Arc::new(KubeStore::new(client.clone(), gs_reader, gss_reader));
        let events = Arc::new(KubeEvents::new(client));
        let shutdown = signal::spawn_handler();
        let controller = Arc::new(Controller::new(store, events, shutdown));

        let mut watches = tokio::task::JoinSet::new();
        watches.spawn(Arc::clone(&controller).watch_game_servers(gs_feed.boxed()));
        watches.spawn(Arc::clone(&controller).watch_game_server_sets(gss_feed.boxed()));

        let result = tokio::select! {
            result = controller.run(self.workers) => result,
            Some(result) = watches.join_next() => result.map_err(eyre::Report::from)?,
        };
        watches.abort_all();
        result
    }
}
