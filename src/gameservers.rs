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

pub mod defaults;
pub mod pod;
pub mod predicates;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::Resource;

use crate::{
    api::{GameServer, GameServerSet},
    metadata,
};

pub use defaults::apply_defaults;
pub use pod::{build_pod, node_tainted_by_autoscaler, not_in_service_constraint, update_pod_spec};

/// Realizes a fresh [`GameServer`] from a set's template: identity, labels,
/// hash, and the controller owner reference. The store assigns the final name
/// from `generate_name`.
pub fn game_server_from_set(gss: &GameServerSet) -> GameServer {
    let template = &gss.spec.template;
    let set_name = gss.metadata.name.clone().unwrap_or_default();

    let mut gs = GameServer {
        metadata: template.metadata.clone().unwrap_or_default(),
        spec: template.spec.clone(),
        status: Default::default(),
    };
    gs.metadata.name = None;
    gs.metadata.generate_name = Some(format!("{set_name}-"));
    gs.metadata.namespace = gss.metadata.namespace.clone();

    let labels = gs.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(metadata::GAME_SERVER_SET_LABEL.to_string(), set_name.clone());
    if let Some(hash) = metadata::template_hash(&gss.metadata) {
        labels.insert(metadata::GAME_SERVER_HASH_LABEL.to_string(), hash.to_string());
    }

    gs.metadata.owner_references = Some(vec![OwnerReference {
        api_version: GameServerSet::api_version(&()).into_owned(),
        kind: GameServerSet::kind(&()).into_owned(),
        name: set_name,
        uid: gss.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }]);

    gs
}

/// Whether the set is the controller owner of the game server.
pub fn is_controlled_by(gs: &GameServer, gss: &GameServerSet) -> bool {
    gs.metadata
        .owner_references
        .iter()
        .flatten()
        .any(|owner| {
            owner.controller == Some(true)
                && owner.kind == GameServerSet::kind(&())
                && Some(owner.name.as_str()) == gss.metadata.name.as_deref()
        })
}

/// Appends an effective `NotInService` constraint unless one is already in
/// force.
pub fn add_not_in_service_constraint(gs: &mut GameServer) {
    if predicates::is_out_of_service(gs) {
        return;
    }
    gs.spec.constraints.push(not_in_service_constraint());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::GameServerSetSpec;

    fn set() -> GameServerSet {
        let mut gss = GameServerSet::new("squad-1-abc", GameServerSetSpec::default());
        gss.metadata.namespace = Some("default".to_string());
        gss.metadata.uid = Some("uid-gss".to_string());
        gss.metadata.labels = Some(
            [(metadata::GAME_SERVER_HASH_LABEL.to_string(), "h1".to_string())].into(),
        );
        gss
    }

    #[test]
    fn realized_server_carries_set_identity() {
        let gss = set();
        let gs = game_server_from_set(&gss);

        assert_eq!(gs.metadata.generate_name.as_deref(), Some("squad-1-abc-"));
        assert_eq!(gs.metadata.namespace.as_deref(), Some("default"));
        let labels = gs.metadata.labels.as_ref().unwrap();
        assert_eq!(labels[metadata::GAME_SERVER_SET_LABEL], "squad-1-abc");
        assert_eq!(labels[metadata::GAME_SERVER_HASH_LABEL], "h1");

        let owner = &gs.metadata.owner_references.as_ref().unwrap()[0];
        assert_eq!(owner.kind, "GameServerSet");
        assert_eq!(owner.name, "squad-1-abc");
        assert_eq!(owner.controller, Some(true));
        assert!(is_controlled_by(&gs, &gss));
    }

    #[test]
    fn ownership_check_requires_controller_ref() {
        let gss = set();
        let mut gs = game_server_from_set(&gss);
        assert!(is_controlled_by(&gs, &gss));

        gs.metadata.owner_references.as_mut().unwrap()[0].controller = Some(false);
        assert!(!is_controlled_by(&gs, &gss));
    }

    #[test]
    fn not_in_service_is_added_once() {
        let gss = set();
        let mut gs = game_server_from_set(&gss);
        add_not_in_service_constraint(&mut gs);
        add_not_in_service_constraint(&mut gs);
        assert_eq!(gs.spec.constraints.len(), 1);
        assert!(predicates::is_out_of_service(&gs));
    }
}
