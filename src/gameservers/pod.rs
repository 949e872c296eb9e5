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

//! Builds and mutates the pod backing a game server.

use std::collections::BTreeMap;

use k8s_openapi::{
    api::core::v1::{
        Affinity, Container, ContainerPort, EmptyDirVolumeSource, EnvVar, Node, Pod, PodAffinity,
        PodAffinityTerm, Volume, VolumeMount, WeightedPodAffinityTerm,
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference, Time},
};
use kube::core::Resource;

use crate::{
    api::{self, Constraint, ConstraintType, GameServer, SchedulingStrategy},
    gameservers::defaults::is_host_port_network,
    metadata,
};

/// Taint applied by the cluster autoscaler to nodes about to be torn down.
pub const TO_BE_DELETED_TAINT: &str = "ToBeDeletedByClusterAutoscaler";

const SERVICE_ACCOUNT_MOUNT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Builds the pod for a game server from its pod template, wiring in
/// identity, host-network ports, scheduling hints, the SDK sidecars, and the
/// service-account muting.
pub fn build_pod(
    gs: &GameServer,
    service_account: &str,
    sidecars: Vec<Container>,
) -> crate::Result<Pod> {
    let mut pod = Pod {
        metadata: gs.spec.template.metadata.clone().unwrap_or_default(),
        spec: Some(gs.spec.template.spec.clone().unwrap_or_default()),
        status: None,
    };

    pod_object_meta(gs, &mut pod);

    if is_host_port_network(&gs.spec) {
        apply_host_ports(gs, &mut pod)?;
    }

    let pod_spec = pod.spec.get_or_insert_with(Default::default);
    pod_spec
        .containers
        .extend(sidecars);

    inject_pod_scheduling(gs, &mut pod);

    // An empty service account means the opinionated mode: the game server
    // container gets the supplied account but no cluster API access. A
    // user-set account is taken as-is.
    let pod_spec = pod.spec.get_or_insert_with(Default::default);
    if pod_spec
        .service_account_name
        .as_deref()
        .unwrap_or_default()
        .is_empty()
    {
        pod_spec.service_account_name = Some(service_account.to_string());
        disable_service_account(&mut pod)?;
    }

    add_sdk_server_env(gs, &mut pod);
    Ok(pod)
}

fn pod_object_meta(gs: &GameServer, pod: &mut Pod) {
    pod.metadata.generate_name = None;
    pod.metadata.resource_version = None;
    pod.metadata.uid = None;
    pod.metadata.name = gs.metadata.name.clone();
    pod.metadata.namespace = gs.metadata.namespace.clone();

    // Game-server values win over template values.
    let mut labels = merged(&pod.metadata.labels, &gs.metadata.labels);
    let mut annotations = merged(&pod.metadata.annotations, &gs.metadata.annotations);

    labels.insert(
        metadata::ROLE_LABEL.to_string(),
        metadata::GAME_SERVER_ROLE.to_string(),
    );
    labels.insert(
        metadata::GAME_SERVER_POD_LABEL.to_string(),
        gs.metadata.name.clone().unwrap_or_default(),
    );
    annotations.insert(api::GROUP.to_string(), api::API_VERSION.to_string());

    pod.metadata.labels = Some(labels);
    pod.metadata.annotations = Some(annotations);

    let owner = OwnerReference {
        api_version: GameServer::api_version(&()).into_owned(),
        kind: GameServer::kind(&()).into_owned(),
        name: gs.metadata.name.clone().unwrap_or_default(),
        uid: gs.metadata.uid.clone().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };
    pod.metadata
        .owner_references
        .get_or_insert_with(Default::default)
        .push(owner);
}

fn merged(base: &Option<BTreeMap<String, String>>, overlay: &Option<BTreeMap<String, String>>) -> BTreeMap<String, String> {
    let mut out = base.clone().unwrap_or_default();
    if let Some(overlay) = overlay {
        out.extend(overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    out
}

fn apply_host_ports(gs: &GameServer, pod: &mut Pod) -> crate::Result<()> {
    apply_to_pod_container(pod, metadata::GAME_SERVER_CONTAINER, |container| {
        let ports = container.ports.get_or_insert_with(Default::default);
        for port in &gs.spec.ports {
            if let Some(container_port) = port.container_port {
                ports.push(ContainerPort {
                    container_port,
                    host_port: port.host_port,
                    protocol: protocol_of(&port.protocol),
                    ..Default::default()
                });
            }
            if let (Some(container_range), Some(host_range)) =
                (&port.container_port_range, &port.host_port_range)
            {
                for idx in container_range.min_port..=container_range.max_port {
                    ports.push(ContainerPort {
                        container_port: idx,
                        host_port: Some(host_range.min_port + (host_range.min_port - idx)),
                        protocol: protocol_of(&port.protocol),
                        ..Default::default()
                    });
                }
            }
        }
    })
}

fn protocol_of(protocol: &str) -> Option<String> {
    (!protocol.is_empty()).then(|| protocol.to_string())
}

/// Injects a preferred pod-affinity term packing game servers together when
/// the scheduling strategy is `MostAllocated`.
fn inject_pod_scheduling(gs: &GameServer, pod: &mut Pod) {
    if gs.spec.scheduling != Some(SchedulingStrategy::MostAllocated) {
        return;
    }
    let pod_spec = pod.spec.get_or_insert_with(Default::default);
    let affinity = pod_spec.affinity.get_or_insert_with(Affinity::default);
    let pod_affinity = affinity.pod_affinity.get_or_insert_with(PodAffinity::default);

    let term = WeightedPodAffinityTerm {
        weight: 100,
        pod_affinity_term: PodAffinityTerm {
            topology_key: "kubernetes.io/hostname".to_string(),
            label_selector: Some(LabelSelector {
                match_labels: Some(
                    [(
                        metadata::ROLE_LABEL.to_string(),
                        metadata::GAME_SERVER_ROLE.to_string(),
                    )]
                    .into(),
                ),
                ..Default::default()
            }),
            ..Default::default()
        },
    };
    pod_affinity
        .preferred_during_scheduling_ignored_during_execution
        .get_or_insert_with(Default::default)
        .push(term);
}

/// Mounts an empty dir over the service-account secret path of the
/// game-server container, denying it cluster API access.
fn disable_service_account(pod: &mut Pod) -> crate::Result<()> {
    let volume = Volume {
        name: "empty".to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    let mount = VolumeMount {
        mount_path: SERVICE_ACCOUNT_MOUNT_PATH.to_string(),
        name: volume.name.clone(),
        read_only: Some(true),
        ..Default::default()
    };
    pod.spec
        .get_or_insert_with(Default::default)
        .volumes
        .get_or_insert_with(Default::default)
        .push(volume);

    apply_to_pod_container(pod, metadata::GAME_SERVER_CONTAINER, |container| {
        container
            .volume_mounts
            .get_or_insert_with(Default::default)
            .push(mount);
    })
}

/// Injects the sidecar port env vars into every non-sidecar container.
fn add_sdk_server_env(gs: &GameServer, pod: &mut Pod) {
    let mut env = Vec::new();
    if gs.spec.sdk_server.grpc_port != 0 {
        env.push(EnvVar {
            name: metadata::SDK_GRPC_PORT_ENV.to_string(),
            value: Some(gs.spec.sdk_server.grpc_port.to_string()),
            value_from: None,
        });
    }
    if gs.spec.sdk_server.http_port != 0 {
        env.push(EnvVar {
            name: metadata::SDK_HTTP_PORT_ENV.to_string(),
            value: Some(gs.spec.sdk_server.http_port.to_string()),
            value_from: None,
        });
    }

    let Some(pod_spec) = pod.spec.as_mut() else {
        return;
    };
    for container in &mut pod_spec.containers {
        if container.name == metadata::SDK_SERVER_CONTAINER {
            continue;
        }
        container
            .env
            .get_or_insert_with(Default::default)
            .extend(env.iter().cloned());
    }
}

/// Applies `f` to the named container of the pod; errors when the container
/// is missing from the template.
pub fn apply_to_pod_container(
    pod: &mut Pod,
    name: &str,
    f: impl FnOnce(&mut Container),
) -> crate::Result<()> {
    let container = pod
        .spec
        .as_mut()
        .and_then(|spec| {
            spec.containers
                .iter_mut()
                .find(|container| container.name == name)
        })
        .ok_or_else(|| eyre::eyre!("failed to find container named {name} in pod spec"))?;
    f(container);
    Ok(())
}

/// Copies image, resources, and env of the game-server container from the
/// game server's template onto a running pod. Resource requests and limits
/// are merged entry by entry; env vars are upserted by name.
pub fn update_pod_spec(gs: &GameServer, pod: &mut Pod) {
    pod.metadata
        .labels
        .get_or_insert_with(Default::default)
        .insert(
            metadata::GAME_SERVER_HASH_LABEL.to_string(),
            metadata::template_hash(&gs.metadata).unwrap_or_default().to_string(),
        );

    let Some(desired) = gs
        .spec
        .template
        .spec
        .as_ref()
        .and_then(|spec| {
            spec.containers
                .iter()
                .find(|container| container.name == metadata::GAME_SERVER_CONTAINER)
        })
        .cloned()
    else {
        return;
    };

    let Some(pod_spec) = pod.spec.as_mut() else {
        return;
    };
    for container in &mut pod_spec.containers {
        if container.name != metadata::GAME_SERVER_CONTAINER {
            continue;
        }
        container.image = desired.image.clone();

        if let Some(desired_resources) = &desired.resources {
            let resources = container.resources.get_or_insert_with(Default::default);
            if let Some(limits) = &desired_resources.limits {
                resources
                    .limits
                    .get_or_insert_with(Default::default)
                    .extend(limits.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
            if let Some(requests) = &desired_resources.requests {
                resources
                    .requests
                    .get_or_insert_with(Default::default)
                    .extend(requests.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        for desired_env in desired.env.iter().flatten() {
            let env = container.env.get_or_insert_with(Default::default);
            match env.iter_mut().find(|var| var.name == desired_env.name) {
                Some(var) => {
                    var.value = desired_env.value.clone();
                    var.value_from = desired_env.value_from.clone();
                }
                None => env.push(desired_env.clone()),
            }
        }
    }
}

/// The constraint appended to a game server when the controller takes it out
/// of service for draining.
pub fn not_in_service_constraint() -> Constraint {
    Constraint {
        type_: ConstraintType::NotInService,
        effective: Some(true),
        message: "garrison controller marked this game server as not in service".to_string(),
        time_added: Some(Time(chrono::Utc::now())),
    }
}

/// Whether the cluster autoscaler has tainted this node for teardown. Game
/// servers landing on such a node should subsequently be constrained out of
/// service by the node lifecycle consumer.
pub fn node_tainted_by_autoscaler(node: &Node) -> bool {
    node.spec
        .as_ref()
        .and_then(|spec| spec.taints.as_ref())
        .is_some_and(|taints| taints.iter().any(|taint| taint.key == TO_BE_DELETED_TAINT))
}
