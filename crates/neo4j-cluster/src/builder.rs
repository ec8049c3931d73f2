//! Desired child objects for a Neo4jEnterpriseCluster
//!
//! Every builder function is a pure function of the cluster resource: the
//! same input always produces byte-identical objects. Maps are `BTreeMap`s
//! and lists are built in a fixed order so the content hash computed by the
//! convergence engine is stable.
//!
//! Children:
//! - ConfigMap `<name>-config`: `neo4j.conf` settings as `NEO4J_*` env vars
//! - Service `<name>-headless`: stable per-member DNS, used for discovery and
//!   split-brain checks
//! - Service `<name>`: client endpoint (bolt + http)
//! - StatefulSet `<name>-server`: the servers themselves

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar, EnvVarSource,
    ObjectFieldSelector, PersistentVolumeClaim, PersistentVolumeClaimSpec, PodSpec,
    PodTemplateSpec, Probe, SecretKeySelector, SecretVolumeSource, Service, ServicePort,
    ServiceSpec, TCPSocketAction, Volume, VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use neo4j_common::crd::{Neo4jEnterpriseCluster, TlsMode};
use neo4j_common::kube_utils::{cluster_labels, controller_owner_ref};
use neo4j_common::Error;

use crate::converge::ChildObject;
use crate::credentials::{PASSWORD_KEY, USERNAME_KEY};

/// Bolt port
pub const BOLT_PORT: i32 = 7687;
/// HTTP port
pub const HTTP_PORT: i32 = 7474;
/// Cluster transaction and discovery port
pub const CLUSTER_PORT: i32 = 6000;
/// Raft port
pub const RAFT_PORT: i32 = 7000;
/// Server-side routing port
pub const ROUTING_PORT: i32 = 7688;

const CONTAINER_NAME: &str = "neo4j";
const DATA_VOLUME: &str = "data";
const TLS_VOLUME: &str = "cluster-tls";
const TLS_MOUNT: &str = "/ssl/cluster";

/// Produces the desired child objects of a cluster
pub trait ResourceBuilder: Send + Sync {
    /// StatefulSet running the servers
    fn build_stateful_set(&self, cluster: &Neo4jEnterpriseCluster) -> Result<StatefulSet, Error>;

    /// Client Service (bolt + http)
    fn build_service(&self, cluster: &Neo4jEnterpriseCluster) -> Result<Service, Error>;

    /// Headless Service giving every member a stable DNS name
    fn build_headless_service(&self, cluster: &Neo4jEnterpriseCluster)
        -> Result<Service, Error>;

    /// ConfigMap carrying the server settings
    fn build_config_map(&self, cluster: &Neo4jEnterpriseCluster) -> Result<ConfigMap, Error>;
}

/// All desired children, configuration first
pub fn desired_state(
    builder: &dyn ResourceBuilder,
    cluster: &Neo4jEnterpriseCluster,
) -> Result<Vec<ChildObject>, Error> {
    Ok(vec![
        ChildObject::ConfigMap(builder.build_config_map(cluster)?),
        ChildObject::Service(builder.build_headless_service(cluster)?),
        ChildObject::Service(builder.build_service(cluster)?),
        ChildObject::StatefulSet(builder.build_stateful_set(cluster)?),
    ])
}

/// Builder used by the operator
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultResourceBuilder;

fn child_meta(cluster: &Neo4jEnterpriseCluster, name: String) -> Result<ObjectMeta, Error> {
    Ok(ObjectMeta {
        name: Some(name),
        namespace: Some(cluster.namespace_or_default()),
        labels: Some(cluster_labels(&cluster.name_any())),
        owner_references: Some(vec![controller_owner_ref(cluster)?]),
        ..Default::default()
    })
}

/// DNS name of member `ordinal`
fn member_fqdn(cluster: &Neo4jEnterpriseCluster, ordinal: i32) -> String {
    format!(
        "{}-{}.{}.{}.svc.cluster.local",
        cluster.server_set_name(),
        ordinal,
        cluster.headless_service_name(),
        cluster.namespace_or_default()
    )
}

/// Server settings for a cluster, user overrides applied last
///
/// A single-primary cluster bootstraps its system database with one primary;
/// a multi-primary cluster waits for `primaries` members before forming.
/// Changing between the two is why existing members must restart on a
/// single-to-multi scale-up.
pub fn neo4j_settings(cluster: &Neo4jEnterpriseCluster) -> BTreeMap<String, String> {
    let topology = &cluster.spec.topology;
    let mut settings = BTreeMap::new();
    let mut set = |k: &str, v: String| {
        settings.insert(k.to_string(), v);
    };

    let endpoints = (0..topology.effective_servers())
        .map(|i| format!("{}:{}", member_fqdn(cluster, i), CLUSTER_PORT))
        .collect::<Vec<_>>()
        .join(",");

    set("server.default_listen_address", "0.0.0.0".to_string());
    set("dbms.cluster.discovery.resolver_type", "LIST".to_string());
    set("dbms.cluster.discovery.version", "V2_ONLY".to_string());
    set("dbms.cluster.discovery.v2.endpoints", endpoints);
    set(
        "initial.dbms.default_primaries_count",
        topology.primaries.to_string(),
    );
    set(
        "initial.dbms.default_secondaries_count",
        topology.secondaries.to_string(),
    );
    if topology.is_single_primary() {
        set("dbms.cluster.minimum_initial_system_primaries_count", "1".to_string());
        set("initial.server.mode_constraint", "NONE".to_string());
    } else {
        set(
            "dbms.cluster.minimum_initial_system_primaries_count",
            topology.primaries.to_string(),
        );
    }

    if cluster.spec.tls.mode == TlsMode::ClusterCertificate {
        set("dbms.ssl.policy.cluster.enabled", "true".to_string());
        set("dbms.ssl.policy.cluster.base_directory", TLS_MOUNT.to_string());
        set("dbms.ssl.policy.cluster.private_key", "tls.key".to_string());
        set("dbms.ssl.policy.cluster.public_certificate", "tls.crt".to_string());
        set("dbms.ssl.policy.bolt.enabled", "true".to_string());
        set("dbms.ssl.policy.bolt.base_directory", TLS_MOUNT.to_string());
        set("dbms.ssl.policy.bolt.private_key", "tls.key".to_string());
        set("dbms.ssl.policy.bolt.public_certificate", "tls.crt".to_string());
        set("server.bolt.tls_level", "OPTIONAL".to_string());
    }

    let query_log = if cluster.spec.query_monitoring.enabled {
        "INFO"
    } else {
        "OFF"
    };
    set("db.logs.query.enabled", query_log.to_string());

    for (k, v) in &cluster.spec.config {
        settings.insert(k.clone(), v.clone());
    }
    settings
}

/// Environment variable the Neo4j image maps to a setting
///
/// `_` becomes `__` and `.` becomes `_`, so
/// `server.memory.heap.max_size` is `NEO4J_server_memory_heap_max__size`.
pub fn setting_env_name(setting: &str) -> String {
    let mut out = String::from("NEO4J_");
    for c in setting.chars() {
        match c {
            '_' => out.push_str("__"),
            '.' => out.push('_'),
            c => out.push(c),
        }
    }
    out
}

fn port(name: &str, port: i32) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

fn all_ports() -> Vec<ServicePort> {
    vec![
        port("bolt", BOLT_PORT),
        port("http", HTTP_PORT),
        port("cluster", CLUSTER_PORT),
        port("raft", RAFT_PORT),
        port("routing", ROUTING_PORT),
    ]
}

fn env_value(name: &str, value: impl Into<String>) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.into()),
        ..Default::default()
    }
}

fn env_from_field(name: &str, path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_from_secret(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(false),
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl ResourceBuilder for DefaultResourceBuilder {
    fn build_config_map(&self, cluster: &Neo4jEnterpriseCluster) -> Result<ConfigMap, Error> {
        let data = neo4j_settings(cluster)
            .into_iter()
            .map(|(k, v)| (setting_env_name(&k), v))
            .collect::<BTreeMap<_, _>>();
        Ok(ConfigMap {
            metadata: child_meta(cluster, cluster.config_map_name())?,
            data: Some(data),
            ..Default::default()
        })
    }

    fn build_headless_service(
        &self,
        cluster: &Neo4jEnterpriseCluster,
    ) -> Result<Service, Error> {
        Ok(Service {
            metadata: child_meta(cluster, cluster.headless_service_name())?,
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                // Members must resolve each other before they are ready
                publish_not_ready_addresses: Some(true),
                selector: Some(cluster_labels(&cluster.name_any())),
                ports: Some(all_ports()),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn build_service(&self, cluster: &Neo4jEnterpriseCluster) -> Result<Service, Error> {
        Ok(Service {
            metadata: child_meta(cluster, cluster.client_service_name())?,
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(cluster_labels(&cluster.name_any())),
                ports: Some(vec![port("bolt", BOLT_PORT), port("http", HTTP_PORT)]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    fn build_stateful_set(&self, cluster: &Neo4jEnterpriseCluster) -> Result<StatefulSet, Error> {
        let labels = cluster_labels(&cluster.name_any());
        let secret = &cluster.spec.auth.secret_ref.name;
        let advertised = format!(
            "$(POD_NAME).{}.{}.svc.cluster.local",
            cluster.headless_service_name(),
            cluster.namespace_or_default()
        );

        let env = vec![
            env_from_field("POD_NAME", "metadata.name"),
            env_value("NEO4J_ACCEPT_LICENSE_AGREEMENT", "yes"),
            env_value("NEO4J_server_default__advertised__address", advertised),
            env_from_secret("NEO4J_USERNAME", secret, USERNAME_KEY),
            env_from_secret("NEO4J_PASSWORD", secret, PASSWORD_KEY),
            env_value("NEO4J_AUTH", "$(NEO4J_USERNAME)/$(NEO4J_PASSWORD)"),
        ];

        let mut volume_mounts = vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: "/data".to_string(),
            ..Default::default()
        }];
        let mut volumes = Vec::new();
        if cluster.spec.tls.mode == TlsMode::ClusterCertificate {
            let tls_secret = cluster.spec.tls.secret_ref.as_ref().ok_or_else(|| {
                Error::validation_for_field(
                    cluster.name_any(),
                    "spec.tls.secretRef",
                    "ClusterCertificate mode needs a certificate secret",
                )
            })?;
            volume_mounts.push(VolumeMount {
                name: TLS_VOLUME.to_string(),
                mount_path: TLS_MOUNT.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
            volumes.push(Volume {
                name: TLS_VOLUME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(tls_secret.name.clone()),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }

        let container = Container {
            name: CONTAINER_NAME.to_string(),
            image: Some(cluster.spec.image.reference()),
            image_pull_policy: cluster.spec.image.pull_policy.clone(),
            ports: Some(
                all_ports()
                    .into_iter()
                    .map(|p| ContainerPort {
                        name: p.name,
                        container_port: p.port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            env: Some(env),
            env_from: Some(vec![EnvFromSource {
                config_map_ref: Some(ConfigMapEnvSource {
                    name: cluster.config_map_name(),
                    optional: Some(false),
                }),
                ..Default::default()
            }]),
            readiness_probe: Some(Probe {
                tcp_socket: Some(TCPSocketAction {
                    port: IntOrString::Int(BOLT_PORT),
                    ..Default::default()
                }),
                initial_delay_seconds: Some(10),
                period_seconds: Some(10),
                ..Default::default()
            }),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        };

        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(DATA_VOLUME.to_string()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: cluster.spec.storage.class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(cluster.spec.storage.size.clone()),
                    )])),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        Ok(StatefulSet {
            metadata: child_meta(cluster, cluster.server_set_name())?,
            spec: Some(StatefulSetSpec {
                replicas: Some(cluster.spec.topology.effective_servers()),
                service_name: cluster.headless_service_name(),
                pod_management_policy: Some("Parallel".to_string()),
                selector: LabelSelector {
                    match_labels: Some(labels.clone()),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        containers: vec![container],
                        volumes: if volumes.is_empty() {
                            None
                        } else {
                            Some(volumes)
                        },
                        ..Default::default()
                    }),
                },
                volume_claim_templates: Some(vec![claim]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::cluster;
    use neo4j_common::crd::SecretRef;
    use neo4j_common::kube_utils::content_hash;

    #[test]
    fn builders_are_deterministic() {
        let c = cluster(3, 1);
        let a = desired_state(&DefaultResourceBuilder, &c).unwrap();
        let b = desired_state(&DefaultResourceBuilder, &c).unwrap();
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.content_hash().unwrap(), y.content_hash().unwrap());
        }
    }

    #[test]
    fn stateful_set_runs_every_server_behind_the_headless_service() {
        let sts = DefaultResourceBuilder
            .build_stateful_set(&cluster(3, 2))
            .unwrap();
        let spec = sts.spec.unwrap();
        assert_eq!(spec.replicas, Some(5));
        assert_eq!(spec.service_name, "graph-headless");
        assert_eq!(spec.pod_management_policy.as_deref(), Some("Parallel"));
        let owner = &sts.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.name, "graph");
        assert_eq!(owner.controller, Some(true));
    }

    #[test]
    fn single_and_multi_primary_bootstrap_differently() {
        let single = neo4j_settings(&cluster(1, 0));
        let multi = neo4j_settings(&cluster(3, 0));
        assert_eq!(
            single["dbms.cluster.minimum_initial_system_primaries_count"],
            "1"
        );
        assert_eq!(
            multi["dbms.cluster.minimum_initial_system_primaries_count"],
            "3"
        );
        assert!(multi["dbms.cluster.discovery.v2.endpoints"]
            .contains("graph-server-2.graph-headless.db.svc.cluster.local:6000"));
        assert_ne!(
            content_hash(&DefaultResourceBuilder.build_config_map(&cluster(1, 0)).unwrap())
                .unwrap(),
            content_hash(&DefaultResourceBuilder.build_config_map(&cluster(3, 0)).unwrap())
                .unwrap()
        );
    }

    #[test]
    fn user_config_overrides_defaults() {
        let mut c = cluster(3, 0);
        c.spec
            .config
            .insert("db.logs.query.enabled".to_string(), "VERBOSE".to_string());
        assert_eq!(neo4j_settings(&c)["db.logs.query.enabled"], "VERBOSE");
    }

    #[test]
    fn setting_names_map_to_image_env_vars() {
        assert_eq!(
            setting_env_name("server.memory.heap.max_size"),
            "NEO4J_server_memory_heap_max__size"
        );
        let cm = DefaultResourceBuilder.build_config_map(&cluster(3, 0)).unwrap();
        assert!(cm
            .data
            .unwrap()
            .contains_key("NEO4J_initial_dbms_default__primaries__count"));
    }

    #[test]
    fn tls_mode_requires_a_secret() {
        let mut c = cluster(3, 0);
        c.spec.tls.mode = TlsMode::ClusterCertificate;
        assert!(DefaultResourceBuilder.build_stateful_set(&c).is_err());

        c.spec.tls.secret_ref = Some(SecretRef {
            name: "graph-tls".to_string(),
        });
        let sts = DefaultResourceBuilder.build_stateful_set(&c).unwrap();
        let volumes = sts.spec.unwrap().template.spec.unwrap().volumes.unwrap();
        assert_eq!(volumes[0].name, TLS_VOLUME);
    }

    #[test]
    fn children_require_an_owner_uid() {
        let mut c = cluster(3, 0);
        c.metadata.uid = None;
        assert!(desired_state(&DefaultResourceBuilder, &c).is_err());
    }
}
