//! Kubernetes helpers shared by the controllers

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::{Resource, ResourceExt};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

/// Annotation recording the content hash of the last applied desired object
pub const CONTENT_HASH_ANNOTATION: &str = "neo4j.neo4j.com/content-hash";

/// Pod-template annotation whose change triggers a rolling restart
pub const RESTART_GENERATION_ANNOTATION: &str = "neo4j.neo4j.com/restart-generation";

/// Pod-template annotation carrying the hash of the applied server configuration
pub const CONFIG_HASH_ANNOTATION: &str = "neo4j.neo4j.com/config-hash";

/// Label carrying the owning cluster's name on every child object
pub const CLUSTER_LABEL: &str = "neo4j.neo4j.com/cluster";

/// Standard "managed-by" label key
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Field manager used for server-side apply and status writes
pub const FIELD_MANAGER: &str = "neo4j-operator";

/// Compute a deterministic hash of the input string, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains, so it can be persisted in
/// annotations.
pub fn deterministic_hash(input: &str) -> String {
    let hash = Sha256::digest(input.as_bytes());
    hash[..8].iter().fold(String::with_capacity(16), |mut s, b| {
        use std::fmt::Write;
        let _ = write!(s, "{:02x}", b);
        s
    })
}

/// Hash the semantically relevant content of a serializable object.
///
/// Server-populated metadata (uid, resourceVersion, timestamps, managed
/// fields, generation, status) and the content-hash annotation itself are
/// removed before hashing. `serde_json` maps are ordered, so identical input
/// gives an identical hash.
pub fn content_hash<T: serde::Serialize>(object: &T) -> Result<String> {
    let mut value =
        serde_json::to_value(object).map_err(|e| Error::serialization(e.to_string()))?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("status");
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            for field in [
                "uid",
                "resourceVersion",
                "creationTimestamp",
                "deletionTimestamp",
                "managedFields",
                "generation",
                "selfLink",
            ] {
                meta.remove(field);
            }
            if let Some(annotations) = meta.get_mut("annotations").and_then(|a| a.as_object_mut())
            {
                annotations.remove(CONTENT_HASH_ANNOTATION);
            }
        }
    }
    let canonical =
        serde_json::to_string(&value).map_err(|e| Error::serialization(e.to_string()))?;
    Ok(deterministic_hash(&canonical))
}

/// Read the recorded content hash from an object's annotations
pub fn recorded_hash(meta: &ObjectMeta) -> Option<&str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(CONTENT_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Set an annotation, creating the map if needed
pub fn set_annotation(meta: &mut ObjectMeta, key: &str, value: impl Into<String>) {
    meta.annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.into());
}

/// Labels every child object of a cluster carries
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
        (MANAGED_BY_LABEL.to_string(), FIELD_MANAGER.to_string()),
        ("app.kubernetes.io/name".to_string(), "neo4j".to_string()),
    ])
}

/// Controller owner reference pointing at `owner`
///
/// Child objects carrying this are garbage-collected with the owner.
pub fn controller_owner_ref<K>(owner: &K) -> Result<OwnerReference>
where
    K: Resource<DynamicType = ()>,
{
    owner
        .controller_owner_ref(&())
        .ok_or_else(|| Error::internal_with_context("owner-ref", format!(
            "{} has no uid yet",
            owner.name_any()
        )))
}
