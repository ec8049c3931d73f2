//! Credential lookup for the database protocol
//!
//! The auth Secret referenced by `spec.auth.secretRef` holds either
//! `username` and `password` keys, or a single `NEO4J_AUTH` key in the
//! `user/password` form the Neo4j image understands.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

#[cfg(test)]
use mockall::automock;

use neo4j_common::crd::Neo4jEnterpriseCluster;
use neo4j_common::Error;

/// Secret key holding the username
pub const USERNAME_KEY: &str = "username";
/// Secret key holding the password
pub const PASSWORD_KEY: &str = "password";
/// Secret key holding `user/password`
pub const NEO4J_AUTH_KEY: &str = "NEO4J_AUTH";

/// Username and password for the HTTP/Bolt endpoints
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Database user
    pub username: String,
    /// Database password
    pub password: String,
}

impl Credentials {
    /// Create credentials from a username and password
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolves the credentials the operator uses to talk to a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CredentialsProvider: Send + Sync {
    /// Credentials for the given cluster
    async fn credentials(&self, cluster: &Neo4jEnterpriseCluster) -> Result<Credentials, Error>;
}

/// Reads credentials from the cluster's auth Secret
pub struct SecretCredentialsProvider {
    client: Client,
}

impl SecretCredentialsProvider {
    /// Create a provider backed by the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CredentialsProvider for SecretCredentialsProvider {
    async fn credentials(&self, cluster: &Neo4jEnterpriseCluster) -> Result<Credentials, Error> {
        let namespace = cluster.namespace_or_default();
        let secret_name = &cluster.spec.auth.secret_ref.name;
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let secret = api.get_opt(secret_name).await?.ok_or_else(|| {
            Error::internal_with_context(
                "credentials",
                format!("auth secret {namespace}/{secret_name} not found"),
            )
        })?;
        credentials_from_secret(&secret)
    }
}

/// Extract credentials from an auth Secret
pub fn credentials_from_secret(secret: &Secret) -> Result<Credentials, Error> {
    let name = secret.metadata.name.as_deref().unwrap_or("<unnamed>");
    let value = |key: &str| -> Option<String> {
        if let Some(data) = secret.data.as_ref().and_then(|d| d.get(key)) {
            return String::from_utf8(data.0.clone()).ok();
        }
        secret.string_data.as_ref().and_then(|d| d.get(key)).cloned()
    };

    if let (Some(username), Some(password)) = (value(USERNAME_KEY), value(PASSWORD_KEY)) {
        return Ok(Credentials::new(username, password));
    }

    if let Some(auth) = value(NEO4J_AUTH_KEY) {
        if let Some((username, password)) = auth.split_once('/') {
            if !username.is_empty() && !password.is_empty() {
                return Ok(Credentials::new(username, password));
            }
        }
        return Err(Error::internal_with_context(
            "credentials",
            format!("secret {name} has a malformed {NEO4J_AUTH_KEY} key, expected user/password"),
        ));
    }

    Err(Error::internal_with_context(
        "credentials",
        format!(
            "secret {name} must contain {USERNAME_KEY}/{PASSWORD_KEY} or {NEO4J_AUTH_KEY}"
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn secret(entries: &[(&str, &str)]) -> Secret {
        Secret {
            metadata: kube::api::ObjectMeta {
                name: Some("graph-auth".to_string()),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn reads_username_and_password_keys() {
        let creds =
            credentials_from_secret(&secret(&[("username", "neo4j"), ("password", "s3cret")]))
                .unwrap();
        assert_eq!(creds, Credentials::new("neo4j", "s3cret"));
    }

    #[test]
    fn falls_back_to_neo4j_auth_key() {
        let creds = credentials_from_secret(&secret(&[("NEO4J_AUTH", "neo4j/pass/with/slash")]))
            .unwrap();
        assert_eq!(creds.username, "neo4j");
        assert_eq!(creds.password, "pass/with/slash");
    }

    #[test]
    fn rejects_malformed_or_missing_keys() {
        assert!(credentials_from_secret(&secret(&[("NEO4J_AUTH", "none")])).is_err());
        assert!(credentials_from_secret(&secret(&[("token", "x")])).is_err());
    }

    #[test]
    fn debug_output_redacts_password() {
        let rendered = format!("{:?}", Credentials::new("neo4j", "hunter2"));
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("neo4j"));
    }
}
