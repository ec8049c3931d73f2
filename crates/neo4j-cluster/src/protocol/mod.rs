//! Client side of the database's cluster-membership protocol
//!
//! The operator never speaks Bolt. It issues administrative Cypher
//! (`SHOW SERVERS`, `SHOW DATABASES`) over the HTTP transactional endpoint,
//! either through the client Service or directly to one member's per-pod DNS
//! name. Calls made on behalf of a cluster go through that cluster's
//! [`CircuitBreaker`](circuit_breaker::CircuitBreaker).

pub mod circuit_breaker;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use neo4j_common::crd::{DatabaseDiagnostic, Neo4jEnterpriseCluster, ServerDiagnostic};
use neo4j_common::error::ProtocolErrorKind;
use neo4j_common::Error;

use crate::builder::HTTP_PORT;
use crate::credentials::Credentials;

pub use circuit_breaker::{BreakerConfig, BreakerState, CircuitBreaker, CircuitBreakerRegistry};
pub use http::{HttpConnector, HttpProtocolClient};

/// Cheapest statement that proves the session works
pub const VERIFY_CONNECTIVITY: &str = "RETURN 1";

/// Server list, one row per cluster member
pub const SHOW_SERVERS: &str = "SHOW SERVERS YIELD name, address, state, health, hosting";

/// Database list, one row per database per hosting server
pub const SHOW_DATABASES: &str =
    "SHOW DATABASES YIELD name, currentStatus, requestedStatus, role, default";

/// Tabular query result
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Rows {
    /// Column names, in order
    pub columns: Vec<String>,
    /// Row values, each aligned with `columns`
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    /// Iterate rows as name-addressable records
    pub fn records(&self) -> impl Iterator<Item = Record<'_>> {
        self.rows.iter().map(move |values| Record {
            columns: &self.columns,
            values,
        })
    }
}

/// One row of a [`Rows`] result
pub struct Record<'a> {
    columns: &'a [String],
    values: &'a [Value],
}

impl Record<'_> {
    /// Value of a column, if present
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|i| self.values.get(i))
    }

    /// String value of a column; empty for missing or non-string values
    pub fn string(&self, column: &str) -> String {
        self.get(column)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

/// Where a session connects
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    /// `namespace/name` of the cluster resource
    pub cluster: String,
    /// Member name when the endpoint is a single pod
    pub member: Option<String>,
    /// Base URL of the HTTP endpoint (no trailing slash)
    pub base_url: String,
}

impl Endpoint {
    /// Endpoint behind the cluster's client Service
    pub fn for_cluster(cluster: &Neo4jEnterpriseCluster) -> Self {
        let namespace = cluster.namespace_or_default();
        Self {
            cluster: cluster_key(cluster),
            member: None,
            base_url: format!(
                "http://{}.{}.svc.cluster.local:{}",
                cluster.client_service_name(),
                namespace,
                HTTP_PORT
            ),
        }
    }

    /// Endpoint of one member, addressed through the headless Service
    pub fn for_member(cluster: &Neo4jEnterpriseCluster, member: &str) -> Self {
        Self {
            cluster: cluster_key(cluster),
            member: Some(member.to_string()),
            base_url: format!("http://{}:{}", member_host(cluster, member), HTTP_PORT),
        }
    }

    /// Build a protocol error attributed to this endpoint
    pub fn error(&self, kind: ProtocolErrorKind, msg: impl Into<String>) -> Error {
        match &self.member {
            Some(member) => Error::protocol_for_member(&self.cluster, member, kind, msg),
            None => Error::protocol(&self.cluster, kind, msg),
        }
    }
}

/// `namespace/name` key of a cluster resource
pub fn cluster_key(cluster: &Neo4jEnterpriseCluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace_or_default(),
        kube::ResourceExt::name_any(cluster)
    )
}

/// Stable DNS name of one member pod
pub fn member_host(cluster: &Neo4jEnterpriseCluster, member: &str) -> String {
    format!(
        "{}.{}.{}.svc.cluster.local",
        member,
        cluster.headless_service_name(),
        cluster.namespace_or_default()
    )
}

/// An open session against the database
///
/// Only [`query`](ProtocolClient::query) must be implemented; the typed
/// helpers are built on it.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Run one statement and return its rows
    async fn query(&self, statement: &str) -> Result<Rows, Error>;

    /// Check the session can run a trivial statement
    async fn verify_connectivity(&self) -> Result<(), Error> {
        self.query(VERIFY_CONNECTIVITY).await.map(|_| ())
    }

    /// `SHOW SERVERS`
    async fn list_servers(&self) -> Result<Vec<ServerDiagnostic>, Error> {
        Ok(parse_servers(&self.query(SHOW_SERVERS).await?))
    }

    /// `SHOW DATABASES`
    async fn list_databases(&self) -> Result<Vec<DatabaseDiagnostic>, Error> {
        Ok(parse_databases(&self.query(SHOW_DATABASES).await?))
    }

    /// Release the session
    async fn close(&self) {}
}

/// Opens sessions
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session and authenticate it
    ///
    /// Bad credentials surface as a protocol error of kind `Auth`.
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ProtocolClient>, Error>;
}

/// Map `SHOW SERVERS` rows to diagnostics
pub fn parse_servers(rows: &Rows) -> Vec<ServerDiagnostic> {
    rows.records()
        .map(|r| ServerDiagnostic {
            name: r.string("name"),
            address: r.string("address"),
            state: r.string("state"),
            health: r.string("health"),
            hosting_count: r
                .get("hosting")
                .and_then(Value::as_array)
                .map(|h| h.len() as i32)
                .unwrap_or(0),
        })
        .collect()
}

/// Map `SHOW DATABASES` rows to diagnostics
pub fn parse_databases(rows: &Rows) -> Vec<DatabaseDiagnostic> {
    rows.records()
        .map(|r| DatabaseDiagnostic {
            name: r.string("name"),
            status: r.string("currentStatus"),
            requested_status: r.string("requestedStatus"),
            role: r.string("role"),
            is_default: r.get("default").and_then(Value::as_bool).unwrap_or(false),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows(columns: &[&str], rows: Vec<Vec<Value>>) -> Rows {
        Rows {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
        }
    }

    #[test]
    fn parses_show_servers_rows() {
        let result = rows(
            &["name", "address", "state", "health", "hosting"],
            vec![
                vec![
                    json!("8c1a"),
                    json!("graph-server-0.graph-headless.db.svc.cluster.local:7687"),
                    json!("Enabled"),
                    json!("Available"),
                    json!(["neo4j", "system"]),
                ],
                vec![json!("9d2b"), json!("x:7687"), json!("Cordoned"), Value::Null, json!([])],
            ],
        );
        let servers = parse_servers(&result);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].hosting_count, 2);
        assert!(servers[0].is_healthy());
        assert_eq!(servers[1].health, "");
        assert!(!servers[1].is_healthy());
    }

    #[test]
    fn parses_show_databases_rows() {
        let result = rows(
            &["name", "currentStatus", "requestedStatus", "role", "default"],
            vec![vec![
                json!("neo4j"),
                json!("online"),
                json!("online"),
                json!("primary"),
                json!(true),
            ]],
        );
        let dbs = parse_databases(&result);
        assert_eq!(dbs[0].name, "neo4j");
        assert_eq!(dbs[0].status, "online");
        assert!(dbs[0].is_default);
    }

    #[test]
    fn missing_columns_read_as_empty() {
        let result = rows(&["name"], vec![vec![json!("s0")]]);
        let servers = parse_servers(&result);
        assert_eq!(servers[0].name, "s0");
        assert_eq!(servers[0].state, "");
        assert_eq!(servers[0].hosting_count, 0);
    }

    #[tokio::test]
    async fn typed_helpers_run_through_query() {
        struct Fixed;

        #[async_trait]
        impl ProtocolClient for Fixed {
            async fn query(&self, statement: &str) -> Result<Rows, Error> {
                assert_eq!(statement, SHOW_SERVERS);
                Ok(rows(
                    &["name", "state", "health"],
                    vec![vec![json!("s0"), json!("Enabled"), json!("Available")]],
                ))
            }
        }

        let servers = Fixed.list_servers().await.unwrap();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name, "s0");
    }
}
