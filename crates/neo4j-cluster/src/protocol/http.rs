//! HTTP transactional-endpoint implementation of the protocol client
//!
//! Statements are posted to `/db/system/tx/commit` with basic auth. Every
//! request, including reading the body, runs under the session deadline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use neo4j_common::error::ProtocolErrorKind;
use neo4j_common::Error;

use super::{Connector, Endpoint, ProtocolClient, Rows};
use crate::credentials::Credentials;

/// Default per-request deadline
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens [`HttpProtocolClient`] sessions sharing one connection pool
#[derive(Clone)]
pub struct HttpConnector {
    http: reqwest::Client,
    timeout: Duration,
}

impl HttpConnector {
    /// Create a connector whose sessions use `timeout` per request
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(timeout)
            .build()
            .map_err(|e| Error::internal_with_context("http-connector", e.to_string()))?;
        Ok(Self { http, timeout })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Arc<dyn ProtocolClient>, Error> {
        let client = HttpProtocolClient {
            http: self.http.clone(),
            endpoint: endpoint.clone(),
            credentials: credentials.clone(),
            timeout: self.timeout,
        };
        client.verify_connectivity().await?;
        Ok(Arc::new(client))
    }
}

/// One authenticated session against a Neo4j HTTP endpoint
pub struct HttpProtocolClient {
    http: reqwest::Client,
    endpoint: Endpoint,
    credentials: Credentials,
    timeout: Duration,
}

impl HttpProtocolClient {
    fn commit_url(&self) -> String {
        format!("{}/db/system/tx/commit", self.endpoint.base_url)
    }

    async fn send(&self, statement: &str) -> Result<TxResponse, Error> {
        let response = self
            .http
            .post(self.commit_url())
            .basic_auth(&self.credentials.username, Some(&self.credentials.password))
            .json(&json!({ "statements": [{ "statement": statement }] }))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(self
                .endpoint
                .error(ProtocolErrorKind::Auth, format!("credentials rejected ({status})")));
        }
        if status.is_server_error() {
            return Err(self
                .endpoint
                .error(ProtocolErrorKind::Connection, format!("server returned {status}")));
        }
        if !status.is_success() {
            return Err(self
                .endpoint
                .error(ProtocolErrorKind::Query, format!("server returned {status}")));
        }

        response
            .json::<TxResponse>()
            .await
            .map_err(|e| self.transport_error(e))
    }

    fn transport_error(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            self.endpoint.error(ProtocolErrorKind::Timeout, e.to_string())
        } else if e.is_decode() {
            self.endpoint.error(ProtocolErrorKind::Query, e.to_string())
        } else {
            self.endpoint.error(ProtocolErrorKind::Connection, e.to_string())
        }
    }
}

#[async_trait]
impl ProtocolClient for HttpProtocolClient {
    async fn query(&self, statement: &str) -> Result<Rows, Error> {
        debug!(endpoint = %self.endpoint.base_url, statement, "running statement");
        let response = tokio::time::timeout(self.timeout, self.send(statement))
            .await
            .map_err(|_| {
                self.endpoint.error(
                    ProtocolErrorKind::Timeout,
                    format!("no answer within {}s", self.timeout.as_secs()),
                )
            })??;
        rows_from_response(response)
            .map_err(|message| self.endpoint.error(ProtocolErrorKind::Query, message))
    }
}

#[derive(Debug, Default, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<TxResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct TxResult {
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    data: Vec<TxRow>,
}

#[derive(Debug, Deserialize)]
struct TxRow {
    #[serde(default)]
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

/// First statement's rows, or the server's reported errors
fn rows_from_response(response: TxResponse) -> Result<Rows, String> {
    if !response.errors.is_empty() {
        return Err(response
            .errors
            .iter()
            .map(|e| format!("{}: {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; "));
    }
    let result = response
        .results
        .into_iter()
        .next()
        .ok_or_else(|| "response carried no result".to_string())?;
    Ok(Rows {
        columns: result.columns,
        rows: result.data.into_iter().map(|d| d.row).collect(),
    })
}
