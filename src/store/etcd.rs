//! etcd v2 keys API adapter.
//!
//! # Responsibilities
//! - Upsert leased keys (`PUT /v2/keys/<key>` with `ttl`)
//! - List keys recursively (`GET /v2/keys/<prefix>?recursive=true`)
//! - Long-poll watches (`?wait=true&recursive=true&waitIndex=N`)
//!
//! # Design Decisions
//! - Each watch runs in its own task and feeds an unbounded channel
//! - Any watch failure ends the stream; the consumer re-establishes it
//! - Key segments are percent-encoded again for the URL path, so encoded
//!   pattern segments survive the round trip unchanged

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::mpsc;
use url::Url;

use crate::config::StoreConfig;
use crate::store::{CoordinationStore, StoreEntry, StoreError, WatchAction, WatchEvent, WatchStream};

#[derive(Debug, Deserialize)]
struct EtcdResponse {
    action: String,
    node: Option<EtcdNode>,
}

#[derive(Debug, Deserialize)]
struct EtcdNode {
    key: String,
    #[serde(default)]
    value: Option<String>,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<EtcdNode>,
    #[serde(default, rename = "modifiedIndex")]
    modified_index: u64,
    #[serde(default)]
    ttl: Option<u64>,
}

impl EtcdNode {
    fn flatten_into(self, out: &mut Vec<StoreEntry>) {
        if self.dir {
            for child in self.nodes {
                child.flatten_into(out);
            }
        } else if let Some(value) = self.value {
            out.push(StoreEntry::new(self.key, value, self.ttl.map(Duration::from_secs)));
        }
    }
}

/// Translate one watch response. Returns the next `waitIndex` and the event,
/// if the action is one the directory cares about.
fn watch_event(body: EtcdResponse) -> (Option<u64>, Option<WatchEvent>) {
    let Some(node) = body.node else {
        return (None, None);
    };
    let next_index = Some(node.modified_index + 1);

    let action = match body.action.as_str() {
        "set" | "create" | "update" | "compareAndSwap" => WatchAction::Set,
        "delete" | "compareAndDelete" => WatchAction::Delete,
        "expire" => WatchAction::Expire,
        other => {
            tracing::debug!(action = other, key = %node.key, "Ignoring etcd action");
            return (next_index, None);
        }
    };
    let event = WatchEvent {
        action,
        key: node.key,
        value: if action == WatchAction::Set { node.value } else { None },
        ttl: node.ttl.map(Duration::from_secs),
    };
    (next_index, Some(event))
}

/// Client for an etcd v2 endpoint.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    client: Client,
    endpoint: Url,
    request_timeout: Duration,
}

impl EtcdStore {
    pub fn new(config: &StoreConfig) -> Result<Self, StoreError> {
        let endpoint = Url::parse(&config.endpoint)
            .map_err(|e| StoreError::InvalidKey(format!("{}: {}", config.endpoint, e)))?;
        Ok(Self {
            client: Client::new(),
            endpoint,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }

    fn key_url(&self, key: &str) -> Result<Url, StoreError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::InvalidKey(key.to_string()))?
            .pop_if_empty()
            .extend(["v2", "keys"])
            .extend(key.split('/').filter(|s| !s.is_empty()));
        Ok(url)
    }

    /// Recursive listing plus the store index it was taken at.
    async fn fetch(&self, prefix: &str) -> Result<(Vec<StoreEntry>, Option<u64>), StoreError> {
        let mut url = self.key_url(prefix)?;
        url.query_pairs_mut().append_pair("recursive", "true");

        let response = self
            .client
            .get(url)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        let index = response
            .headers()
            .get("x-etcd-index")
            .and_then(|h| h.to_str().ok())
            .and_then(|s| s.parse::<u64>().ok());

        if response.status() == StatusCode::NOT_FOUND {
            return Ok((Vec::new(), index));
        }
        if !response.status().is_success() {
            return Err(StoreError::Protocol(format!("list returned {}", response.status())));
        }

        let body: EtcdResponse = response
            .json()
            .await
            .map_err(|e| StoreError::Protocol(e.to_string()))?;
        let mut entries = Vec::new();
        if let Some(node) = body.node {
            node.flatten_into(&mut entries);
        }
        Ok((entries, index))
    }
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let url = self.key_url(key)?;
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("value", value)
            .append_pair("ttl", &ttl.as_secs().max(1).to_string())
            .finish();

        let response = self
            .client
            .put(url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Protocol(format!("set returned {}", response.status())));
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<StoreEntry>, StoreError> {
        Ok(self.fetch(prefix).await?.0)
    }

    async fn watch(&self, prefix: &str) -> Result<WatchStream, StoreError> {
        // Probing first makes an unreachable store fail the call instead of the stream.
        let (_, index) = self.fetch(prefix).await?;
        let url = self.key_url(prefix)?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_loop(self.client.clone(), url, index.map(|i| i + 1), tx));
        Ok(rx)
    }
}

async fn watch_loop(
    client: Client,
    base: Url,
    mut wait_index: Option<u64>,
    tx: mpsc::UnboundedSender<WatchEvent>,
) {
    loop {
        let mut url = base.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("wait", "true").append_pair("recursive", "true");
            if let Some(index) = wait_index {
                query.append_pair("waitIndex", &index.to_string());
            }
        }

        let response = tokio::select! {
            _ = tx.closed() => return,
            response = client.get(url).send() => response,
        };

        let body: EtcdResponse = match response {
            Ok(r) if r.status().is_success() => match r.json().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(error = %e, "Undecodable etcd watch response");
                    return;
                }
            },
            Ok(r) => {
                tracing::warn!(status = %r.status(), "etcd watch rejected");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, "etcd watch failed");
                return;
            }
        };

        let (next_index, event) = watch_event(body);
        if next_index.is_some() {
            wait_index = next_index;
        }
        let Some(event) = event else {
            continue;
        };
        if tx.send(event).is_err() {
            return;
        }
    }
}
