//! reqwest bindings for the board API and the realtime stream.
//!
//! The realtime channel is a long-lived GET answered with newline-delimited
//! JSON rows. A background task reads the body and forwards parsed rows into
//! the subscription's mpsc channel; dropping or aborting the task closes it.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::BoardError;

use super::models::{BackendStatus, ItemDraft, ItemId, Scope, WorkItem};
use super::ports::{BoardApi, BoardLike, ChangeFeed, ChangeFilter, RawChange, Subscription, SubscriptionHandle};
use super::wire;

const ROW_BUFFER: usize = 256;
const USER_AGENT: &str = concat!("flowboard/", env!("CARGO_PKG_VERSION"));

fn request_error(context: &str, e: reqwest::Error) -> BoardError {
    if e.is_timeout() {
        BoardError::Timeout(format!("{}: {}", context, e))
    } else {
        BoardError::Network(format!("{}: {}", context, e))
    }
}

fn trim_base(base_url: &str) -> String {
    base_url.trim_end_matches('/').to_string()
}

/// Appends `segments` to the base path, percent-encoding each one.
fn endpoint_url(base_url: &str, segments: &[&str]) -> Result<reqwest::Url, BoardError> {
    let mut url = reqwest::Url::parse(base_url)
        .map_err(|e| BoardError::Validation(format!("invalid base URL {}: {}", base_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| BoardError::Validation(format!("base URL {} cannot carry a path", base_url)))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// Request/response persistence over HTTP.
pub struct HttpBoardApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpBoardApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, BoardError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BoardError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: trim_base(base_url),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BoardApi for HttpBoardApi {
    async fn fetch_board(&self, scope: &Scope) -> Result<BoardLike, BoardError> {
        let url = endpoint_url(
            &self.base_url,
            &["api", "disciplines", scope.discipline_id(), "board"],
        )?;
        debug!(url = %url, "fetching board");
        self.client
            .get(url)
            .query(&[("project_id", scope.project_id())])
            .send()
            .await
            .map_err(|e| request_error("board request failed", e))?
            .error_for_status()
            .map_err(|e| request_error("board request rejected", e))?
            .json::<BoardLike>()
            .await
            .map_err(|e| request_error("board response unreadable", e))
    }

    async fn update_status(&self, item_id: &ItemId, status: BackendStatus) -> Result<(), BoardError> {
        let url = endpoint_url(&self.base_url, &["api", "items", item_id.as_str(), "status"])?;
        self.client
            .patch(url)
            .json(&json!({ "status": status }))
            .send()
            .await
            .map_err(|e| request_error("status update failed", e))?
            .error_for_status()
            .map_err(|e| request_error("status update rejected", e))?;
        Ok(())
    }

    async fn create_item(&self, scope: &Scope, draft: &ItemDraft) -> Result<WorkItem, BoardError> {
        let url = endpoint_url(
            &self.base_url,
            &["api", "disciplines", scope.discipline_id(), "items"],
        )?;
        self.client
            .post(url)
            .query(&[("project_id", scope.project_id())])
            .json(draft)
            .send()
            .await
            .map_err(|e| request_error("create request failed", e))?
            .error_for_status()
            .map_err(|e| request_error("create request rejected", e))?
            .json::<WorkItem>()
            .await
            .map_err(|e| request_error("create response unreadable", e))
    }
}

/// Realtime rows over a streamed NDJSON response.
pub struct HttpChangeFeed {
    client: reqwest::Client,
    base_url: String,
    next_id: AtomicU64,
    readers: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl HttpChangeFeed {
    /// Only the connect phase is bounded; the stream itself stays open.
    pub fn new(base_url: &str, connect_timeout: Duration) -> Result<Self, BoardError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| BoardError::Channel(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: trim_base(base_url),
            next_id: AtomicU64::new(1),
            readers: Mutex::new(HashMap::new()),
        })
    }

    fn readers(&self) -> std::sync::MutexGuard<'_, HashMap<u64, JoinHandle<()>>> {
        self.readers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for HttpChangeFeed {
    fn drop(&mut self) {
        for (_, reader) in self.readers().drain() {
            reader.abort();
        }
    }
}

#[async_trait]
impl ChangeFeed for HttpChangeFeed {
    async fn subscribe(&self, key: &str, filter: &ChangeFilter) -> Result<Subscription, BoardError> {
        let url = format!("{}/api/realtime", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("project_id", filter.project_id.as_str()),
                ("discipline_id", filter.discipline_id.as_str()),
                ("events", filter.events_param().as_str()),
            ])
            .send()
            .await
            .map_err(|e| BoardError::Channel(format!("{}: {}", key, e)))?
            .error_for_status()
            .map_err(|e| BoardError::Channel(format!("{}: {}", key, e)))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rows) = mpsc::channel(ROW_BUFFER);
        let channel = key.to_string();
        let reader = tokio::spawn(async move {
            read_rows(channel, response, tx).await;
        });
        self.readers().insert(id, reader);

        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                key: key.to_string(),
            },
            rows,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        if let Some(reader) = self.readers().remove(&handle.id) {
            reader.abort();
            debug!(channel = %handle.key, "realtime reader stopped");
        }
    }
}

/// Forward each complete line of `response` as a row until the body ends or
/// the receiver goes away. Undecodable lines are logged and skipped.
async fn read_rows(channel: String, response: reqwest::Response, tx: mpsc::Sender<RawChange>) {
    let mut body = response.bytes_stream();
    let mut pending: Vec<u8> = Vec::new();

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(channel = %channel, error = %e, "realtime stream failed");
                return;
            }
        };
        pending.extend_from_slice(&chunk);
        while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = pending.drain(..=newline).collect();
            if !forward_line(&channel, &line, &tx).await {
                return;
            }
        }
    }
    if !pending.is_empty() {
        forward_line(&channel, &pending, &tx).await;
    }
    debug!(channel = %channel, "realtime stream closed by server");
}

async fn forward_line(channel: &str, line: &[u8], tx: &mpsc::Sender<RawChange>) -> bool {
    match wire::parse_feed_line(&String::from_utf8_lossy(line)) {
        Ok(Some(row)) => tx.send(row).await.is_ok(),
        Ok(None) => true,
        Err(e) => {
            warn!(channel = %channel, error = %e, "skipping undecodable realtime line");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_is_dropped() {
        let api = HttpBoardApi::new("http://localhost:8080/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.base_url(), "http://localhost:8080");
    }

    #[test]
    fn test_endpoint_segments_are_escaped() {
        let url = endpoint_url("http://localhost:8080/board", &["api", "items", "a/b?c#d", "status"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8080/board/api/items/a%2Fb%3Fc%23d/status");
    }

    #[test]
    fn test_endpoint_rejects_unparseable_base() {
        let err = endpoint_url("not a url", &["api"]).unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_a_network_error() {
        // port 9 (discard) is closed on test machines
        let api = HttpBoardApi::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let err = api
            .fetch_board(&Scope::new("p1", "d1").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Network(_) | BoardError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_unreachable_feed_is_a_channel_error() {
        let feed = HttpChangeFeed::new("http://127.0.0.1:9", Duration::from_secs(2)).unwrap();
        let scope = Scope::new("p1", "d1").unwrap();
        let filter = ChangeFilter::for_scope(&scope, &[]);
        let err = feed.subscribe(&scope.channel_key(), &filter).await.unwrap_err();
        assert!(matches!(err, BoardError::Channel(_)));
    }
}
