//! Collaborator interfaces consumed by the engine.
//!
//! Real implementations: `HttpBoardApi`, `HttpChangeFeed`. Test double and
//! demo backend: `InMemoryBackend`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::errors::BoardError;

use super::models::{BackendStatus, ChangeKind, ItemDraft, ItemId, Scope, WorkItem};

/// Un-normalized board response: `{"board": {...}}` or legacy `{"kanban": {...}}`,
/// possibly missing columns.
pub type BoardLike = serde_json::Value;

/// Request/response persistence API.
#[async_trait]
pub trait BoardApi: Send + Sync {
    async fn fetch_board(&self, scope: &Scope) -> Result<BoardLike, BoardError>;

    async fn update_status(&self, item_id: &ItemId, status: BackendStatus) -> Result<(), BoardError>;

    async fn create_item(&self, scope: &Scope, draft: &ItemDraft) -> Result<WorkItem, BoardError>;
}

/// A raw pushed row: `{"event": "UPDATE", "record": {"id": .., "status": .., ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub event: ChangeKind,
    pub record: serde_json::Value,
}

/// Server-side filter sent with a subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeFilter {
    pub project_id: String,
    pub discipline_id: String,
    pub events: Vec<ChangeKind>,
}

impl ChangeFilter {
    pub fn for_scope(scope: &Scope, events: &[ChangeKind]) -> Self {
        Self {
            project_id: scope.project_id().to_string(),
            discipline_id: scope.discipline_id().to_string(),
            events: events.to_vec(),
        }
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        self.events.contains(&kind)
    }

    /// `INSERT,UPDATE` form used in query strings.
    pub fn events_param(&self) -> String {
        self.events
            .iter()
            .map(ChangeKind::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Identifies one live subscription for `unsubscribe`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    pub id: u64,
    pub key: String,
}

/// A live subscription: its handle plus the stream of rows.
#[derive(Debug)]
pub struct Subscription {
    pub handle: SubscriptionHandle,
    pub rows: mpsc::Receiver<RawChange>,
}

/// Push channel delivering row changes for one scope.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, key: &str, filter: &ChangeFilter) -> Result<Subscription, BoardError>;

    async fn unsubscribe(&self, handle: SubscriptionHandle);
}
