//! In-process backend implementing both collaborator traits.
//!
//! Used by the `demo` command and by tests. Status writes and creates are
//! echoed to subscribers the way a database change feed would, filtered by
//! scope and event kind on the "server" side. Failure injection and a write
//! gate let callers exercise degraded paths and ordering.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::errors::BoardError;

use super::mapper;
use super::models::{BackendStatus, ChangeKind, Column, ItemDraft, ItemId, Scope, WorkItem};
use super::ports::{BoardApi, BoardLike, ChangeFeed, ChangeFilter, RawChange, Subscription, SubscriptionHandle};

const ROW_BUFFER: usize = 256;

struct StoredRow {
    project_id: String,
    column: Column,
    item: WorkItem,
}

struct Subscriber {
    id: u64,
    filter: ChangeFilter,
    tx: mpsc::Sender<RawChange>,
}

#[derive(Default)]
struct MemoryState {
    rows: Vec<StoredRow>,
    subscribers: Vec<Subscriber>,
    next_subscription: u64,
    next_item: u64,
    status_calls: Vec<(ItemId, BackendStatus)>,
    fail_writes: usize,
    fail_fetches: bool,
    fail_subscribe: bool,
    legacy_wrapper: bool,
}

pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
    paused: watch::Sender<bool>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Mutex::new(MemoryState::default()),
            paused,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        // a panicking test thread must not poison the backend for the rest
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add an item to `column` of `scope`, appended at the bottom.
    pub fn seed(&self, scope: &Scope, column: Column, mut item: WorkItem) {
        item.status = mapper::map_column_to_status(column);
        item.discipline_id = scope.discipline_id().to_string();
        self.lock().rows.push(StoredRow {
            project_id: scope.project_id().to_string(),
            column,
            item,
        });
    }

    /// Answer fetches with the legacy `kanban` wrapper.
    pub fn use_legacy_wrapper(&self, legacy: bool) {
        self.lock().legacy_wrapper = legacy;
    }

    /// Fail the next `count` status writes or creates with a network error.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().fail_writes = count;
    }

    pub fn fail_fetches(&self, fail: bool) {
        self.lock().fail_fetches = fail;
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.lock().fail_subscribe = fail;
    }

    /// Hold every status write and create until `resume_writes`.
    /// Calls are still recorded as they arrive.
    pub fn pause_writes(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume_writes(&self) {
        self.paused.send_replace(false);
    }

    /// Every `update_status` call received, in arrival order.
    pub fn status_calls(&self) -> Vec<(ItemId, BackendStatus)> {
        self.lock().status_calls.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    /// Status the backend currently holds for `item_id`.
    pub fn stored_status(&self, item_id: &ItemId) -> Option<BackendStatus> {
        self.lock()
            .rows
            .iter()
            .find(|row| row.item.id == *item_id)
            .map(|row| row.item.status)
    }

    /// Push a row to subscribers whose filter matches it.
    pub fn emit(&self, kind: ChangeKind, record: Value) {
        self.broadcast(RawChange { event: kind, record }, true);
    }

    /// Push a row to every subscriber, ignoring filters.
    pub fn emit_unfiltered(&self, kind: ChangeKind, record: Value) {
        self.broadcast(RawChange { event: kind, record }, false);
    }

    /// Drop every subscriber's stream, as if the server went away.
    pub fn disconnect_all(&self) {
        self.lock().subscribers.clear();
    }

    fn broadcast(&self, change: RawChange, filtered: bool) {
        let mut state = self.lock();
        let (project, discipline) = super::wire::record_scope(&change.record);
        state.subscribers.retain(|subscriber| {
            let matches = !filtered
                || (subscriber.filter.accepts(change.event)
                    && project.as_deref() == Some(subscriber.filter.project_id.as_str())
                    && discipline.as_deref() == Some(subscriber.filter.discipline_id.as_str()));
            if !matches {
                return true;
            }
            // a closed receiver means the subscriber is gone
            !matches!(
                subscriber.tx.try_send(change.clone()),
                Err(mpsc::error::TrySendError::Closed(_))
            )
        });
    }

    async fn wait_for_gate(&self) {
        let mut rx = self.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }

    fn take_write_failure(&self) -> bool {
        let mut state = self.lock();
        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            true
        } else {
            false
        }
    }
}

fn record_for(project_id: &str, item: &WorkItem) -> Value {
    let mut record = serde_json::to_value(item).unwrap_or_else(|_| json!({ "id": item.id }));
    if let Value::Object(map) = &mut record {
        map.insert("project_id".into(), Value::String(project_id.to_string()));
    }
    record
}

#[async_trait]
impl BoardApi for InMemoryBackend {
    async fn fetch_board(&self, scope: &Scope) -> Result<BoardLike, BoardError> {
        let state = self.lock();
        if state.fail_fetches {
            return Err(BoardError::Network("connection refused".into()));
        }
        let mut columns = serde_json::Map::new();
        for row in state.rows.iter().filter(|row| {
            row.project_id == scope.project_id() && row.item.discipline_id == scope.discipline_id()
        }) {
            let entry = columns
                .entry(row.column.as_str())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(items) = entry {
                items.push(serde_json::to_value(&row.item).map_err(|e| {
                    BoardError::MalformedPayload(format!("item {}: {}", row.item.id, e))
                })?);
            }
        }
        let wrapper = if state.legacy_wrapper { "kanban" } else { "board" };
        Ok(json!({ wrapper: columns }))
    }

    async fn update_status(&self, item_id: &ItemId, status: BackendStatus) -> Result<(), BoardError> {
        self.lock().status_calls.push((item_id.clone(), status));
        self.wait_for_gate().await;
        if self.take_write_failure() {
            return Err(BoardError::Network(format!("update of {} failed", item_id)));
        }

        let record = {
            let mut state = self.lock();
            let row = state
                .rows
                .iter_mut()
                .find(|row| row.item.id == *item_id)
                .ok_or_else(|| BoardError::Network(format!("item {} does not exist", item_id)))?;
            row.item.status = status;
            row.column = mapper::default_column_for_status(status, Some(row.column));
            record_for(&row.project_id, &row.item)
        };
        debug!(item_id = %item_id, status = %status, "memory backend stored status");
        self.emit(ChangeKind::Update, record);
        Ok(())
    }

    async fn create_item(&self, scope: &Scope, draft: &ItemDraft) -> Result<WorkItem, BoardError> {
        self.wait_for_gate().await;
        if self.take_write_failure() {
            return Err(BoardError::Network("create failed".into()));
        }

        let (item, record) = {
            let mut state = self.lock();
            state.next_item += 1;
            let id = ItemId::new(format!("srv-{}", state.next_item));
            let item = WorkItem::from_draft(id, draft, scope.discipline_id());
            let record = record_for(scope.project_id(), &item);
            state.rows.push(StoredRow {
                project_id: scope.project_id().to_string(),
                column: mapper::ENTRY_COLUMN,
                item: item.clone(),
            });
            (item, record)
        };
        self.emit(ChangeKind::Insert, record);
        Ok(item)
    }
}

#[async_trait]
impl ChangeFeed for InMemoryBackend {
    async fn subscribe(&self, key: &str, filter: &ChangeFilter) -> Result<Subscription, BoardError> {
        let mut state = self.lock();
        if state.fail_subscribe {
            return Err(BoardError::Channel(format!("subscription to {} refused", key)));
        }
        state.next_subscription += 1;
        let id = state.next_subscription;
        let (tx, rows) = mpsc::channel(ROW_BUFFER);
        state.subscribers.push(Subscriber {
            id,
            filter: filter.clone(),
            tx,
        });
        Ok(Subscription {
            handle: SubscriptionHandle {
                id,
                key: key.to_string(),
            },
            rows,
        })
    }

    async fn unsubscribe(&self, handle: SubscriptionHandle) {
        self.lock().subscribers.retain(|s| s.id != handle.id);
    }
}

/// Group a scope's stored rows by column; used to compare server state in tests.
pub fn columns_of(backend: &InMemoryBackend, scope: &Scope) -> HashMap<Column, Vec<ItemId>> {
    let mut columns: HashMap<Column, Vec<ItemId>> = HashMap::new();
    for row in backend.lock().rows.iter().filter(|row| {
        row.project_id == scope.project_id() && row.item.discipline_id == scope.discipline_id()
    }) {
        columns.entry(row.column).or_default().push(row.item.id.clone());
    }
    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::wire::normalize_board_response;

    fn scope() -> Scope {
        Scope::new("p1", "d1").unwrap()
    }

    fn seeded() -> InMemoryBackend {
        let backend = InMemoryBackend::new();
        let item = WorkItem::from_draft(ItemId::new("T1"), &ItemDraft::titled("Survey"), "d1");
        backend.seed(&scope(), Column::Todo, item.clone());
        backend.seed(&Scope::new("p1", "d2").unwrap(), Column::Done, {
            let mut other = item;
            other.id = ItemId::new("X1");
            other
        });
        backend
    }

    #[tokio::test]
    async fn test_fetch_returns_only_scope_rows() {
        let backend = seeded();
        let data = normalize_board_response(backend.fetch_board(&scope()).await.unwrap()).unwrap();
        assert_eq!(data.board.column(Column::Todo), &[ItemId::new("T1")]);
        assert!(data.items.get(&ItemId::new("X1")).is_none());
    }

    #[tokio::test]
    async fn test_legacy_wrapper() {
        let backend = seeded();
        backend.use_legacy_wrapper(true);
        let raw = backend.fetch_board(&scope()).await.unwrap();
        assert!(raw.get("kanban").is_some());
        assert!(raw.get("board").is_none());
    }

    #[tokio::test]
    async fn test_status_write_is_echoed_to_matching_subscribers() {
        let backend = seeded();
        let filter = ChangeFilter::for_scope(&scope(), &[ChangeKind::Update]);
        let mut sub = backend.subscribe("board:p1:d1", &filter).await.unwrap();
        let other = ChangeFilter::for_scope(&Scope::new("p1", "d2").unwrap(), &[ChangeKind::Update]);
        let mut other_sub = backend.subscribe("board:p1:d2", &other).await.unwrap();

        backend
            .update_status(&ItemId::new("T1"), BackendStatus::Review)
            .await
            .unwrap();
        let row = sub.rows.try_recv().unwrap();
        assert_eq!(row.event, ChangeKind::Update);
        assert_eq!(row.record["status"], "review");
        assert_eq!(row.record["project_id"], "p1");
        assert!(other_sub.rows.try_recv().is_err());
        assert_eq!(backend.stored_status(&ItemId::new("T1")), Some(BackendStatus::Review));
        assert_eq!(
            columns_of(&backend, &scope()).get(&Column::ReviewDic),
            Some(&vec![ItemId::new("T1")])
        );
    }

    #[tokio::test]
    async fn test_event_kind_filter_is_applied() {
        let backend = seeded();
        let filter = ChangeFilter::for_scope(&scope(), &[ChangeKind::Update]);
        let mut sub = backend.subscribe("k", &filter).await.unwrap();
        backend
            .create_item(&scope(), &ItemDraft::titled("New"))
            .await
            .unwrap();
        assert!(sub.rows.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let backend = seeded();
        backend.fail_next_writes(1);
        let err = backend
            .update_status(&ItemId::new("T1"), BackendStatus::Done)
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Network(_)));
        assert!(backend
            .update_status(&ItemId::new("T1"), BackendStatus::Done)
            .await
            .is_ok());
        assert_eq!(backend.status_calls().len(), 2);

        backend.fail_fetches(true);
        assert!(backend.fetch_board(&scope()).await.is_err());
        backend.fail_subscribe(true);
        assert!(matches!(
            backend
                .subscribe("k", &ChangeFilter::for_scope(&scope(), &[]))
                .await,
            Err(BoardError::Channel(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_item_write_fails() {
        let backend = InMemoryBackend::new();
        assert!(backend
            .update_status(&ItemId::new("nope"), BackendStatus::Done)
            .await
            .is_err());
    }
}
