//! Board Session: single owner of the store for one board view.
//!
//! Wires the dispatcher, listener and store together and runs the cooperative
//! loop that applies asynchronous completions. Spawned persistence tasks and the
//! realtime feed only ever send messages; every store mutation happens on the
//! task that owns the session, inside `request_move`, `process_next` or
//! `drain_pending`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::errors::BoardError;

use super::dispatcher::{Direction, FailurePolicy, MutationDispatcher, WriteOutcome, WriteTicket};
use super::events::{BoardEvent, DEFAULT_EVENT_BUFFER};
use super::fallback;
use super::listener::{FeedPoll, RealtimeListener};
use super::models::{BackendStatus, BoardSnapshot, ChangeEvent, Column, ItemDraft, ItemId, Scope};
use super::ports::{BoardApi, ChangeFeed, RawChange};
use super::store::BoardStore;
use super::wire;

/// Runtime knobs for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub on_write_failure: FailurePolicy,
    pub event_buffer: usize,
    /// Subscribe to the realtime channel on open.
    pub live_updates: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            on_write_failure: FailurePolicy::default(),
            event_buffer: DEFAULT_EVENT_BUFFER,
            live_updates: true,
        }
    }
}

/// How the board for the current scope was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded { items: usize },
    /// The fetch failed; the placeholder board is showing.
    Fallback { reason: String },
}

impl LoadOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback { .. })
    }
}

/// What one turn of the event loop did.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionActivity {
    StatusWrite {
        item_id: ItemId,
        status: BackendStatus,
        succeeded: bool,
    },
    Create {
        tentative_id: ItemId,
        succeeded: bool,
    },
    Change(ChangeEvent),
    /// A row was dropped: wrong scope, malformed, or nothing to delete.
    RowSkipped,
    LiveUpdatesLost,
}

pub struct BoardSession {
    api: Arc<dyn BoardApi>,
    store: BoardStore,
    dispatcher: MutationDispatcher,
    listener: RealtimeListener,
    outcomes: mpsc::UnboundedReceiver<WriteOutcome>,
    scope: Option<Scope>,
    generation: u64,
    config: SessionConfig,
}

impl BoardSession {
    pub fn new(api: Arc<dyn BoardApi>, feed: Arc<dyn ChangeFeed>, config: SessionConfig) -> Self {
        let (tx, outcomes) = mpsc::unbounded_channel();
        Self {
            dispatcher: MutationDispatcher::new(Arc::clone(&api), tx, config.on_write_failure),
            store: BoardStore::new(config.event_buffer),
            listener: RealtimeListener::new(feed),
            api,
            outcomes,
            scope: None,
            generation: 0,
            config,
        }
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.scope.as_ref()
    }

    pub fn store(&self) -> &BoardStore {
        &self.store
    }

    pub fn dispatcher(&self) -> &MutationDispatcher {
        &self.dispatcher
    }

    pub fn is_live(&self) -> bool {
        self.listener.is_live()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.store.subscribe()
    }

    /// Read-only copy for rendering.
    pub fn snapshot(&self) -> BoardSnapshot {
        BoardSnapshot {
            scope: self.scope.clone(),
            board: self.store.board().clone(),
            items: self.store.items().clone(),
            is_fallback: self.store.is_fallback(),
            live_updates: self.listener.is_live(),
        }
    }

    /// Switch to `scope`: release the old channel, subscribe the new one, then
    /// load the board. A failed fetch shows the placeholder board instead of
    /// failing; a failed subscribe leaves the board without live updates.
    pub async fn open(&mut self, scope: Scope) -> Result<LoadOutcome, BoardError> {
        info!(scope = %scope, "opening board");
        self.listener.unsubscribe().await;
        self.scope = Some(scope.clone());

        if self.config.live_updates {
            self.start_live_updates(&scope).await;
        }
        let outcome = self.load(&scope).await;
        self.sync_echo_tracking();
        Ok(outcome)
    }

    /// Re-fetch the board for the current scope. On failure the current board
    /// stays as it is and the error is returned.
    pub async fn refresh(&mut self) -> Result<LoadOutcome, BoardError> {
        let scope = self.require_scope()?.clone();
        let response = self.api.fetch_board(&scope).await?;
        let data = wire::normalize_board_response(response)?;
        let items = data.items.len();
        self.begin_generation();
        self.store.replace_board(data, false, Some(scope.clone()));
        info!(scope = %scope, items, "board refreshed");
        Ok(LoadOutcome::Loaded { items })
    }

    /// Recover after a fallback load or lost channel: re-subscribe if live
    /// updates are down, then refresh.
    pub async fn retry(&mut self) -> Result<LoadOutcome, BoardError> {
        let scope = self.require_scope()?.clone();
        if self.config.live_updates && !self.listener.is_live() {
            self.start_live_updates(&scope).await;
            self.sync_echo_tracking();
        }
        self.refresh().await
    }

    /// Optimistically move an item and persist its new status in the background.
    pub fn request_move(
        &mut self,
        item_id: &ItemId,
        from: Column,
        to: Column,
        dest_index: usize,
    ) -> Result<WriteTicket, BoardError> {
        self.require_scope()?;
        self.dispatcher
            .request_move(&mut self.store, item_id, from, to, dest_index)
    }

    pub fn move_adjacent(
        &mut self,
        item_id: &ItemId,
        direction: Direction,
    ) -> Result<WriteTicket, BoardError> {
        self.require_scope()?;
        self.dispatcher
            .move_adjacent(&mut self.store, item_id, direction)
    }

    /// Quick-create into the entry column. Returns the tentative id.
    pub fn create_item(&mut self, draft: ItemDraft) -> Result<ItemId, BoardError> {
        let scope = self.require_scope()?.clone();
        if self.store.is_fallback() {
            return Err(BoardError::Validation(
                "board is unavailable; retry before creating items".into(),
            ));
        }
        if draft.title.trim().is_empty() {
            return Err(BoardError::Validation("title is required".into()));
        }
        Ok(self.dispatcher.create_item(&mut self.store, &scope, draft))
    }

    pub fn retry_failed_writes(&mut self) -> usize {
        self.dispatcher.retry_failed_writes(&mut self.store)
    }

    /// Wait for the next persistence outcome or pushed row and apply it.
    /// Persistence outcomes are preferred when both are ready.
    pub async fn process_next(&mut self) -> SessionActivity {
        enum Next {
            Outcome(Option<WriteOutcome>),
            Row(Option<RawChange>),
        }

        let next = tokio::select! {
            biased;
            outcome = self.outcomes.recv() => Next::Outcome(outcome),
            row = self.listener.next_row() => Next::Row(row),
        };
        match next {
            Next::Outcome(Some(outcome)) => self.apply_outcome(outcome),
            // the dispatcher holds a sender for the session's lifetime
            Next::Outcome(None) => std::future::pending().await,
            Next::Row(Some(raw)) => self.apply_row(raw),
            Next::Row(None) => self.live_updates_lost(),
        }
    }

    /// Apply everything that is already waiting, without blocking.
    pub fn drain_pending(&mut self) -> Vec<SessionActivity> {
        let mut activity = Vec::new();
        loop {
            if let Ok(outcome) = self.outcomes.try_recv() {
                activity.push(self.apply_outcome(outcome));
                continue;
            }
            match self.listener.try_next_row() {
                FeedPoll::Row(raw) => activity.push(self.apply_row(raw)),
                FeedPoll::Closed => activity.push(self.live_updates_lost()),
                FeedPoll::Empty => break,
            }
        }
        activity
    }

    /// Release the realtime channel.
    pub async fn close(&mut self) {
        self.listener.unsubscribe().await;
        self.sync_echo_tracking();
        info!("board session closed");
    }

    fn require_scope(&self) -> Result<&Scope, BoardError> {
        self.scope
            .as_ref()
            .ok_or_else(|| BoardError::Validation("no board is open".into()))
    }

    /// Echoes can only be expected while rows are flowing.
    fn sync_echo_tracking(&mut self) {
        self.dispatcher.set_echo_tracking(self.listener.is_live());
    }

    fn begin_generation(&mut self) {
        self.generation += 1;
        self.dispatcher.begin_generation(self.generation);
    }

    async fn load(&mut self, scope: &Scope) -> LoadOutcome {
        let fetched = match self.api.fetch_board(scope).await {
            Ok(response) => wire::normalize_board_response(response),
            Err(e) => Err(e),
        };
        self.begin_generation();
        match fetched {
            Ok(data) => {
                let items = data.items.len();
                self.store.replace_board(data, false, Some(scope.clone()));
                info!(scope = %scope, items, "board loaded");
                LoadOutcome::Loaded { items }
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(scope = %scope, error = %reason, "board fetch failed; showing placeholder board");
                self.store
                    .replace_board(fallback::placeholder_board(scope), true, Some(scope.clone()));
                self.store.publish(BoardEvent::FallbackLoaded {
                    reason: reason.clone(),
                });
                LoadOutcome::Fallback { reason }
            }
        }
    }

    async fn start_live_updates(&mut self, scope: &Scope) {
        match self.listener.subscribe(scope).await {
            Ok(channel) => self.store.publish(BoardEvent::LiveUpdatesStarted { channel }),
            Err(e) => {
                warn!(scope = %scope, error = %e, "live updates unavailable");
                self.store.publish(BoardEvent::LiveUpdatesUnavailable {
                    reason: e.to_string(),
                });
            }
        }
    }

    fn apply_outcome(&mut self, outcome: WriteOutcome) -> SessionActivity {
        let activity = match &outcome {
            WriteOutcome::Status { ticket, result } => SessionActivity::StatusWrite {
                item_id: ticket.item_id.clone(),
                status: ticket.status,
                succeeded: result.is_ok(),
            },
            WriteOutcome::Create {
                tentative_id,
                result,
                ..
            } => SessionActivity::Create {
                tentative_id: tentative_id.clone(),
                succeeded: result.is_ok(),
            },
        };
        self.dispatcher.apply_outcome(&mut self.store, outcome);
        activity
    }

    fn apply_row(&mut self, raw: RawChange) -> SessionActivity {
        let event = raw.event;
        match self.listener.apply(raw, &mut self.store, &mut self.dispatcher) {
            Ok(Some(change)) => SessionActivity::Change(change),
            Ok(None) => SessionActivity::RowSkipped,
            Err(e) => {
                warn!(event = event.as_str(), error = %e, "skipping pushed row");
                SessionActivity::RowSkipped
            }
        }
    }

    fn live_updates_lost(&mut self) -> SessionActivity {
        self.sync_echo_tracking();
        self.store.publish(BoardEvent::LiveUpdatesUnavailable {
            reason: "realtime stream ended".into(),
        });
        SessionActivity::LiveUpdatesLost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::InMemoryBackend;
    use crate::sync::models::{ChangeKind, ChangeOrigin, WorkItem};
    use serde_json::json;

    fn scope() -> Scope {
        Scope::new("p1", "d1").unwrap()
    }

    fn seed(backend: &InMemoryBackend, column: Column, ids: &[&str]) {
        for id in ids {
            backend.seed(
                &scope(),
                column,
                WorkItem::from_draft(ItemId::new(*id), &ItemDraft::titled(*id), "d1"),
            );
        }
    }

    fn session_with(backend: &Arc<InMemoryBackend>, config: SessionConfig) -> BoardSession {
        BoardSession::new(backend.clone(), backend.clone(), config)
    }

    async fn open_session(backend: &Arc<InMemoryBackend>) -> BoardSession {
        let mut session = session_with(backend, SessionConfig::default());
        session.open(scope()).await.unwrap();
        session
    }

    fn ids(session: &BoardSession, column: Column) -> Vec<String> {
        session
            .snapshot()
            .board
            .column(column)
            .iter()
            .map(|id| id.to_string())
            .collect()
    }

    #[tokio::test]
    async fn test_move_applies_locally_and_persists_mapped_status() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Backlog, &["T1", "T2"]);
        let mut session = open_session(&backend).await;

        let ticket = session
            .request_move(&ItemId::new("T1"), Column::Backlog, Column::Todo, 0)
            .unwrap();
        assert_eq!(ids(&session, Column::Backlog), vec!["T2"]);
        assert_eq!(ids(&session, Column::Todo), vec!["T1"]);
        assert_eq!(ticket.status, BackendStatus::Todo);

        let activity = session.process_next().await;
        assert_eq!(
            activity,
            SessionActivity::StatusWrite {
                item_id: ItemId::new("T1"),
                status: BackendStatus::Todo,
                succeeded: true,
            }
        );
        assert_eq!(
            backend.status_calls(),
            vec![(ItemId::new("T1"), BackendStatus::Todo)]
        );
    }

    #[tokio::test]
    async fn test_remote_change_lands_at_front_of_review_column() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Todo, &["T1"]);
        seed(&backend, Column::ReviewDic, &["R1"]);
        let mut session = open_session(&backend).await;

        backend.emit(
            ChangeKind::Update,
            json!({ "id": "T1", "status": "review", "discipline_id": "d1", "project_id": "p1" }),
        );
        let SessionActivity::Change(change) = session.process_next().await else {
            panic!("Expected a merged change");
        };
        assert_eq!(change.origin, ChangeOrigin::Remote);
        assert!(ids(&session, Column::Todo).is_empty());
        assert_eq!(ids(&session, Column::ReviewDic), vec!["T1", "R1"]);
        assert_eq!(session.snapshot().board.occurrences(&ItemId::new("T1")), 1);
    }

    #[tokio::test]
    async fn test_move_from_wrong_column_reports_not_found() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Backlog, &["T9"]);
        let mut session = open_session(&backend).await;
        let before = session.snapshot().board;

        let err = session
            .request_move(&ItemId::new("T9"), Column::Todo, Column::Done, 0)
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(session.snapshot().board, before);
        assert!(session.drain_pending().is_empty());
        assert!(backend.status_calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fetch_shows_flagged_placeholder_board() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_fetches(true);
        let mut session = session_with(&backend, SessionConfig::default());
        let mut events = session.subscribe();

        let outcome = session.open(scope()).await.unwrap();
        assert!(outcome.is_fallback());
        let snapshot = session.snapshot();
        assert!(snapshot.is_fallback);
        assert!(!snapshot.board.is_empty());

        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert!(names.contains(&"fallback_loaded"));
    }

    #[tokio::test]
    async fn test_placeholder_board_is_never_persisted() {
        let backend = Arc::new(InMemoryBackend::new());
        backend.fail_fetches(true);
        let mut session = session_with(&backend, SessionConfig::default());
        session.open(scope()).await.unwrap();

        let demo = ItemId::new("demo-1");
        session
            .request_move(&demo, Column::Backlog, Column::Todo, 0)
            .unwrap();
        session.move_adjacent(&demo, Direction::Right).unwrap();
        assert_eq!(session.store().column_of(&demo), Some(Column::InProgress));

        let err = session
            .create_item(ItemDraft::titled("Not on the placeholder"))
            .unwrap_err();
        assert!(matches!(err, BoardError::Validation(_)));

        tokio::task::yield_now().await;
        assert!(session.drain_pending().is_empty());
        assert!(backend.status_calls().is_empty());
    }

    #[tokio::test]
    async fn test_no_echo_tracking_without_live_updates() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Todo, &["T1"]);
        let mut session = session_with(
            &backend,
            SessionConfig {
                live_updates: false,
                ..SessionConfig::default()
            },
        );
        session.open(scope()).await.unwrap();

        let t1 = ItemId::new("T1");
        session
            .request_move(&t1, Column::Todo, Column::Done, 0)
            .unwrap();
        assert_eq!(session.dispatcher().awaiting_echo(&t1), 0);
        session.process_next().await;
        assert_eq!(backend.stored_status(&t1), Some(BackendStatus::Done));
    }

    #[tokio::test]
    async fn test_retry_replaces_fallback_board() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Todo, &["T1"]);
        backend.fail_fetches(true);
        let mut session = open_session(&backend).await;
        assert!(session.snapshot().is_fallback);

        assert!(session.retry().await.is_err());
        assert!(session.snapshot().is_fallback);

        backend.fail_fetches(false);
        assert_eq!(session.retry().await.unwrap(), LoadOutcome::Loaded { items: 1 });
        let snapshot = session.snapshot();
        assert!(!snapshot.is_fallback);
        assert_eq!(ids(&session, Column::Todo), vec!["T1"]);
    }

    #[tokio::test]
    async fn test_two_rapid_moves_issue_two_writes_in_call_order() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Todo, &["T1"]);
        let mut session = open_session(&backend).await;
        backend.pause_writes();

        let t1 = ItemId::new("T1");
        session
            .request_move(&t1, Column::Todo, Column::InProgress, 0)
            .unwrap();
        session
            .request_move(&t1, Column::InProgress, Column::ReviewDcc, 0)
            .unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(
            backend.status_calls(),
            vec![
                (t1.clone(), BackendStatus::InProgress),
                (t1.clone(), BackendStatus::Review)
            ]
        );

        backend.resume_writes();
        // two write outcomes plus two echoed rows
        for _ in 0..4 {
            session.process_next().await;
        }
        assert_eq!(ids(&session, Column::ReviewDcc), vec!["T1"]);
        assert_eq!(session.snapshot().board.occurrences(&t1), 1);
        assert_eq!(backend.status_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_operations_before_open_are_rejected() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut session = session_with(&backend, SessionConfig::default());
        assert!(matches!(
            session.request_move(&ItemId::new("T1"), Column::Todo, Column::Done, 0),
            Err(BoardError::Validation(_))
        ));
        assert!(matches!(
            session.create_item(ItemDraft::titled("x")),
            Err(BoardError::Validation(_))
        ));
        assert!(matches!(session.refresh().await, Err(BoardError::Validation(_))));
    }

    #[tokio::test]
    async fn test_subscribe_failure_degrades_to_manual_refresh() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Todo, &["T1"]);
        backend.fail_subscribe(true);
        let mut session = session_with(&backend, SessionConfig::default());
        let mut events = session.subscribe();

        let outcome = session.open(scope()).await.unwrap();
        assert_eq!(outcome, LoadOutcome::Loaded { items: 1 });
        assert!(!session.snapshot().live_updates);
        assert_eq!(events.try_recv().unwrap().name(), "live_updates_unavailable");

        backend.fail_subscribe(false);
        session.retry().await.unwrap();
        assert!(session.is_live());
    }

    #[tokio::test]
    async fn test_switching_scope_drops_old_channel_and_board() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Todo, &["T1"]);
        let other = Scope::new("p1", "d2").unwrap();
        backend.seed(
            &other,
            Column::Done,
            WorkItem::from_draft(ItemId::new("X1"), &ItemDraft::titled("x"), "d2"),
        );
        let mut session = open_session(&backend).await;
        session.open(other.clone()).await.unwrap();

        assert_eq!(backend.subscriber_count(), 1);
        assert_eq!(session.scope(), Some(&other));
        assert!(session.store().item(&ItemId::new("T1")).is_none());

        // a row for the old discipline never reaches the new board
        backend.emit_unfiltered(
            ChangeKind::Insert,
            json!({ "id": "T5", "status": "todo", "discipline_id": "d1", "project_id": "p1" }),
        );
        assert_eq!(session.drain_pending(), vec![SessionActivity::RowSkipped]);
        assert!(session.store().item(&ItemId::new("T5")).is_none());
    }

    #[tokio::test]
    async fn test_in_flight_write_from_previous_scope_is_ignored() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Todo, &["T1"]);
        let mut session = session_with(
            &backend,
            SessionConfig {
                on_write_failure: FailurePolicy::Revert,
                live_updates: false,
                ..SessionConfig::default()
            },
        );
        session.open(scope()).await.unwrap();
        backend.fail_next_writes(1);
        session
            .request_move(&ItemId::new("T1"), Column::Todo, Column::Done, 0)
            .unwrap();
        session.refresh().await.unwrap();

        session.process_next().await;
        // the refreshed board is authoritative; the stale failure changes nothing
        assert_eq!(ids(&session, Column::Todo), vec!["T1"]);
        assert_eq!(session.dispatcher().failed_items().count(), 0);
    }

    #[tokio::test]
    async fn test_quick_create_round_trip() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut session = open_session(&backend).await;
        let mut events = session.subscribe();

        let tentative = session.create_item(ItemDraft::titled("Order rebar")).unwrap();
        assert_eq!(ids(&session, Column::Backlog), vec![tentative.to_string()]);
        assert!(matches!(
            session.create_item(ItemDraft::titled("  ")),
            Err(BoardError::Validation(_))
        ));

        let activity = session.process_next().await;
        assert_eq!(
            activity,
            SessionActivity::Create {
                tentative_id: tentative.clone(),
                succeeded: true
            }
        );
        // the INSERT echo for the created row merges into the same entry
        session.process_next().await;
        let backlog = ids(&session, Column::Backlog);
        assert_eq!(backlog.len(), 1);
        assert!(backlog[0].starts_with("srv-"));
        let names: Vec<&str> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| e.name())
            .collect();
        assert!(names.contains(&"item_acknowledged"));
    }

    #[tokio::test]
    async fn test_lost_stream_is_reported() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut session = open_session(&backend).await;
        assert!(session.is_live());
        backend.disconnect_all();
        assert_eq!(session.process_next().await, SessionActivity::LiveUpdatesLost);
        assert!(!session.snapshot().live_updates);
    }

    #[tokio::test]
    async fn test_move_adjacent_through_session() {
        let backend = Arc::new(InMemoryBackend::new());
        seed(&backend, Column::Backlog, &["T1"]);
        let mut session = open_session(&backend).await;
        let ticket = session
            .move_adjacent(&ItemId::new("T1"), Direction::Right)
            .unwrap();
        assert_eq!(ticket.status, BackendStatus::Todo);
        assert!(matches!(
            session.move_adjacent(&ItemId::new("T1"), Direction::Down),
            Err(BoardError::Validation(_))
        ));
    }
}
