//! Realtime Change Listener: merges pushed row changes into the store.
//!
//! One subscription at a time, keyed by scope. The server filters by scope and
//! event kind; every row is re-checked here anyway so a misbehaving channel
//! cannot leak another discipline's items onto the board.

use std::sync::Arc;

use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use crate::errors::BoardError;

use super::dispatcher::MutationDispatcher;
use super::events::BoardEvent;
use super::mapper;
use super::models::{ChangeEvent, ChangeKind, ChangeOrigin, Scope, WorkItem};
use super::ports::{ChangeFeed, ChangeFilter, RawChange, SubscriptionHandle};
use super::reconciler::{self, Placement};
use super::store::BoardStore;
use super::wire::{self, NormalizedChange};

/// Row kinds requested from the channel.
pub const SUBSCRIBED_EVENTS: [ChangeKind; 3] =
    [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

/// Result of polling the active subscription without waiting.
#[derive(Debug)]
pub enum FeedPoll {
    Row(RawChange),
    Empty,
    /// The stream ended; live updates are gone until the next subscribe.
    Closed,
}

struct ActiveSubscription {
    handle: SubscriptionHandle,
    scope: Scope,
    rows: tokio::sync::mpsc::Receiver<RawChange>,
}

pub struct RealtimeListener {
    feed: Arc<dyn ChangeFeed>,
    active: Option<ActiveSubscription>,
    /// Handle of a stream that ended on its own and still needs releasing.
    ended: Option<SubscriptionHandle>,
}

impl RealtimeListener {
    pub fn new(feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            feed,
            active: None,
            ended: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.active.is_some()
    }

    pub fn scope(&self) -> Option<&Scope> {
        self.active.as_ref().map(|active| &active.scope)
    }

    /// Subscribe to `scope`, releasing any previous subscription first.
    /// Returns the channel key.
    pub async fn subscribe(&mut self, scope: &Scope) -> Result<String, BoardError> {
        self.unsubscribe().await;

        let key = scope.channel_key();
        let filter = ChangeFilter::for_scope(scope, &SUBSCRIBED_EVENTS);
        let subscription = self.feed.subscribe(&key, &filter).await?;
        info!(channel = %key, "subscribed to board changes");
        self.active = Some(ActiveSubscription {
            handle: subscription.handle,
            scope: scope.clone(),
            rows: subscription.rows,
        });
        Ok(key)
    }

    pub async fn unsubscribe(&mut self) {
        if let Some(handle) = self.ended.take() {
            self.feed.unsubscribe(handle).await;
        }
        if let Some(active) = self.active.take() {
            debug!(channel = %active.handle.key, "unsubscribing");
            self.feed.unsubscribe(active.handle).await;
        }
    }

    /// Wait for the next row. Never resolves while there is no subscription,
    /// so it can sit in a `select!` next to other sources. `None` means the
    /// stream ended.
    pub async fn next_row(&mut self) -> Option<RawChange> {
        let Some(active) = self.active.as_mut() else {
            return std::future::pending().await;
        };
        match active.rows.recv().await {
            Some(row) => Some(row),
            None => {
                self.mark_ended();
                None
            }
        }
    }

    pub fn try_next_row(&mut self) -> FeedPoll {
        let Some(active) = self.active.as_mut() else {
            return FeedPoll::Empty;
        };
        match active.rows.try_recv() {
            Ok(row) => FeedPoll::Row(row),
            Err(TryRecvError::Empty) => FeedPoll::Empty,
            Err(TryRecvError::Disconnected) => {
                self.mark_ended();
                FeedPoll::Closed
            }
        }
    }

    fn mark_ended(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(channel = %active.handle.key, "realtime stream ended");
            self.ended = Some(active.handle);
        }
    }

    /// Merge one row for the active scope. Rows arriving with no active
    /// subscription are dropped.
    pub fn apply(
        &self,
        raw: RawChange,
        store: &mut BoardStore,
        dispatcher: &mut MutationDispatcher,
    ) -> Result<Option<ChangeEvent>, BoardError> {
        match self.active.as_ref() {
            Some(active) => merge_change(&active.scope, raw, store, dispatcher),
            None => Ok(None),
        }
    }
}

/// Merge a pushed row into `store`.
///
/// Returns `Ok(None)` for rows dropped by the scope re-check or deletes of
/// items the board does not hold. Malformed rows and unknown statuses are
/// errors; the caller logs and skips them.
pub fn merge_change(
    scope: &Scope,
    raw: RawChange,
    store: &mut BoardStore,
    dispatcher: &mut MutationDispatcher,
) -> Result<Option<ChangeEvent>, BoardError> {
    if !in_scope(scope, &raw) {
        debug!(event = raw.event.as_str(), "dropping row outside active scope");
        return Ok(None);
    }

    let existing = wire::record_id(&raw.record)
        .ok()
        .and_then(|id| store.item(&id).cloned());
    match wire::normalize_change(raw, existing.as_ref())? {
        NormalizedChange::Delete { item_id } => {
            dispatcher.forget_echoes(&item_id);
            let Some((column, _)) = store.remove_item(&item_id) else {
                debug!(item_id = %item_id, "delete for item not on board");
                return Ok(None);
            };
            let change = ChangeEvent {
                item_id,
                kind: ChangeKind::Delete,
                changed_fields: Vec::new(),
                origin: ChangeOrigin::Remote,
            };
            store.publish(BoardEvent::ChangeReceived {
                change: change.clone(),
                column: Some(column),
            });
            Ok(Some(change))
        }
        NormalizedChange::Upsert { kind, mut item } => {
            let origin = dispatcher.classify_origin(&item.id, item.status);
            let current = store.position_of(&item.id);

            let (column, placement) = match (origin, current) {
                // our own write coming back: content may be fresh but the
                // local placement is already newer than the echoed status
                (ChangeOrigin::Echo, Some((column, index))) => {
                    item.status = mapper::map_column_to_status(column);
                    (column, Placement::At(index))
                }
                _ => (
                    reconciler::resolve_remote_column(item.status, current.map(|(c, _)| c)),
                    reconciler::remote_placement(),
                ),
            };

            let changed_fields = match &existing {
                Some(previous) => item.changed_fields(previous),
                None => WorkItem::all_fields(),
            };
            let change = ChangeEvent {
                item_id: item.id.clone(),
                kind,
                changed_fields,
                origin,
            };
            store.upsert_item(item, column, placement);
            debug!(item_id = %change.item_id, column = %column, origin = ?origin, "merged pushed change");
            store.publish(BoardEvent::ChangeReceived {
                change: change.clone(),
                column: Some(column),
            });
            Ok(Some(change))
        }
    }
}

/// Client-side re-check of the row's scope keys.
///
/// Inserts and updates must carry the active discipline. Deletes often carry
/// only the id; those are accepted unless they name a different scope.
fn in_scope(scope: &Scope, raw: &RawChange) -> bool {
    let (project, discipline) = wire::record_scope(&raw.record);
    if project.is_some_and(|p| p != scope.project_id()) {
        return false;
    }
    match discipline {
        Some(d) => d == scope.discipline_id(),
        None => raw.event == ChangeKind::Delete,
    }
}
