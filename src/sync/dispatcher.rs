//! Mutation Dispatcher: optimistic local moves plus fire-and-forget persistence.
//!
//! A move is applied to the store synchronously and the status write is
//! handed to a background writer without being awaited. The writer starts
//! requests strictly in issue order but lets them complete concurrently: writes
//! are not serialized per item, and each carries the target status at call
//! time. Outcomes come back over an mpsc channel and are applied by the owning
//! session, which keeps the store single-writer.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::BoardError;

use super::events::BoardEvent;
use super::mapper;
use super::models::{BackendStatus, ChangeOrigin, Column, ItemDraft, ItemId, Scope, WorkItem};
use super::ports::BoardApi;
use super::reconciler::{self, AwaitedEcho, Placement};
use super::store::BoardStore;

/// Most recent tickets kept for inspection.
const ISSUED_LOG_LIMIT: usize = 256;

/// Unechoed writes remembered per item; older ones are forgotten first.
const ECHO_WINDOW: usize = 16;

/// What to do with an optimistic move whose write failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep the optimistic placement and surface a warning.
    #[default]
    Retain,
    /// Move the item back, unless something else touched it since.
    Revert,
}

impl std::fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Retain => write!(f, "retain"),
            Self::Revert => write!(f, "revert"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = BoardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "retain" => Ok(Self::Retain),
            "revert" => Ok(Self::Revert),
            _ => Err(BoardError::Validation(format!(
                "Invalid failure policy '{}'. Valid values: retain, revert",
                s
            ))),
        }
    }
}

/// Whether a status write went to the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    Sent,
    /// The item has no server id yet; its status is reconciled on acknowledgment.
    Deferred,
    /// The placeholder board is showing; nothing is persisted.
    LocalOnly,
}

/// Record of one status write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteTicket {
    pub seq: u64,
    pub generation: u64,
    pub item_id: ItemId,
    pub status: BackendStatus,
    pub delivery: Delivery,
}

impl WriteTicket {
    pub fn is_sent(&self) -> bool {
        self.delivery == Delivery::Sent
    }
}

/// Keyboard-driven moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
}

/// Completed persistence request, delivered back to the owning session.
#[derive(Debug)]
pub enum WriteOutcome {
    Status {
        ticket: WriteTicket,
        result: Result<(), BoardError>,
    },
    Create {
        generation: u64,
        tentative_id: ItemId,
        result: Result<WorkItem, BoardError>,
    },
}

/// Where a move started, for the revert policy.
#[derive(Debug, Clone)]
struct PendingMove {
    origin: (Column, usize),
    touched: u64,
}

pub struct MutationDispatcher {
    api: Arc<dyn BoardApi>,
    outcomes: mpsc::UnboundedSender<WriteOutcome>,
    policy: FailurePolicy,
    generation: u64,
    next_seq: u64,
    issued: VecDeque<WriteTicket>,
    pending: BTreeMap<u64, PendingMove>,
    awaiting_echo: HashMap<ItemId, VecDeque<AwaitedEcho>>,
    track_echoes: bool,
    failed: BTreeMap<ItemId, WriteTicket>,
    writer: Option<mpsc::UnboundedSender<WriteTicket>>,
}

impl MutationDispatcher {
    pub fn new(
        api: Arc<dyn BoardApi>,
        outcomes: mpsc::UnboundedSender<WriteOutcome>,
        policy: FailurePolicy,
    ) -> Self {
        Self {
            api,
            outcomes,
            policy,
            generation: 0,
            next_seq: 0,
            issued: VecDeque::new(),
            pending: BTreeMap::new(),
            awaiting_echo: HashMap::new(),
            track_echoes: true,
            failed: BTreeMap::new(),
            writer: None,
        }
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Start a new generation. Outcomes of writes issued before are ignored.
    pub fn begin_generation(&mut self, generation: u64) {
        self.generation = generation;
        self.pending.clear();
        self.awaiting_echo.clear();
        self.failed.clear();
    }

    /// Only remember writes for echo matching while a realtime feed is
    /// delivering rows. Turning it off forgets everything pending.
    pub fn set_echo_tracking(&mut self, enabled: bool) {
        self.track_echoes = enabled;
        if !enabled {
            self.awaiting_echo.clear();
        }
    }

    /// Writes of `item_id` still waiting for their echo.
    pub fn awaiting_echo(&self, item_id: &ItemId) -> usize {
        self.awaiting_echo.get(item_id).map_or(0, VecDeque::len)
    }

    /// Drop pending echoes for an item that left the board.
    pub fn forget_echoes(&mut self, item_id: &ItemId) {
        self.awaiting_echo.remove(item_id);
    }

    /// Tickets issued so far, oldest first.
    pub fn issued(&self) -> impl Iterator<Item = &WriteTicket> {
        self.issued.iter()
    }

    /// Writes issued but not yet settled in the current generation.
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Items whose latest write failed and has not been retried.
    pub fn failed_items(&self) -> impl Iterator<Item = &ItemId> {
        self.failed.keys()
    }

    /// Apply a move locally, then fire the status write.
    pub fn request_move(
        &mut self,
        store: &mut BoardStore,
        item_id: &ItemId,
        from: Column,
        to: Column,
        dest_index: usize,
    ) -> Result<WriteTicket, BoardError> {
        let origin = store
            .position_of(item_id)
            .filter(|(column, _)| *column == from)
            .ok_or_else(|| BoardError::NotInColumn {
                item_id: item_id.clone(),
                column: from,
            })?;

        store.move_item(item_id, from, to, dest_index)?;
        let status = mapper::map_column_to_status(to);
        let ticket = self.issue_status_write(store, item_id.clone(), status);
        if ticket.is_sent() {
            self.pending.insert(
                ticket.seq,
                PendingMove {
                    origin,
                    touched: store.last_touched(item_id).unwrap_or_default(),
                },
            );
        }
        Ok(ticket)
    }

    /// Keyboard move: left/right to the neighbouring column at the same index,
    /// up/down one slot within the column. Funnels through `request_move`.
    pub fn move_adjacent(
        &mut self,
        store: &mut BoardStore,
        item_id: &ItemId,
        direction: Direction,
    ) -> Result<WriteTicket, BoardError> {
        let (column, index) = store
            .position_of(item_id)
            .ok_or_else(|| BoardError::ItemNotFound {
                item_id: item_id.clone(),
            })?;
        let (to, dest_index) = match direction {
            Direction::Left => (column.neighbor(-1), index),
            Direction::Right => (column.neighbor(1), index),
            Direction::Up => (index.checked_sub(1).map(|_| column), index.saturating_sub(1)),
            Direction::Down => {
                let last = store.board().column(column).len().saturating_sub(1);
                ((index < last).then_some(column), index + 1)
            }
        };
        let to = to.ok_or_else(|| {
            BoardError::Validation(format!(
                "cannot move {} {:?} from {} position {}",
                item_id, direction, column, index
            ))
        })?;
        self.request_move(store, item_id, column, to, dest_index)
    }

    /// Insert a tentative item at the front of the entry column and fire the create.
    pub fn create_item(&mut self, store: &mut BoardStore, scope: &Scope, draft: ItemDraft) -> ItemId {
        let tentative_id = ItemId::tentative();
        let item = WorkItem::from_draft(tentative_id.clone(), &draft, scope.discipline_id());
        store.upsert_item(item, mapper::ENTRY_COLUMN, Placement::Front);

        let api = Arc::clone(&self.api);
        let tx = self.outcomes.clone();
        let generation = self.generation;
        let scope = scope.clone();
        let id = tentative_id.clone();
        tokio::spawn(async move {
            let result = api.create_item(&scope, &draft).await;
            let _ = tx.send(WriteOutcome::Create {
                generation,
                tentative_id: id,
                result,
            });
        });
        debug!(item_id = %tentative_id, "create issued");
        tentative_id
    }

    /// Re-issue writes that failed, using each item's current status.
    pub fn retry_failed_writes(&mut self, store: &mut BoardStore) -> usize {
        let failed = std::mem::take(&mut self.failed);
        let mut retried = 0;
        for item_id in failed.into_keys() {
            let Some((column, index)) = store.position_of(&item_id) else {
                continue;
            };
            let status = mapper::map_column_to_status(column);
            let ticket = self.issue_status_write(store, item_id.clone(), status);
            if ticket.is_sent() {
                self.pending.insert(
                    ticket.seq,
                    PendingMove {
                        origin: (column, index),
                        touched: store.last_touched(&item_id).unwrap_or_default(),
                    },
                );
            }
            retried += 1;
        }
        if retried > 0 {
            info!(retried, "retrying failed writes");
        }
        retried
    }

    /// Whether a pushed status echoes one of our own writes.
    pub fn classify_origin(&mut self, item_id: &ItemId, status: BackendStatus) -> ChangeOrigin {
        match self.awaiting_echo.get_mut(item_id) {
            Some(awaiting) => {
                let origin = reconciler::classify_origin(status, awaiting);
                if awaiting.is_empty() {
                    self.awaiting_echo.remove(item_id);
                }
                origin
            }
            None => ChangeOrigin::Remote,
        }
    }

    /// Apply a settled write to the store. Outcomes from older generations are dropped.
    pub fn apply_outcome(&mut self, store: &mut BoardStore, outcome: WriteOutcome) {
        match outcome {
            WriteOutcome::Status { ticket, result } => {
                if ticket.generation != self.generation {
                    debug!(seq = ticket.seq, item_id = %ticket.item_id, "ignoring write from superseded board");
                    return;
                }
                let pending = self.pending.remove(&ticket.seq);
                match result {
                    Ok(()) => {
                        debug!(seq = ticket.seq, item_id = %ticket.item_id, status = %ticket.status, "write acknowledged");
                    }
                    Err(error) => self.handle_failed_write(store, ticket, pending, error),
                }
            }
            WriteOutcome::Create {
                generation,
                tentative_id,
                result,
            } => {
                if generation != self.generation {
                    debug!(item_id = %tentative_id, "ignoring create from superseded board");
                    return;
                }
                self.handle_created(store, tentative_id, result);
            }
        }
    }

    fn handle_failed_write(
        &mut self,
        store: &mut BoardStore,
        ticket: WriteTicket,
        pending: Option<PendingMove>,
        error: BoardError,
    ) {
        warn!(item_id = %ticket.item_id, status = %ticket.status, error = %error, "status write failed");
        if let Some(awaiting) = self.awaiting_echo.get_mut(&ticket.item_id) {
            awaiting.retain(|echo| echo.seq != ticket.seq);
            if awaiting.is_empty() {
                self.awaiting_echo.remove(&ticket.item_id);
            }
        }
        store.publish(BoardEvent::WriteFailed {
            item_id: ticket.item_id.clone(),
            status: ticket.status,
            error: error.to_string(),
        });

        let reverted = self.policy == FailurePolicy::Revert
            && pending.is_some_and(|pending| self.revert(store, &ticket.item_id, pending));
        if reverted {
            return;
        }
        if error.is_retryable() {
            self.failed.insert(ticket.item_id.clone(), ticket);
        } else {
            debug!(item_id = %ticket.item_id, "write failure is not retryable");
        }
    }

    fn revert(&self, store: &mut BoardStore, item_id: &ItemId, pending: PendingMove) -> bool {
        if !reconciler::should_revert(pending.touched, store.last_touched(item_id)) {
            debug!(item_id = %item_id, "item changed since failed write; keeping current placement");
            return false;
        }
        let Some(current) = store.column_of(item_id) else {
            return false;
        };
        let (column, index) = pending.origin;
        match store.move_item(item_id, current, column, index) {
            Ok(position) => {
                info!(item_id = %item_id, column = %column, "reverted failed move");
                store.publish(BoardEvent::WriteReverted {
                    item_id: item_id.clone(),
                    column,
                    position,
                });
                true
            }
            Err(_) => false,
        }
    }

    fn handle_created(
        &mut self,
        store: &mut BoardStore,
        tentative_id: ItemId,
        result: Result<WorkItem, BoardError>,
    ) {
        match result {
            Ok(created) => {
                let server_status = created.status;
                let item_id = created.id.clone();
                match store.rename_item(&tentative_id, created) {
                    Ok(column) => {
                        info!(tentative_id = %tentative_id, item_id = %item_id, "create acknowledged");
                        // moved while unacknowledged: persist where it sits now
                        let status = mapper::map_column_to_status(column);
                        if status != server_status {
                            let ticket = self.issue_status_write(store, item_id.clone(), status);
                            if let Some(index) = store.position_of(&item_id).map(|(_, i)| i) {
                                self.pending.insert(
                                    ticket.seq,
                                    PendingMove {
                                        origin: (column, index),
                                        touched: store.last_touched(&item_id).unwrap_or_default(),
                                    },
                                );
                            }
                        }
                    }
                    Err(_) => {
                        debug!(tentative_id = %tentative_id, "acknowledged item no longer on board");
                    }
                }
            }
            Err(error) => {
                warn!(tentative_id = %tentative_id, error = %error, "create failed; dropping tentative item");
                store.remove_item(&tentative_id);
                store.publish(BoardEvent::CreateFailed {
                    tentative_id,
                    error: error.to_string(),
                });
            }
        }
    }

    fn issue_status_write(
        &mut self,
        store: &BoardStore,
        item_id: ItemId,
        status: BackendStatus,
    ) -> WriteTicket {
        self.next_seq += 1;
        let delivery = if store.is_fallback() {
            Delivery::LocalOnly
        } else if item_id.is_tentative() {
            Delivery::Deferred
        } else {
            Delivery::Sent
        };
        let ticket = WriteTicket {
            seq: self.next_seq,
            generation: self.generation,
            item_id,
            status,
            delivery,
        };
        if self.issued.len() == ISSUED_LOG_LIMIT {
            self.issued.pop_front();
        }
        self.issued.push_back(ticket.clone());

        match ticket.delivery {
            Delivery::Deferred => {
                debug!(seq = ticket.seq, item_id = %ticket.item_id, "write deferred until create is acknowledged");
                return ticket;
            }
            Delivery::LocalOnly => {
                debug!(seq = ticket.seq, item_id = %ticket.item_id, "placeholder board; write not persisted");
                return ticket;
            }
            Delivery::Sent => {}
        }

        if self.track_echoes {
            let awaiting = self.awaiting_echo.entry(ticket.item_id.clone()).or_default();
            if awaiting.len() == ECHO_WINDOW {
                awaiting.pop_front();
            }
            awaiting.push_back(AwaitedEcho {
                seq: ticket.seq,
                status,
            });
        }
        debug!(seq = ticket.seq, item_id = %ticket.item_id, status = %status, "write issued");
        self.send_to_writer(ticket.clone());
        ticket
    }

    fn send_to_writer(&mut self, ticket: WriteTicket) {
        let writer = self.writer.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(run_status_writer(
                Arc::clone(&self.api),
                rx,
                self.outcomes.clone(),
            ));
            tx
        });
        if let Err(mpsc::error::SendError(ticket)) = writer.send(ticket) {
            warn!(seq = ticket.seq, item_id = %ticket.item_id, "status writer stopped");
            self.writer = None;
            let _ = self.outcomes.send(WriteOutcome::Status {
                ticket,
                result: Err(BoardError::Channel("status writer stopped".into())),
            });
        }
    }
}

/// Start each queued write in arrival order and report completions as they
/// happen. Exits once the dispatcher is gone and every request has settled.
async fn run_status_writer(
    api: Arc<dyn BoardApi>,
    mut tickets: mpsc::UnboundedReceiver<WriteTicket>,
    outcomes: mpsc::UnboundedSender<WriteOutcome>,
) {
    let mut in_flight = FuturesUnordered::new();
    loop {
        tokio::select! {
            biased;
            ticket = tickets.recv() => match ticket {
                Some(ticket) => in_flight.push(write_status(Arc::clone(&api), ticket)),
                None => break,
            },
            Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                let _ = outcomes.send(outcome);
            }
        }
    }
    while let Some(outcome) = in_flight.next().await {
        let _ = outcomes.send(outcome);
    }
}

async fn write_status(api: Arc<dyn BoardApi>, ticket: WriteTicket) -> WriteOutcome {
    let result = api.update_status(&ticket.item_id, ticket.status).await;
    WriteOutcome::Status { ticket, result }
}
