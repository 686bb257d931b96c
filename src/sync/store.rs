//! Board State Store: the canonical column → items mapping.
//!
//! Single writer, synchronous mutations, no internal locking. The owning
//! session is the only caller; asynchronous results reach it as messages and
//! are applied here one at a time. Every mutation is published on a broadcast
//! channel so views can re-render without the store knowing about them.

use std::collections::{BTreeMap, HashMap};

use tokio::sync::broadcast;
use tracing::debug;

use crate::errors::BoardError;

use super::events::{BoardEvent, publish};
use super::mapper;
use super::models::{Board, BoardData, Column, ItemId, Scope, WorkItem};
use super::reconciler::{self, Placement};

pub struct BoardStore {
    board: Board,
    items: BTreeMap<ItemId, WorkItem>,
    is_fallback: bool,
    revision: u64,
    touched: HashMap<ItemId, u64>,
    events: broadcast::Sender<BoardEvent>,
}

impl BoardStore {
    pub fn new(event_buffer: usize) -> Self {
        let (events, _) = broadcast::channel(event_buffer.max(1));
        Self {
            board: Board::empty(),
            items: BTreeMap::new(),
            is_fallback: false,
            revision: 0,
            touched: HashMap::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    pub(crate) fn publish(&self, event: BoardEvent) {
        publish(&self.events, event);
    }

    pub fn board(&self) -> &Board {
        &self.board
    }

    pub fn items(&self) -> &BTreeMap<ItemId, WorkItem> {
        &self.items
    }

    pub fn item(&self, item_id: &ItemId) -> Option<&WorkItem> {
        self.items.get(item_id)
    }

    pub fn column_of(&self, item_id: &ItemId) -> Option<Column> {
        self.board.column_of(item_id)
    }

    pub fn position_of(&self, item_id: &ItemId) -> Option<(Column, usize)> {
        self.board.position_of(item_id)
    }

    pub fn is_fallback(&self) -> bool {
        self.is_fallback
    }

    /// Monotonic mutation counter.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Revision of the last mutation that touched `item_id`.
    pub fn last_touched(&self, item_id: &ItemId) -> Option<u64> {
        self.touched.get(item_id).copied()
    }

    fn touch(&mut self, item_id: &ItemId) {
        self.revision += 1;
        self.touched.insert(item_id.clone(), self.revision);
    }

    /// Move `item_id` out of `from` into `to` at `dest_index` (clamped).
    ///
    /// Fails without mutating when the item is not in `from`. On success the
    /// item's backend status becomes the mapped status of `to`. Returns the
    /// index the item landed at.
    pub fn move_item(
        &mut self,
        item_id: &ItemId,
        from: Column,
        to: Column,
        dest_index: usize,
    ) -> Result<usize, BoardError> {
        let source = self.board.column_mut(from);
        let index = source
            .iter()
            .position(|id| id == item_id)
            .ok_or_else(|| BoardError::NotInColumn {
                item_id: item_id.clone(),
                column: from,
            })?;
        let id = source.remove(index);

        let target = self.board.column_mut(to);
        let position = reconciler::local_placement(dest_index).index_in(target.len());
        target.insert(position, id);

        if let Some(item) = self.items.get_mut(item_id) {
            item.status = mapper::map_column_to_status(to);
        }
        self.touch(item_id);
        debug!(item_id = %item_id, from = %from, to = %to, position, "item moved");
        self.publish(BoardEvent::ItemMoved {
            item_id: item_id.clone(),
            from_column: from,
            to_column: to,
            position,
        });
        Ok(position)
    }

    /// Insert or replace `item` in `column`, removing any existing occurrence
    /// from every column first. Returns the landing index.
    pub fn upsert_item(&mut self, item: WorkItem, column: Column, placement: Placement) -> usize {
        let item_id = item.id.clone();
        self.detach(&item_id);

        let target = self.board.column_mut(column);
        let position = placement.index_in(target.len());
        target.insert(position, item_id.clone());
        self.items.insert(item_id.clone(), item);

        self.touch(&item_id);
        debug!(item_id = %item_id, column = %column, position, "item upserted");
        self.publish(BoardEvent::ItemUpserted {
            item_id,
            column,
            position,
        });
        position
    }

    pub fn remove_item(&mut self, item_id: &ItemId) -> Option<(Column, WorkItem)> {
        let column = self.board.column_of(item_id);
        self.detach(item_id);
        let item = self.items.remove(item_id);
        self.touched.remove(item_id);
        let (column, item) = column.zip(item)?;
        self.revision += 1;
        debug!(item_id = %item_id, column = %column, "item removed");
        self.publish(BoardEvent::ItemRemoved {
            item_id: item_id.clone(),
            column,
        });
        Some((column, item))
    }

    /// Swap a tentative id for the server's item, keeping column and position.
    ///
    /// The stored status is aligned with the column the item sits in now (it
    /// may have been moved while unacknowledged). Returns the item's column.
    pub fn rename_item(&mut self, tentative_id: &ItemId, item: WorkItem) -> Result<Column, BoardError> {
        let (column, index) =
            self.board
                .position_of(tentative_id)
                .ok_or_else(|| BoardError::ItemNotFound {
                    item_id: tentative_id.clone(),
                })?;
        let new_id = item.id.clone();
        if new_id != *tentative_id {
            self.detach(&new_id);
        }
        // detaching the server id may have shifted the tentative entry
        let index = self
            .board
            .column(column)
            .iter()
            .position(|id| id == tentative_id)
            .unwrap_or(index);
        self.board.column_mut(column)[index] = new_id.clone();

        let mut item = item;
        item.status = mapper::map_column_to_status(column);
        self.items.remove(tentative_id);
        self.items.insert(new_id.clone(), item);
        self.touched.remove(tentative_id);
        self.touch(&new_id);
        self.publish(BoardEvent::ItemAcknowledged {
            tentative_id: tentative_id.clone(),
            item_id: new_id,
        });
        Ok(column)
    }

    /// Replace everything. Pending optimism is discarded with the old board.
    pub fn replace_board(&mut self, data: BoardData, is_fallback: bool, scope: Option<Scope>) {
        self.board = data.board;
        self.items = data.items;
        self.is_fallback = is_fallback;
        self.touched.clear();
        self.revision += 1;
        self.publish(BoardEvent::BoardReplaced {
            scope,
            item_count: self.items.len(),
            is_fallback,
        });
    }

    /// Remove `item_id` from whichever columns hold it.
    fn detach(&mut self, item_id: &ItemId) {
        for column in Column::ALL {
            self.board.column_mut(column).retain(|id| id != item_id);
        }
    }
}

impl Default for BoardStore {
    fn default() -> Self {
        Self::new(super::events::DEFAULT_EVENT_BUFFER)
    }
}
