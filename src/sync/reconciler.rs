//! Merge rules applied when local edits, persistence results and pushed
//! changes disagree about where an item lives.
//!
//! There is no timestamp or version arbitration: the last mutation applied to
//! the store wins, whatever its source. That is correct when a pushed change is
//! the echo of the user's own move. It is not a correct arbiter between two
//! users editing the same item at once; the later arrival simply overwrites.

use std::collections::{BTreeMap, VecDeque};

use tracing::warn;

use super::mapper;
use super::models::{BackendStatus, Board, BoardData, ChangeOrigin, Column, ItemId, WorkItem};

/// Where an item lands inside its target column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Newest-first; used for externally driven changes.
    Front,
    /// Explicit index, clamped to the column length; used for local moves.
    At(usize),
}

impl Placement {
    pub fn index_in(&self, len: usize) -> usize {
        match self {
            Self::Front => 0,
            Self::At(index) => (*index).min(len),
        }
    }
}

pub fn local_placement(dest_index: usize) -> Placement {
    Placement::At(dest_index)
}

pub fn remote_placement() -> Placement {
    Placement::Front
}

/// Column a pushed status should land in, given where the item sits now.
pub fn resolve_remote_column(status: BackendStatus, current: Option<Column>) -> Column {
    mapper::default_column_for_status(status, current)
}

/// A status write of ours whose echo has not come back on the feed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AwaitedEcho {
    pub seq: u64,
    pub status: BackendStatus,
}

/// A pushed status is an echo when it matches a write this session issued and
/// has not seen echoed yet.
///
/// Rows arrive in server order, so a match also retires every older entry. A
/// row matching nothing is someone else's change landing after our writes; it
/// retires all of them, and our later echoes merge as ordinary remote rows.
pub fn classify_origin(status: BackendStatus, awaiting: &mut VecDeque<AwaitedEcho>) -> ChangeOrigin {
    match awaiting.iter().position(|echo| echo.status == status) {
        Some(index) => {
            awaiting.drain(..=index);
            ChangeOrigin::Echo
        }
        None => {
            awaiting.clear();
            ChangeOrigin::Remote
        }
    }
}

/// A failed write may only be reverted if nothing touched the item after it was issued.
pub fn should_revert(touched_at_issue: u64, touched_now: Option<u64>) -> bool {
    touched_now == Some(touched_at_issue)
}

/// Build a fully populated board from per-column item lists.
///
/// An id listed more than once keeps its first occurrence in board order, so a
/// malformed response can never put one item in two columns.
pub fn assemble_board<I>(columns: I) -> BoardData
where
    I: IntoIterator<Item = (Column, Vec<WorkItem>)>,
{
    let mut grouped: BTreeMap<Column, Vec<WorkItem>> = BTreeMap::new();
    for (column, items) in columns {
        grouped.entry(column).or_default().extend(items);
    }

    let mut board = Board::empty();
    let mut items: BTreeMap<ItemId, WorkItem> = BTreeMap::new();
    for (column, column_items) in grouped {
        for item in column_items {
            if items.contains_key(&item.id) {
                warn!(item_id = %item.id, column = %column, "dropping duplicate board entry");
                continue;
            }
            board.column_mut(column).push(item.id.clone());
            items.insert(item.id.clone(), item);
        }
    }
    BoardData { board, items }
}
