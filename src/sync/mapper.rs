//! Column/status translation.
//!
//! Several columns collapse onto one backend status, so the reverse direction
//! is a policy rather than a function: keep the item's previous column when it
//! already matches, otherwise use the fixed entry column for that status.

use crate::errors::BoardError;

use super::models::{BackendStatus, Column};

/// Column new items are quick-created into.
pub const ENTRY_COLUMN: Column = Column::Backlog;

pub fn map_column_to_status(column: Column) -> BackendStatus {
    match column {
        Column::Backlog | Column::Todo => BackendStatus::Todo,
        Column::InProgress => BackendStatus::InProgress,
        Column::ReviewDic | Column::ReviewIdc | Column::ReviewDcc => BackendStatus::Review,
        Column::Done => BackendStatus::Done,
    }
}

/// String-keyed variant for callers holding raw column names.
pub fn map_column_name_to_status(column: &str) -> Result<BackendStatus, BoardError> {
    column.parse().map(map_column_to_status)
}

/// Fixed default column per status, used when there is no previous column to keep.
pub fn entry_column_for_status(status: BackendStatus) -> Column {
    match status {
        BackendStatus::Todo => Column::Todo,
        BackendStatus::InProgress => Column::InProgress,
        BackendStatus::Review => Column::ReviewDic,
        BackendStatus::Done => Column::Done,
    }
}

pub fn default_column_for_status(status: BackendStatus, previous: Option<Column>) -> Column {
    match previous {
        Some(column) if map_column_to_status(column) == status => column,
        _ => entry_column_for_status(status),
    }
}

pub fn default_column_for_status_name(
    status: &str,
    previous: Option<Column>,
) -> Result<Column, BoardError> {
    status
        .parse()
        .map(|status| default_column_for_status(status, previous))
}

/// All columns that persist as `status`, in board order.
pub fn columns_for_status(status: BackendStatus) -> Vec<Column> {
    Column::ALL
        .into_iter()
        .filter(|c| map_column_to_status(*c) == status)
        .collect()
}
