//! Typed error hierarchy for the board sync engine.
//!
//! `BoardError` is the single library-level error. Variants map onto the
//! failure classes the engine distinguishes:
//! - `Validation` / `ItemNotFound` / `NotInColumn`: synchronous, fail-fast,
//!   the board is never mutated
//! - `Network` / `Timeout`: persistence or fetch failures
//! - `Mapping`: unknown column, status or priority names
//! - `Channel`: realtime subscription failures
//! - `MalformedPayload`: a response or push row that cannot be decoded

use thiserror::Error;

use crate::sync::models::{Column, ItemId};

/// Which vocabulary a `Mapping` error was raised against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingKind {
    Column,
    Status,
    Priority,
}

impl MappingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Column => "column",
            Self::Status => "status",
            Self::Priority => "priority",
        }
    }
}

impl std::fmt::Display for MappingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from the board store, dispatcher, listener and their collaborators.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BoardError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Item {item_id} not found")]
    ItemNotFound { item_id: ItemId },

    #[error("Item {item_id} not found in column {column}")]
    NotInColumn { item_id: ItemId, column: Column },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Unknown {kind} '{value}'")]
    Mapping { kind: MappingKind, value: String },

    #[error("Realtime channel error: {0}")]
    Channel(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

impl BoardError {
    pub(crate) fn unknown(kind: MappingKind, value: impl Into<String>) -> Self {
        Self::Mapping {
            kind,
            value: value.into(),
        }
    }

    /// True for both "item absent" variants.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ItemNotFound { .. } | Self::NotInColumn { .. })
    }

    /// Network and timeout failures are worth retrying; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_in_column_carries_item_and_column() {
        let err = BoardError::NotInColumn {
            item_id: ItemId::new("T9"),
            column: Column::Todo,
        };
        match &err {
            BoardError::NotInColumn { item_id, column } => {
                assert_eq!(item_id.as_str(), "T9");
                assert_eq!(*column, Column::Todo);
            }
            _ => panic!("Expected NotInColumn"),
        }
        assert_eq!(err.to_string(), "Item T9 not found in column todo");
        assert!(err.is_not_found());
    }

    #[test]
    fn test_mapping_error_names_vocabulary() {
        let err = BoardError::unknown(MappingKind::Status, "blocked");
        assert_eq!(err.to_string(), "Unknown status 'blocked'");
        assert!(!err.is_not_found());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_retryable_variants() {
        assert!(BoardError::Network("connection refused".into()).is_retryable());
        assert!(BoardError::Timeout("fetch board".into()).is_retryable());
        assert!(!BoardError::Channel("closed".into()).is_retryable());
        assert!(!BoardError::Validation("missing scope".into()).is_retryable());
    }

    #[test]
    fn test_board_error_implements_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&BoardError::Channel("x".into()));
    }
}
