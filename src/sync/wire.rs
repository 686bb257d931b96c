//! Normalization at the network boundary.
//!
//! Nothing reaches the store until it has the fixed, fully populated shape:
//! board responses are unwrapped from `board` or legacy `kanban`, missing
//! columns become empty lists, and pushed rows are merged over the item the
//! store already holds so partial updates keep the fields they omit.

use serde_json::Value;

use crate::errors::BoardError;

use super::models::{BoardData, ChangeKind, Column, ItemId, WorkItem};
use super::ports::{BoardLike, RawChange};
use super::reconciler::assemble_board;

const WRAPPER_KEYS: [&str; 2] = ["board", "kanban"];

/// Turn a raw board response into `BoardData`.
///
/// Unknown column keys fail with a mapping error rather than being guessed at.
pub fn normalize_board_response(response: BoardLike) -> Result<BoardData, BoardError> {
    let Value::Object(mut envelope) = response else {
        return Err(BoardError::MalformedPayload(
            "board response is not an object".into(),
        ));
    };
    let inner = WRAPPER_KEYS
        .iter()
        .find_map(|key| envelope.remove(*key))
        .ok_or_else(|| {
            BoardError::MalformedPayload("board response has neither 'board' nor 'kanban'".into())
        })?;
    let columns = match inner {
        Value::Object(columns) => columns,
        Value::Null => serde_json::Map::new(),
        other => {
            return Err(BoardError::MalformedPayload(format!(
                "expected column map, got {}",
                type_name(&other)
            )));
        }
    };

    let mut parsed = Vec::with_capacity(columns.len());
    for (name, entries) in columns {
        let column: Column = name.parse()?;
        let items = match entries {
            Value::Null => Vec::new(),
            Value::Array(entries) => entries
                .into_iter()
                .map(|entry| {
                    serde_json::from_value::<WorkItem>(entry).map_err(|e| {
                        BoardError::MalformedPayload(format!("item in column {}: {}", column, e))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            other => {
                return Err(BoardError::MalformedPayload(format!(
                    "column {} holds {}, expected a list",
                    column,
                    type_name(&other)
                )));
            }
        };
        parsed.push((column, items));
    }
    Ok(assemble_board(parsed))
}

/// The item-level content of one pushed row.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizedChange {
    Upsert { kind: ChangeKind, item: WorkItem },
    Delete { item_id: ItemId },
}

/// Scope keys carried by a row, as text.
pub fn record_scope(record: &Value) -> (Option<String>, Option<String>) {
    (
        id_text(record.get("project_id")),
        id_text(record.get("discipline_id")),
    )
}

/// The row's id without decoding the rest of it.
pub fn record_id(record: &Value) -> Result<ItemId, BoardError> {
    id_text(record.get("id"))
        .map(ItemId::new)
        .ok_or_else(|| BoardError::MalformedPayload("row has no id".into()))
}

/// Decode a pushed row, overlaying its fields on `existing` when the store
/// already holds the item.
pub fn normalize_change(
    raw: RawChange,
    existing: Option<&WorkItem>,
) -> Result<NormalizedChange, BoardError> {
    let item_id = record_id(&raw.record)?;
    if raw.event == ChangeKind::Delete {
        return Ok(NormalizedChange::Delete { item_id });
    }

    let Value::Object(record) = raw.record else {
        return Err(BoardError::MalformedPayload("row record is not an object".into()));
    };
    if let Some(status) = record.get("status").and_then(Value::as_str) {
        // surface unknown statuses as mapping errors, not decode noise
        status.parse::<super::models::BackendStatus>()?;
    }

    let mut merged = match existing {
        Some(item) => match serde_json::to_value(item) {
            Ok(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        },
        None => serde_json::Map::new(),
    };
    for (key, value) in record {
        merged.insert(key, value);
    }

    let item: WorkItem = serde_json::from_value(Value::Object(merged))
        .map_err(|e| BoardError::MalformedPayload(format!("row {}: {}", item_id, e)))?;
    Ok(NormalizedChange::Upsert {
        kind: raw.event,
        item,
    })
}

/// Parse one line of the NDJSON realtime stream. Blank lines and `:` keepalive
/// comments yield `None`.
pub fn parse_feed_line(line: &str) -> Result<Option<RawChange>, BoardError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }
    serde_json::from_str(line)
        .map(Some)
        .map_err(|e| BoardError::MalformedPayload(format!("feed line: {}", e)))
}

fn id_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::MappingKind;
    use crate::sync::models::BackendStatus;
    use serde_json::json;

    fn row(id: &str, status: &str) -> Value {
        json!({
            "id": id,
            "title": format!("Item {}", id),
            "status": status,
            "discipline_id": "d1",
            "project_id": "p1",
        })
    }

    #[test]
    fn test_board_wrapper_is_accepted() {
        let data = normalize_board_response(json!({
            "board": { "todo": [row("T1", "todo")], "done": [row("T2", "done")] }
        }))
        .unwrap();
        assert_eq!(data.board.column(Column::Todo), &[ItemId::new("T1")]);
        assert_eq!(data.board.column(Column::Done), &[ItemId::new("T2")]);
        assert_eq!(data.items.len(), 2);
    }

    #[test]
    fn test_legacy_kanban_wrapper_is_accepted() {
        let data = normalize_board_response(json!({
            "kanban": { "review_dcc": [row("R1", "review")] }
        }))
        .unwrap();
        assert_eq!(data.board.column_of(&ItemId::new("R1")), Some(Column::ReviewDcc));
    }

    #[test]
    fn test_missing_columns_are_normalized_to_empty() {
        let data = normalize_board_response(json!({ "board": { "backlog": null } })).unwrap();
        for column in Column::ALL {
            assert!(data.board.column(column).is_empty());
        }
        assert_eq!(data.board.iter().count(), Column::ALL.len());
    }

    #[test]
    fn test_unknown_column_is_a_mapping_error() {
        let err = normalize_board_response(json!({ "board": { "icebox": [] } })).unwrap_err();
        assert!(matches!(
            err,
            BoardError::Mapping {
                kind: MappingKind::Column,
                ..
            }
        ));
    }

    #[test]
    fn test_response_without_wrapper_is_malformed() {
        let err = normalize_board_response(json!({ "todo": [] })).unwrap_err();
        assert!(matches!(err, BoardError::MalformedPayload(_)));
        let err = normalize_board_response(json!([1, 2])).unwrap_err();
        assert!(matches!(err, BoardError::MalformedPayload(_)));
    }

    #[test]
    fn test_partial_update_keeps_existing_fields() {
        let existing: WorkItem = serde_json::from_value(json!({
            "id": "T1",
            "title": "Survey site",
            "priority": "high",
            "status": "todo",
            "discipline_id": "d1",
            "tags": ["civil"],
        }))
        .unwrap();
        let raw = RawChange {
            event: ChangeKind::Update,
            record: json!({ "id": "T1", "status": "review", "discipline_id": "d1" }),
        };
        let NormalizedChange::Upsert { item, .. } = normalize_change(raw, Some(&existing)).unwrap()
        else {
            panic!("Expected Upsert");
        };
        assert_eq!(item.status, BackendStatus::Review);
        assert_eq!(item.title, "Survey site");
        assert!(item.tags.contains("civil"));
    }

    #[test]
    fn test_delete_row_needs_only_an_id() {
        let raw = RawChange {
            event: ChangeKind::Delete,
            record: json!({ "id": 12 }),
        };
        assert_eq!(
            normalize_change(raw, None).unwrap(),
            NormalizedChange::Delete {
                item_id: ItemId::new("12")
            }
        );
    }

    #[test]
    fn test_unknown_status_in_row_is_a_mapping_error() {
        let raw = RawChange {
            event: ChangeKind::Insert,
            record: row("T1", "blocked"),
        };
        assert!(matches!(
            normalize_change(raw, None),
            Err(BoardError::Mapping {
                kind: MappingKind::Status,
                ..
            })
        ));
    }

    #[test]
    fn test_row_without_id_or_status_is_malformed() {
        let raw = RawChange {
            event: ChangeKind::Update,
            record: json!({ "status": "todo" }),
        };
        assert!(matches!(
            normalize_change(raw, None),
            Err(BoardError::MalformedPayload(_))
        ));
        let raw = RawChange {
            event: ChangeKind::Insert,
            record: json!({ "id": "N1", "discipline_id": "d1" }),
        };
        assert!(matches!(
            normalize_change(raw, None),
            Err(BoardError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_record_scope_reads_strings_and_numbers() {
        let (project, discipline) = record_scope(&json!({ "project_id": 4, "discipline_id": "d1" }));
        assert_eq!(project.as_deref(), Some("4"));
        assert_eq!(discipline.as_deref(), Some("d1"));
        assert_eq!(record_scope(&json!({})), (None, None));
    }

    #[test]
    fn test_parse_feed_line() {
        assert_eq!(parse_feed_line("").unwrap(), None);
        assert_eq!(parse_feed_line(": keepalive").unwrap(), None);
        let parsed = parse_feed_line(r#"{"event":"INSERT","record":{"id":"N1"}}"#)
            .unwrap()
            .unwrap();
        assert_eq!(parsed.event, ChangeKind::Insert);
        assert!(parse_feed_line("{truncated").is_err());
    }
}
