//! Placeholder board shown when the initial fetch fails.
//!
//! The items are clearly marked as demo data and never persisted: every id
//! starts with `demo-`, and the session flags the board as a fallback so the
//! UI can say so.

use chrono::{Duration, Utc};

use super::mapper;
use super::models::{BoardData, Column, ItemId, Priority, Scope, WorkItem};
use super::reconciler::assemble_board;

pub const DEMO_PREFIX: &str = "demo-";

const DEMO_ITEMS: [(Column, &str, Priority, u8); 7] = [
    (Column::Backlog, "Collect site survey drawings", Priority::Low, 0),
    (Column::Todo, "Draft structural load calculations", Priority::Medium, 0),
    (Column::InProgress, "Coordinate MEP penetrations", Priority::High, 40),
    (Column::ReviewDic, "Discipline check: foundation plan", Priority::Medium, 80),
    (Column::ReviewIdc, "Interdisciplinary check: roof framing", Priority::Medium, 90),
    (Column::ReviewDcc, "Document control: issue for tender", Priority::Critical, 95),
    (Column::Done, "Kick-off meeting minutes", Priority::Low, 100),
];

/// Build the placeholder board for `scope`, one demo item per column.
pub fn placeholder_board(scope: &Scope) -> BoardData {
    let now = Utc::now();
    assemble_board(DEMO_ITEMS.iter().enumerate().map(
        |(n, (column, title, priority, progress))| {
            let item = WorkItem {
                id: ItemId::new(format!("{DEMO_PREFIX}{}", n + 1)),
                title: title.to_string(),
                description: String::new(),
                priority: *priority,
                assignee_id: None,
                due_date: Some((now + Duration::days(7 * (n as i64 + 1))).date_naive()),
                tags: ["demo".to_string()].into_iter().collect(),
                status: mapper::map_column_to_status(*column),
                progress: *progress,
                discipline_id: scope.discipline_id().to_string(),
                created_at: now,
            };
            (*column, vec![item])
        },
    ))
}

pub fn is_demo_item(item_id: &ItemId) -> bool {
    item_id.as_str().starts_with(DEMO_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_board_fills_every_column() {
        let scope = Scope::new("p1", "d1").unwrap();
        let data = placeholder_board(&scope);
        for column in Column::ALL {
            assert_eq!(data.board.column(column).len(), 1, "column {}", column);
        }
        assert!(data.items.keys().all(is_demo_item));
    }

    #[test]
    fn test_placeholder_statuses_match_columns() {
        let scope = Scope::new("p1", "d7").unwrap();
        let data = placeholder_board(&scope);
        for (column, ids) in data.board.iter() {
            for id in ids {
                let item = &data.items[id];
                assert_eq!(item.status, mapper::map_column_to_status(column));
                assert_eq!(item.discipline_id, "d7");
            }
        }
    }
}
