use std::sync::Arc;

use proptest::prelude::*;
use serde_json::json;
use tokio::sync::mpsc;

use flowboard::sync::dispatcher::{FailurePolicy, MutationDispatcher};
use flowboard::sync::listener::merge_change;
use flowboard::sync::mapper::map_column_to_status;
use flowboard::sync::memory::InMemoryBackend;
use flowboard::sync::models::ChangeKind;
use flowboard::sync::ports::RawChange;
use flowboard::sync::store::BoardStore;
use flowboard::sync::{BackendStatus, Column, ItemId, Scope};

const IDS: [&str; 6] = ["a", "b", "c", "d", "e", "f"];

#[derive(Debug, Clone)]
enum Op {
    /// Local drag of the item at `pick` (modulo board size) to `to`.
    Move { pick: usize, to: Column, index: usize },
    Remote { id: usize, kind: ChangeKind, status: BackendStatus },
}

fn arb_column() -> impl Strategy<Value = Column> {
    prop::sample::select(Column::ALL.to_vec())
}

fn arb_status() -> impl Strategy<Value = BackendStatus> {
    prop::sample::select(BackendStatus::ALL.to_vec())
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (any::<usize>(), arb_column(), 0usize..8)
            .prop_map(|(pick, to, index)| Op::Move { pick, to, index }),
        (
            0..IDS.len(),
            prop::sample::select(vec![ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete]),
            arb_status()
        )
            .prop_map(|(id, kind, status)| Op::Remote { id, kind, status }),
    ]
}

fn scope() -> Scope {
    Scope::new("p1", "d1").unwrap()
}

fn row(id: &str, kind: ChangeKind, status: BackendStatus) -> RawChange {
    RawChange {
        event: kind,
        record: json!({
            "id": id,
            "title": format!("Item {}", id),
            "status": status.as_str(),
            "project_id": "p1",
            "discipline_id": "d1",
        }),
    }
}

fn apply(op: &Op, store: &mut BoardStore, dispatcher: &mut MutationDispatcher) {
    match op {
        Op::Move { pick, to, index } => {
            let ids: Vec<ItemId> = store.items().keys().cloned().collect();
            if ids.is_empty() {
                return;
            }
            let id = &ids[pick % ids.len()];
            if let Some(from) = store.column_of(id) {
                store.move_item(id, from, *to, *index).unwrap();
            }
        }
        Op::Remote { id, kind, status } => {
            // updates for unknown items still insert, so every row is valid
            merge_change(&scope(), row(IDS[*id], *kind, *status), store, dispatcher).unwrap();
        }
    }
}

fn check_invariants(store: &BoardStore) -> Result<(), TestCaseError> {
    let board = store.board();
    prop_assert_eq!(board.len(), store.items().len());
    for (column, ids) in board.iter() {
        for id in ids {
            prop_assert_eq!(board.occurrences(id), 1, "{} appears more than once", id);
            let item = store.item(id);
            prop_assert!(item.is_some(), "{} has no item record", id);
            if let Some(item) = item {
                prop_assert_eq!(item.status, map_column_to_status(column));
            }
        }
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn board_stays_consistent_under_mixed_changes(ops in prop::collection::vec(arb_op(), 1..40)) {
        let (outcomes, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = MutationDispatcher::new(
            Arc::new(InMemoryBackend::new()),
            outcomes,
            FailurePolicy::Retain,
        );
        let mut store = BoardStore::new(16);

        for op in &ops {
            apply(op, &mut store, &mut dispatcher);
            check_invariants(&store)?;
        }
    }

    #[test]
    fn replaying_a_remote_row_is_idempotent(
        id in 0..IDS.len(),
        status in arb_status(),
        prefix in prop::collection::vec(arb_op(), 0..20),
    ) {
        let (outcomes, _rx) = mpsc::unbounded_channel();
        let mut dispatcher = MutationDispatcher::new(
            Arc::new(InMemoryBackend::new()),
            outcomes,
            FailurePolicy::Retain,
        );
        let mut store = BoardStore::new(16);
        for op in &prefix {
            apply(op, &mut store, &mut dispatcher);
        }

        let change = row(IDS[id], ChangeKind::Update, status);
        merge_change(&scope(), change.clone(), &mut store, &mut dispatcher).unwrap();
        let board_once = store.board().clone();
        let item_once = store.item(&ItemId::new(IDS[id])).cloned();

        merge_change(&scope(), change, &mut store, &mut dispatcher).unwrap();
        prop_assert_eq!(store.board(), &board_once);
        prop_assert_eq!(store.item(&ItemId::new(IDS[id])).cloned(), item_once);
    }
}
