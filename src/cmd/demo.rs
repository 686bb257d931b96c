//! Scripted walkthrough against the in-memory backend: `flowboard demo`.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use flowboard::sync::fallback::placeholder_board;
use flowboard::sync::memory::InMemoryBackend;
use flowboard::sync::models::ChangeKind;
use flowboard::sync::{
    BoardEvent, BoardSession, Column, ItemDraft, ItemId, Scope, SessionActivity, SessionConfig,
};

use super::board::render_board;
use super::watch::print_events;

const SETTLE_WINDOW: Duration = Duration::from_millis(200);

/// Apply outcomes and rows until nothing arrives for a short while.
async fn settle(session: &mut BoardSession, events: &mut broadcast::Receiver<BoardEvent>) -> usize {
    let mut applied = 0;
    while let Ok(activity) = tokio::time::timeout(SETTLE_WINDOW, session.process_next()).await {
        applied += 1;
        if activity == SessionActivity::LiveUpdatesLost {
            break;
        }
    }
    print_events(events);
    applied
}

fn step(title: &str) {
    println!();
    println!("{}", console::style(title).bold());
}

pub async fn cmd_demo() -> Result<()> {
    let scope = Scope::new("demo-project", "demo-discipline").context("Invalid demo scope")?;
    let backend = Arc::new(InMemoryBackend::new());
    let seed = placeholder_board(&scope);
    for (column, ids) in seed.board.iter() {
        for id in ids {
            if let Some(item) = seed.items.get(id) {
                backend.seed(&scope, column, item.clone());
            }
        }
    }

    let mut session = BoardSession::new(backend.clone(), backend.clone(), SessionConfig::default());
    let mut events = session.subscribe();

    step("1. Open the board");
    session.open(scope.clone()).await?;
    print_events(&mut events);
    render_board(&session.snapshot());

    step("2. Move demo-1 from backlog to todo (optimistic, then persisted)");
    session.request_move(&ItemId::new("demo-1"), Column::Backlog, Column::Todo, 0)?;
    settle(&mut session, &mut events).await;

    step("3. Another user marks demo-2 as done");
    backend.emit(
        ChangeKind::Update,
        serde_json::json!({
            "id": "demo-2",
            "status": "done",
            "progress": 100,
            "project_id": scope.project_id(),
            "discipline_id": scope.discipline_id(),
        }),
    );
    settle(&mut session, &mut events).await;

    step("4. A write fails: demo-3 stays where it was dropped");
    backend.fail_next_writes(1);
    session.request_move(&ItemId::new("demo-3"), Column::InProgress, Column::ReviewDic, 0)?;
    settle(&mut session, &mut events).await;

    step("5. Retry failed writes");
    session.retry_failed_writes();
    settle(&mut session, &mut events).await;

    step("6. Quick-create an item");
    session.create_item(ItemDraft::titled("Follow up on site visit"))?;
    settle(&mut session, &mut events).await;

    step("Final board");
    render_board(&session.snapshot());
    println!(
        "{} status write(s) issued, {} received by the backend",
        session.dispatcher().issued().count(),
        backend.status_calls().len()
    );

    session.close().await;
    Ok(())
}
