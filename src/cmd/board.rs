//! Board inspection and moves: `flowboard board`, `move`, `columns`.

use anyhow::{Context, Result, bail};
use std::time::Duration;

use flowboard::board_config::FlowboardConfig;
use flowboard::sync::mapper;
use flowboard::sync::{
    BackendStatus, BoardEvent, BoardSnapshot, Column, ItemId, LoadOutcome, SessionActivity,
    SessionConfig,
};

/// Print a snapshot column by column.
pub(crate) fn render_board(snapshot: &BoardSnapshot) {
    println!();
    match &snapshot.scope {
        Some(scope) => println!("{}", console::style(format!("Board {}", scope)).bold().cyan()),
        None => println!("{}", console::style("Board").bold().cyan()),
    }
    println!("─────────────────────────");
    if snapshot.is_fallback {
        println!(
            "{}",
            console::style("⚠ Board unavailable, showing placeholder data").yellow()
        );
    }

    for column in Column::ALL {
        let items = snapshot.items_in(column);
        println!(
            "{} ({})",
            console::style(column.as_str()).bold(),
            items.len()
        );
        for item in items {
            println!(
                "  {} {} {}",
                console::style(format!("[{}]", item.id)).dim(),
                item.title,
                console::style(format!("{} · {}%", item.priority.as_str(), item.progress)).dim()
            );
        }
    }
    println!();
}

pub async fn cmd_board(config: &FlowboardConfig, json: bool) -> Result<()> {
    let scope = config.scope()?;
    let mut session = super::http_session(
        config,
        SessionConfig {
            live_updates: false,
            ..config.session_config()
        },
    )?;
    session.open(scope).await.context("Failed to open board")?;

    let snapshot = session.snapshot();
    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("Failed to serialize board")?
        );
    } else {
        render_board(&snapshot);
    }
    session.close().await;
    Ok(())
}

pub async fn cmd_move(
    config: &FlowboardConfig,
    item: &str,
    from: &str,
    to: &str,
    index: usize,
) -> Result<()> {
    let from: Column = from.parse().context("Invalid source column")?;
    let to: Column = to.parse().context("Invalid target column")?;
    let scope = config.scope()?;
    let mut session = super::http_session(
        config,
        SessionConfig {
            live_updates: false,
            ..config.session_config()
        },
    )?;

    if let LoadOutcome::Fallback { reason } = session.open(scope).await? {
        bail!("Cannot move items while the board is unavailable: {}", reason);
    }
    let mut events = session.subscribe();
    let item_id = ItemId::new(item);
    let ticket = session.request_move(&item_id, from, to, index)?;
    println!(
        "Moved {} from {} to {} (status {})",
        item_id, from, to, ticket.status
    );

    let wait = config.request_timeout() + Duration::from_secs(1);
    let succeeded = tokio::time::timeout(wait, async {
        loop {
            if let SessionActivity::StatusWrite {
                item_id: written,
                succeeded,
                ..
            } = session.process_next().await
                && written == item_id
            {
                return succeeded;
            }
        }
    })
    .await
    .context("Timed out waiting for the status write")?;

    if succeeded {
        println!("{} Saved", console::style("✓").green());
        session.close().await;
        return Ok(());
    }

    let reason = std::iter::from_fn(|| events.try_recv().ok())
        .find_map(|event| match event {
            BoardEvent::WriteFailed { error, .. } => Some(error),
            _ => None,
        })
        .unwrap_or_else(|| "unknown error".to_string());
    session.close().await;
    bail!("Status write for {} failed: {}", item_id, reason)
}

pub fn cmd_columns() {
    println!();
    println!("{}", console::style("Column → status").bold().cyan());
    for column in Column::ALL {
        println!(
            "  {:<12} → {}",
            column.as_str(),
            mapper::map_column_to_status(column)
        );
    }
    println!();
    println!("{}", console::style("Status → default column").bold().cyan());
    for status in BackendStatus::ALL {
        let columns: Vec<&str> = mapper::columns_for_status(status)
            .iter()
            .map(Column::as_str)
            .collect();
        println!(
            "  {:<12} → {}  (also: {})",
            status.as_str(),
            mapper::entry_column_for_status(status),
            columns.join(", ")
        );
    }
    println!();
    println!("New items enter {}.", mapper::ENTRY_COLUMN);
    println!();
}
