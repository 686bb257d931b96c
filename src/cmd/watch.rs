//! Live board tail: `flowboard watch`.

use anyhow::{Context, Result};
use tokio::sync::broadcast;

use flowboard::board_config::FlowboardConfig;
use flowboard::sync::{BoardEvent, SessionActivity};

/// One line per event, warnings highlighted.
pub(crate) fn format_event(event: &BoardEvent) -> String {
    let detail = match event {
        BoardEvent::BoardReplaced {
            scope,
            item_count,
            is_fallback,
        } => format!(
            "{} items{}{}",
            item_count,
            scope.as_ref().map(|s| format!(" for {}", s)).unwrap_or_default(),
            if *is_fallback { " (placeholder)" } else { "" }
        ),
        BoardEvent::ItemMoved {
            item_id,
            from_column,
            to_column,
            position,
        } => format!("{} {} → {} @{}", item_id, from_column, to_column, position),
        BoardEvent::ItemUpserted {
            item_id,
            column,
            position,
        } => format!("{} in {} @{}", item_id, column, position),
        BoardEvent::ItemRemoved { item_id, column } => format!("{} from {}", item_id, column),
        BoardEvent::ItemAcknowledged {
            tentative_id,
            item_id,
        } => format!("{} is now {}", tentative_id, item_id),
        BoardEvent::ChangeReceived { change, column } => format!(
            "{} {} ({:?}){}{}",
            change.kind.as_str(),
            change.item_id,
            change.origin,
            column.map(|c| format!(" → {}", c)).unwrap_or_default(),
            if change.changed_fields.is_empty() {
                String::new()
            } else {
                format!(" [{}]", change.changed_fields.join(", "))
            }
        ),
        BoardEvent::WriteFailed {
            item_id,
            status,
            error,
        } => format!("{} → {}: {}", item_id, status, error),
        BoardEvent::WriteReverted {
            item_id, column, ..
        } => format!("{} back to {}", item_id, column),
        BoardEvent::CreateFailed {
            tentative_id,
            error,
        } => format!("{}: {}", tentative_id, error),
        BoardEvent::FallbackLoaded { reason } => reason.clone(),
        BoardEvent::LiveUpdatesStarted { channel } => channel.clone(),
        BoardEvent::LiveUpdatesUnavailable { reason } => reason.clone(),
    };

    let name = if event.is_warning() {
        console::style(event.name()).yellow().to_string()
    } else {
        console::style(event.name()).cyan().to_string()
    };
    format!("{} {}", name, detail)
}

/// Print whatever is queued on `events`.
pub(crate) fn print_events(events: &mut broadcast::Receiver<BoardEvent>) {
    loop {
        match events.try_recv() {
            Ok(event) => println!("{}", format_event(&event)),
            Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                println!("{}", console::style(format!("… {} events skipped", skipped)).dim());
            }
            Err(_) => break,
        }
    }
}

pub async fn cmd_watch(config: &FlowboardConfig, limit: Option<usize>) -> Result<()> {
    let scope = config.scope()?;
    let mut session = super::http_session(config, config.session_config())?;
    let mut events = session.subscribe();
    session.open(scope).await.context("Failed to open board")?;
    print_events(&mut events);

    if !session.is_live() {
        println!(
            "{}",
            console::style("Live updates unavailable; nothing to watch.").yellow()
        );
        session.close().await;
        return Ok(());
    }

    let mut changes = 0usize;
    loop {
        tokio::select! {
            activity = session.process_next() => {
                print_events(&mut events);
                match activity {
                    SessionActivity::Change(_) => changes += 1,
                    SessionActivity::LiveUpdatesLost => break,
                    _ => {}
                }
                if limit.is_some_and(|limit| changes >= limit) {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    session.close().await;
    println!("{} change(s) received", changes);
    Ok(())
}
