use serde::Serialize;
use tokio::sync::broadcast;

use super::models::{BackendStatus, ChangeEvent, Column, ItemId, Scope};

/// Default capacity of the change-notification channel.
pub const DEFAULT_EVENT_BUFFER: usize = 256;

// ── Board change notifications ───────────────────────────────────────

/// Everything the UI layer may want to re-render on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum BoardEvent {
    BoardReplaced {
        scope: Option<Scope>,
        item_count: usize,
        is_fallback: bool,
    },
    ItemMoved {
        item_id: ItemId,
        from_column: Column,
        to_column: Column,
        position: usize,
    },
    ItemUpserted {
        item_id: ItemId,
        column: Column,
        position: usize,
    },
    ItemRemoved {
        item_id: ItemId,
        column: Column,
    },
    ItemAcknowledged {
        tentative_id: ItemId,
        item_id: ItemId,
    },
    ChangeReceived {
        change: ChangeEvent,
        column: Option<Column>,
    },

    // Persistence outcomes
    WriteFailed {
        item_id: ItemId,
        status: BackendStatus,
        error: String,
    },
    WriteReverted {
        item_id: ItemId,
        column: Column,
        position: usize,
    },
    CreateFailed {
        tentative_id: ItemId,
        error: String,
    },

    // Degraded modes
    FallbackLoaded {
        reason: String,
    },
    LiveUpdatesStarted {
        channel: String,
    },
    LiveUpdatesUnavailable {
        reason: String,
    },
}

impl BoardEvent {
    /// Short name used in logs and the `watch` command.
    pub fn name(&self) -> &'static str {
        match self {
            Self::BoardReplaced { .. } => "board_replaced",
            Self::ItemMoved { .. } => "item_moved",
            Self::ItemUpserted { .. } => "item_upserted",
            Self::ItemRemoved { .. } => "item_removed",
            Self::ItemAcknowledged { .. } => "item_acknowledged",
            Self::ChangeReceived { .. } => "change_received",
            Self::WriteFailed { .. } => "write_failed",
            Self::WriteReverted { .. } => "write_reverted",
            Self::CreateFailed { .. } => "create_failed",
            Self::FallbackLoaded { .. } => "fallback_loaded",
            Self::LiveUpdatesStarted { .. } => "live_updates_started",
            Self::LiveUpdatesUnavailable { .. } => "live_updates_unavailable",
        }
    }

    /// Non-fatal problems the UI should surface as a warning.
    pub fn is_warning(&self) -> bool {
        matches!(
            self,
            Self::WriteFailed { .. }
                | Self::CreateFailed { .. }
                | Self::FallbackLoaded { .. }
                | Self::LiveUpdatesUnavailable { .. }
        )
    }
}

// ── Broadcast helper ─────────────────────────────────────────────────

/// Send an event to every subscriber. Returns silently when nobody listens.
pub fn publish(tx: &broadcast::Sender<BoardEvent>, event: BoardEvent) {
    let _ = tx.send(event);
}
