//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled          |
//! |----------|---------------------------|
//! | `board`  | `Board`, `Move`, `Columns`|
//! | `watch`  | `Watch`                   |
//! | `demo`   | `Demo`                    |
//! | `config` | `Config`                  |

pub mod board;
pub mod config;
pub mod demo;
pub mod watch;

pub use board::{cmd_board, cmd_columns, cmd_move};
pub use config::cmd_config;
pub use demo::cmd_demo;
pub use watch::cmd_watch;

use std::sync::Arc;

use anyhow::{Context, Result};

use flowboard::board_config::FlowboardConfig;
use flowboard::sync::http::{HttpBoardApi, HttpChangeFeed};
use flowboard::sync::{BoardSession, SessionConfig};

/// Build a session talking to the configured server.
pub(crate) fn http_session(config: &FlowboardConfig, session: SessionConfig) -> Result<BoardSession> {
    let base_url = config.base_url();
    let api = HttpBoardApi::new(&base_url, config.request_timeout())
        .context("Failed to create board API client")?;
    let feed = HttpChangeFeed::new(&base_url, config.request_timeout())
        .context("Failed to create realtime client")?;
    Ok(BoardSession::new(Arc::new(api), Arc::new(feed), session))
}
