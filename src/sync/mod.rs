//! Board sync engine: optimistic moves, persistence and realtime merge.
//!
//! ## Overview
//!
//! A board view shows work items in fine-grained columns (three review
//! stages, a backlog separate from todo) while the backend persists a coarser
//! status. The engine keeps the on-screen board responsive by applying moves
//! locally first, persisting them in the background, and folding in changes
//! other actors push over the realtime channel.
//!
//! ## Module Map
//!
//! ```text
//!  user action                                   push channel
//!      │                                              │ RawChange rows
//!      v                                              v
//! ┌──────────────────────────────────────────────────────────────────┐
//! │ session.rs  (BoardSession: owns everything below, runs the loop) │
//! │    │                                              │              │
//! │    │ request_move / create_item                   │ next_row     │
//! │    v                                              v              │
//! │ dispatcher.rs ──writer──> BoardApi        listener.rs            │
//! │    │         <─mpsc WriteOutcome─┘            │ wire::normalize  │
//! │    │                                          │ mapper (status→  │
//! │    │ move_item / rename_item                  │   column)        │
//! │    v                                          v                  │
//! │ store.rs  (BoardStore: column → ordered ids, broadcast events)   │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module       | Responsibility                                             |
//! |--------------|------------------------------------------------------------|
//! | `models`     | `WorkItem`, `Column`, `BackendStatus`, `Board`, `Scope`    |
//! | `mapper`     | column → status, and the status → column policy            |
//! | `reconciler` | placement rules, echo detection, board assembly            |
//! | `events`     | `BoardEvent` enum + `publish()` helper                     |
//! | `ports`      | `BoardApi` / `ChangeFeed` traits the session is built on   |
//! | `wire`       | response and row normalization at the network boundary     |
//! | `fallback`   | placeholder board shown when the fetch fails               |
//! | `http`       | reqwest implementations of the ports                       |
//! | `memory`     | in-process backend for the demo and tests                  |
//!
//! ## Typical Flow (drag an item to review)
//!
//! 1. `BoardSession::request_move(T1, todo, review_idc, 0)`
//! 2. The store moves T1 synchronously and sets its status to `review`.
//! 3. The dispatcher queues `update_status(T1, review)` on its ordered writer
//!    and returns a ticket.
//! 4. The backend echoes an UPDATE row; the listener recognises it as the
//!    session's own write and leaves T1 where the user put it.
//! 5. `process_next()` applies the write outcome. On failure the move is
//!    kept (or reverted, when configured) and `WriteFailed` is published.

pub mod dispatcher;
pub mod events;
pub mod fallback;
pub mod http;
pub mod listener;
pub mod mapper;
pub mod memory;
pub mod models;
pub mod ports;
pub mod reconciler;
pub mod session;
pub mod store;
pub mod wire;

pub use dispatcher::{Delivery, Direction, FailurePolicy, WriteTicket};
pub use events::BoardEvent;
pub use models::{BackendStatus, Board, BoardSnapshot, Column, ItemDraft, ItemId, Scope, WorkItem};
pub use session::{BoardSession, LoadOutcome, SessionActivity, SessionConfig};
