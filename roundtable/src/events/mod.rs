//! Per-session event plumbing
//!
//! Each session constructs its own [`EventBus`] and hands a shared reference
//! to every emitter (context store, orchestrator, session manager). There is
//! no process-wide bus.
//!
//! ```text
//! ┌──────────────┐  emit   ┌──────────────┐  inline   ┌────────────────┐
//! │   Emitter    │────────▶│   EventBus   │──────────▶│ sync listeners │
//! └──────────────┘         └──┬────────┬──┘           └────────────────┘
//!                             │        │  queue       ┌────────────────┐
//!                             │        └─────────────▶│ async listeners│
//!                             ▼                       └────────────────┘
//!                      ┌──────────────┐
//!                      │ ring history │ + broadcast stream
//!                      └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{
    EventBus, EventFilter, FilteredReceiver, ListenerError, ListenerHandle, ListenerResult,
    SharedEventBus, DEFAULT_HISTORY_CAPACITY,
};
pub use types::{Event, EventId};
