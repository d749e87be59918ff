//! Race event bus.
//!
//! The coordinator and aggregator publish lifecycle events when a bus is
//! attached. Publishing never blocks and never fails because nobody is
//! listening; slow subscribers lag and skip.
//!
//! ```text
//! ┌──────────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ RaceCoordinator  │────▶│  Event Bus   │────▶│  Subscribers │
//! │ Aggregator       │     │  (broadcast) │     │   (recv)     │
//! └──────────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, EventBusError, EventBusResult, EventFilter, FilteredReceiver, SharedEventBus};
pub use types::RaceEvent;
