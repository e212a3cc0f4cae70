//! Tank alarm event bus and notification infrastructure.
//!
//! - [`EventBus`] -- in-process publish/subscribe hub backed by
//!   `tokio::sync::broadcast`.
//! - [`ServerEvent`] -- the envelope for alarm, power, liveness and daily
//!   report events.
//! - [`NotificationDispatcher`] -- de-duplicates events and hands rendered
//!   messages to a [`RelayOutbox`].
//! - [`DailyReportScheduler`] -- publishes the daily summary at the
//!   configured time.

pub mod bus;
pub mod digest;
pub mod dispatcher;

pub use bus::{DailyReport, EventBus, ServerEvent};
pub use digest::{DailyReportScheduler, ReportSource};
pub use dispatcher::{
    MemoryOutbox, NotificationDispatcher, OutboundMessage, RelayOutbox, TracingOutbox,
};
