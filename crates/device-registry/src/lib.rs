//! device-registry: authority over which devices are connected
//!
//! Sessions never touch the map directly. They submit [`SessionCommand`]s to
//! a [`RegistryService`], the single writer, and receive [`RegistryReply`]s on
//! a private channel. Read-only queries (`count`, `lookup`, `last_reading`)
//! may be issued from any task through a cloned [`DeviceRegistry`] handle.

mod types;
pub use types::{
    reply_channel, EntrySummary, ReadingEvent, RegistryReply, ReplyReceiver, ReplySender,
    SessionCommand, TimestampedReading, REPLY_CAPACITY,
};

mod error;
pub use error::{RegistryError, Result};

mod clock;
pub use clock::{Clock, FixedClock, SystemClock};

mod registry;
pub use registry::{DeviceRegistry, RegistryBuilder};

mod service;
pub use service::{CommandSink, RegistryService};

mod metrics;
pub use metrics::{MetricsHub, RegistryMetrics};
