//! Field controller persistence and notification boundary
//!
//! # Key Components
//!
//! - **DeviceStore / AutomationStore**: read models and write-backs the engines need
//! - **EventPublisher**: best-effort push notifications
//! - **SqliteStore**: sqlx-backed implementation
//! - **MemoryStore**: in-memory implementation for tests and embedding

pub mod memory_impl;
pub mod publisher;
pub mod sqlite_impl;
pub mod traits;

pub use memory_impl::{HistoryEntry, MemoryStore};
pub use publisher::{BroadcastPublisher, RecordingPublisher};
pub use sqlite_impl::SqliteStore;
pub use traits::{AutomationStore, DeviceErrorRecord, DeviceStore, EventPublisher, Store};
