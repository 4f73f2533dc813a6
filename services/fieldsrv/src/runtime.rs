//! Runtime orchestration
//!
//! Component wiring, lifecycle management and maintenance tasks.

pub mod lifecycle;

pub use lifecycle::{start_cleanup_task, FieldRuntime, RuntimeDeps};
