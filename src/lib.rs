//! Per-process network traffic monitor.
//!
//! Packets are read from a capture handle, classified by direction, attributed
//! to the owning process through a periodically refreshed connection table, and
//! aggregated into one-second windows that are published to subscribers and
//! persisted as session history.

pub mod attribution;
pub mod capture;
pub mod models;
pub mod store;
pub mod utils;

pub use capture::manager::{CaptureExit, MonitorService};
pub use models::config::AppConfig;
pub use store::SessionStore;
pub use utils::error::{AppError, AppResult};
