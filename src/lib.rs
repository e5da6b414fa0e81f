//! fitsync - Offline-first workout log with local profiles and cloud sync
//!
//! One dataset is live at a time; sessions auto-commit after inactivity.

pub mod app;
pub mod db;
pub mod error;
pub mod merge;
pub mod model;
pub mod plan;
pub mod profile;
pub mod session;
pub mod stats;
pub mod sync;

pub use app::{App, ImportMode, Mode, SignInOutcome};
pub use db::{DurableMap, MemoryMap, SqliteMap};
pub use error::{Error, Result};
pub use model::{Dataset, Settings};
pub use profile::ProfileStore;
