//! FolioFox core engine.
//!
//! Four cooperating subsystems over one SQLite catalog:
//! download queue scheduling ([`queue`]), indexer health and failover
//! ([`failover`]), book deduplication ([`dedup`]), and scheduled catalog
//! maintenance ([`maintenance`]). [`supervisor`] wires the long-running
//! loops under a single cancellation token.

pub mod catalog;
pub mod dedup;
pub mod error;
pub mod failover;
pub mod maintenance;
pub mod queue;
pub mod supervisor;

pub use catalog::CatalogStore;
pub use error::{FolioError, Result};
pub use supervisor::Supervisor;
