//! crxd - browser extension cache and update server
//!
//! Polls extension sources, keeps the latest package of each configured
//! extension on disk and serves an update manifest pointing at them.

pub mod cache;
pub mod coordinator;
pub mod listener;
pub mod logging;
pub mod poller;
pub mod server;
pub mod source;
pub mod watcher;

pub use cache::CacheStore;
pub use coordinator::{Coordinator, ReconcileReport};
pub use poller::{PollError, PollOutcome, Poller, PollerState};
pub use source::{ByteStream, HttpSourceFactory, SourceAdapter, SourceFactory};
