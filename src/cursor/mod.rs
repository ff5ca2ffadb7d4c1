//! In-memory cursor tracking for incremental collection.
//!
//! A cursor records the identifier of the newest item already handed to the
//! pipeline for one source key (e.g. `octocat/hello-world`). Cursors live only
//! in process memory: after a restart the collector falls back to its cutoff
//! window and may re-emit up to one window's worth of events. That is within
//! the at-least-once contract.

mod store;

pub use store::CursorStore;
