//! fwd - forwards activity from polled APIs, webhooks and watch streams to a
//! message bus as CloudEvents.
//!
//! Events flow through one pipeline: every [`pipeline::Source`] writes into a
//! bounded fan-in queue, and a single batch publisher drains it to the bus.

pub mod collector;
pub mod config;
pub mod cursor;
pub mod pipeline;
pub mod push;
pub mod server;
pub mod types;
pub mod webhooks;
