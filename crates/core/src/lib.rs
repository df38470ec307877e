//! Domain model and pure logic for the comfy-relay dispatcher.
//!
//! Holds the job request model, the declarative template engine and its
//! on-disk catalog, the backoff controllers used by the dispatch loop, and
//! the normalized job record persisted after a successful generation.
//! Nothing in this crate talks to the network.

pub mod backoff;
pub mod catalog;
pub mod error;
pub mod job;
pub mod record;
pub mod template;
pub mod types;
