//! Core types shared by every Trenova crate.
//!
//! - [`id`] - prefixed, lexicographically sortable identifiers
//! - [`time`] - unix-second clock helpers

pub mod id;
pub mod time;

pub use id::{IdError, Pulid};
pub use time::{now_unix, unix_after};
