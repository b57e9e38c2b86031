//! Generation-scoped cache of HTTP responses.
//!
//! Responses live in named regions (`<prefix>-<kind>-<generation>`):
//! - the shell region holds the application's static assets, pre-populated on install
//! - the runtime-data region holds API responses, written as they are fetched
//!
//! Regions of older generations are deleted when a new generation activates.

mod region;
mod storage;
mod store;

pub use region::{CacheRegion, RegionKind};
#[cfg(test)]
pub(crate) use storage::FailingStorage;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use store::CacheStore;

pub(crate) use storage::parse_datetime;
