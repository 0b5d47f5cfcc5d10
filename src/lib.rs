//! # rb-cache
//!
//! Read-batching, deduplicating cache for remote, key-indexed entity stores.
//!
//! Think of it as the client-side counterpart of a REST-ish backend that serves hierarchical records (companies,
//! sites, buildings, scenes, objects, geometries, ...) where a single screen may need thousands of individually
//! identified records.
//!
//! # The Basics
//!
//! The crate is designed for the following use case:
//!
//! - Entities are addressed by opaque string identifiers and fetched through an HTTP-like transport.
//! - Many small reads are issued in bursts, often for overlapping sets of identifiers.
//! - The backend is happier with a few bounded batch reads than with thousands of single-record requests.
//!
//! The cache operates on the following principles:
//!
//! - It is transport-agnostic: anything implementing [`Transport`] will do.
//! - Every key is in one of three states: absent, pending (a fetch is in flight) or present.
//! - A key is never requested twice while it is pending; callers that need it simply wait for the fetch to land.
//! - Absent keys raised within an aggregation window are merged into bunches of bounded size.
//! - No more than a configured number of transport calls are in flight at the same time.
//! - Fully async, built on top of [tokio](https://crates.io/crates/tokio).
//!
//! # Entity Manager
//!
//! [`EntityManager`] is the entry point. It owns a cache, an aggregation buffer, a request queue with its process
//! queue, and a registry of callers waiting for keys that are still on their way. Every read by key goes through
//! the cache first; what cannot be answered right away is scheduled for a batch read, and the caller is resolved
//! once all of its keys are known. Query reads ("where" and "all") and every write bypass the cache and go to the
//! dispatcher directly.
//!
//! ```ignore
//! let manager = EntityManager::new(transport, ManagerConfig::new("/api/buildings"))?;
//!
//! // Both calls share a single batch request.
//! let (one, many) = tokio::join!(manager.read_one("b-1"), manager.read_many(["b-1", "b-2", "b-3"]));
//! ```
//!
//! # Coalescer
//!
//! [`Coalescer`] is a simpler sibling for raw transport access, e.g. file downloads. It doesn't cache anything but
//! makes sure identical requests that are queued or in flight at the same time are only sent once.

pub mod cache;
pub mod coalescer;
pub mod config;
pub mod error;
pub mod manager;
pub mod router;
pub mod test;
pub mod traits;
pub mod types;

pub(crate) mod aggregator;
pub(crate) mod descriptor;
pub(crate) mod dispatcher;
pub(crate) mod waiting;

#[doc(inline)]
pub use coalescer::Coalescer;
#[doc(inline)]
pub use manager::EntityManager;
#[doc(inline)]
pub use traits::Transport;

pub mod prelude {
    pub use crate::cache::AddOutcome;
    pub use crate::cache::CacheState;
    pub use crate::cache::EntityCache;
    pub use crate::coalescer::Coalescer;
    pub use crate::config::CoalescerConfig;
    pub use crate::config::ManagerConfig;
    pub use crate::error::*;
    pub use crate::manager::EntityManager;
    pub use crate::manager::ReadOutcome;
    pub use crate::traits::Observer;
    pub use crate::traits::Transport;
    pub use crate::types::*;
}
