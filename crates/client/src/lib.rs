//! Client code for shelf.
//!
//! This crate provides the network side of the caching engine: the HTTP
//! fetch client, request classification, strategy execution and synthesized
//! offline responses.

pub mod fetch;
pub mod fetcher;
pub mod offline;
pub mod router;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use fetch::{FetchClient, FetchConfig, Network, NetworkResponse, ResourceRequest};
pub use fetcher::{FetchOutcome, ResourceFetcher, Served};
pub use router::{Route, Strategy, StrategyRouter};
pub use shelf_core::DynamicEndpoint;
