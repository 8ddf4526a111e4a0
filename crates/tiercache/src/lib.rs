//! A two-tier (memory and disk) object cache with a coalescing fetch and derive pipeline.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod logging;
pub mod utils;
