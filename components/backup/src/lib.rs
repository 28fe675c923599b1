// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! Distributed, online, range-partitioned backup of an ordered keyspace.
//!
//! The coordinator instructs every store of a cluster to stream its portion
//! of the requested key ranges into an external storage target as immutable
//! sorted-string files, then reconciles the remaining gaps with targeted
//! per-region retries. See [`client::Client`] for the entry point.

#[macro_use]
extern crate slog_global;

pub mod api;
pub mod backoff;
pub mod client;
pub mod conn;
pub mod errors;
pub mod metrics;
pub mod push;
pub mod rtree;
pub mod schema;
pub mod summary;
pub mod tablecodec;
pub mod utils;

#[cfg(test)]
mod test_util;

pub use crate::{
    client::{Client, MetaSink, ProgressCallback, ProgressUnit, LOCK_FILE, META_FILE},
    errors::{Error, Result},
};
