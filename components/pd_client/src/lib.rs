// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

//! The interface towards the placement driver (PD).
//!
//! The placement driver is the cluster-management service: it owns the
//! timestamp oracle, the store directory and the region routing table. This
//! crate only defines the client-side seam; the wire implementation is
//! provided by the embedding binary.

pub mod errors;
pub mod oracle;

use std::ops::Deref;

use async_trait::async_trait;

pub use self::{
    errors::{Error, Result},
    oracle::TimeStamp,
};

pub type Key = Vec<u8>;

pub const INVALID_ID: u64 = 0;

/// A storage node registered in PD.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Store {
    pub id: u64,
    pub address: String,
    /// Read-only replica stores serve analytical replicas and cannot
    /// produce backup artifacts.
    pub read_only: bool,
}

/// A member of a region's raft group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Peer {
    pub id: u64,
    pub store_id: u64,
}

/// A contiguous sub-range of the keyspace owned by one raft group.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Region {
    pub id: u64,
    pub start_key: Key,
    pub end_key: Key,
    pub peers: Vec<Peer>,
}

/// A region together with its current leader, if PD knows one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegionInfo {
    pub region: Region,
    pub leader: Option<Peer>,
}

impl RegionInfo {
    pub fn new(region: Region, leader: Option<Peer>) -> RegionInfo {
        RegionInfo { region, leader }
    }
}

impl Deref for RegionInfo {
    type Target = Region;

    fn deref(&self) -> &Self::Target {
        &self.region
    }
}

/// PdClient communicates with the placement driver.
///
/// One PD deployment serves exactly one cluster, so the cluster ID is bound
/// when the concrete client is created and is not passed per call.
#[async_trait]
pub trait PdClient: Send + Sync {
    /// Returns the cluster ID.
    fn get_cluster_id(&self) -> Result<u64>;

    /// Returns a `(physical, logical)` pair from the timestamp oracle.
    async fn get_ts(&self) -> Result<(u64, u64)>;

    /// Returns all stores currently registered, whatever their kind.
    async fn get_all_stores(&self) -> Result<Vec<Store>>;

    /// Returns the store with the given ID.
    async fn get_store(&self, store_id: u64) -> Result<Store>;

    /// Returns the region covering `key` and its current leader.
    ///
    /// `Ok(None)` means PD has no region for the key right now (e.g. during
    /// a split); callers are expected to retry.
    async fn get_region(&self, key: &[u8]) -> Result<Option<RegionInfo>>;

    /// Returns the GC safe point: the oldest timestamp whose data is still
    /// preserved by the garbage collector.
    async fn get_gc_safe_point(&self) -> Result<TimeStamp>;
}
