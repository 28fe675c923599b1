// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! Deterministic stubs of the cluster collaborators, for tests.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use futures::stream;
use pd_client::{PdClient, Peer, Region, RegionInfo, Store, TimeStamp};

use crate::{
    api::{
        BackupClient, BackupRequest, BackupResponse, File, LockInfo, ResponseError,
        ResponseStream, RpcError, RpcStatusCode,
    },
    client::{MetaSink, ProgressCallback, ProgressUnit},
    conn::{ClientMgr, LockResolver},
    errors::{Error, Result},
};

/// One scripted `backup` call: either fail to open, or stream these items.
pub type ScriptedCall = std::result::Result<Vec<std::result::Result<BackupResponse, RpcError>>, RpcError>;

pub struct ScriptedClient {
    calls: Mutex<VecDeque<ScriptedCall>>,
    pub calls_made: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(calls: Vec<ScriptedCall>) -> ScriptedClient {
        ScriptedClient {
            calls: Mutex::new(VecDeque::from(calls)),
            calls_made: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> ScriptedClient {
        ScriptedClient::new(Vec::new())
    }
}

#[async_trait]
impl BackupClient for ScriptedClient {
    async fn backup(&self, _req: BackupRequest) -> std::result::Result<ResponseStream, RpcError> {
        self.calls_made.fetch_add(1, Ordering::SeqCst);
        let call = self.calls.lock().unwrap().pop_front();
        let items = match call {
            // An exhausted script behaves like an idle store: the call opens
            // fine and hits EOF at once.
            None => Vec::new(),
            Some(Err(e)) => return Err(e),
            Some(Ok(items)) => items,
        };
        Ok(Box::pin(stream::iter(items)))
    }
}

pub struct MockPdClient {
    cluster_id: u64,
    stores: Vec<Store>,
    regions: Mutex<Vec<RegionInfo>>,
    tso_physical: AtomicU64,
    gc_safe_point: AtomicU64,
}

impl MockPdClient {
    pub fn new(cluster_id: u64, stores: Vec<Store>) -> MockPdClient {
        MockPdClient {
            cluster_id,
            stores,
            regions: Mutex::new(Vec::new()),
            tso_physical: AtomicU64::new(100_000),
            gc_safe_point: AtomicU64::new(0),
        }
    }

    pub fn set_regions(&self, regions: Vec<RegionInfo>) {
        *self.regions.lock().unwrap() = regions;
    }

    pub fn set_gc_safe_point(&self, ts: TimeStamp) {
        self.gc_safe_point.store(ts.into_inner(), Ordering::SeqCst);
    }
}

#[async_trait]
impl PdClient for MockPdClient {
    fn get_cluster_id(&self) -> pd_client::Result<u64> {
        Ok(self.cluster_id)
    }

    async fn get_ts(&self) -> pd_client::Result<(u64, u64)> {
        Ok((self.tso_physical.fetch_add(1, Ordering::SeqCst), 1))
    }

    async fn get_all_stores(&self) -> pd_client::Result<Vec<Store>> {
        Ok(self.stores.clone())
    }

    async fn get_store(&self, store_id: u64) -> pd_client::Result<Store> {
        self.stores
            .iter()
            .find(|s| s.id == store_id)
            .cloned()
            .ok_or(pd_client::Error::StoreNotFound(store_id))
    }

    async fn get_region(&self, key: &[u8]) -> pd_client::Result<Option<RegionInfo>> {
        Ok(self
            .regions
            .lock()
            .unwrap()
            .iter()
            .find(|info| {
                info.region.start_key.as_slice() <= key
                    && (info.region.end_key.is_empty() || key < info.region.end_key.as_slice())
            })
            .cloned())
    }

    async fn get_gc_safe_point(&self) -> pd_client::Result<TimeStamp> {
        Ok(TimeStamp::new(self.gc_safe_point.load(Ordering::SeqCst)))
    }
}

#[derive(Default)]
pub struct MockLockResolver {
    pub results: Mutex<VecDeque<u64>>,
    pub calls: Mutex<Vec<(TimeStamp, LockInfo)>>,
}

#[async_trait]
impl LockResolver for MockLockResolver {
    async fn resolve_lock(&self, backup_ts: TimeStamp, lock: &LockInfo) -> Result<u64> {
        self.calls.lock().unwrap().push((backup_ts, lock.clone()));
        Ok(self.results.lock().unwrap().pop_front().unwrap_or(0))
    }
}

pub struct MockClientMgr {
    pd: Arc<MockPdClient>,
    pub clients: Mutex<HashMap<u64, Arc<ScriptedClient>>>,
    resolver: Arc<MockLockResolver>,
    pub resets: AtomicUsize,
}

#[async_trait]
impl ClientMgr for MockClientMgr {
    async fn backup_client(&self, store_id: u64) -> Result<Arc<dyn BackupClient>> {
        self.clients
            .lock()
            .unwrap()
            .get(&store_id)
            .map(|c| c.clone() as Arc<dyn BackupClient>)
            .ok_or(Error::FailedToConnect {
                store_id,
                msg: "connection refused".to_owned(),
            })
    }

    async fn reset_backup_client(&self, store_id: u64) -> Result<Arc<dyn BackupClient>> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        self.backup_client(store_id).await
    }

    fn pd_client(&self) -> Arc<dyn PdClient> {
        self.pd.clone()
    }

    fn lock_resolver(&self) -> Arc<dyn LockResolver> {
        self.resolver.clone()
    }

    fn close(&self) {}
}

/// A cluster in a box: PD, stores with scripted clients, a lock resolver.
pub struct MockEnv {
    pub pd: Arc<MockPdClient>,
    pub mgr: Arc<MockClientMgr>,
    pub resolver: Arc<MockLockResolver>,
}

impl MockEnv {
    pub fn builder() -> MockEnvBuilder {
        MockEnvBuilder::default()
    }

    pub fn stores(&self) -> Vec<Store> {
        futures::executor::block_on(self.pd.get_all_stores()).unwrap()
    }

    pub fn client(&self, store_id: u64) -> Arc<ScriptedClient> {
        self.mgr.clients.lock().unwrap()[&store_id].clone()
    }
}

#[derive(Default)]
pub struct MockEnvBuilder {
    cluster_id: Option<u64>,
    stores: Vec<(u64, Vec<ScriptedCall>)>,
    regions: Vec<RegionInfo>,
    lock_results: Vec<u64>,
}

impl MockEnvBuilder {
    pub fn cluster_id(mut self, id: u64) -> Self {
        self.cluster_id = Some(id);
        self
    }

    pub fn store(mut self, id: u64, calls: Vec<ScriptedCall>) -> Self {
        self.stores.push((id, calls));
        self
    }

    /// A region `[start, end)` whose leader lives on `leader_store`. Pass 0
    /// to register the region without a leader. The leader store does not
    /// have to be a registered store, which models a leader the directory
    /// still advertises while the store itself is gone.
    pub fn region(mut self, id: u64, start: &[u8], end: &[u8], leader_store: u64) -> Self {
        let mut peers: Vec<Peer> = self
            .stores
            .iter()
            .map(|(store_id, _)| Peer {
                id: id * 100 + store_id,
                store_id: *store_id,
            })
            .collect();
        if leader_store != 0 && !peers.iter().any(|p| p.store_id == leader_store) {
            peers.push(Peer {
                id: id * 100 + leader_store,
                store_id: leader_store,
            });
        }
        let leader = peers.iter().find(|p| p.store_id == leader_store).cloned();
        self.regions.push(RegionInfo::new(
            Region {
                id,
                start_key: start.to_vec(),
                end_key: end.to_vec(),
                peers,
            },
            leader,
        ));
        self
    }

    pub fn lock_result(mut self, ms_before_expired: u64) -> Self {
        self.lock_results.push(ms_before_expired);
        self
    }

    pub fn build(self) -> MockEnv {
        let stores = self
            .stores
            .iter()
            .map(|(id, _)| Store {
                id: *id,
                address: format!("store-{}", id),
                read_only: false,
            })
            .collect();
        let pd = Arc::new(MockPdClient::new(self.cluster_id.unwrap_or(1), stores));
        pd.set_regions(self.regions);
        let clients = self
            .stores
            .into_iter()
            .map(|(id, calls)| (id, Arc::new(ScriptedClient::new(calls))))
            .collect();
        let resolver = Arc::new(MockLockResolver {
            results: Mutex::new(VecDeque::from(self.lock_results)),
            calls: Mutex::new(Vec::new()),
        });
        let mgr = Arc::new(MockClientMgr {
            pd: pd.clone(),
            clients: Mutex::new(clients),
            resolver: resolver.clone(),
            resets: AtomicUsize::new(0),
        });
        MockEnv { pd, mgr, resolver }
    }
}

#[derive(Default)]
pub struct Ticks {
    pub range: AtomicUsize,
    pub region: AtomicUsize,
}

pub fn counting_progress() -> (ProgressCallback, Arc<Ticks>) {
    let ticks = Arc::new(Ticks::default());
    let t = ticks.clone();
    let callback: ProgressCallback = Arc::new(move |unit| {
        match unit {
            ProgressUnit::Range => t.range.fetch_add(1, Ordering::SeqCst),
            ProgressUnit::Region => t.region.fetch_add(1, Ordering::SeqCst),
        };
    });
    (callback, ticks)
}

/// A meta sink collecting every batch it receives, in order.
#[derive(Default)]
pub struct CollectingSink {
    pub batches: Mutex<Vec<Vec<File>>>,
}

impl MetaSink for CollectingSink {
    fn append_data_files(&self, files: &[File]) -> Result<()> {
        self.batches.lock().unwrap().push(files.to_vec());
        Ok(())
    }
}

impl CollectingSink {
    pub fn file_names(&self) -> Vec<String> {
        self.batches
            .lock()
            .unwrap()
            .iter()
            .flatten()
            .map(|f| f.name.clone())
            .collect()
    }
}

pub fn resp_ok(start: &[u8], end: &[u8], file_name: &str) -> BackupResponse {
    BackupResponse {
        error: None,
        start_key: start.to_vec(),
        end_key: end.to_vec(),
        files: vec![File {
            name: file_name.to_owned(),
            start_key: start.to_vec(),
            end_key: end.to_vec(),
            total_kvs: 1,
            total_bytes: 10,
            crc64xor: 0,
            cf: "default".to_owned(),
        }],
    }
}

pub fn resp_err(start: &[u8], end: &[u8], error: ResponseError) -> BackupResponse {
    BackupResponse {
        error: Some(error),
        start_key: start.to_vec(),
        end_key: end.to_vec(),
        files: Vec::new(),
    }
}

pub fn unavailable() -> RpcError {
    RpcError::new(RpcStatusCode::Unavailable, "store is unavailable")
}
