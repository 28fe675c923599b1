// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! Connections needed by a backup: per-store streaming clients, the
//! placement driver and the lock resolver.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use pd_client::{PdClient, Store, TimeStamp};

use crate::{
    api::{BackupClient, LockInfo, RpcError},
    errors::{Error, Result},
    metrics::BACKUP_STORE_RESET_COUNTER,
};

/// ClientMgr manages connections needed by backup.
#[async_trait]
pub trait ClientMgr: Send + Sync {
    async fn backup_client(&self, store_id: u64) -> Result<Arc<dyn BackupClient>>;
    /// Drops the cached connection for the store and dials a fresh one.
    async fn reset_backup_client(&self, store_id: u64) -> Result<Arc<dyn BackupClient>>;
    fn pd_client(&self) -> Arc<dyn PdClient>;
    fn lock_resolver(&self) -> Arc<dyn LockResolver>;
    fn close(&self);
}

/// Resolves key locks met while reading at the backup timestamp.
#[async_trait]
pub trait LockResolver: Send + Sync {
    /// Tries to resolve `lock`. Returns the milliseconds until the lock
    /// expires if it is still held, or 0 if it was cleaned up.
    async fn resolve_lock(&self, backup_ts: TimeStamp, lock: &LockInfo) -> Result<u64>;
}

/// Dials a backup client towards one store.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, store: &Store)
        -> std::result::Result<Arc<dyn BackupClient>, RpcError>;
}

/// A per-store client cache. `reset` racing a concurrent `get` resolves to
/// last-writer-wins; both hand out a healthy client.
pub struct ClientPool {
    pd: Arc<dyn PdClient>,
    connector: Box<dyn Connector>,
    clients: Mutex<HashMap<u64, Arc<dyn BackupClient>>>,
}

impl ClientPool {
    pub fn new(pd: Arc<dyn PdClient>, connector: Box<dyn Connector>) -> ClientPool {
        ClientPool {
            pd,
            connector,
            clients: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, store_id: u64) -> Result<Arc<dyn BackupClient>> {
        if let Some(client) = self.clients.lock().unwrap().get(&store_id) {
            return Ok(client.clone());
        }
        self.dial(store_id).await
    }

    pub async fn reset(&self, store_id: u64) -> Result<Arc<dyn BackupClient>> {
        BACKUP_STORE_RESET_COUNTER.inc();
        self.clients.lock().unwrap().remove(&store_id);
        self.dial(store_id).await
    }

    async fn dial(&self, store_id: u64) -> Result<Arc<dyn BackupClient>> {
        let store = self.pd.get_store(store_id).await?;
        let client = self
            .connector
            .connect(&store)
            .await
            .map_err(|e| Error::FailedToConnect {
                store_id,
                msg: e.to_string(),
            })?;
        self.clients.lock().unwrap().insert(store_id, client.clone());
        Ok(client)
    }

    pub fn close(&self) {
        self.clients.lock().unwrap().clear();
    }
}

/// The default [`ClientMgr`], combining a client pool with the shared
/// cluster collaborators.
pub struct Mgr {
    pool: ClientPool,
    pd: Arc<dyn PdClient>,
    lock_resolver: Arc<dyn LockResolver>,
}

impl Mgr {
    pub fn new(
        pd: Arc<dyn PdClient>,
        connector: Box<dyn Connector>,
        lock_resolver: Arc<dyn LockResolver>,
    ) -> Mgr {
        Mgr {
            pool: ClientPool::new(pd.clone(), connector),
            pd,
            lock_resolver,
        }
    }
}

#[async_trait]
impl ClientMgr for Mgr {
    async fn backup_client(&self, store_id: u64) -> Result<Arc<dyn BackupClient>> {
        self.pool.get(store_id).await
    }

    async fn reset_backup_client(&self, store_id: u64) -> Result<Arc<dyn BackupClient>> {
        self.pool.reset(store_id).await
    }

    fn pd_client(&self) -> Arc<dyn PdClient> {
        self.pd.clone()
    }

    fn lock_resolver(&self) -> Arc<dyn LockResolver> {
        self.lock_resolver.clone()
    }

    fn close(&self) {
        self.pool.close();
    }
}

/// All stores that serve backup data. Read-only replica stores cannot
/// produce backup artifacts and are skipped.
pub async fn all_data_stores(pd: &dyn PdClient) -> Result<Vec<Store>> {
    let stores = pd.get_all_stores().await?;
    Ok(stores.into_iter().filter(|s| !s.read_only).collect())
}
