// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! The backup coordinator.
//!
//! A backup of one key range runs in two phases. The push-down phase
//! broadcasts the range to every store and collects the sub-ranges they
//! acknowledge into a range tree. The fine-grained phase then walks the
//! uncovered remainder, retrying each gap against its region leader with
//! error classification and bounded backoff, until the tree covers the whole
//! range. The converged tree is walked once in key order to hand the file
//! descriptors downstream.

use std::{
    collections::{HashSet, VecDeque},
    future::Future,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::{Duration, Instant},
};

use external_storage::{create_storage, ExternalStorage, StorageBackend};
use futures::{StreamExt, TryStreamExt};
use pd_client::{PdClient, Peer, TimeStamp};
use tokio::{sync::mpsc, time::sleep};

use crate::{
    api::{BackupClient, BackupRequest, BackupResponse, ErrorDetail, File},
    backoff::Backoffer,
    conn::{self, ClientMgr, LockResolver},
    errors::{Error, Result},
    metrics::*,
    push::PushDown,
    rtree::{Range, RangeTree},
    summary,
    utils::{self, redact},
};

/// Maximum cumulative sleep (ms) of one fine-grained pass over a range.
const FINE_GRAINED_MAX_BACKOFF_MS: u64 = 80_000;
/// Transport-level attempts of one streaming call.
const BACKUP_RETRY_TIMES: usize = 5;
/// Attempts to discover a region leader before giving up.
const FIND_LEADER_RETRY_TIMES: u64 = 5;
const FINE_GRAINED_WORKERS: usize = 4;
/// Backoff hint when the leader store cannot be connected. 20s is the upper
/// bound before the raft election timer fires on the remaining peers.
const LEADER_DOWN_BACKOFF_MS: u64 = 20_000;
/// Backoff when a stream ends without yielding anything. 10s is the store
/// heartbeat interval, also the average leader election timeout.
const NO_PROGRESS_BACKOFF_MS: u64 = 10_000;
/// Grace time before reconnecting to an unavailable store.
const TRANSPORT_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Region errors settle once the raft state converges.
const REGION_ERROR_BACKOFF_MS: u64 = 1_000;
/// A brief object-store outage is expected to end within seconds.
const STORAGE_ERROR_BACKOFF_MS: u64 = 3_000;
const DEFAULT_GC_SAFE_POINT_TTL_SECS: i64 = 5 * 60;

/// Name of the metadata file in the storage target.
pub const META_FILE: &str = "backupmeta";
/// Name of the lock file warning other jobs away from the target.
pub const LOCK_FILE: &str = "backup.lock";

/// The unit of one progress callback event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProgressUnit {
    /// A whole user range completed both phases.
    Range,
    /// One region-sized sub-range was acknowledged.
    Region,
}

pub type ProgressCallback = Arc<dyn Fn(ProgressUnit) + Send + Sync>;

/// Receives the file descriptors of completed sub-ranges, in ascending key
/// order within a range. Serialization is up to the implementation.
pub trait MetaSink: Send + Sync {
    fn append_data_files(&self, files: &[File]) -> Result<()>;
}

/// A client instructing the stores of a cluster how to do a backup.
pub struct Client {
    mgr: Arc<dyn ClientMgr>,
    cluster_id: u64,
    storage: Option<Arc<dyn ExternalStorage>>,
    backend: Option<StorageBackend>,
    gc_ttl: i64,
}

impl Client {
    /// Creates a backup client bound to the cluster the manager talks to.
    pub fn new(mgr: Arc<dyn ClientMgr>) -> Result<Client> {
        info!("new backup client");
        let cluster_id = mgr.pd_client().get_cluster_id()?;
        Ok(Client {
            mgr,
            cluster_id,
            storage: None,
            backend: None,
            gc_ttl: 0,
        })
    }

    pub fn cluster_id(&self) -> u64 {
        self.cluster_id
    }

    /// Sets the TTL of the service safe point held for this backup.
    pub fn set_gc_ttl(&mut self, ttl: i64) {
        self.gc_ttl = if ttl <= 0 {
            DEFAULT_GC_SAFE_POINT_TTL_SECS
        } else {
            ttl
        };
    }

    pub fn gc_ttl(&self) -> i64 {
        self.gc_ttl
    }

    /// The timestamp the backup reads at: the caller's `ts` when non-zero,
    /// otherwise a fresh oracle timestamp shifted back by `timeago`. Either
    /// way the result must still be covered by the GC safe point.
    pub async fn backup_ts(&self, ts: u64, timeago: chrono::Duration) -> Result<TimeStamp> {
        let backup_ts = if ts > 0 {
            TimeStamp::new(ts)
        } else {
            let (physical, logical) = self.mgr.pd_client().get_ts().await?;
            let now = TimeStamp::compose(physical, logical);
            if timeago < chrono::Duration::zero() {
                return Err(Error::InvalidArgument(
                    "negative timeago is not allowed".to_owned(),
                ));
            }
            if timeago > chrono::Duration::zero() {
                info!("backup time ago"; "timeago" => ?timeago);
                let physical_ago = physical
                    .checked_sub(timeago.num_milliseconds() as u64)
                    .ok_or_else(|| {
                        Error::InvalidArgument(
                            "backup ts overflow please choose a smaller timeago".to_owned(),
                        )
                    })?;
                let backup_ts = TimeStamp::compose(physical_ago, logical);
                if backup_ts > now {
                    return Err(Error::InvalidArgument(
                        "backup ts overflow please choose a smaller timeago".to_owned(),
                    ));
                }
                backup_ts
            } else {
                now
            }
        };
        utils::check_gc_safe_point(self.mgr.pd_client().as_ref(), backup_ts).await?;
        info!("backup encode timestamp"; "backup_ts" => backup_ts.into_inner());
        Ok(backup_ts)
    }

    /// Registers the storage target, refusing one that already holds a
    /// backup or a running job's lock.
    pub async fn set_storage(&mut self, backend: StorageBackend) -> Result<()> {
        let storage = create_storage(&backend)?;
        for marker in [META_FILE, LOCK_FILE] {
            if storage.file_exists(marker).await? {
                return Err(Error::InvalidArgument(format!(
                    "{} exists in {}, there may be some backup files in the path already, \
                     please specify a correct backup directory",
                    marker,
                    backend.url()
                )));
            }
        }
        self.storage = Some(storage);
        self.backend = Some(backend);
        Ok(())
    }

    /// Writes the lock file, a readable warning to whoever browses the
    /// target while the backup runs.
    pub async fn set_lock_file(&self) -> Result<()> {
        self.storage()?
            .write_file(
                LOCK_FILE,
                b"DO NOT DELETE\n\
                  This file exists to remind other backup jobs won't use this path",
            )
            .await?;
        Ok(())
    }

    pub fn storage(&self) -> Result<&Arc<dyn ExternalStorage>> {
        self.storage
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("backup storage is not set".to_owned()))
    }

    fn backend_uri(&self) -> Result<String> {
        self.backend
            .as_ref()
            .map(|b| b.url().to_string())
            .ok_or_else(|| Error::InvalidArgument("backup storage is not set".to_owned()))
    }

    /// Backs up all `ranges`, at most `concurrency` of them in flight. The
    /// first fatal error cancels the remaining work.
    pub async fn backup_ranges(
        &self,
        ranges: Vec<Range>,
        req: BackupRequest,
        concurrency: usize,
        meta_sink: &dyn MetaSink,
        progress: ProgressCallback,
    ) -> Result<()> {
        let start = Instant::now();
        let res = futures::stream::iter(ranges)
            .map(Ok::<_, Error>)
            .try_for_each_concurrent(concurrency.max(1), |rg| {
                let req = req.clone();
                let progress = progress.clone();
                async move {
                    self.backup_range(&rg.start_key, &rg.end_key, req, meta_sink, &progress)
                        .await
                }
            })
            .await;
        info!("backup ranges finished"; "take" => ?start.elapsed());
        res
    }

    /// Backs up one key range and emits its file descriptors in key order.
    pub async fn backup_range(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        req: BackupRequest,
        meta_sink: &dyn MetaSink,
        progress: &ProgressCallback,
    ) -> Result<()> {
        let start = Instant::now();
        let res = self
            .backup_range_inner(start_key, end_key, req, meta_sink, progress)
            .await;
        BACKUP_RANGE_HISTOGRAM_VEC
            .with_label_values(&["range"])
            .observe(start.elapsed().as_secs_f64());
        info!("backup range finished"; "take" => ?start.elapsed());
        if let Err(e) = &res {
            let key = format!(
                "range start:{} end:{}",
                hex::encode(start_key),
                hex::encode(end_key)
            );
            summary::collect_failure_unit(&key, e);
            BACKUP_RANGE_ERROR_VEC.with_label_values(&[e.label()]).inc();
        }
        res
    }

    async fn backup_range_inner(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        mut req: BackupRequest,
        meta_sink: &dyn MetaSink,
        progress: &ProgressCallback,
    ) -> Result<()> {
        info!(
            "backup started";
            "start_key" => %redact(&start_key),
            "end_key" => %redact(&end_key),
            "rate_limit" => req.rate_limit,
            "concurrency" => req.concurrency
        );
        let all_stores = conn::all_data_stores(self.mgr.pd_client().as_ref()).await?;

        req.cluster_id = self.cluster_id;
        req.start_key = start_key.to_vec();
        req.end_key = end_key.to_vec();
        req.storage_backend = self.backend_uri()?;

        let push_start = Instant::now();
        let push = PushDown::new(self.mgr.clone());
        let mut results = push.push_backup(req.clone(), all_stores, progress).await?;
        BACKUP_RANGE_HISTOGRAM_VEC
            .with_label_values(&["push_down"])
            .observe(push_start.elapsed().as_secs_f64());
        info!("finish backup push down"; "ok_ranges" => results.len());

        // Find and back up the remaining sub-ranges.
        let fine_start = Instant::now();
        self.fine_grained_backup(start_key, end_key, &req, &mut results, progress)
            .await?;
        BACKUP_RANGE_HISTOGRAM_VEC
            .with_label_values(&["fine_grained"])
            .observe(fine_start.elapsed().as_secs_f64());

        progress(ProgressUnit::Range);

        if req.is_raw_kv {
            info!(
                "backup raw ranges";
                "start_key" => %redact(&start_key),
                "end_key" => %redact(&end_key),
                "cf" => %req.cf
            );
        } else {
            info!(
                "backup time range";
                "start_version" => req.start_version,
                "end_version" => req.end_version
            );
        }

        let mut emit_err = None;
        results.ascend(|rg| {
            for file in &rg.files {
                summary::collect_success_unit(summary::TOTAL_KV, 1, file.total_kvs);
                summary::collect_success_unit(summary::TOTAL_BYTES, 1, file.total_bytes);
            }
            // Keep the files of one sub-range together and in key order;
            // the sink relies on both.
            if let Err(e) = meta_sink.append_data_files(&rg.files) {
                emit_err = Some(e);
                return false;
            }
            true
        });
        if let Some(e) = emit_err {
            return Err(e);
        }

        check_dup_files(&results);
        Ok(())
    }

    /// Iterates until `range_tree` covers `[start_key, end_key)` or a fatal
    /// error occurs. The tree is only ever touched from this task; workers
    /// contribute through the response channel.
    async fn fine_grained_backup(
        &self,
        start_key: &[u8],
        end_key: &[u8],
        req: &BackupRequest,
        range_tree: &mut RangeTree,
        progress: &ProgressCallback,
    ) -> Result<()> {
        let mut bo = Backoffer::new(FINE_GRAINED_MAX_BACKOFF_MS);
        loop {
            // Step 1: is any sub-range still uncovered?
            let incomplete = range_tree.get_incomplete_range(start_key, end_key);
            if incomplete.is_empty() {
                return Ok(());
            }
            BACKUP_FINE_GRAINED_LOOP_COUNTER.inc();
            info!("start fine grained backup"; "incomplete" => incomplete.len());

            // Step 2: retry every uncovered sub-range on its region leader.
            let retry = Arc::new(StdMutex::new(VecDeque::from(incomplete)));
            let (resp_tx, mut resp_rx) = mpsc::channel::<BackupResponse>(4);
            let (err_tx, mut err_rx) = mpsc::channel::<Error>(4);
            let max_backoff_ms = Arc::new(StdMutex::new(0u64));

            let mut workers = Vec::with_capacity(FINE_GRAINED_WORKERS);
            for _ in 0..FINE_GRAINED_WORKERS {
                let retry = retry.clone();
                let resp_tx = resp_tx.clone();
                let err_tx = err_tx.clone();
                let max_backoff_ms = max_backoff_ms.clone();
                let mgr = self.mgr.clone();
                let req = req.clone();
                workers.push(tokio::spawn(async move {
                    loop {
                        let rg = retry.lock().unwrap().pop_front();
                        let rg = match rg {
                            Some(rg) => rg,
                            None => return,
                        };
                        match handle_fine_grained(&mgr, &rg, &req, &resp_tx).await {
                            Ok(backoff_ms) => {
                                if backoff_ms != 0 {
                                    let mut max = max_backoff_ms.lock().unwrap();
                                    if *max < backoff_ms {
                                        *max = backoff_ms;
                                    }
                                }
                            }
                            Err(e) => {
                                let _ = err_tx.send(e).await;
                                return;
                            }
                        }
                    }
                }));
            }
            // Keep only the workers' handles on the channels, so the
            // response channel closes exactly when every worker finished.
            drop(resp_tx);
            drop(err_tx);

            loop {
                tokio::select! {
                    Some(err) = err_rx.recv() => {
                        utils::abort_and_drain(std::mem::take(&mut workers)).await;
                        return Err(err);
                    }
                    resp = resp_rx.recv() => {
                        let resp = match resp {
                            Some(resp) => resp,
                            None => break,
                        };
                        // Workers only forward error-free responses.
                        debug_assert!(resp.error.is_none());
                        info!(
                            "put fine grained range";
                            "start_key" => %redact(&resp.start_key),
                            "end_key" => %redact(&resp.end_key)
                        );
                        if !range_tree.put(
                            resp.start_key.clone(),
                            resp.end_key.clone(),
                            resp.files,
                        ) {
                            error!(
                                "fine grained response overlaps a stored range";
                                "start_key" => %redact(&resp.start_key),
                                "end_key" => %redact(&resp.end_key)
                            );
                            continue;
                        }
                        progress(ProgressUnit::Region);
                    }
                }
            }
            for worker in workers {
                let _ = worker.await;
            }
            // The response channel may close before a late error wins the
            // race in the select above; it is buffered, so pick it up now.
            if let Ok(err) = err_rx.try_recv() {
                return Err(err);
            }

            // Step 3: back off if the pass asked for it, then repeat.
            let ms = *max_backoff_ms.lock().unwrap();
            if ms != 0 {
                info!("handle fine grained"; "backoff_ms" => ms);
                bo.backoff(ms).await?;
            }
        }
    }
}

async fn find_region_leader(pd: &dyn PdClient, key: &[u8]) -> Result<Peer> {
    for i in 0..FIND_LEADER_RETRY_TIMES {
        match pd.get_region(key).await {
            Ok(Some(region)) => {
                if let Some(leader) = region.leader {
                    info!(
                        "find leader";
                        "leader_store" => leader.store_id,
                        "key" => %redact(&key)
                    );
                    return Ok(leader);
                }
                warn!("region has no leader yet"; "key" => %redact(&key));
            }
            Ok(None) => warn!("no region found"; "key" => %redact(&key)),
            Err(e) => error!("find leader failed"; "err" => %e),
        }
        sleep(Duration::from_millis(100 * i)).await;
    }
    error!("can not find leader"; "key" => %redact(&key));
    Err(Error::NoLeader(key.to_vec()))
}

/// Retries one uncovered sub-range against its region leader. Returns the
/// backoff hint (ms) the next pass should honor; 0 means clean progress.
async fn handle_fine_grained(
    mgr: &Arc<dyn ClientMgr>,
    rg: &Range,
    req_template: &BackupRequest,
    resp_tx: &mpsc::Sender<BackupResponse>,
) -> Result<u64> {
    let leader = find_region_leader(mgr.pd_client().as_ref(), &rg.start_key).await?;
    let store_id = leader.store_id;

    let mut req = req_template.clone();
    // The sub-range may still cross a region boundary; the store answers
    // with per-region responses either way.
    req.start_key = rg.start_key.clone();
    req.end_key = rg.end_key.clone();

    let client = match mgr.backup_client(store_id).await {
        Ok(client) => client,
        Err(e @ Error::FailedToConnect { .. }) => {
            // The leader store may be down; give the raft election timer
            // time to fire before the next pass retries the range.
            warn!("failed to connect to store, skipping"; "err" => %e, "store_id" => store_id);
            return Ok(LEADER_DOWN_BACKOFF_MS);
        }
        Err(e) => {
            error!("fail to connect store"; "store_id" => store_id);
            return Err(e);
        }
    };

    let lock_resolver = mgr.lock_resolver();
    let backup_ts = TimeStamp::new(req.end_version);
    let has_progress = AtomicBool::new(false);
    let backoff_ms = AtomicU64::new(0);
    let res = send_backup(
        store_id,
        client,
        req.clone(),
        |resp| {
            let lock_resolver = lock_resolver.clone();
            let has_progress = &has_progress;
            let backoff_ms = &backoff_ms;
            async move {
                let (resp, should_backoff) =
                    on_backup_response(store_id, backup_ts, lock_resolver.as_ref(), resp).await?;
                backoff_ms.fetch_max(should_backoff, Ordering::SeqCst);
                if let Some(resp) = resp {
                    resp_tx.send(resp).await.map_err(|_| {
                        Error::Other("fine-grained supervisor is gone".into())
                    })?;
                }
                // An error response is progress too; otherwise an early EOF
                // would override its backoff hint.
                has_progress.store(true, Ordering::SeqCst);
                Ok(())
            }
        },
        || {
            let mgr = mgr.clone();
            async move {
                warn!("reset the connection in fine grained backup"; "store_id" => store_id);
                mgr.reset_backup_client(store_id).await
            }
        },
    )
    .await;
    if let Err(e) = res {
        if matches!(e, Error::FailedToConnect { .. }) {
            warn!("failed to connect to store, skipping"; "err" => %e, "store_id" => store_id);
            return Ok(LEADER_DOWN_BACKOFF_MS);
        }
        error!(
            "failed to send fine grained backup";
            "store_id" => store_id,
            "start_key" => %redact(&req.start_key),
            "end_key" => %redact(&req.end_key)
        );
        return Err(e);
    }

    // Nothing arrived at all: debounce before the next pass re-queues the
    // sub-range.
    if !has_progress.load(Ordering::SeqCst) {
        return Ok(NO_PROGRESS_BACKOFF_MS);
    }
    Ok(backoff_ms.load(Ordering::SeqCst))
}

/// Checks one backup response: pass it through, turn it into a backoff hint,
/// or fail. Lock resolution is delegated through the injected resolver, so
/// the decision itself stays deterministic.
pub async fn on_backup_response(
    store_id: u64,
    backup_ts: TimeStamp,
    lock_resolver: &dyn LockResolver,
    resp: BackupResponse,
) -> Result<(Option<BackupResponse>, u64)> {
    let err = match &resp.error {
        None => return Ok((Some(resp), 0)),
        Some(err) => err,
    };
    match &err.detail {
        Some(ErrorDetail::Kv(key_error)) => {
            if let Some(lock) = &key_error.locked {
                // Try to resolve the blocking lock.
                warn!("backup occur kv error"; "error" => %err, "store_id" => store_id);
                let ms_before_expired = lock_resolver.resolve_lock(backup_ts, lock).await?;
                return Ok((None, ms_before_expired));
            }
            // Backup should not meet any other kv error.
            error!("unexpected kv error"; "error" => %err, "store_id" => store_id);
            Err(Error::KvUnknown {
                store_id,
                msg: err.to_string(),
            })
        }
        Some(ErrorDetail::Region(region_error)) => {
            if region_error.is_retryable() {
                warn!("backup occur region error"; "error" => %err, "store_id" => store_id);
                return Ok((None, REGION_ERROR_BACKOFF_MS));
            }
            error!("unexpected region error"; "error" => %err, "store_id" => store_id);
            Err(Error::KvUnknown {
                store_id,
                msg: err.to_string(),
            })
        }
        Some(ErrorDetail::ClusterId { current, request }) => {
            error!("backup occur cluster ID error"; "error" => %err, "store_id" => store_id);
            Err(Error::ClusterIdMismatch {
                request: *request,
                current: *current,
            })
        }
        None => {
            if utils::message_is_retryable_storage_error(&err.msg) {
                warn!("backup occur storage error"; "error" => %err.msg, "store_id" => store_id);
                return Ok((None, STORAGE_ERROR_BACKOFF_MS));
            }
            error!("backup occur unknown error"; "error" => %err.msg, "store_id" => store_id);
            Err(Error::KvUnknown {
                store_id,
                msg: err.msg.clone(),
            })
        }
    }
}

/// Sends a backup request to one store, forwarding every streamed response
/// to `respond`. `respond` returning an error terminates the stream. A
/// store that is momentarily unavailable is reconnected through `reset` and
/// the call retried, a bounded number of times.
pub async fn send_backup<F, Fut, R, RFut>(
    store_id: u64,
    mut client: Arc<dyn BackupClient>,
    req: BackupRequest,
    mut respond: F,
    reset: R,
) -> Result<()>
where
    F: FnMut(BackupResponse) -> Fut,
    Fut: Future<Output = Result<()>>,
    R: Fn() -> RFut,
    RFut: Future<Output = Result<Arc<dyn BackupClient>>>,
{
    for retry in 0..BACKUP_RETRY_TIMES {
        info!(
            "try backup";
            "start_key" => %redact(&req.start_key),
            "end_key" => %redact(&req.end_key),
            "store_id" => store_id,
            "retry" => retry
        );
        let mut stream = match client.backup(req.clone()).await {
            Ok(stream) => stream,
            Err(e) if e.is_retryable() => {
                sleep(TRANSPORT_RETRY_INTERVAL).await;
                client = reset_client(store_id, &reset).await?;
                continue;
            }
            Err(e) => {
                error!("fail to backup"; "store_id" => store_id, "retry" => retry);
                return Err(Error::FailedToConnect {
                    store_id,
                    msg: format!("failed to create backup stream: {}", e),
                });
            }
        };
        loop {
            match stream.next().await {
                None => {
                    info!("backup streaming finish"; "store_id" => store_id, "retry" => retry);
                    return Ok(());
                }
                Some(Ok(resp)) => {
                    debug!(
                        "range backed up";
                        "start_key" => %redact(&resp.start_key),
                        "end_key" => %redact(&resp.end_key)
                    );
                    respond(resp).await?;
                }
                Some(Err(e)) if e.is_retryable() => {
                    // The store went away mid-stream; reconnect and retry
                    // the whole call.
                    sleep(TRANSPORT_RETRY_INTERVAL).await;
                    client = reset_client(store_id, &reset).await?;
                    break;
                }
                Some(Err(e)) => {
                    return Err(Error::FailedToConnect {
                        store_id,
                        msg: format!(
                            "failed to receive from backup stream (retry {}): {}",
                            retry, e
                        ),
                    });
                }
            }
        }
    }
    Err(Error::FailedToConnect {
        store_id,
        msg: format!("store unavailable after {} attempts", BACKUP_RETRY_TIMES),
    })
}

async fn reset_client<R, RFut>(store_id: u64, reset: &R) -> Result<Arc<dyn BackupClient>>
where
    R: Fn() -> RFut,
    RFut: Future<Output = Result<Arc<dyn BackupClient>>>,
{
    reset().await.map_err(|e| {
        Error::Other(
            format!(
                "failed to reset backup connection on store {}, please check the store status: {}",
                store_id, e
            )
            .into(),
        )
    })
}

/// Warns on output files whose names collide across the tree.
fn check_dup_files(range_tree: &RangeTree) {
    let mut files = HashSet::new();
    range_tree.ascend(|rg| {
        for file in &rg.files {
            if !files.insert(file.name.clone()) {
                error!("dup file"; "file" => %file.name);
            }
        }
        true
    });
}
