// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! The push-down phase of a backup: fan one range request out to every
//! store and gather the acknowledged sub-ranges.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    api::{BackupRequest, BackupResponse, ErrorDetail},
    client::{send_backup, ProgressCallback, ProgressUnit},
    conn::ClientMgr,
    errors::{Error, Result},
    rtree::RangeTree,
    utils::{self, redact},
};

/// One push-down pass over a single range.
pub struct PushDown {
    mgr: Arc<dyn ClientMgr>,
}

impl PushDown {
    pub fn new(mgr: Arc<dyn ClientMgr>) -> PushDown {
        PushDown { mgr }
    }

    /// Broadcasts `req` to `stores` and collects every acknowledged
    /// sub-range into a fresh range tree.
    ///
    /// Workers stream raw responses into one channel; this task is the sole
    /// writer of the tree. A cluster ID mismatch aborts the whole pass;
    /// other response-level errors leave a gap for the fine-grained phase.
    pub async fn push_backup(
        &self,
        req: BackupRequest,
        stores: Vec<pd_client::Store>,
        progress: &ProgressCallback,
    ) -> Result<RangeTree> {
        let mut res = RangeTree::new();
        let (resp_tx, mut resp_rx) = mpsc::unbounded_channel::<BackupResponse>();
        let (err_tx, mut err_rx) = mpsc::unbounded_channel::<Error>();

        let mut workers = Vec::with_capacity(stores.len());
        for store in &stores {
            let store_id = store.id;
            let client = match self.mgr.backup_client(store_id).await {
                Ok(client) => client,
                Err(e) => {
                    error!("fail to connect store"; "store_id" => store_id);
                    utils::abort_and_drain(std::mem::take(&mut workers)).await;
                    return Err(e);
                }
            };
            let mgr = self.mgr.clone();
            let req = req.clone();
            let resp_tx = resp_tx.clone();
            let err_tx = err_tx.clone();
            workers.push(tokio::spawn(async move {
                let res = send_backup(
                    store_id,
                    client,
                    req,
                    |resp| {
                        let resp_tx = resp_tx.clone();
                        async move {
                            resp_tx.send(resp).map_err(|_| {
                                Error::Other("push-down supervisor is gone".into())
                            })?;
                            Ok(())
                        }
                    },
                    || {
                        let mgr = mgr.clone();
                        async move {
                            warn!("reset the connection in push down"; "store_id" => store_id);
                            mgr.reset_backup_client(store_id).await
                        }
                    },
                )
                .await;
                if let Err(e) = res {
                    let _ = err_tx.send(e);
                }
            }));
        }
        // Keep only the workers' handles on the channels, so the response
        // channel closes exactly when every worker has finished.
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
                        // All workers finished and the buffered responses
                        // are drained. A worker error may still sit in its
                        // channel if the close won the race above.
                        None => {
                            return match err_rx.try_recv() {
                                Ok(err) => Err(err),
                                Err(_) => Ok(res),
                            };
                        }
                    };
                    match &resp.error {
                        None => {
                            if !res.put(
                                resp.start_key.clone(),
                                resp.end_key.clone(),
                                resp.files,
                            ) {
                                error!(
                                    "backup response overlaps a stored range";
                                    "start_key" => %redact(&resp.start_key),
                                    "end_key" => %redact(&resp.end_key)
                                );
                                continue;
                            }
                            progress(ProgressUnit::Region);
                        }
                        Some(err) => match &err.detail {
                            Some(ErrorDetail::ClusterId { current, request }) => {
                                error!("backup occur cluster ID error"; "error" => %err);
                                utils::abort_and_drain(std::mem::take(&mut workers)).await;
                                return Err(Error::ClusterIdMismatch {
                                    request: *request,
                                    current: *current,
                                });
                            }
                            _ => {
                                // Leave the sub-range uncovered; the
                                // fine-grained phase will find the gap.
                                warn!(
                                    "backup occur error, the sub-range will be retried";
                                    "error" => %err,
                                    "start_key" => %redact(&resp.start_key),
                                    "end_key" => %redact(&resp.end_key)
                                );
                            }
                        },
                    }
                }
            }
        }
    }
}
