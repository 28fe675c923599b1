// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use std::{error, io, result};

use thiserror::Error;

/// The error type for backup.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed to read schema meta: {0}")]
    MetaRead(String),
    #[error("no region leader found for key {}", hex::encode_upper(.0))]
    NoLeader(Vec<u8>),
    #[error("failed to connect to store {store_id}: {msg}")]
    FailedToConnect { store_id: u64, msg: String },
    #[error("unknown kv error on store {store_id}: {msg}")]
    KvUnknown { store_id: u64, msg: String },
    #[error("cluster ID mismatch: request {request}, current {current}")]
    ClusterIdMismatch { request: u64, current: u64 },
    #[error("backoff exceeds the max sleep of {limit_ms}ms")]
    BackoffExhausted { limit_ms: u64 },
    #[error("IO error {0}")]
    Io(#[from] io::Error),
    #[error("placement driver error {0}")]
    Pd(#[from] pd_client::Error),
    #[error("other error {0}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

impl Error {
    /// A stable label for metrics and the final summary.
    pub fn label(&self) -> &'static str {
        match self {
            Error::InvalidArgument(_) => "invalid_argument",
            Error::MetaRead(_) => "meta_read",
            Error::NoLeader(_) => "no_leader",
            Error::FailedToConnect { .. } => "failed_to_connect",
            Error::KvUnknown { .. } => "kv_unknown",
            Error::ClusterIdMismatch { .. } => "cluster_id_mismatch",
            Error::BackoffExhausted { .. } => "backoff_exhausted",
            Error::Io(_) => "io",
            Error::Pd(_) => "pd",
            Error::Other(_) => "other",
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
