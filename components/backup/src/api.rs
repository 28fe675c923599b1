// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! The wire contract of the backup service.
//!
//! Every storage node exposes a server-streaming `Backup` call. The types
//! here mirror the protobuf messages one-to-one; the transport itself (stub
//! generation, TLS, keepalive) is provided by the embedding binary through
//! the [`BackupClient`] trait.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use pd_client::Peer;

/// One immutable sorted-string file produced by a store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct File {
    pub name: String,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub total_kvs: u64,
    pub total_bytes: u64,
    pub crc64xor: u64,
    pub cf: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CompressionType {
    #[default]
    Unknown,
    Lz4,
    Snappy,
    Zstd,
}

/// The request broadcast to stores. `start_key`/`end_key` bound the data to
/// back up; `end_version` is the snapshot timestamp.
#[derive(Clone, Debug, Default)]
pub struct BackupRequest {
    pub cluster_id: u64,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub start_version: u64,
    pub end_version: u64,
    pub rate_limit: u64,
    pub concurrency: u32,
    /// Opaque URI of the storage target, resolved by the store.
    pub storage_backend: String,
    pub is_raw_kv: bool,
    pub cf: String,
    pub compression_type: CompressionType,
    pub compression_level: i32,
}

/// One message of the response stream: either an error or an acknowledged
/// sub-range with its output files.
#[derive(Clone, Debug, Default)]
pub struct BackupResponse {
    pub error: Option<ResponseError>,
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub files: Vec<File>,
}

#[derive(Clone, Debug)]
pub struct ResponseError {
    pub msg: String,
    pub detail: Option<ErrorDetail>,
}

impl ResponseError {
    pub fn message(msg: impl Into<String>) -> ResponseError {
        ResponseError {
            msg: msg.into(),
            detail: None,
        }
    }

    pub fn detail(detail: ErrorDetail) -> ResponseError {
        ResponseError {
            msg: String::new(),
            detail: Some(detail),
        }
    }
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "{:?}", detail),
            None => f.write_str(&self.msg),
        }
    }
}

#[derive(Clone, Debug)]
pub enum ErrorDetail {
    ClusterId { current: u64, request: u64 },
    Kv(KeyError),
    Region(RegionError),
}

/// A per-key error. `locked` carries the blocking lock when the key is
/// locked by an in-flight transaction.
#[derive(Clone, Debug, Default)]
pub struct KeyError {
    pub locked: Option<LockInfo>,
    pub msg: String,
}

/// The lock blocking a read, as reported by the store.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LockInfo {
    pub key: Vec<u8>,
    pub primary_lock: Vec<u8>,
    pub lock_version: u64,
    pub lock_ttl: u64,
}

#[derive(Clone, Debug)]
pub enum RegionError {
    EpochNotMatch {
        msg: String,
    },
    NotLeader {
        region_id: u64,
        leader: Option<Peer>,
    },
    RegionNotFound {
        region_id: u64,
    },
    ServerIsBusy {
        reason: String,
    },
    StaleCommand,
    StoreNotMatch {
        request_store_id: u64,
        actual_store_id: u64,
    },
    ReadIndexNotReady {
        region_id: u64,
    },
    ProposalInMergingMode {
        region_id: u64,
    },
    Other(String),
}

impl RegionError {
    /// Whether the error resolves itself once the region settles (leader
    /// re-election, split, merge or a busy store draining its queue).
    pub fn is_retryable(&self) -> bool {
        !matches!(self, RegionError::Other(_))
    }
}

/// Status of a failed transport-level call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RpcStatusCode {
    Cancelled,
    Unknown,
    DeadlineExceeded,
    Unavailable,
}

#[derive(Clone, Debug)]
pub struct RpcError {
    pub code: RpcStatusCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcStatusCode, message: impl Into<String>) -> RpcError {
        RpcError {
            code,
            message: message.into(),
        }
    }

    /// Whether it is worth resetting the connection and retrying.
    pub fn is_retryable(&self) -> bool {
        self.code == RpcStatusCode::Unavailable
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// The response side of one streaming `Backup` call. The stream ends after
/// the store has sent its last response (EOF).
pub type ResponseStream = BoxStream<'static, std::result::Result<BackupResponse, RpcError>>;

/// A per-store backup client over an established connection.
#[async_trait]
pub trait BackupClient: Send + Sync {
    /// Opens a server-streaming backup call.
    async fn backup(&self, req: BackupRequest) -> std::result::Result<ResponseStream, RpcError>;
}
