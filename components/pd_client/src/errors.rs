// Copyright 2021 TiKV Project Authors. Licensed under Apache-2.0.

use std::{error, result};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("region is not found for key {}", hex::encode_upper(.0))]
    RegionNotFound(Vec<u8>),
    #[error("store {0} is not found")]
    StoreNotFound(u64),
    #[error("cluster {0} is not bootstrapped")]
    ClusterNotBootstrapped(u64),
    #[error("unknown error {0:?}")]
    Other(#[from] Box<dyn error::Error + Sync + Send>),
}

pub type Result<T> = result::Result<T, Error>;
