// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! External storage support.
//!
//! Backup artifacts are written by the storage nodes themselves; the
//! coordinator only touches the target for small marker and metadata files.
//! This crate defines the storage interface plus the two built-in drivers
//! (`local://` and `noop://`). Cloud drivers live in the embedding binary.

#[macro_use]
extern crate slog_global;

use std::{io, path::Path, sync::Arc};

use async_trait::async_trait;

mod local;
pub use local::LocalStorage;
mod noop;
pub use noop::NoopStorage;

/// An abstraction of an external storage target.
#[async_trait]
pub trait ExternalStorage: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn url(&self) -> io::Result<url::Url>;

    /// Writes `data` to the given relative path, replacing any existing file.
    async fn write_file(&self, name: &str, data: &[u8]) -> io::Result<()>;

    /// Reads the whole content of the given relative path.
    async fn read_file(&self, name: &str) -> io::Result<Vec<u8>>;

    /// Whether a file exists at the given relative path.
    async fn file_exists(&self, name: &str) -> io::Result<bool>;
}

/// A parsed description of a storage target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageBackend {
    Local(std::path::PathBuf),
    Noop,
}

impl StorageBackend {
    /// Parses an opaque URI (`local:///dir`, `noop://`) into a backend.
    pub fn from_uri(uri: &str) -> io::Result<StorageBackend> {
        let url = url::Url::parse(uri)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        match url.scheme() {
            "local" | "file" => Ok(StorageBackend::Local(Path::new(url.path()).to_owned())),
            "noop" => Ok(StorageBackend::Noop),
            other => {
                error!("unknown storage"; "scheme" => %other);
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown storage {}", uri),
                ))
            }
        }
    }

    pub fn url(&self) -> url::Url {
        match self {
            StorageBackend::Local(p) => {
                let mut u = url::Url::parse("local:///").unwrap();
                u.set_path(&p.to_string_lossy());
                u
            }
            StorageBackend::Noop => url::Url::parse("noop:///").unwrap(),
        }
    }
}

/// Creates a new storage from the given backend description.
pub fn create_storage(backend: &StorageBackend) -> io::Result<Arc<dyn ExternalStorage>> {
    match backend {
        StorageBackend::Local(p) => LocalStorage::new(p).map(|s| Arc::new(s) as _),
        StorageBackend::Noop => Ok(Arc::new(NoopStorage::default()) as _),
    }
}
