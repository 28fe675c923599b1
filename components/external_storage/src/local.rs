// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    io,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tokio::{fs::File, io::AsyncWriteExt};

use super::ExternalStorage;

const STORAGE_NAME: &str = "local";
// Temporary suffix used while a write is in flight. A crashed write leaves a
// `.tmp` file behind instead of a truncated target.
const TMP_SUFFIX: &str = ".tmp";

/// A storage saves files in the local file system.
#[derive(Clone)]
pub struct LocalStorage {
    base: PathBuf,
}

impl LocalStorage {
    /// Creates a new local storage rooted at `base`, creating the directory
    /// if it does not yet exist.
    pub fn new(base: &Path) -> io::Result<LocalStorage> {
        std::fs::create_dir_all(base)?;
        Ok(LocalStorage {
            base: base.to_owned(),
        })
    }

    fn path_of(&self, name: &str) -> PathBuf {
        self.base.join(name)
    }
}

#[async_trait]
impl ExternalStorage for LocalStorage {
    fn name(&self) -> &'static str {
        STORAGE_NAME
    }

    fn url(&self) -> io::Result<url::Url> {
        let mut u = url::Url::parse("local:///").unwrap();
        u.set_path(&self.base.to_string_lossy());
        Ok(u)
    }

    async fn write_file(&self, name: &str, data: &[u8]) -> io::Result<()> {
        // Write to a temporary sibling and rename, so a concurrent reader
        // never observes a half-written file.
        let tmp = self.path_of(&format!("{}{}", name, TMP_SUFFIX));
        let mut file = File::create(&tmp).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);
        tokio::fs::rename(&tmp, self.path_of(name)).await
    }

    async fn read_file(&self, name: &str) -> io::Result<Vec<u8>> {
        tokio::fs::read(self.path_of(name)).await
    }

    async fn file_exists(&self, name: &str) -> io::Result<bool> {
        match tokio::fs::metadata(self.path_of(name)).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}
