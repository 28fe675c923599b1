// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use std::io;

use async_trait::async_trait;

use super::ExternalStorage;

const STORAGE_NAME: &str = "noop";

/// A storage that saves files into void.
/// It is mainly for test use.
#[derive(Clone, Default)]
pub struct NoopStorage {}

fn url_for() -> url::Url {
    url::Url::parse("noop:///").unwrap()
}

#[async_trait]
impl ExternalStorage for NoopStorage {
    fn name(&self) -> &'static str {
        STORAGE_NAME
    }

    fn url(&self) -> io::Result<url::Url> {
        Ok(url_for())
    }

    async fn write_file(&self, _name: &str, _data: &[u8]) -> io::Result<()> {
        Ok(())
    }

    async fn read_file(&self, _name: &str) -> io::Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn file_exists(&self, _name: &str) -> io::Result<bool> {
        Ok(false)
    }
}
