// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use pd_client::{PdClient, TimeStamp};
use tokio::task::JoinHandle;

use crate::errors::{Error, Result};

static REDACT_INFO_LOG: AtomicBool = AtomicBool::new(false);

/// Whether user keys are suppressed in log output and error messages.
pub fn set_redact_info_log(redact: bool) {
    REDACT_INFO_LOG.store(redact, Ordering::Relaxed);
}

/// A user key prepared for logging: hex-encoded, or suppressed entirely when
/// redaction is enabled.
pub struct Value<'a>(pub &'a [u8]);

/// Wrap a user key for a log field.
pub fn redact(key: &impl AsRef<[u8]>) -> Value<'_> {
    Value(key.as_ref())
}

impl fmt::Display for Value<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if REDACT_INFO_LOG.load(Ordering::Relaxed) {
            f.write_str("?")
        } else {
            f.write_str(&hex::encode_upper(self.0))
        }
    }
}

impl slog::Value for Value<'_> {
    fn serialize(
        &self,
        _record: &slog::Record<'_>,
        key: slog::Key,
        serializer: &mut dyn slog::Serializer,
    ) -> slog::Result {
        serializer.emit_arguments(key, &format_args!("{}", self))
    }
}

// Messages of storage-side failures that are worth a retry: the object store
// was briefly unreachable or throttling. Matched case-insensitively against
// the error message because the stores report them unstructured.
const RETRYABLE_SERVER_ERRORS: &[&str] = &[
    "server closed",
    "connection refused",
    "connection reset by peer",
    "channel closed",
    "error trying to connect",
    "connection closed before message completed",
    "body write aborted",
    "error during dispatch",
    "put object timeout",
];

pub fn message_is_retryable_storage_error(msg: &str) -> bool {
    let msg = msg.to_lowercase();
    RETRYABLE_SERVER_ERRORS.iter().any(|e| msg.contains(e))
}

/// Fails if `backup_ts` is no longer preserved by the garbage collector.
pub async fn check_gc_safe_point(pd: &dyn PdClient, backup_ts: TimeStamp) -> Result<()> {
    let safe_point = pd.get_gc_safe_point().await?;
    if backup_ts <= safe_point {
        return Err(Error::InvalidArgument(format!(
            "backup ts {} is earlier than the GC safe point {}",
            backup_ts, safe_point
        )));
    }
    Ok(())
}

/// Aborts every pending task and waits for them to wind down.
pub async fn abort_and_drain<T>(mut pending: Vec<JoinHandle<T>>) {
    for join in pending.iter() {
        join.abort();
    }
    while let Some(join) = pending.pop() {
        let _ = join.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_storage_error() {
        assert!(message_is_retryable_storage_error(
            "failed to put file: Connection Reset by Peer"
        ));
        assert!(message_is_retryable_storage_error("put object timeout"));
        assert!(!message_is_retryable_storage_error("sst corrupted"));
        assert!(!message_is_retryable_storage_error(""));
    }

    #[test]
    fn test_redact() {
        set_redact_info_log(false);
        assert_eq!(format!("{}", redact(&b"\x01a")), "0161");
        set_redact_info_log(true);
        assert_eq!(format!("{}", redact(&b"\x01a")), "?");
        set_redact_info_log(false);
    }
}
