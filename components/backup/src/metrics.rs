// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

use lazy_static::*;
use prometheus::*;

lazy_static! {
    pub static ref BACKUP_RANGE_HISTOGRAM_VEC: HistogramVec = register_histogram_vec!(
        "backup_range_duration_seconds",
        "Bucketed histogram of backup range duration",
        &["type"]
    )
    .unwrap();
    pub static ref BACKUP_RANGE_ERROR_VEC: IntCounterVec = register_int_counter_vec!(
        "backup_error_counter",
        "Total number of backup errors",
        &["error"]
    )
    .unwrap();
    pub static ref BACKUP_STORE_RESET_COUNTER: IntCounter = register_int_counter!(
        "backup_store_reset_counter",
        "Total number of backup connection resets"
    )
    .unwrap();
    pub static ref BACKUP_FINE_GRAINED_LOOP_COUNTER: IntCounter = register_int_counter!(
        "backup_fine_grained_loop_counter",
        "Total number of fine grained backup iterations"
    )
    .unwrap();
}
