// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! Collects per-unit outcomes of a backup run for the final report.

use std::{
    collections::{BTreeMap, HashMap},
    sync::Mutex,
};

use lazy_static::lazy_static;

use crate::errors::Error;

pub const TOTAL_KV: &str = "total kv";
pub const TOTAL_BYTES: &str = "total bytes";

#[derive(Default)]
struct Collector {
    success_units: BTreeMap<&'static str, (u64, u64)>,
    failure_units: HashMap<String, String>,
}

lazy_static! {
    static ref COLLECTOR: Mutex<Collector> = Mutex::new(Collector::default());
}

/// Records `count` successful units of `name` carrying `value` (bytes, kvs).
pub fn collect_success_unit(name: &'static str, count: u64, value: u64) {
    let mut c = COLLECTOR.lock().unwrap();
    let entry = c.success_units.entry(name).or_insert((0, 0));
    entry.0 += count;
    entry.1 += value;
}

/// Records the failure of one unit, keyed by a human-readable identifier.
pub fn collect_failure_unit(key: &str, err: &Error) {
    let mut c = COLLECTOR.lock().unwrap();
    c.failure_units
        .entry(key.to_owned())
        .or_insert_with(|| err.to_string());
}

/// Logs the collected outcome of the whole run and resets the collector.
pub fn summary(name: &str) {
    let mut c = COLLECTOR.lock().unwrap();
    if c.failure_units.is_empty() {
        for (unit, (count, value)) in &c.success_units {
            info!("backup summary"; "name" => %name, "unit" => %unit, "count" => count, "total" => value);
        }
    } else {
        for (key, reason) in &c.failure_units {
            error!("backup failed"; "name" => %name, "unit" => %key, "error" => %reason);
        }
    }
    *c = Collector::default();
}

#[cfg(test)]
pub fn has_failure_unit(key: &str) -> bool {
    COLLECTOR.lock().unwrap().failure_units.contains_key(key)
}

#[cfg(test)]
pub fn failure_unit_reason(key: &str) -> Option<String> {
    COLLECTOR.lock().unwrap().failure_units.get(key).cloned()
}

#[cfg(test)]
pub fn success_unit(name: &'static str) -> Option<(u64, u64)> {
    COLLECTOR.lock().unwrap().success_units.get(name).copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    // The collector is process-wide and other tests feed it concurrently, so
    // assertions below stick to units no other test touches.
    #[test]
    fn test_collect_units() {
        const UNIT: &str = "summary test unit";
        collect_success_unit(UNIT, 1, 100);
        collect_success_unit(UNIT, 1, 50);
        assert_eq!(success_unit(UNIT), Some((2, 150)));

        let key = "range start:f0 end:f1";
        collect_failure_unit(key, &Error::InvalidArgument("boom".to_owned()));
        // The first reason for a unit wins.
        collect_failure_unit(key, &Error::InvalidArgument("later".to_owned()));
        assert!(has_failure_unit(key));
        assert_eq!(
            failure_unit_reason(key),
            Some("invalid argument: boom".to_owned())
        );
    }
}
