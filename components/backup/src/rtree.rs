// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! An ordered container of the sub-ranges a backup has covered so far.
//!
//! The tree is keyed by start key and never stores two overlapping
//! intervals. Intervals are kept exactly as inserted: adjacent intervals are
//! not merged, and an interval equal to a stored one only contributes its
//! files (replicas of one region report the same boundaries with different
//! files). A single supervisor task owns the tree; workers hand it data
//! through a response channel.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::api::File;

/// A sub-range of the keyspace. `end_key` empty means unbounded above.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Range {
    pub start_key: Vec<u8>,
    pub end_key: Vec<u8>,
    pub files: Vec<File>,
}

impl Range {
    pub fn new(start_key: Vec<u8>, end_key: Vec<u8>) -> Range {
        Range {
            start_key,
            end_key,
            files: Vec::new(),
        }
    }

    /// Clips `[start, end)` to this range, or `None` if they do not
    /// intersect. Empty end keys are unbounded.
    pub fn intersect(&self, start: &[u8], end: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        if !self.end_key.is_empty() && start >= self.end_key.as_slice() {
            return None;
        }
        if !end.is_empty() && end <= self.start_key.as_slice() {
            return None;
        }
        let sub_start = if start > self.start_key.as_slice() {
            start.to_vec()
        } else {
            self.start_key.clone()
        };
        let sub_end = if end.is_empty() {
            self.end_key.clone()
        } else if self.end_key.is_empty() || end < self.end_key.as_slice() {
            end.to_vec()
        } else {
            self.end_key.clone()
        };
        Some((sub_start, sub_end))
    }
}

#[derive(Debug, Default)]
pub struct RangeTree(BTreeMap<Vec<u8>, Range>);

impl RangeTree {
    pub fn new() -> RangeTree {
        RangeTree::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The stored range covering `key`, if any.
    fn get_by_point(&self, key: &[u8]) -> Option<&Range> {
        self.0
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(key)))
            .next_back()
            .map(|(_, rg)| rg)
            .filter(|rg| rg.end_key.is_empty() || rg.end_key.as_slice() > key)
    }

    /// Some stored range intersecting `[start_key, end_key)`, if any.
    pub fn find_overlapping(&self, start_key: &[u8], end_key: &[u8]) -> Option<&Range> {
        if let Some(rg) = self.get_by_point(start_key) {
            return Some(rg);
        }
        let upper = if end_key.is_empty() {
            Bound::Unbounded
        } else {
            Bound::Excluded(end_key)
        };
        self.0
            .range::<[u8], _>((Bound::Excluded(start_key), upper))
            .map(|(_, rg)| rg)
            .next()
    }

    /// Inserts a covered sub-range with its files.
    ///
    /// An interval equal to a stored one appends its files to it. A partial
    /// overlap with any stored interval is refused (`false`); the caller
    /// holds that to be a bug on its side.
    pub fn put(&mut self, start_key: Vec<u8>, end_key: Vec<u8>, files: Vec<File>) -> bool {
        if !end_key.is_empty() && start_key >= end_key {
            return false;
        }
        if let Some(exist) = self.0.get_mut(&start_key) {
            if exist.end_key == end_key {
                exist.files.extend(files);
                return true;
            }
            return false;
        }
        if self.find_overlapping(&start_key, &end_key).is_some() {
            return false;
        }
        self.0.insert(
            start_key.clone(),
            Range {
                start_key,
                end_key,
                files,
            },
        );
        true
    }

    /// Returns the maximal sub-ranges of `[start_key, end_key)` not covered
    /// by any stored interval, in key order. Returns the whole request when
    /// the tree is empty.
    pub fn get_incomplete_range(&self, start_key: &[u8], end_key: &[u8]) -> Vec<Range> {
        if !start_key.is_empty() && start_key == end_key {
            return Vec::new();
        }
        let mut incomplete = Vec::new();
        let request = Range::new(start_key.to_vec(), end_key.to_vec());
        let mut last_end = start_key.to_vec();
        // Start iterating from the range covering the start key, so a range
        // inserted with a smaller start key still counts as coverage.
        let pivot = self
            .get_by_point(start_key)
            .map_or_else(|| start_key.to_vec(), |rg| rg.start_key.clone());
        let ranges = self
            .0
            .range::<[u8], _>((Bound::Included(pivot.as_slice()), Bound::Unbounded))
            .map(|(_, rg)| rg);
        for rg in ranges {
            if !end_key.is_empty() && rg.start_key.as_slice() >= end_key {
                break;
            }
            if last_end.as_slice() < rg.start_key.as_slice() {
                if let Some((start, end)) = request.intersect(&last_end, &rg.start_key) {
                    incomplete.push(Range::new(start, end));
                }
            }
            if rg.end_key.is_empty() {
                // Covered all the way up.
                return incomplete;
            }
            if last_end < rg.end_key {
                last_end = rg.end_key.clone();
            }
            if !end_key.is_empty() && last_end.as_slice() >= end_key {
                return incomplete;
            }
        }
        if let Some((start, end)) = request.intersect(&last_end, end_key) {
            incomplete.push(Range::new(start, end));
        }
        incomplete
    }

    /// In-order traversal. The visitor returning `false` halts it.
    pub fn ascend<F>(&self, mut visitor: F)
    where
        F: FnMut(&Range) -> bool,
    {
        for rg in self.0.values() {
            if !visitor(rg) {
                break;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> {
        self.0.values()
    }
}
