// Copyright 2020 TiKV Project Authors. Licensed under Apache-2.0.

//! Point-in-time schema enumeration.
//!
//! Reads a metadata snapshot at the backup timestamp and turns every matched
//! table into key ranges for the coordinator, rebasing id allocators along
//! the way so a later restore can resume allocation without collisions. This
//! is the only place a captured table descriptor is mutated; downstream code
//! treats it as immutable.

use pd_client::TimeStamp;

use crate::{
    errors::{Error, Result},
    rtree::Range,
    tablecodec,
};

pub type MetaError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DbInfo {
    pub id: i64,
    pub name: String,
}

/// Lifecycle state of a schema object. Only `Public` objects are visible to
/// reads and worth backing up.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SchemaState {
    #[default]
    None,
    DeleteOnly,
    WriteOnly,
    WriteReorganization,
    Public,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexInfo {
    pub id: i64,
    pub name: String,
    pub state: SchemaState,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionDefinition {
    pub id: i64,
    pub name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    pub definitions: Vec<PartitionDefinition>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TableKind {
    #[default]
    Table,
    View,
    Sequence,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TableInfo {
    pub id: i64,
    pub name: String,
    pub kind: TableKind,
    pub indices: Vec<IndexInfo>,
    pub partition: Option<PartitionInfo>,
    pub pk_is_handle: bool,
    pub auto_random_bits: u64,
    pub has_auto_increment: bool,
    /// Rebased during enumeration: the next row/auto-increment id.
    pub auto_inc_id: i64,
    /// Rebased during enumeration: the next auto-random id.
    pub auto_rand_id: i64,
}

impl TableInfo {
    pub fn is_view(&self) -> bool {
        self.kind == TableKind::View
    }

    pub fn is_sequence(&self) -> bool {
        self.kind == TableKind::Sequence
    }

    pub fn contains_auto_random_bits(&self) -> bool {
        self.auto_random_bits > 0
    }

    /// Whether the table allocates row ids or auto-increment ids at all.
    pub fn need_auto_id(&self) -> bool {
        !self.pk_is_handle || self.has_auto_increment
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum AllocatorKind {
    RowId,
    Sequence,
    AutoRandom,
}

/// A read-only view of the schema metadata at one snapshot timestamp.
pub trait SnapshotMeta {
    fn list_databases(&self) -> std::result::Result<Vec<DbInfo>, MetaError>;
    fn list_tables(&self, db_id: i64) -> std::result::Result<Vec<TableInfo>, MetaError>;
}

/// An id allocator bound to one database.
pub trait IdAllocator {
    /// Reads the next value the allocator would hand out, without claiming
    /// it.
    fn next_global_auto_id(&self, table_id: i64) -> std::result::Result<i64, MetaError>;
}

/// Storage that can open schema snapshots and the per-database allocators.
pub trait MetaStorage {
    fn snapshot_meta(
        &self,
        ts: TimeStamp,
    ) -> std::result::Result<Box<dyn SnapshotMeta + '_>, MetaError>;
    fn id_allocator(&self, db_id: i64, kind: AllocatorKind) -> Box<dyn IdAllocator + '_>;
}

/// Selects the databases and tables a backup covers.
pub trait TableFilter {
    fn match_schema(&self, db: &str) -> bool;
    fn match_table(&self, db: &str, table: &str) -> bool;
}

// Databases owned by the system itself. Their content is derived or
// node-local and is excluded from every backup, whatever the user filter
// matches.
const SYSTEM_DATABASES: &[&str] = &[
    "information_schema",
    "performance_schema",
    "metrics_schema",
    "mysql",
];

pub fn is_system_database(name: &str) -> bool {
    let name = name.to_lowercase();
    SYSTEM_DATABASES.iter().any(|db| name == *db)
}

/// The schema objects a backup captured, in (database name, table name)
/// order.
#[derive(Default)]
pub struct Schemas {
    entries: Vec<(DbInfo, TableInfo)>,
}

impl Schemas {
    fn push(&mut self, db: DbInfo, table: TableInfo) {
        self.entries.push((db, table));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(DbInfo, TableInfo)> {
        self.entries.iter()
    }
}

/// Returns the key ranges encompassing the entire table: row data plus every
/// public index, per partition if the table is partitioned.
pub fn build_table_ranges(tbl: &TableInfo) -> Vec<Range> {
    match &tbl.partition {
        None => append_ranges(tbl, tbl.id),
        Some(partition) => {
            let mut ranges =
                Vec::with_capacity(partition.definitions.len() * (tbl.indices.len() + 1));
            for def in &partition.definitions {
                ranges.extend(append_ranges(tbl, def.id));
            }
            ranges
        }
    }
}

fn append_ranges(tbl: &TableInfo, physical_id: i64) -> Vec<Range> {
    let mut ranges = Vec::with_capacity(tbl.indices.len() + 1);
    let (start, end) = tablecodec::table_record_range(physical_id);
    ranges.push(Range::new(start, end));
    for index in &tbl.indices {
        if index.state != SchemaState::Public {
            continue;
        }
        let (start, end) = tablecodec::table_index_range(physical_id, index.id);
        ranges.push(Range::new(start, end));
    }
    ranges
}

/// Enumerates the schema at `backup_ts` and returns the key ranges and table
/// descriptors of everything the filter matches.
///
/// Matched descriptors come back with their id allocators rebased and
/// non-public indexes dropped. An empty result is not an error.
pub fn build_backup_range_and_schema(
    storage: &dyn MetaStorage,
    table_filter: &dyn TableFilter,
    backup_ts: TimeStamp,
) -> Result<(Vec<Range>, Schemas)> {
    let meta = storage.snapshot_meta(backup_ts).map_err(|e| {
        Error::InvalidArgument(format!(
            "unreadable schema snapshot at {}: {}",
            backup_ts, e
        ))
    })?;

    let mut dbs = meta
        .list_databases()
        .map_err(|e| Error::MetaRead(format!("list databases: {}", e)))?;
    dbs.sort_by(|a, b| a.name.cmp(&b.name));

    let mut ranges = Vec::new();
    let mut backup_schemas = Schemas::default();
    for db in dbs {
        if !table_filter.match_schema(&db.name) || is_system_database(&db.name) {
            continue;
        }

        let id_alloc = storage.id_allocator(db.id, AllocatorKind::RowId);
        let seq_alloc = storage.id_allocator(db.id, AllocatorKind::Sequence);
        let rand_alloc = storage.id_allocator(db.id, AllocatorKind::AutoRandom);

        let mut tables = meta
            .list_tables(db.id)
            .map_err(|e| Error::MetaRead(format!("list tables of {}: {}", db.name, e)))?;
        if tables.is_empty() {
            warn!("it's not necessary for backing up empty database"; "db" => %db.name);
            continue;
        }
        tables.sort_by(|a, b| a.name.cmp(&b.name));

        for mut table in tables {
            if !table_filter.match_table(&db.name, &table.name) {
                continue;
            }

            let global_auto_id = if table.is_sequence() {
                Some(seq_alloc.next_global_auto_id(table.id))
            } else if table.is_view() || !table.need_auto_id() {
                // No auto id for views or tables with neither row id nor
                // auto-increment id.
                None
            } else {
                Some(id_alloc.next_global_auto_id(table.id))
            };
            // A table without an allocator resets the captured value to
            // zero, so a stale snapshot value never reaches restore.
            table.auto_inc_id = global_auto_id
                .transpose()
                .map_err(|e| {
                    Error::MetaRead(format!("rebase auto id of {}: {}", table.name, e))
                })?
                .unwrap_or(0);
            debug!(
                "change table auto inc id";
                "db" => %db.name,
                "table" => %table.name,
                "auto_inc_id" => table.auto_inc_id
            );

            if table.pk_is_handle && table.contains_auto_random_bits() {
                // The auto-random allocator needs rebasing as well so a
                // restore can resume allocation.
                table.auto_rand_id =
                    rand_alloc.next_global_auto_id(table.id).map_err(|e| {
                        Error::MetaRead(format!(
                            "rebase auto random id of {}: {}",
                            table.name, e
                        ))
                    })?;
                debug!(
                    "change table auto random id";
                    "db" => %db.name,
                    "table" => %table.name,
                    "auto_rand_id" => table.auto_rand_id
                );
            }

            // Drop all non-public indexes from the captured descriptor.
            table.indices.retain(|idx| idx.state == SchemaState::Public);

            ranges.extend(build_table_ranges(&table));
            backup_schemas.push(db.clone(), table);
        }
    }

    if backup_schemas.is_empty() {
        info!("nothing to backup");
        return Ok((Vec::new(), backup_schemas));
    }
    Ok((ranges, backup_schemas))
}
