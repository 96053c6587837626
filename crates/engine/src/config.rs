//! Engine configuration: a fluent builder over everything spec.md §6 names
//! as programmatic (no environment variables, no config file).

use std::path::PathBuf;

/// One table's static shape, fixed at engine construction (spec.md §3:
/// "tables are direct array-indexed structures sized at construction").
#[derive(Debug, Clone)]
pub struct TableConfig {
    pub table_id: u32,
    pub num_records: usize,
    pub record_size: usize,
}

/// Everything the core accepts as configuration (spec.md §6): worker thread
/// count, per-table record counts, batch size, starting epoch, log path,
/// and `allow_restore`. Per-table free-list (version buffer) sizing is a
/// single shared byte budget, matching the per-worker allocator's
/// construction in spec.md §4.2.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub(crate) num_workers: usize,
    pub(crate) tables: Vec<TableConfig>,
    pub(crate) batch_size: usize,
    pub(crate) starting_epoch: u32,
    pub(crate) log_path: PathBuf,
    pub(crate) allow_restore: bool,
    pub(crate) version_buffer_capacity_bytes: usize,
    pub(crate) queue_capacity: usize,
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn starting_epoch(&self) -> u32 {
        self.starting_epoch
    }

    pub fn tables(&self) -> &[TableConfig] {
        &self.tables
    }

    pub fn log_path(&self) -> &std::path::Path {
        &self.log_path
    }

    pub fn allow_restore(&self) -> bool {
        self.allow_restore
    }

    pub fn version_buffer_capacity_bytes(&self) -> usize {
        self.version_buffer_capacity_bytes
    }

    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }
}

/// Fluent builder, matching the teacher's `DatabaseBuilder` pattern.
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    num_workers: usize,
    tables: Vec<TableConfig>,
    batch_size: usize,
    starting_epoch: u32,
    log_path: PathBuf,
    allow_restore: bool,
    version_buffer_capacity_bytes: usize,
    queue_capacity: usize,
}

impl EngineConfigBuilder {
    fn new() -> Self {
        EngineConfigBuilder {
            num_workers: 1,
            tables: Vec::new(),
            batch_size: 64,
            starting_epoch: 0,
            log_path: PathBuf::from("chronodb.log"),
            allow_restore: false,
            version_buffer_capacity_bytes: 1024 * 1024,
            queue_capacity: 1024,
        }
    }

    pub fn num_workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    pub fn table(mut self, table_id: u32, num_records: usize, record_size: usize) -> Self {
        self.tables.push(TableConfig { table_id, num_records, record_size });
        self
    }

    pub fn batch_size(mut self, n: usize) -> Self {
        self.batch_size = n;
        self
    }

    pub fn starting_epoch(mut self, epoch: u32) -> Self {
        self.starting_epoch = epoch;
        self
    }

    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    pub fn allow_restore(mut self, allow: bool) -> Self {
        self.allow_restore = allow;
        self
    }

    pub fn version_buffer_capacity_bytes(mut self, bytes: usize) -> Self {
        self.version_buffer_capacity_bytes = bytes;
        self
    }

    /// Bounded inter-stage queue capacity (spec.md §4.6, default 1024).
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Validate and freeze the configuration. Per spec.md §7, a
    /// `ConfigInvalid` condition panics at initialization rather than
    /// returning a catchable error, the same fail-fast treatment given to
    /// an unrecoverable log I/O failure: a malformed configuration should
    /// never let a single thread spawn.
    pub fn build(self) -> EngineConfig {
        assert!(self.num_workers > 0, "invalid configuration: num_workers must be at least 1");
        assert!(self.batch_size > 0, "invalid configuration: batch_size must be at least 1");
        assert!(!self.tables.is_empty(), "invalid configuration: at least one table must be configured");
        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            assert!(seen.insert(table.table_id), "invalid configuration: duplicate table id {}", table.table_id);
        }
        assert!(self.queue_capacity > 0, "invalid configuration: queue_capacity must be at least 1");
        EngineConfig {
            num_workers: self.num_workers,
            tables: self.tables,
            batch_size: self.batch_size,
            starting_epoch: self.starting_epoch,
            log_path: self.log_path,
            allow_restore: self.allow_restore,
            version_buffer_capacity_bytes: self.version_buffer_capacity_bytes,
            queue_capacity: self.queue_capacity,
        }
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "num_workers")]
    fn rejects_zero_workers() {
        EngineConfig::builder().table(1, 10, 8).num_workers(0).build();
    }

    #[test]
    #[should_panic(expected = "at least one table")]
    fn rejects_no_tables() {
        EngineConfig::builder().build();
    }

    #[test]
    #[should_panic(expected = "duplicate table id")]
    fn rejects_duplicate_table_ids() {
        EngineConfig::builder().table(1, 10, 8).table(1, 20, 8).build();
    }

    #[test]
    fn accepts_a_well_formed_config() {
        let config = EngineConfig::builder().table(1, 1000, 8).num_workers(4).batch_size(128).build();
        assert_eq!(config.num_workers(), 4);
        assert_eq!(config.batch_size(), 128);
        assert_eq!(config.tables().len(), 1);
    }
}
