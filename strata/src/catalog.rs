//! The table registry and the interface every table file implements.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::database::Database;
use crate::error::{DbError, DbResult};
use crate::page::{BTreePage, PageRef};
use crate::tuple::{Tuple, TupleDesc};
use crate::types::{PageId, TransactionId};

/// A disk-backed table file. The buffer pool routes all page I/O and tuple
/// mutation through this interface.
pub trait DbFile: Send + Sync {
    /// The id uniquely identifying this file in the catalog.
    fn id(&self) -> u32;

    fn tuple_desc(&self) -> &TupleDesc;

    /// Reads a page from disk. Called by the buffer pool on a cache miss,
    /// never directly by operators.
    fn read_page(&self, pid: PageId) -> DbResult<BTreePage>;

    /// Writes a page back to its slot on disk. Called by the buffer pool
    /// when flushing.
    fn write_page(&self, page: &BTreePage) -> DbResult<()>;

    /// The number of full-sized data pages currently in the file.
    fn num_pages(&self) -> DbResult<usize>;

    /// Inserts a tuple, returning every page the operation touched with
    /// write intent.
    fn insert_tuple(&self, db: &Database, tid: TransactionId, t: Tuple)
        -> DbResult<Vec<PageRef>>;

    /// Deletes a tuple located by its record id, returning every page the
    /// operation touched with write intent.
    fn delete_tuple(
        &self,
        db: &Database,
        tid: TransactionId,
        t: &Tuple,
    ) -> DbResult<Vec<PageRef>>;
}

/// Maps table ids to their files.
#[derive(Default)]
pub struct Catalog {
    tables: RwLock<HashMap<u32, Arc<dyn DbFile>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Registers a table file. Re-adding a table id replaces the previous
    /// registration.
    pub fn add_table(&self, file: Arc<dyn DbFile>) {
        crate::strata_debug_log!("[Catalog::add_table] Registering table {}", file.id());
        self.tables.write().unwrap().insert(file.id(), file);
    }

    pub fn database_file(&self, table_id: u32) -> DbResult<Arc<dyn DbFile>> {
        self.tables
            .read()
            .unwrap()
            .get(&table_id)
            .cloned()
            .ok_or_else(|| DbError::Db(format!("no table with id {}", table_id)))
    }

    pub fn tuple_desc(&self, table_id: u32) -> DbResult<TupleDesc> {
        Ok(self.database_file(table_id)?.tuple_desc().clone())
    }

    pub fn table_ids(&self) -> Vec<u32> {
        self.tables.read().unwrap().keys().copied().collect()
    }
}
