use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::storage::heap::TableHeap;
use crate::storage::index::{IndexKey, IndexUndo};
use crate::storage::page::{RecordId, TupleMeta};
use crate::storage::tuple::Tuple;
use crate::transaction::lock_manager::{LockMode, TableOid};
use crate::transaction::{IsolationLevel, TransactionId, TransactionState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteType {
    Insert,
    Delete,
    Update,
}

/// Table-level undo record: enough to invert the operation through the
/// table heap on abort.
#[derive(Debug)]
pub struct TableWriteRecord {
    pub rid: RecordId,
    pub wtype: WriteType,
    pub table: Arc<TableHeap>,
    pub old_tuple: Option<Tuple>,
    pub old_meta: Option<TupleMeta>,
}

impl TableWriteRecord {
    pub fn insert(rid: RecordId, table: Arc<TableHeap>) -> Self {
        Self {
            rid,
            wtype: WriteType::Insert,
            table,
            old_tuple: None,
            old_meta: None,
        }
    }

    pub fn delete(rid: RecordId, table: Arc<TableHeap>) -> Self {
        Self {
            rid,
            wtype: WriteType::Delete,
            table,
            old_tuple: None,
            old_meta: None,
        }
    }

    pub fn update(
        rid: RecordId,
        table: Arc<TableHeap>,
        old_meta: TupleMeta,
        old_tuple: Tuple,
    ) -> Self {
        Self {
            rid,
            wtype: WriteType::Update,
            table,
            old_tuple: Some(old_tuple),
            old_meta: Some(old_meta),
        }
    }
}

/// Index-level undo record. The key is stored encoded so the write set does
/// not depend on the index's key type.
#[derive(Debug)]
pub struct IndexWriteRecord {
    pub wtype: WriteType,
    pub key: Vec<u8>,
    pub rid: RecordId,
    pub index: Arc<dyn IndexUndo>,
}

impl IndexWriteRecord {
    pub fn new<K: IndexKey>(
        wtype: WriteType,
        key: K,
        rid: RecordId,
        index: Arc<dyn IndexUndo>,
    ) -> Self {
        Self {
            wtype,
            key: key.encode_to_vec(),
            rid,
            index,
        }
    }
}

#[derive(Debug, Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableOid, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set_mut(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }

    fn table_set(&self, mode: LockMode) -> &HashSet<TableOid> {
        match mode {
            LockMode::Shared => &self.shared_tables,
            LockMode::Exclusive => &self.exclusive_tables,
            LockMode::IntentionShared => &self.intention_shared_tables,
            LockMode::IntentionExclusive => &self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &self.shared_intention_exclusive_tables,
        }
    }
}

/// A transaction: identity, isolation level, 2PL phase, the locks it holds,
/// and the undo records accumulated by its writes. State is atomic because
/// the deadlock detector aborts victims from its own thread.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: AtomicU8,
    lock_sets: Mutex<LockSets>,
    write_set: Mutex<Vec<TableWriteRecord>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: AtomicU8::new(TransactionState::Growing as u8),
            lock_sets: Mutex::new(LockSets::default()),
            write_set: Mutex::new(Vec::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        TransactionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: TransactionState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    pub fn holds_table_lock(&self, mode: LockMode, oid: TableOid) -> bool {
        self.lock_sets.lock().table_set(mode).contains(&oid)
    }

    pub fn held_table_modes(&self, oid: TableOid) -> Vec<LockMode> {
        let sets = self.lock_sets.lock();
        [
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::Shared,
            LockMode::SharedIntentionExclusive,
            LockMode::Exclusive,
        ]
        .into_iter()
        .filter(|mode| sets.table_set(*mode).contains(&oid))
        .collect()
    }

    pub fn holds_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) -> bool {
        let sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &sets.shared_rows,
            LockMode::Exclusive => &sets.exclusive_rows,
            _ => return false,
        };
        rows.get(&oid).is_some_and(|set| set.contains(&rid))
    }

    /// True while any row in the table is still locked by this transaction;
    /// the table lock must outlive its row locks.
    pub fn holds_row_locks_on(&self, oid: TableOid) -> bool {
        let sets = self.lock_sets.lock();
        sets.shared_rows.get(&oid).is_some_and(|set| !set.is_empty())
            || sets
                .exclusive_rows
                .get(&oid)
                .is_some_and(|set| !set.is_empty())
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.lock_sets.lock().table_set_mut(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => return,
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: RecordId) {
        let mut sets = self.lock_sets.lock();
        let rows = match mode {
            LockMode::Shared => &mut sets.shared_rows,
            LockMode::Exclusive => &mut sets.exclusive_rows,
            _ => return,
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
        }
    }

    /// Drain every held lock, rows first. Used when the transaction
    /// terminates and the lock manager tears its requests down wholesale.
    pub(crate) fn take_all_locks(&self) -> (Vec<TableOid>, Vec<(TableOid, RecordId)>) {
        let mut sets = self.lock_sets.lock();
        let mut rows: Vec<(TableOid, RecordId)> = Vec::new();
        for (oid, rids) in sets.shared_rows.drain() {
            rows.extend(rids.into_iter().map(|rid| (oid, rid)));
        }
        for (oid, rids) in sets.exclusive_rows.drain() {
            rows.extend(rids.into_iter().map(|rid| (oid, rid)));
        }
        let mut tables: HashSet<TableOid> = HashSet::new();
        for mode in [
            LockMode::IntentionShared,
            LockMode::IntentionExclusive,
            LockMode::Shared,
            LockMode::SharedIntentionExclusive,
            LockMode::Exclusive,
        ] {
            tables.extend(sets.table_set_mut(mode).drain());
        }
        (tables.into_iter().collect(), rows)
    }

    pub fn append_table_write(&self, record: TableWriteRecord) {
        self.write_set.lock().push(record);
    }

    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    pub(crate) fn pop_table_write(&self) -> Option<TableWriteRecord> {
        self.write_set.lock().pop()
    }

    pub(crate) fn pop_index_write(&self) -> Option<IndexWriteRecord> {
        self.index_write_set.lock().pop()
    }

    pub fn write_set_len(&self) -> usize {
        self.write_set.lock().len()
    }

    pub fn index_write_set_len(&self) -> usize {
        self.index_write_set.lock().len()
    }
}
