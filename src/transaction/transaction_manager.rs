use dashmap::DashMap;
use log::debug;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::{VellumError, VellumResult};
use crate::transaction::{
    IsolationLevel, LockManager, Transaction, TransactionId, TransactionState, WriteType,
};

/// Allocates transactions, drives their state machine, and reverses their
/// side effects on abort.
#[derive(Debug)]
pub struct TransactionManager {
    next_txn_id: AtomicI64,
    lock_manager: Arc<LockManager>,
    txn_map: DashMap<TransactionId, Arc<Transaction>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicI64::new(0),
            lock_manager,
            txn_map: DashMap::new(),
        }
    }

    pub fn lock_manager(&self) -> Arc<LockManager> {
        self.lock_manager.clone()
    }

    /// Start a transaction. Ids are monotonic; a smaller id means an older
    /// transaction.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.txn_map.insert(txn_id, txn.clone());
        debug!("txn {} began ({:?})", txn_id, isolation_level);
        txn
    }

    pub fn get_transaction(&self, txn_id: TransactionId) -> Option<Arc<Transaction>> {
        self.txn_map.get(&txn_id).map(|entry| entry.value().clone())
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> VellumResult<()> {
        match txn.state() {
            TransactionState::Committed => {
                return Err(VellumError::Internal(format!(
                    "transaction {} already committed",
                    txn.id()
                )))
            }
            TransactionState::Aborted => {
                return Err(VellumError::Internal(format!(
                    "transaction {} already aborted",
                    txn.id()
                )))
            }
            TransactionState::Growing | TransactionState::Shrinking => {}
        }

        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Committed);
        self.txn_map.remove(&txn.id());
        debug!("txn {} committed", txn.id());
        Ok(())
    }

    /// Walk the write sets in reverse and invert every record, then release
    /// all locks.
    pub fn abort(&self, txn: &Arc<Transaction>) -> VellumResult<()> {
        if txn.state() == TransactionState::Committed {
            return Err(VellumError::Internal(format!(
                "transaction {} already committed",
                txn.id()
            )));
        }

        while let Some(record) = txn.pop_table_write() {
            match record.wtype {
                WriteType::Insert => {
                    // the inserted tuple becomes a tombstone
                    let mut meta = record.table.tuple_meta(record.rid)?;
                    meta.is_deleted = true;
                    meta.delete_txn_id = txn.id();
                    record.table.update_tuple_meta(meta, record.rid)?;
                }
                WriteType::Delete => {
                    let mut meta = record.table.tuple_meta(record.rid)?;
                    meta.is_deleted = false;
                    record.table.update_tuple_meta(meta, record.rid)?;
                }
                WriteType::Update => {
                    let old_meta = record.old_meta.ok_or_else(|| {
                        VellumError::Internal("update undo record without old meta".to_string())
                    })?;
                    let old_tuple = record.old_tuple.ok_or_else(|| {
                        VellumError::Internal("update undo record without old tuple".to_string())
                    })?;
                    record
                        .table
                        .update_tuple_in_place_unsafe(old_meta, &old_tuple, record.rid)?;
                }
            }
        }

        while let Some(record) = txn.pop_index_write() {
            match record.wtype {
                WriteType::Insert => record.index.undo_insert(&record.key, record.rid)?,
                WriteType::Delete => record.index.undo_delete(&record.key, record.rid)?,
                WriteType::Update => {
                    return Err(VellumError::Internal(
                        "index write sets record inserts and deletes only".to_string(),
                    ))
                }
            }
        }

        self.lock_manager.release_all_locks(txn);
        txn.set_state(TransactionState::Aborted);
        self.txn_map.remove(&txn.id());
        debug!("txn {} aborted", txn.id());
        Ok(())
    }

    pub fn active_transactions(&self) -> Vec<TransactionId> {
        self.txn_map.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPoolManager;
    use crate::storage::disk_manager::DiskManager;
    use crate::storage::disk_scheduler::DiskScheduler;
    use crate::storage::heap::TableHeap;
    use crate::storage::index::{BPlusTree, IndexUndo};
    use crate::storage::page::{RecordId, TupleMeta};
    use crate::storage::tuple::Tuple;
    use crate::transaction::{IndexWriteRecord, LockMode, TableWriteRecord};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<BufferPoolManager>, TransactionManager) {
        let temp_dir = TempDir::new().unwrap();
        let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
        let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
        let bpm = Arc::new(BufferPoolManager::new(64, disk_scheduler));
        let manager = TransactionManager::new(LockManager::new());
        (temp_dir, bpm, manager)
    }

    #[test]
    fn ids_are_monotonic() {
        let (_tmp, _bpm, manager) = setup();
        let txn1 = manager.begin(IsolationLevel::RepeatableRead);
        let txn2 = manager.begin(IsolationLevel::ReadCommitted);
        assert!(txn1.id() < txn2.id());
        assert_eq!(txn1.state(), TransactionState::Growing);
    }

    #[test]
    fn commit_releases_locks() {
        let (_tmp, _bpm, manager) = setup();
        let lock_manager = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let waiter = manager.begin(IsolationLevel::RepeatableRead);

        assert!(lock_manager
            .lock_table(&txn, LockMode::Exclusive, 1)
            .unwrap());
        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);

        // the released lock is immediately grantable
        assert!(lock_manager
            .lock_table(&waiter, LockMode::Exclusive, 1)
            .unwrap());
        assert!(manager.commit(&txn).is_err());
    }

    #[test]
    fn abort_reverts_heap_writes() {
        let (_tmp, bpm, manager) = setup();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let heap = Arc::new(TableHeap::try_new(bpm).unwrap());

        // insert -> undo marks the tuple deleted
        let inserted_rid = heap
            .insert_tuple(&TupleMeta::new(txn.id()), &Tuple::new(vec![1, 2, 3]))
            .unwrap();
        txn.append_table_write(TableWriteRecord::insert(inserted_rid, heap.clone()));

        // delete -> undo clears the tombstone
        let deleted_rid = heap
            .insert_tuple(&TupleMeta::new(0), &Tuple::new(vec![4, 5, 6]))
            .unwrap();
        let mut meta = heap.tuple_meta(deleted_rid).unwrap();
        meta.is_deleted = true;
        meta.delete_txn_id = txn.id();
        heap.update_tuple_meta(meta, deleted_rid).unwrap();
        txn.append_table_write(TableWriteRecord::delete(deleted_rid, heap.clone()));

        // update -> undo restores the old image
        let updated_rid = heap
            .insert_tuple(&TupleMeta::new(0), &Tuple::new(vec![7, 7, 7]))
            .unwrap();
        let (old_meta, old_tuple) = heap.full_tuple(updated_rid).unwrap();
        heap.update_tuple_in_place_unsafe(old_meta, &Tuple::new(vec![8, 8, 8]), updated_rid)
            .unwrap();
        txn.append_table_write(TableWriteRecord::update(
            updated_rid,
            heap.clone(),
            old_meta,
            old_tuple,
        ));

        manager.abort(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Aborted);

        assert!(heap.tuple_meta(inserted_rid).unwrap().is_deleted);
        assert!(!heap.tuple_meta(deleted_rid).unwrap().is_deleted);
        assert_eq!(heap.tuple(updated_rid).unwrap().data, vec![7, 7, 7]);
    }

    #[test]
    fn abort_reverts_index_writes() {
        let (_tmp, bpm, manager) = setup();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let tree = Arc::new(BPlusTree::<i64>::new(bpm, 4, 4).unwrap());
        let index: Arc<dyn IndexUndo> = tree.clone();

        // a pre-existing entry the transaction deletes
        let kept_rid = RecordId::new(9, 9);
        assert!(tree.insert(50, kept_rid).unwrap());
        assert!(tree.remove(50).unwrap());
        txn.append_index_write(IndexWriteRecord::new(
            WriteType::Delete,
            50i64,
            kept_rid,
            index.clone(),
        ));

        // an entry the transaction inserted
        let new_rid = RecordId::new(3, 3);
        assert!(tree.insert(10, new_rid).unwrap());
        txn.append_index_write(IndexWriteRecord::new(
            WriteType::Insert,
            10i64,
            new_rid,
            index.clone(),
        ));

        manager.abort(&txn).unwrap();

        assert_eq!(tree.get_value(10).unwrap(), None);
        assert_eq!(tree.get_value(50).unwrap(), Some(kept_rid));
    }

    #[test]
    fn strict_two_phase_locking_under_repeatable_read() {
        let (_tmp, _bpm, manager) = setup();
        let lock_manager = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);

        assert!(lock_manager
            .lock_table(&txn, LockMode::IntentionExclusive, 1)
            .unwrap());
        assert!(lock_manager
            .lock_row(&txn, LockMode::Exclusive, 1, RecordId::new(1, 1))
            .unwrap());

        // no lock is released before commit, so the state never shrinks
        assert_eq!(txn.state(), TransactionState::Growing);
        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
    }
}
