use log::{trace, warn};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use crate::config::LockManagerConfig;
use crate::error::{AbortReason, VellumError, VellumResult};
use crate::storage::page::RecordId;
use crate::transaction::{
    IsolationLevel, Transaction, TransactionId, TransactionState, INVALID_TXN_ID,
};

pub type TableOid = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn: Arc<Transaction>,
    txn_id: TransactionId,
    mode: LockMode,
    rid: Option<RecordId>,
    granted: bool,
}

#[derive(Debug)]
struct LockRequestQueue {
    requests: VecDeque<LockRequest>,
    /// Transaction currently upgrading on this queue, or `INVALID_TXN_ID`.
    upgrading: TransactionId,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            requests: VecDeque::new(),
            upgrading: INVALID_TXN_ID,
        }
    }
}

#[derive(Debug)]
struct ResourceLock {
    state: Mutex<LockRequestQueue>,
    condvar: Condvar,
}

impl ResourceLock {
    fn new() -> Self {
        Self {
            state: Mutex::new(LockRequestQueue::new()),
            condvar: Condvar::new(),
        }
    }
}

type RowKey = (TableOid, RecordId);

/// Hierarchical two-phase lock service.
///
/// Tables take any of the five modes, rows only S or X. Waiters queue FIFO
/// per resource and are granted in batches of mutually compatible requests;
/// a transaction upgrading its lock jumps ahead of ordinary waiters. A
/// background thread breaks deadlocks by aborting the youngest transaction
/// of each waits-for cycle.
#[derive(Debug)]
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<ResourceLock>>>,
    row_lock_map: Mutex<HashMap<RowKey, Arc<ResourceLock>>>,
    shutdown: Arc<AtomicBool>,
}

impl LockManager {
    pub fn new() -> Arc<Self> {
        Self::new_with_config(LockManagerConfig::default())
    }

    pub fn new_with_config(config: LockManagerConfig) -> Arc<Self> {
        let manager = Arc::new(Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            shutdown: Arc::new(AtomicBool::new(false)),
        });

        // The detector holds only a weak handle, so a dropped lock manager
        // stops the thread at its next wakeup.
        if config.enable_deadlock_detection {
            let weak: Weak<LockManager> = Arc::downgrade(&manager);
            let shutdown = manager.shutdown.clone();
            let interval = config.deadlock_detection_interval;
            thread::Builder::new()
                .name("deadlock-detector".to_string())
                .spawn(move || {
                    while !shutdown.load(Ordering::Relaxed) {
                        thread::sleep(interval);
                        let Some(manager) = weak.upgrade() else {
                            break;
                        };
                        manager.run_cycle_detection();
                    }
                })
                .expect("failed to spawn deadlock detector");
        }
        manager
    }

    /// Acquire (or upgrade to) a table lock. `Ok(false)` is a quiet denial;
    /// `Err(TransactionAbort)` marks the transaction aborted.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> VellumResult<bool> {
        self.lock_table_inner(txn, mode, oid, true)
    }

    fn lock_table_inner(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        raise: bool,
    ) -> VellumResult<bool> {
        if !self.pre_check(txn, mode, raise)? {
            return Ok(false);
        }

        let resource = self.table_resource(oid);
        let mut queue = resource.state.lock();

        if let Some(pos) = queue
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id())
        {
            let held_mode = queue.requests[pos].mode;
            if held_mode == mode {
                return Ok(true);
            }
            if queue.upgrading != INVALID_TXN_ID {
                if !raise {
                    return Ok(false);
                }
                return Err(Self::abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(held_mode, mode) {
                if !raise {
                    return Ok(false);
                }
                return Err(Self::abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }
            queue.upgrading = txn.id();
            queue.requests.remove(pos);
            txn.remove_table_lock(held_mode, oid);
            trace!("txn {} upgrading table {} to {:?}", txn.id(), oid, mode);
        }
        queue.requests.push_back(LockRequest {
            txn: txn.clone(),
            txn_id: txn.id(),
            mode,
            rid: None,
            granted: false,
        });

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::purge_requests(&mut queue, txn.id(), None);
                if queue.upgrading == txn.id() {
                    queue.upgrading = INVALID_TXN_ID;
                }
                resource.condvar.notify_all();
                return Ok(false);
            }
            if Self::try_grant(&mut queue, txn.id(), mode) {
                break;
            }
            resource.condvar.wait(&mut queue);
        }
        drop(queue);

        txn.insert_table_lock(mode, oid);
        trace!("txn {} granted {:?} on table {}", txn.id(), mode, oid);
        Ok(true)
    }

    /// Release a table lock. Aborts if rows of that table are still locked
    /// or no table lock is held.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> VellumResult<bool> {
        if txn.holds_row_locks_on(oid) {
            return Err(Self::abort_txn(
                txn,
                AbortReason::TableUnlockedBeforeUnlockingRows,
            ));
        }

        let Some(resource) = self.lookup_table_resource(oid) else {
            return Err(Self::abort_txn(
                txn,
                AbortReason::AttemptedUnlockButNoLockHeld,
            ));
        };
        let mut queue = resource.state.lock();
        let Some(pos) = queue
            .requests
            .iter()
            .position(|request| request.granted && request.txn_id == txn.id())
        else {
            drop(queue);
            return Err(Self::abort_txn(
                txn,
                AbortReason::AttemptedUnlockButNoLockHeld,
            ));
        };
        let request = queue.requests.remove(pos).unwrap();
        Self::apply_unlock_transition(txn, request.mode);
        txn.remove_table_lock(request.mode, oid);
        resource.condvar.notify_all();
        Ok(true)
    }

    /// Acquire a row lock (S or X only). The required table intent lock is
    /// taken transparently when missing.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: RecordId,
    ) -> VellumResult<bool> {
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Err(Self::abort_txn(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        if !self.pre_check(txn, mode, true)? {
            return Ok(false);
        }

        // the row lock only makes sense under a covering table intent
        let required: &[LockMode] = if mode == LockMode::Shared {
            &[
                LockMode::IntentionShared,
                LockMode::Shared,
                LockMode::SharedIntentionExclusive,
            ]
        } else {
            &[
                LockMode::IntentionExclusive,
                LockMode::Exclusive,
                LockMode::SharedIntentionExclusive,
            ]
        };
        if !required
            .iter()
            .any(|table_mode| txn.holds_table_lock(*table_mode, oid))
        {
            let mut acquired = false;
            for table_mode in required {
                if self.lock_table_inner(txn, *table_mode, oid, false)? {
                    acquired = true;
                    break;
                }
            }
            if !acquired {
                return Ok(false);
            }
        }

        let resource = self.row_resource(oid, rid);
        let mut queue = resource.state.lock();

        if let Some(pos) = queue
            .requests
            .iter()
            .position(|request| request.txn_id == txn.id())
        {
            let held_mode = queue.requests[pos].mode;
            if held_mode == mode {
                return Ok(true);
            }
            if queue.upgrading != INVALID_TXN_ID {
                return Err(Self::abort_txn(txn, AbortReason::UpgradeConflict));
            }
            if !can_upgrade(held_mode, mode) {
                return Err(Self::abort_txn(txn, AbortReason::IncompatibleUpgrade));
            }
            queue.upgrading = txn.id();
            queue.requests.remove(pos);
            txn.remove_row_lock(held_mode, oid, rid);
            trace!("txn {} upgrading row {} to {:?}", txn.id(), rid, mode);
        }
        queue.requests.push_back(LockRequest {
            txn: txn.clone(),
            txn_id: txn.id(),
            mode,
            rid: Some(rid),
            granted: false,
        });

        loop {
            if txn.state() == TransactionState::Aborted {
                Self::purge_requests(&mut queue, txn.id(), Some(rid));
                if queue.upgrading == txn.id() {
                    queue.upgrading = INVALID_TXN_ID;
                }
                resource.condvar.notify_all();
                return Ok(false);
            }
            if Self::try_grant(&mut queue, txn.id(), mode) {
                break;
            }
            resource.condvar.wait(&mut queue);
        }
        drop(queue);

        txn.insert_row_lock(mode, oid, rid);
        trace!("txn {} granted {:?} on row {}", txn.id(), mode, rid);
        Ok(true)
    }

    /// Release a row lock. With `force`, the isolation-level state
    /// transition is skipped (terminating transactions tear down wholesale).
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: RecordId,
        force: bool,
    ) -> VellumResult<bool> {
        let Some(resource) = self.lookup_row_resource(oid, rid) else {
            return Err(Self::abort_txn(
                txn,
                AbortReason::AttemptedUnlockButNoLockHeld,
            ));
        };
        let mut queue = resource.state.lock();
        let Some(pos) = queue
            .requests
            .iter()
            .position(|request| request.granted && request.txn_id == txn.id())
        else {
            drop(queue);
            return Err(Self::abort_txn(
                txn,
                AbortReason::AttemptedUnlockButNoLockHeld,
            ));
        };
        let request = queue.requests.remove(pos).unwrap();
        if !force {
            Self::apply_unlock_transition(txn, request.mode);
        }
        txn.remove_row_lock(request.mode, oid, rid);
        resource.condvar.notify_all();
        Ok(true)
    }

    /// Drop every lock the transaction still holds, rows before tables, with
    /// no state transitions. Called by commit and abort.
    pub fn release_all_locks(&self, txn: &Arc<Transaction>) {
        let (tables, rows) = txn.take_all_locks();
        for (oid, rid) in rows {
            if let Some(resource) = self.lookup_row_resource(oid, rid) {
                let mut queue = resource.state.lock();
                Self::purge_requests(&mut queue, txn.id(), Some(rid));
                if queue.upgrading == txn.id() {
                    queue.upgrading = INVALID_TXN_ID;
                }
                resource.condvar.notify_all();
            }
        }
        for oid in tables {
            if let Some(resource) = self.lookup_table_resource(oid) {
                let mut queue = resource.state.lock();
                Self::purge_requests(&mut queue, txn.id(), None);
                if queue.upgrading == txn.id() {
                    queue.upgrading = INVALID_TXN_ID;
                }
                resource.condvar.notify_all();
            }
        }
    }

    /// Isolation-aware admission check shared by table and row requests.
    /// `Ok(false)` denies without aborting (the original engine's behaviour
    /// for illegal modes in the growing phase under READ_UNCOMMITTED).
    fn pre_check(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        raise: bool,
    ) -> VellumResult<bool> {
        let state = txn.state();
        if matches!(
            state,
            TransactionState::Committed | TransactionState::Aborted
        ) {
            return Ok(false);
        }
        match state {
            TransactionState::Growing => {
                if txn.isolation_level() == IsolationLevel::ReadUncommitted
                    && !matches!(
                        mode,
                        LockMode::IntentionExclusive | LockMode::Exclusive
                    )
                {
                    return Ok(false);
                }
                Ok(true)
            }
            TransactionState::Shrinking => match txn.isolation_level() {
                IsolationLevel::RepeatableRead | IsolationLevel::ReadUncommitted => {
                    if !raise {
                        return Ok(false);
                    }
                    Err(Self::abort_txn(txn, AbortReason::LockOnShrinking))
                }
                IsolationLevel::ReadCommitted => {
                    if matches!(mode, LockMode::IntentionShared | LockMode::Shared) {
                        Ok(true)
                    } else if !raise {
                        Ok(false)
                    } else {
                        Err(Self::abort_txn(txn, AbortReason::LockOnShrinking))
                    }
                }
            },
            _ => Ok(false),
        }
    }

    /// First unlock drives the 2PL phase change, specialised per isolation
    /// level: REPEATABLE_READ shrinks on releasing S or X, the others only
    /// on releasing X.
    fn apply_unlock_transition(txn: &Arc<Transaction>, mode: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(mode, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                mode == LockMode::Exclusive
            }
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    /// Grant predicate. May only grant when: no conflicting granted request
    /// from another transaction exists; an in-progress upgrade belongs to
    /// the requester (upgraders jump the queue); and no earlier ungranted
    /// request conflicts (FIFO with batching of compatible waiters).
    fn try_grant(queue: &mut LockRequestQueue, txn_id: TransactionId, mode: LockMode) -> bool {
        for request in queue.requests.iter().filter(|request| request.granted) {
            if request.txn_id != txn_id && !modes_compatible(mode, request.mode) {
                return false;
            }
        }

        if queue.upgrading != INVALID_TXN_ID {
            if queue.upgrading != txn_id {
                return false;
            }
            queue.upgrading = INVALID_TXN_ID;
            if let Some(request) = queue
                .requests
                .iter_mut()
                .find(|request| !request.granted && request.txn_id == txn_id)
            {
                request.granted = true;
            }
            return true;
        }

        for request in queue.requests.iter_mut().filter(|request| !request.granted) {
            if request.txn_id == txn_id {
                request.granted = true;
                return true;
            }
            if !modes_compatible(mode, request.mode) {
                return false;
            }
        }
        false
    }

    fn purge_requests(queue: &mut LockRequestQueue, txn_id: TransactionId, rid: Option<RecordId>) {
        queue
            .requests
            .retain(|request| !(request.txn_id == txn_id && request.rid == rid));
    }

    fn abort_txn(txn: &Arc<Transaction>, reason: AbortReason) -> VellumError {
        txn.set_state(TransactionState::Aborted);
        VellumError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        }
    }

    fn table_resource(&self, oid: TableOid) -> Arc<ResourceLock> {
        let mut map = self.table_lock_map.lock();
        map.entry(oid)
            .or_insert_with(|| Arc::new(ResourceLock::new()))
            .clone()
    }

    fn lookup_table_resource(&self, oid: TableOid) -> Option<Arc<ResourceLock>> {
        self.table_lock_map.lock().get(&oid).cloned()
    }

    fn row_resource(&self, oid: TableOid, rid: RecordId) -> Arc<ResourceLock> {
        let mut map = self.row_lock_map.lock();
        map.entry((oid, rid))
            .or_insert_with(|| Arc::new(ResourceLock::new()))
            .clone()
    }

    fn lookup_row_resource(&self, oid: TableOid, rid: RecordId) -> Option<Arc<ResourceLock>> {
        self.row_lock_map.lock().get(&(oid, rid)).cloned()
    }

    fn all_resources(&self) -> Vec<Arc<ResourceLock>> {
        let mut resources: Vec<Arc<ResourceLock>> =
            self.table_lock_map.lock().values().cloned().collect();
        resources.extend(self.row_lock_map.lock().values().cloned());
        resources
    }

    /// One detector pass: build the waits-for graph, abort the youngest
    /// member of each cycle until none remain.
    fn run_cycle_detection(&self) {
        loop {
            let (graph, handles) = self.build_waits_for();
            let Some(cycle) = Self::find_cycle(&graph) else {
                break;
            };
            let victim_id = *cycle.iter().max().expect("cycle is non-empty");
            warn!(
                "deadlock detected involving {:?}; aborting youngest txn {}",
                cycle, victim_id
            );
            if let Some(victim) = handles.get(&victim_id) {
                victim.set_state(TransactionState::Aborted);
            }
            for resource in self.all_resources() {
                let mut queue = resource.state.lock();
                let before = queue.requests.len();
                queue.requests.retain(|request| request.txn_id != victim_id);
                if queue.upgrading == victim_id {
                    queue.upgrading = INVALID_TXN_ID;
                }
                if queue.requests.len() != before {
                    resource.condvar.notify_all();
                }
            }
        }
    }

    /// Edge `waiter -> holder` for every ungranted request blocked by a
    /// conflicting granted request on the same queue.
    fn build_waits_for(
        &self,
    ) -> (
        BTreeMap<TransactionId, BTreeSet<TransactionId>>,
        HashMap<TransactionId, Arc<Transaction>>,
    ) {
        let mut graph: BTreeMap<TransactionId, BTreeSet<TransactionId>> = BTreeMap::new();
        let mut handles: HashMap<TransactionId, Arc<Transaction>> = HashMap::new();
        for resource in self.all_resources() {
            let queue = resource.state.lock();
            for request in &queue.requests {
                handles
                    .entry(request.txn_id)
                    .or_insert_with(|| request.txn.clone());
            }
            for waiter in queue.requests.iter().filter(|request| !request.granted) {
                for holder in queue.requests.iter().filter(|request| request.granted) {
                    if waiter.txn_id != holder.txn_id
                        && !modes_compatible(waiter.mode, holder.mode)
                    {
                        graph
                            .entry(waiter.txn_id)
                            .or_default()
                            .insert(holder.txn_id);
                    }
                }
            }
        }
        (graph, handles)
    }

    /// DFS from the lowest transaction id, exploring lowest neighbours
    /// first; returns the first cycle found.
    fn find_cycle(
        graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
    ) -> Option<Vec<TransactionId>> {
        fn dfs(
            graph: &BTreeMap<TransactionId, BTreeSet<TransactionId>>,
            node: TransactionId,
            stack: &mut Vec<TransactionId>,
            visited: &mut HashSet<TransactionId>,
        ) -> Option<Vec<TransactionId>> {
            if let Some(pos) = stack.iter().position(|on_stack| *on_stack == node) {
                return Some(stack[pos..].to_vec());
            }
            if !visited.insert(node) {
                return None;
            }
            stack.push(node);
            if let Some(next) = graph.get(&node) {
                for &neighbour in next {
                    if let Some(cycle) = dfs(graph, neighbour, stack, visited) {
                        return Some(cycle);
                    }
                }
            }
            stack.pop();
            None
        }

        let mut visited = HashSet::new();
        for &start in graph.keys() {
            let mut stack = Vec::new();
            if let Some(cycle) = dfs(graph, start, &mut stack, &mut visited) {
                return Some(cycle);
            }
        }
        None
    }

    #[cfg(test)]
    fn table_upgrading(&self, oid: TableOid) -> TransactionId {
        self.lookup_table_resource(oid)
            .map(|resource| resource.state.lock().upgrading)
            .unwrap_or(INVALID_TXN_ID)
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

/// Compatibility matrix over the five modes; X conflicts with everything.
fn modes_compatible(requested: LockMode, held: LockMode) -> bool {
    use LockMode::*;
    match (requested, held) {
        (IntentionShared, IntentionShared | IntentionExclusive | Shared | SharedIntentionExclusive)
        | (IntentionExclusive, IntentionShared | IntentionExclusive)
        | (Shared, IntentionShared | Shared)
        | (SharedIntentionExclusive, IntentionShared) => true,
        _ => false,
    }
}

/// Allowed upgrade lattice: IS -> {IX, S, SIX, X}, S -> {SIX, X},
/// IX -> {SIX, X}, SIX -> X.
fn can_upgrade(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (held, requested),
        (IntentionShared, IntentionExclusive | Shared | SharedIntentionExclusive | Exclusive)
            | (Shared, SharedIntentionExclusive | Exclusive)
            | (IntentionExclusive, SharedIntentionExclusive | Exclusive)
            | (SharedIntentionExclusive, Exclusive)
    )
}
