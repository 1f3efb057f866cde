mod lock_manager;
mod transaction;
mod transaction_manager;

pub use lock_manager::{LockManager, LockMode, TableOid};
pub use transaction::{IndexWriteRecord, TableWriteRecord, Transaction, WriteType};
pub use transaction_manager::TransactionManager;

pub type TransactionId = i64;
pub const INVALID_TXN_ID: TransactionId = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionState {
    Growing = 0,
    Shrinking = 1,
    Committed = 2,
    Aborted = 3,
}

impl TransactionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => TransactionState::Growing,
            1 => TransactionState::Shrinking,
            2 => TransactionState::Committed,
            _ => TransactionState::Aborted,
        }
    }
}
