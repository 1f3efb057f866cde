use crate::transaction::TransactionId;
use thiserror::Error;

pub type VellumResult<T, E = VellumError> = Result<T, E>;

/// Reason recorded on a transaction when the lock manager aborts it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockOnShrinking,
    UpgradeConflict,
    IncompatibleUpgrade,
    AttemptedUnlockButNoLockHeld,
    AttemptedIntentionLockOnRow,
    TableUnlockedBeforeUnlockingRows,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let msg = match self {
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "requested upgrade is incompatible",
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock called but no lock held",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked before unlocking rows"
            }
        };
        write!(f, "{}", msg)
    }
}

#[derive(Debug, Error)]
pub enum VellumError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

impl VellumError {
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            VellumError::TransactionAbort { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
