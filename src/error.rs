use thiserror::Error;

use crate::transaction::{AbortReason, TransactionId};

pub type VellumDBResult<T, E = VellumDBError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum VellumDBError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Key already exists: {0}")]
    KeyExists(String),

    #[error("Key not found: {0}")]
    KeyMissing(String),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

impl VellumDBError {
    /// Convenience for matching deadlock-victim failures in callers.
    pub fn is_deadlock_abort(&self) -> bool {
        matches!(
            self,
            VellumDBError::TransactionAbort {
                reason: AbortReason::Deadlock,
                ..
            }
        )
    }
}
