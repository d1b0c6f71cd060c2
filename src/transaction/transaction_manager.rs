use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::debug;

use crate::error::{VellumDBError, VellumDBResult};
use crate::transaction::lock_manager::LockManager;
use crate::transaction::transaction::{
    AbortReason, IsolationLevel, Transaction, TransactionState,
};

/// Hands out transactions and tears their locks down at commit/abort.
///
/// Ids are monotonic, so a larger id always means a younger transaction;
/// the deadlock detector relies on that to pick its victim.
#[derive(Debug)]
pub struct TransactionManager {
    next_txn_id: AtomicU64,
    lock_manager: Arc<LockManager>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            lock_manager,
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        debug!("begin txn {} at {:?}", id, isolation_level);
        Arc::new(Transaction::new(id, isolation_level))
    }

    pub fn commit(&self, txn: &Arc<Transaction>) -> VellumDBResult<()> {
        if txn.is_aborted() {
            self.lock_manager.release_all(txn);
            return Err(VellumDBError::TransactionAbort {
                txn_id: txn.id(),
                reason: AbortReason::Deadlock,
            });
        }
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Committed);
        debug!("commit txn {}", txn.id());
        Ok(())
    }

    pub fn abort(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Aborted);
        debug!("abort txn {}", txn.id());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::LockMode;

    #[test]
    fn commit_releases_all_locks() {
        let lock_manager = Arc::new(LockManager::new());
        let manager = TransactionManager::new(lock_manager.clone());
        let txn = manager.begin(IsolationLevel::RepeatableRead);

        lock_manager
            .lock_table(&txn, LockMode::IntentionExclusive, 1)
            .unwrap();
        lock_manager
            .lock_row(
                &txn,
                LockMode::Exclusive,
                1,
                crate::storage::page::RecordId::new(1, 1),
            )
            .unwrap();

        manager.commit(&txn).unwrap();
        assert_eq!(txn.state(), TransactionState::Committed);
        assert_eq!(txn.table_lock_mode(1), None);

        // the resources are free for the next transaction
        let txn2 = manager.begin(IsolationLevel::RepeatableRead);
        lock_manager
            .lock_table(&txn2, LockMode::Exclusive, 1)
            .unwrap();
        manager.commit(&txn2).unwrap();
    }

    #[test]
    fn ids_are_monotonic() {
        let manager = TransactionManager::new(Arc::new(LockManager::new()));
        let a = manager.begin(IsolationLevel::ReadCommitted);
        let b = manager.begin(IsolationLevel::ReadCommitted);
        assert!(b.id() > a.id());
    }
}
