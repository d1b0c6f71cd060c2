use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::storage::page::RecordId;
use crate::transaction::lock_manager::LockMode;

pub type TransactionId = u64;
pub type TableId = u32;

pub const INVALID_TRANSACTION_ID: TransactionId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why the lock manager aborted a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockSharedOnReadUncommitted,
    LockOnShrinking,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    IncompatibleUpgrade,
    UpgradeConflict,
    AttemptedUnlockButNoLockHeld,
    TableUnlockedBeforeUnlockingRows,
    Deadlock,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            AbortReason::LockSharedOnReadUncommitted => {
                "shared lock requested under READ UNCOMMITTED"
            }
            AbortReason::LockOnShrinking => "lock requested in the shrinking phase",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock without a matching table lock",
            AbortReason::IncompatibleUpgrade => "lock upgrade outside the upgrade lattice",
            AbortReason::UpgradeConflict => "another upgrade is already pending on the resource",
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock without a held lock",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked while its row locks are still held"
            }
            AbortReason::Deadlock => "chosen as the deadlock victim",
        };
        write!(f, "{}", text)
    }
}

#[derive(Debug, Default)]
struct LockSets {
    shared_tables: HashSet<TableId>,
    exclusive_tables: HashSet<TableId>,
    intention_shared_tables: HashSet<TableId>,
    intention_exclusive_tables: HashSet<TableId>,
    shared_intention_exclusive_tables: HashSet<TableId>,
    shared_rows: HashMap<TableId, HashSet<RecordId>>,
    exclusive_rows: HashMap<TableId, HashSet<RecordId>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableId> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

#[derive(Debug)]
struct TransactionInner {
    state: TransactionState,
    locks: LockSets,
}

/// A transaction as the lock manager sees it: an id, an isolation level, and
/// mutable state plus lock-set bookkeeping behind a mutex. Shared via `Arc`
/// so the deadlock detector can flip a waiter's state from another thread.
#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    inner: Mutex<TransactionInner>,
}

impl Transaction {
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            inner: Mutex::new(TransactionInner {
                state: TransactionState::Growing,
                locks: LockSets::default(),
            }),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        self.inner.lock().state
    }

    pub fn set_state(&self, state: TransactionState) {
        self.inner.lock().state = state;
    }

    pub fn is_aborted(&self) -> bool {
        self.state() == TransactionState::Aborted
    }

    /// Move to SHRINKING unless already terminal.
    pub(crate) fn begin_shrinking(&self) {
        let mut inner = self.inner.lock();
        if inner.state == TransactionState::Growing || inner.state == TransactionState::Shrinking {
            inner.state = TransactionState::Shrinking;
        }
    }

    pub fn table_lock_mode(&self, table_id: TableId) -> Option<LockMode> {
        let inner = self.inner.lock();
        let locks = &inner.locks;
        if locks.shared_tables.contains(&table_id) {
            Some(LockMode::Shared)
        } else if locks.exclusive_tables.contains(&table_id) {
            Some(LockMode::Exclusive)
        } else if locks.intention_shared_tables.contains(&table_id) {
            Some(LockMode::IntentionShared)
        } else if locks.intention_exclusive_tables.contains(&table_id) {
            Some(LockMode::IntentionExclusive)
        } else if locks.shared_intention_exclusive_tables.contains(&table_id) {
            Some(LockMode::SharedIntentionExclusive)
        } else {
            None
        }
    }

    pub fn row_lock_mode(&self, table_id: TableId, rid: RecordId) -> Option<LockMode> {
        let inner = self.inner.lock();
        let locks = &inner.locks;
        if locks
            .shared_rows
            .get(&table_id)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Shared)
        } else if locks
            .exclusive_rows
            .get(&table_id)
            .is_some_and(|rows| rows.contains(&rid))
        {
            Some(LockMode::Exclusive)
        } else {
            None
        }
    }

    pub(crate) fn record_table_lock(&self, mode: LockMode, table_id: TableId) {
        self.inner.lock().locks.table_set(mode).insert(table_id);
    }

    pub(crate) fn erase_table_lock(&self, mode: LockMode, table_id: TableId) {
        self.inner.lock().locks.table_set(mode).remove(&table_id);
    }

    pub(crate) fn record_row_lock(&self, mode: LockMode, table_id: TableId, rid: RecordId) {
        let mut inner = self.inner.lock();
        let rows = match mode {
            LockMode::Shared => &mut inner.locks.shared_rows,
            LockMode::Exclusive => &mut inner.locks.exclusive_rows,
            _ => return,
        };
        rows.entry(table_id).or_default().insert(rid);
    }

    pub(crate) fn erase_row_lock(&self, mode: LockMode, table_id: TableId, rid: RecordId) {
        let mut inner = self.inner.lock();
        let rows = match mode {
            LockMode::Shared => &mut inner.locks.shared_rows,
            LockMode::Exclusive => &mut inner.locks.exclusive_rows,
            _ => return,
        };
        if let Some(set) = rows.get_mut(&table_id) {
            set.remove(&rid);
            if set.is_empty() {
                rows.remove(&table_id);
            }
        }
    }

    pub fn holds_row_locks_on(&self, table_id: TableId) -> bool {
        let inner = self.inner.lock();
        inner
            .locks
            .shared_rows
            .get(&table_id)
            .is_some_and(|rows| !rows.is_empty())
            || inner
                .locks
                .exclusive_rows
                .get(&table_id)
                .is_some_and(|rows| !rows.is_empty())
    }

    /// Everything still held, rows first so release order respects the
    /// table-before-rows rule.
    pub(crate) fn held_locks(&self) -> (Vec<(LockMode, TableId, RecordId)>, Vec<(LockMode, TableId)>) {
        let inner = self.inner.lock();
        let mut rows = Vec::new();
        for (table_id, rids) in inner.locks.shared_rows.iter() {
            for rid in rids {
                rows.push((LockMode::Shared, *table_id, *rid));
            }
        }
        for (table_id, rids) in inner.locks.exclusive_rows.iter() {
            for rid in rids {
                rows.push((LockMode::Exclusive, *table_id, *rid));
            }
        }
        let mut tables = Vec::new();
        for table_id in inner.locks.shared_tables.iter() {
            tables.push((LockMode::Shared, *table_id));
        }
        for table_id in inner.locks.exclusive_tables.iter() {
            tables.push((LockMode::Exclusive, *table_id));
        }
        for table_id in inner.locks.intention_shared_tables.iter() {
            tables.push((LockMode::IntentionShared, *table_id));
        }
        for table_id in inner.locks.intention_exclusive_tables.iter() {
            tables.push((LockMode::IntentionExclusive, *table_id));
        }
        for table_id in inner.locks.shared_intention_exclusive_tables.iter() {
            tables.push((LockMode::SharedIntentionExclusive, *table_id));
        }
        (rows, tables)
    }
}
