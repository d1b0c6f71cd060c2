use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::LockManagerConfig;
use crate::error::{VellumDBError, VellumDBResult};
use crate::storage::page::RecordId;
use crate::transaction::transaction::{
    AbortReason, IsolationLevel, TableId, Transaction, TransactionId, INVALID_TRANSACTION_ID,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// May `requested` be granted while `held` is granted to another transaction?
pub fn modes_compatible(held: LockMode, requested: LockMode) -> bool {
    use LockMode::*;
    match held {
        IntentionShared => !matches!(requested, Exclusive),
        IntentionExclusive => matches!(requested, IntentionShared | IntentionExclusive),
        Shared => matches!(requested, IntentionShared | Shared),
        SharedIntentionExclusive => matches!(requested, IntentionShared),
        Exclusive => false,
    }
}

/// The permitted upgrade lattice:
/// IS -> {S, X, IX, SIX}; S -> {X, SIX}; IX -> {X, SIX}; SIX -> {X}.
pub fn upgradable(from: LockMode, to: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (from, to),
        (IntentionShared, Shared)
            | (IntentionShared, Exclusive)
            | (IntentionShared, IntentionExclusive)
            | (IntentionShared, SharedIntentionExclusive)
            | (Shared, Exclusive)
            | (Shared, SharedIntentionExclusive)
            | (IntentionExclusive, Exclusive)
            | (IntentionExclusive, SharedIntentionExclusive)
            | (SharedIntentionExclusive, Exclusive)
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resource {
    Table(TableId),
    Row(TableId, RecordId),
}

#[derive(Debug, Clone)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueState {
    requests: VecDeque<LockRequest>,
    /// Transaction with an upgrade in flight on this resource, if any.
    upgrading: TransactionId,
}

#[derive(Debug)]
struct LockQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                requests: VecDeque::new(),
                upgrading: INVALID_TRANSACTION_ID,
            }),
            condvar: Condvar::new(),
        }
    }
}

type RowKey = (TableId, RecordId);

#[derive(Debug)]
struct LockManagerInner {
    table_lock_map: Mutex<HashMap<TableId, Arc<LockQueue>>>,
    row_lock_map: Mutex<HashMap<RowKey, Arc<LockQueue>>>,
    /// Lets the detector flip the state of a waiting transaction by id.
    txn_registry: DashMap<TransactionId, Arc<Transaction>>,
    enable_cycle_detection: AtomicBool,
    shutdown: AtomicBool,
    /// Edges of the most recent detector round, for inspection in tests.
    latest_waits_for: Mutex<Vec<(TransactionId, TransactionId)>>,
}

/// Hierarchical table/row lock manager.
///
/// Each resource has a FIFO request queue guarded by its own mutex and woken
/// through its own condition variable. Upgrades re-enter the queue ahead of
/// all waiting requests. A background thread periodically rebuilds the
/// waits-for graph and aborts the youngest transaction of every cycle.
#[derive(Debug)]
pub struct LockManager {
    inner: Arc<LockManagerInner>,
    cycle_detection_thread: Option<thread::JoinHandle<()>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::new_with_config(LockManagerConfig::default())
    }

    pub fn new_with_config(config: LockManagerConfig) -> Self {
        let inner = Arc::new(LockManagerInner {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            txn_registry: DashMap::new(),
            enable_cycle_detection: AtomicBool::new(config.enable_cycle_detection),
            shutdown: AtomicBool::new(false),
            latest_waits_for: Mutex::new(Vec::new()),
        });
        let detector_inner = inner.clone();
        let interval = config.cycle_detection_interval;
        let handle = thread::Builder::new()
            .name("lock-manager-cycle-detector".to_string())
            .spawn(move || Self::run_cycle_detection(detector_inner, interval))
            .expect("failed to spawn deadlock detector");
        Self {
            inner,
            cycle_detection_thread: Some(handle),
        }
    }

    pub fn set_cycle_detection(&self, enabled: bool) {
        self.inner
            .enable_cycle_detection
            .store(enabled, Ordering::SeqCst);
    }

    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
    ) -> VellumDBResult<()> {
        self.lock_resource(txn, mode, Resource::Table(table_id))
    }

    pub fn unlock_table(&self, txn: &Arc<Transaction>, table_id: TableId) -> VellumDBResult<()> {
        self.unlock_resource(txn, Resource::Table(table_id))
    }

    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
        rid: RecordId,
    ) -> VellumDBResult<()> {
        self.lock_resource(txn, mode, Resource::Row(table_id, rid))
    }

    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        table_id: TableId,
        rid: RecordId,
    ) -> VellumDBResult<()> {
        self.unlock_resource(txn, Resource::Row(table_id, rid))
    }

    /// Release every lock the transaction still holds, rows before tables.
    pub fn release_all(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = txn.held_locks();
        for (_, table_id, rid) in rows {
            let _ = self.unlock_resource(txn, Resource::Row(table_id, rid));
        }
        for (_, table_id) in tables {
            let _ = self.unlock_resource(txn, Resource::Table(table_id));
        }
        self.inner.txn_registry.remove(&txn.id());
    }

    /// Waits-for edges from the most recent detector round.
    pub fn waits_for_edges(&self) -> Vec<(TransactionId, TransactionId)> {
        self.inner.latest_waits_for.lock().clone()
    }

    fn abort<T>(&self, txn: &Arc<Transaction>, reason: AbortReason) -> VellumDBResult<T> {
        // flip state before surfacing so concurrent waiters observe it
        txn.set_state(crate::transaction::TransactionState::Aborted);
        Err(VellumDBError::TransactionAbort {
            txn_id: txn.id(),
            reason,
        })
    }

    fn queue_for(&self, resource: Resource) -> Arc<LockQueue> {
        match resource {
            Resource::Table(table_id) => {
                let mut map = self.inner.table_lock_map.lock();
                map.entry(table_id)
                    .or_insert_with(|| Arc::new(LockQueue::new()))
                    .clone()
            }
            Resource::Row(table_id, rid) => {
                let mut map = self.inner.row_lock_map.lock();
                map.entry((table_id, rid))
                    .or_insert_with(|| Arc::new(LockQueue::new()))
                    .clone()
            }
        }
    }

    fn held_mode(txn: &Transaction, resource: Resource) -> Option<LockMode> {
        match resource {
            Resource::Table(table_id) => txn.table_lock_mode(table_id),
            Resource::Row(table_id, rid) => txn.row_lock_mode(table_id, rid),
        }
    }

    fn precheck(txn: &Transaction, mode: LockMode, resource: Resource) -> Result<(), AbortReason> {
        use LockMode::*;

        if matches!(resource, Resource::Row(_, _))
            && !matches!(mode, Shared | Exclusive)
        {
            return Err(AbortReason::AttemptedIntentionLockOnRow);
        }

        let state = txn.state();
        let shrinking = state == crate::transaction::TransactionState::Shrinking;
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(AbortReason::LockSharedOnReadUncommitted);
                }
                if shrinking {
                    return Err(AbortReason::LockOnShrinking);
                }
            }
            IsolationLevel::ReadCommitted => {
                if shrinking
                    && matches!(mode, Exclusive | IntentionExclusive | SharedIntentionExclusive)
                {
                    return Err(AbortReason::LockOnShrinking);
                }
            }
            IsolationLevel::RepeatableRead => {
                if shrinking {
                    return Err(AbortReason::LockOnShrinking);
                }
            }
        }

        if let Resource::Row(table_id, _) = resource {
            let table_mode = txn.table_lock_mode(table_id);
            if mode == Exclusive {
                if !matches!(
                    table_mode,
                    Some(Exclusive | IntentionExclusive | SharedIntentionExclusive)
                ) {
                    return Err(AbortReason::TableLockNotPresent);
                }
            } else if table_mode.is_none() {
                return Err(AbortReason::TableLockNotPresent);
            }
        }

        Ok(())
    }

    fn lock_resource(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        resource: Resource,
    ) -> VellumDBResult<()> {
        self.inner.txn_registry.insert(txn.id(), txn.clone());
        let queue = self.queue_for(resource);
        let mut state = queue.state.lock();

        if let Err(reason) = Self::precheck(txn, mode, resource) {
            return self.abort(txn, reason);
        }

        let mut upgrade = false;
        if let Some(held) = Self::held_mode(txn, resource) {
            if held == mode {
                return Ok(());
            }
            if !upgradable(held, mode) {
                return self.abort(txn, AbortReason::IncompatibleUpgrade);
            }
            if state.upgrading != INVALID_TRANSACTION_ID {
                return self.abort(txn, AbortReason::UpgradeConflict);
            }
            state.upgrading = txn.id();
            // upgrade = drop the old grant, then re-enter ahead of waiters
            state.requests.retain(|request| request.txn_id != txn.id());
            match resource {
                Resource::Table(table_id) => txn.erase_table_lock(held, table_id),
                Resource::Row(table_id, rid) => txn.erase_row_lock(held, table_id, rid),
            }
            upgrade = true;
        }

        let request = LockRequest {
            txn_id: txn.id(),
            mode,
            granted: false,
        };
        if upgrade {
            let position = state
                .requests
                .iter()
                .position(|request| !request.granted)
                .unwrap_or(state.requests.len());
            state.requests.insert(position, request);
        } else {
            state.requests.push_back(request);
        }

        loop {
            if txn.is_aborted() {
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TRANSACTION_ID;
                }
                state.requests.retain(|request| request.txn_id != txn.id());
                queue.condvar.notify_all();
                return Err(VellumDBError::TransactionAbort {
                    txn_id: txn.id(),
                    reason: AbortReason::Deadlock,
                });
            }
            if Self::try_grant(&mut state, txn.id()) {
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TRANSACTION_ID;
                }
                match resource {
                    Resource::Table(table_id) => txn.record_table_lock(mode, table_id),
                    Resource::Row(table_id, rid) => txn.record_row_lock(mode, table_id, rid),
                }
                trace!(
                    "lock granted: txn={} resource={:?} mode={:?}",
                    txn.id(),
                    resource,
                    mode
                );
                queue.condvar.notify_all();
                return Ok(());
            }
            queue.condvar.wait(&mut state);
        }
    }

    /// Grant iff the request is the earliest non-granted one and compatible
    /// with every grant ahead of it.
    fn try_grant(state: &mut QueueState, txn_id: TransactionId) -> bool {
        let Some(first_waiting) = state
            .requests
            .iter()
            .position(|request| !request.granted)
        else {
            return false;
        };
        if state.requests[first_waiting].txn_id != txn_id {
            return false;
        }
        let mode = state.requests[first_waiting].mode;
        for request in state.requests.iter().take(first_waiting) {
            if request.txn_id == txn_id {
                continue;
            }
            if !modes_compatible(request.mode, mode) {
                return false;
            }
        }
        state.requests[first_waiting].granted = true;
        true
    }

    fn unlock_resource(&self, txn: &Arc<Transaction>, resource: Resource) -> VellumDBResult<()> {
        let queue = match resource {
            Resource::Table(table_id) => self.inner.table_lock_map.lock().get(&table_id).cloned(),
            Resource::Row(table_id, rid) => self
                .inner
                .row_lock_map
                .lock()
                .get(&(table_id, rid))
                .cloned(),
        };
        let Some(queue) = queue else {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        };
        let mut state = queue.state.lock();

        let Some(held) = Self::held_mode(txn, resource) else {
            return self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld);
        };

        if let Resource::Table(table_id) = resource {
            if txn.holds_row_locks_on(table_id) {
                return self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows);
            }
        }

        // only releasing S or X moves the transaction to SHRINKING
        let needs_shrink = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(held, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                held == LockMode::Exclusive
            }
        };
        if needs_shrink {
            txn.begin_shrinking();
        }

        match resource {
            Resource::Table(table_id) => txn.erase_table_lock(held, table_id),
            Resource::Row(table_id, rid) => txn.erase_row_lock(held, table_id, rid),
        }
        state.requests.retain(|request| request.txn_id != txn.id());
        queue.condvar.notify_all();
        Ok(())
    }

    fn run_cycle_detection(inner: Arc<LockManagerInner>, interval: Duration) {
        loop {
            thread::sleep(interval);
            if inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            if !inner.enable_cycle_detection.load(Ordering::SeqCst) {
                continue;
            }

            let table_map = inner.table_lock_map.lock();
            let row_map = inner.row_lock_map.lock();

            let mut waits_for: BTreeMap<TransactionId, Vec<TransactionId>> = BTreeMap::new();
            let mut collect = |queue: &Arc<LockQueue>| {
                let state = queue.state.lock();
                let granted: Vec<TransactionId> = state
                    .requests
                    .iter()
                    .filter(|request| request.granted)
                    .map(|request| request.txn_id)
                    .collect();
                for request in state.requests.iter().filter(|request| !request.granted) {
                    let edges = waits_for.entry(request.txn_id).or_default();
                    for holder in granted.iter() {
                        if *holder != request.txn_id {
                            edges.push(*holder);
                        }
                    }
                }
            };
            for queue in table_map.values() {
                collect(queue);
            }
            for queue in row_map.values() {
                collect(queue);
            }
            for edges in waits_for.values_mut() {
                edges.sort_unstable();
                edges.dedup();
            }

            {
                let mut snapshot = inner.latest_waits_for.lock();
                snapshot.clear();
                for (waiter, holders) in waits_for.iter() {
                    for holder in holders {
                        snapshot.push((*waiter, *holder));
                    }
                }
            }

            let mut aborted_any = false;
            while let Some(victim) = Self::find_cycle_victim(&waits_for) {
                warn!("deadlock detected; aborting youngest txn {}", victim);
                aborted_any = true;
                waits_for.remove(&victim);
                for edges in waits_for.values_mut() {
                    edges.retain(|txn_id| *txn_id != victim);
                }
                if let Some(txn) = inner.txn_registry.get(&victim) {
                    txn.set_state(crate::transaction::TransactionState::Aborted);
                }
            }

            if aborted_any {
                // take each queue's mutex so a waiter between its abort check
                // and its wait cannot miss the signal
                for queue in table_map.values().chain(row_map.values()) {
                    let _state = queue.state.lock();
                    queue.condvar.notify_all();
                }
            }
        }
    }

    /// DFS for any cycle; the victim is the largest (youngest) id on it.
    fn find_cycle_victim(
        graph: &BTreeMap<TransactionId, Vec<TransactionId>>,
    ) -> Option<TransactionId> {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        fn dfs(
            graph: &BTreeMap<TransactionId, Vec<TransactionId>>,
            node: TransactionId,
            colors: &mut HashMap<TransactionId, u8>,
            path: &mut Vec<TransactionId>,
        ) -> Option<TransactionId> {
            match colors.get(&node).copied().unwrap_or(WHITE) {
                GRAY => {
                    let position = path.iter().position(|txn_id| *txn_id == node)?;
                    return path[position..].iter().max().copied();
                }
                BLACK => return None,
                _ => {}
            }
            colors.insert(node, GRAY);
            path.push(node);
            if let Some(edges) = graph.get(&node) {
                for next in edges {
                    if let Some(victim) = dfs(graph, *next, colors, path) {
                        return Some(victim);
                    }
                }
            }
            path.pop();
            colors.insert(node, BLACK);
            None
        }

        let mut colors: HashMap<TransactionId, u8> = HashMap::new();
        for start in graph.keys() {
            if colors.get(start).copied().unwrap_or(WHITE) == BLACK {
                continue;
            }
            let mut path = Vec::new();
            if let Some(victim) = dfs(graph, *start, &mut colors, &mut path) {
                return Some(victim);
            }
        }
        None
    }
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.cycle_detection_thread.take() {
            let _ = handle.join();
        }
    }
}
