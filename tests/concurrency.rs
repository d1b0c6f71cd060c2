use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;

use vellumdb::buffer::BufferManager;
use vellumdb::config::{BTreeConfig, LockManagerConfig};
use vellumdb::error::VellumDBError;
use vellumdb::storage::disk_manager::DiskManager;
use vellumdb::storage::disk_scheduler::DiskScheduler;
use vellumdb::storage::index::BPlusTreeIndex;
use vellumdb::storage::page::btree_page::default_comparator;
use vellumdb::storage::page::RecordId;
use vellumdb::transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, TransactionManager,
};

fn key_of(v: u64) -> Vec<u8> {
    v.to_be_bytes().to_vec()
}

fn build_index(pool_pages: usize) -> (TempDir, Arc<BPlusTreeIndex>) {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
    let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let buffer_pool = Arc::new(BufferManager::new(pool_pages, disk_scheduler));
    let index = Arc::new(BPlusTreeIndex::new(
        buffer_pool,
        default_comparator,
        BTreeConfig {
            key_size: 8,
            leaf_max_size: 10,
            internal_max_size: 10,
        },
    ));
    (temp_dir, index)
}

/// A reader hammering one key while a writer builds the tree underneath it
/// must never observe a torn page or a spurious error.
#[test]
fn btree_reader_survives_concurrent_writer() {
    let (_tmp, index) = build_index(512);
    let done = Arc::new(AtomicBool::new(false));
    let target = 500u64;

    let reader = {
        let index = index.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut observed = false;
            while !done.load(Ordering::SeqCst) {
                match index.get(&key_of(target)).unwrap() {
                    Some(rid) => {
                        assert_eq!(rid, RecordId::new(target as u32, target as u32));
                        observed = true;
                    }
                    None => {}
                }
            }
            observed
        })
    };

    for i in 1..=1000u64 {
        index.insert(&key_of(i), RecordId::new(i as u32, i as u32)).unwrap();
    }
    // let the reader observe the final state before stopping it
    thread::sleep(Duration::from_millis(20));
    done.store(true, Ordering::SeqCst);
    let observed = reader.join().unwrap();
    assert!(observed, "reader never saw the target key");

    assert_eq!(
        index.get(&key_of(target)).unwrap(),
        Some(RecordId::new(target as u32, target as u32))
    );
    index.check_integrity().unwrap();
}

/// Two transactions locking two rows in opposite order deadlock; the
/// detector aborts the younger one and the survivor finishes.
#[test]
fn row_deadlock_aborts_youngest() {
    let lock_manager = Arc::new(LockManager::new_with_config(LockManagerConfig {
        cycle_detection_interval: Duration::from_millis(25),
        enable_cycle_detection: true,
    }));
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));

    let table = 1;
    let row1 = RecordId::new(1, 1);
    let row2 = RecordId::new(2, 2);

    let txn_a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_b = txn_manager.begin(IsolationLevel::RepeatableRead);
    assert!(txn_b.id() > txn_a.id());

    lock_manager
        .lock_table(&txn_a, LockMode::IntentionExclusive, table)
        .unwrap();
    lock_manager
        .lock_table(&txn_b, LockMode::IntentionExclusive, table)
        .unwrap();
    lock_manager
        .lock_row(&txn_a, LockMode::Exclusive, table, row1)
        .unwrap();
    lock_manager
        .lock_row(&txn_b, LockMode::Exclusive, table, row2)
        .unwrap();

    let barrier = Arc::new(Barrier::new(2));

    let a_handle = {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let txn_a = txn_a.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            // A waits for B's lock on row2
            let result = lock_manager.lock_row(&txn_a, LockMode::Exclusive, table, row2);
            match result {
                Ok(()) => {
                    txn_manager.commit(&txn_a).unwrap();
                    true
                }
                Err(_) => {
                    txn_manager.abort(&txn_a);
                    false
                }
            }
        })
    };

    let b_handle = {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let txn_b = txn_b.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
            barrier.wait();
            // B waits for A's lock on row1, closing the cycle
            let result = lock_manager.lock_row(&txn_b, LockMode::Exclusive, table, row1);
            match result {
                Ok(()) => {
                    txn_manager.commit(&txn_b).unwrap();
                    true
                }
                Err(error) => {
                    assert!(error.is_deadlock_abort(), "unexpected error: {error}");
                    txn_manager.abort(&txn_b);
                    false
                }
            }
        })
    };

    let a_committed = a_handle.join().unwrap();
    let b_committed = b_handle.join().unwrap();

    // B is younger (larger id): it must be the victim
    assert!(a_committed, "the older transaction should survive");
    assert!(!b_committed, "the younger transaction should be aborted");
}

/// Upgrade requests overtake earlier waiters on the same resource.
#[test]
fn upgrade_has_priority_over_waiting_exclusive() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(lock_manager.clone());
    let table = 7;

    let txn_a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let txn_b = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&txn_a, LockMode::Shared, table).unwrap();

    let b_granted = Arc::new(AtomicBool::new(false));
    let b_handle = {
        let lock_manager = lock_manager.clone();
        let txn_b = txn_b.clone();
        let b_granted = b_granted.clone();
        thread::spawn(move || {
            lock_manager.lock_table(&txn_b, LockMode::Exclusive, table).unwrap();
            b_granted.store(true, Ordering::SeqCst);
            lock_manager.unlock_table(&txn_b, table).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(40));
    assert!(!b_granted.load(Ordering::SeqCst));

    // the upgrade releases A's shared grant and overtakes B
    lock_manager.lock_table(&txn_a, LockMode::Exclusive, table).unwrap();
    assert_eq!(txn_a.table_lock_mode(table), Some(LockMode::Exclusive));
    assert!(!b_granted.load(Ordering::SeqCst));

    lock_manager.unlock_table(&txn_a, table).unwrap();
    b_handle.join().unwrap();
    assert!(b_granted.load(Ordering::SeqCst));
}

/// Conflicting shared/exclusive lock holders serialize their effects.
#[test]
fn lock_release_publishes_effects_to_next_holder() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    let table = 3;
    let shared_value = Arc::new(std::sync::Mutex::new(0u64));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let shared_value = shared_value.clone();
        handles.push(thread::spawn(move || {
            let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
            lock_manager.lock_table(&txn, LockMode::Exclusive, table).unwrap();
            {
                let mut value = shared_value.lock().unwrap();
                *value += 1;
            }
            txn_manager.commit(&txn).unwrap();
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(*shared_value.lock().unwrap(), 8);
}

/// Aborting with the lock manager's reason taxonomy is observable end to end.
#[test]
fn isolation_violations_surface_precise_reasons() {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(lock_manager.clone());

    let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
    let err = lock_manager
        .lock_table(&txn, LockMode::SharedIntentionExclusive, 1)
        .unwrap_err();
    match err {
        VellumDBError::TransactionAbort { txn_id, reason } => {
            assert_eq!(txn_id, txn.id());
            assert_eq!(reason, AbortReason::LockSharedOnReadUncommitted);
        }
        other => panic!("unexpected error {other}"),
    }
}

/// The buffer pool refuses work only while saturated with pinned pages.
#[test]
fn buffer_pool_saturation_and_recovery() {
    let temp_dir = TempDir::new().unwrap();
    let disk_manager = Arc::new(DiskManager::try_new(temp_dir.path().join("test.db")).unwrap());
    let disk_scheduler = Arc::new(DiskScheduler::new(disk_manager));
    let manager = Arc::new(BufferManager::new(4, disk_scheduler));

    let mut guards = Vec::new();
    for _ in 0..4 {
        guards.push(manager.new_page().unwrap());
    }
    assert!(manager.new_page().is_err());

    let freed = guards.pop().unwrap();
    let freed_id = freed.page_id();
    drop(freed);
    let replacement = manager.new_page().unwrap();
    assert_ne!(replacement.page_id(), freed_id);
}
