// Lock Manager Integration Tests

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use granitedb::transaction::concurrency::lock_manager::{LockError, LockManager, LockMode};

#[test]
fn test_shared_then_exclusive_blocks() {
    let lm = LockManager::new();
    lm.lock(1, 500, LockMode::Shared).unwrap();
    lm.lock(2, 500, LockMode::Shared).unwrap();

    assert_eq!(
        lm.try_lock(3, 500, LockMode::Exclusive),
        Err(LockError::WouldBlock)
    );

    lm.unlock_all(1);
    lm.unlock_all(2);
    lm.try_lock(3, 500, LockMode::Exclusive).unwrap();
}

#[test]
fn test_release_wakes_blocked_waiter() {
    let lm = Arc::new(LockManager::new());
    lm.lock(1, 7, LockMode::Exclusive).unwrap();

    let lm2 = lm.clone();
    let waiter = thread::spawn(move || {
        lm2.lock(2, 7, LockMode::Exclusive).unwrap();
        lm2.unlock_all(2);
    });

    thread::sleep(Duration::from_millis(50));
    lm.unlock_all(1);
    waiter.join().unwrap();
}

#[test]
fn test_shared_run_promoted_together() {
    let lm = Arc::new(LockManager::new());
    lm.lock(1, 9, LockMode::Exclusive).unwrap();

    let granted = Arc::new(AtomicUsize::new(0));
    let mut readers = Vec::new();
    for txn_id in 2..=4u64 {
        let lm = lm.clone();
        let granted = granted.clone();
        readers.push(thread::spawn(move || {
            lm.lock(txn_id, 9, LockMode::Shared).unwrap();
            granted.fetch_add(1, Ordering::SeqCst);
            // Hold briefly so the readers overlap.
            thread::sleep(Duration::from_millis(100));
            lm.unlock_all(txn_id);
        }));
    }

    thread::sleep(Duration::from_millis(50));
    assert_eq!(granted.load(Ordering::SeqCst), 0, "writer still holds");

    lm.unlock_all(1);
    thread::sleep(Duration::from_millis(60));
    // All queued shared requests were granted together.
    assert_eq!(granted.load(Ordering::SeqCst), 3);

    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_classic_ab_ba_deadlock_one_victim() {
    let lm = Arc::new(LockManager::new());
    let barrier = Arc::new(Barrier::new(2));

    let spawn = |txn_id: u64, first: u64, second: u64| {
        let lm = lm.clone();
        let barrier = barrier.clone();
        thread::spawn(move || -> Result<(), LockError> {
            lm.lock(txn_id, first, LockMode::Exclusive)?;
            barrier.wait();
            let result = lm.lock(txn_id, second, LockMode::Exclusive);
            if result.is_err() {
                // The victim must release what it holds so the survivor
                // can finish.
                lm.unlock_all(txn_id);
                return result;
            }
            lm.unlock_all(txn_id);
            Ok(())
        })
    };

    let t1 = spawn(1, 100, 200);
    let t2 = spawn(2, 200, 100);

    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    let victims = [r1, r2]
        .iter()
        .filter(|r| matches!(r, Err(LockError::DeadlockVictim(_))))
        .count();
    let survivors = [r1, r2].iter().filter(|r| r.is_ok()).count();
    assert_eq!(victims, 1, "exactly one transaction is the victim");
    assert_eq!(survivors, 1, "the other transaction proceeds");

    // The youngest transaction in the cycle (id 2) is the chosen victim.
    assert!(r2.is_err(), "victim selection prefers the youngest");
}

#[test]
fn test_simultaneous_upgrade_deadlocks() {
    let lm = Arc::new(LockManager::new());
    lm.lock(1, 77, LockMode::Shared).unwrap();
    lm.lock(2, 77, LockMode::Shared).unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let spawn = |txn_id: u64| {
        let lm = lm.clone();
        let barrier = barrier.clone();
        thread::spawn(move || -> Result<(), LockError> {
            barrier.wait();
            // Upgrade: both already hold Shared, both want Exclusive.
            let result = lm.lock(txn_id, 77, LockMode::Exclusive);
            if result.is_err() {
                lm.unlock_all(txn_id);
            }
            result
        })
    };

    let t1 = spawn(1);
    let t2 = spawn(2);
    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    // The classic upgrade deadlock is detected, not silently accepted:
    // one upgrader dies, the other gets the exclusive.
    let victims = [r1, r2]
        .iter()
        .filter(|r| matches!(r, Err(LockError::DeadlockVictim(_))))
        .count();
    assert_eq!(victims, 1);
    assert_eq!([r1, r2].iter().filter(|r| r.is_ok()).count(), 1);
}

#[test]
fn test_fifo_ordering_between_writers() {
    let lm = Arc::new(LockManager::new());
    lm.lock(1, 3, LockMode::Exclusive).unwrap();

    let order = Arc::new(order_log::OrderLog::new());

    let mut writers = Vec::new();
    for txn_id in [2u64, 3] {
        let lm = lm.clone();
        let order = order.clone();
        writers.push(thread::spawn(move || {
            lm.lock(txn_id, 3, LockMode::Exclusive).unwrap();
            order.push(txn_id);
            thread::sleep(Duration::from_millis(20));
            lm.unlock_all(txn_id);
        }));
        // Stagger the arrivals so the queue order is deterministic.
        thread::sleep(Duration::from_millis(30));
    }

    lm.unlock_all(1);
    for writer in writers {
        writer.join().unwrap();
    }
    assert_eq!(order.snapshot(), vec![2, 3]);
}

/// Tiny append-only log used to observe grant order across threads.
mod order_log {
    use std::sync::Mutex;

    pub struct OrderLog(Mutex<Vec<u64>>);

    impl OrderLog {
        pub fn new() -> Self {
            Self(Mutex::new(Vec::new()))
        }

        pub fn push(&self, id: u64) {
            self.0.lock().unwrap().push(id);
        }

        pub fn snapshot(&self) -> Vec<u64> {
            self.0.lock().unwrap().clone()
        }
    }
}
