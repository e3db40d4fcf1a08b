// Transaction Integration Tests (engine level)

use std::sync::{Arc, Barrier};
use std::thread;
use anyhow::Result;
use tempfile::TempDir;

use granitedb::engine::{EngineConfig, EngineError, StorageEngine};
use granitedb::transaction::concurrency::lock_manager::{LockError, LockMode};
use granitedb::transaction::concurrency::transaction::IsolationLevel;

fn test_engine(dir: &TempDir) -> Result<StorageEngine> {
    test_engine_with(dir, IsolationLevel::ReadCommitted)
}

fn test_engine_with(dir: &TempDir, isolation: IsolationLevel) -> Result<StorageEngine> {
    let config = EngineConfig {
        data_path: dir.path().join("txn.db"),
        log_dir: dir.path().join("logs"),
        sync_commit: false,
        isolation_level: isolation,
        ..Default::default()
    };
    Ok(StorageEngine::open(config)?)
}

#[test]
fn test_commit_makes_writes_visible() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = test_engine(&dir)?;

    let writer = engine.begin_txn()?;
    engine.put(writer, 1, 10)?;
    engine.put(writer, 2, 20)?;
    engine.commit(writer)?;

    let reader = engine.begin_txn()?;
    assert_eq!(engine.get(reader, 1)?, Some(10));
    assert_eq!(engine.get(reader, 2)?, Some(20));
    engine.commit(reader)?;
    Ok(())
}

#[test]
fn test_abort_undoes_inserts_updates_and_deletes() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = test_engine(&dir)?;

    let setup = engine.begin_txn()?;
    for key in 1..=20u64 {
        engine.put(setup, key, key * 10)?;
    }
    engine.commit(setup)?;

    let txn = engine.begin_txn()?;
    engine.put(txn, 21, 210)?; // insert
    engine.put(txn, 5, 999)?; // update
    engine.delete(txn, 10)?; // delete
    engine.abort(txn)?;

    let reader = engine.begin_txn()?;
    assert_eq!(engine.get(reader, 21)?, None);
    assert_eq!(engine.get(reader, 5)?, Some(50));
    assert_eq!(engine.get(reader, 10)?, Some(100));
    engine.commit(reader)?;
    Ok(())
}

#[test]
fn test_operations_on_finished_transaction_fail() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = test_engine(&dir)?;

    let txn = engine.begin_txn()?;
    engine.put(txn, 1, 1)?;
    engine.commit(txn)?;

    assert!(matches!(
        engine.put(txn, 2, 2),
        Err(EngineError::UnknownTransaction(_))
    ));
    assert!(engine.commit(txn).is_err());
    assert!(engine.abort(txn).is_err());
    Ok(())
}

#[test]
fn test_prepare_refuses_mutations_then_commits() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = test_engine(&dir)?;

    let txn = engine.begin_txn()?;
    engine.put(txn, 1, 100)?;
    engine.prepare(txn)?;

    assert!(matches!(
        engine.put(txn, 2, 200),
        Err(EngineError::Transaction(_))
    ));

    engine.commit(txn)?;
    let reader = engine.begin_txn()?;
    assert_eq!(engine.get(reader, 1)?, Some(100));
    engine.commit(reader)?;
    Ok(())
}

#[test]
fn test_read_committed_releases_read_locks_early() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = test_engine_with(&dir, IsolationLevel::ReadCommitted)?;

    let setup = engine.begin_txn()?;
    engine.put(setup, 1, 10)?;
    engine.commit(setup)?;

    let reader = engine.begin_txn()?;
    assert_eq!(engine.get(reader, 1)?, Some(10));

    // The read lock is gone as soon as the read completed, so a writer
    // can take the exclusive immediately.
    let writer = engine.begin_txn()?;
    engine.try_acquire_lock(writer, 1, LockMode::Exclusive)?;
    engine.release_lock(writer, 1)?;
    engine.commit(writer)?;
    engine.commit(reader)?;
    Ok(())
}

#[test]
fn test_serializable_holds_read_locks_to_commit() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = test_engine_with(&dir, IsolationLevel::Serializable)?;

    let setup = engine.begin_txn()?;
    engine.put(setup, 1, 10)?;
    engine.commit(setup)?;

    let reader = engine.begin_txn()?;
    assert_eq!(engine.get(reader, 1)?, Some(10));

    // The shared lock is held until the reader commits: a writer's
    // non-blocking probe must fail.
    let writer = engine.begin_txn()?;
    assert!(matches!(
        engine.try_acquire_lock(writer, 1, LockMode::Exclusive),
        Err(EngineError::Lock(LockError::WouldBlock))
    ));

    engine.commit(reader)?;
    engine.try_acquire_lock(writer, 1, LockMode::Exclusive)?;
    engine.commit(writer)?;
    Ok(())
}

#[test]
fn test_engine_deadlock_one_victim_one_survivor() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(test_engine(&dir)?);
    let barrier = Arc::new(Barrier::new(2));

    const KEY_A: u64 = 1;
    const KEY_B: u64 = 2;

    let spawn = |first: u64, second: u64| {
        let engine = engine.clone();
        let barrier = barrier.clone();
        thread::spawn(move || -> std::result::Result<(), EngineError> {
            let txn = engine.begin_txn()?;
            engine.put(txn, first, first * 100)?;
            barrier.wait();
            // The opposing orders force a cycle; the engine aborts the
            // victim automatically.
            engine.put(txn, second, second * 100)?;
            engine.commit(txn)?;
            Ok(())
        })
    };

    let t1 = spawn(KEY_A, KEY_B);
    let t2 = spawn(KEY_B, KEY_A);
    let r1 = t1.join().unwrap();
    let r2 = t2.join().unwrap();

    let victims = [&r1, &r2]
        .iter()
        .filter(|r| matches!(r, Err(EngineError::Lock(LockError::DeadlockVictim(_)))))
        .count();
    let survivors = [&r1, &r2].iter().filter(|r| r.is_ok()).count();
    assert_eq!(victims, 1, "exactly one deadlock victim");
    assert_eq!(survivors, 1, "the other transaction commits");

    // The survivor's writes are visible; the victim's were rolled back.
    let reader = engine.begin_txn()?;
    let a = engine.get(reader, KEY_A)?;
    let b = engine.get(reader, KEY_B)?;
    engine.commit(reader)?;

    if r1.is_ok() {
        assert_eq!(a, Some(KEY_A * 100));
        assert_eq!(b, Some(KEY_B * 100));
    } else {
        assert_eq!(b, Some(KEY_B * 100));
        assert_eq!(a, Some(KEY_A * 100));
    }
    Ok(())
}

#[test]
fn test_concurrent_disjoint_writers_both_commit() -> Result<()> {
    let dir = TempDir::new()?;
    let engine = Arc::new(test_engine(&dir)?);

    let mut handles = Vec::new();
    for worker in 0..4u64 {
        let engine = engine.clone();
        handles.push(thread::spawn(move || -> std::result::Result<(), EngineError> {
            let base = worker * 100;
            let txn = engine.begin_txn()?;
            for key in base..base + 25 {
                engine.put(txn, key, key + 1)?;
            }
            engine.commit(txn)?;
            Ok(())
        }));
    }
    for handle in handles {
        handle.join().unwrap()?;
    }

    let reader = engine.begin_txn()?;
    for worker in 0..4u64 {
        let base = worker * 100;
        for key in base..base + 25 {
            assert_eq!(engine.get(reader, key)?, Some(key + 1));
        }
    }
    engine.commit(reader)?;
    Ok(())
}
