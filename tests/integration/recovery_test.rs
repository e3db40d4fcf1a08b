// Recovery Integration Tests

use anyhow::Result;
use tempfile::TempDir;

use granitedb::engine::{EngineConfig, StorageEngine};
use granitedb::transaction::wal::log_manager::append_raw_bytes;

fn durable_config(dir: &TempDir) -> EngineConfig {
    EngineConfig {
        data_path: dir.path().join("recovery.db"),
        log_dir: dir.path().join("logs"),
        sync_commit: true,
        ..Default::default()
    }
}

#[test]
fn test_committed_writes_survive_a_crash() -> Result<()> {
    let dir = TempDir::new()?;

    {
        let engine = StorageEngine::open(durable_config(&dir))?;
        let txn = engine.begin_txn()?;
        for key in 1..=50u64 {
            engine.put(txn, key, key * 10)?;
        }
        engine.commit(txn)?;
        // Dropped without close(): dirty pages are lost, only the WAL
        // survives, as after a kill.
    }

    let engine = StorageEngine::open(durable_config(&dir))?;
    let txn = engine.begin_txn()?;
    for key in 1..=50u64 {
        assert_eq!(engine.get(txn, key)?, Some(key * 10));
    }
    engine.commit(txn)?;
    engine.close()?;
    Ok(())
}

#[test]
fn test_uncommitted_writes_are_rolled_back() -> Result<()> {
    let dir = TempDir::new()?;

    {
        let engine = StorageEngine::open(durable_config(&dir))?;

        // An in-flight transaction writes, then a second transaction
        // commits, which also makes the first one's records durable.
        let in_flight = engine.begin_txn()?;
        engine.put(in_flight, 100, 1000)?;
        engine.put(in_flight, 101, 1010)?;

        let committed = engine.begin_txn()?;
        engine.put(committed, 1, 10)?;
        engine.commit(committed)?;
        // Crash with in_flight unresolved.
    }

    let engine = StorageEngine::open(durable_config(&dir))?;
    let txn = engine.begin_txn()?;
    assert_eq!(engine.get(txn, 1)?, Some(10));
    assert_eq!(engine.get(txn, 100)?, None, "loser insert must be undone");
    assert_eq!(engine.get(txn, 101)?, None);
    engine.commit(txn)?;
    Ok(())
}

#[test]
fn test_aborted_transaction_stays_aborted_after_crash() -> Result<()> {
    let dir = TempDir::new()?;

    {
        let engine = StorageEngine::open(durable_config(&dir))?;

        let keep = engine.begin_txn()?;
        engine.put(keep, 1, 11)?;
        engine.commit(keep)?;

        let doomed = engine.begin_txn()?;
        engine.put(doomed, 1, 999)?;
        engine.put(doomed, 2, 22)?;
        engine.abort(doomed)?;
    }

    let engine = StorageEngine::open(durable_config(&dir))?;
    let txn = engine.begin_txn()?;
    assert_eq!(engine.get(txn, 1)?, Some(11));
    assert_eq!(engine.get(txn, 2)?, None);
    engine.commit(txn)?;
    Ok(())
}

#[test]
fn test_deletes_survive_a_crash() -> Result<()> {
    let dir = TempDir::new()?;

    {
        let engine = StorageEngine::open(durable_config(&dir))?;
        let txn = engine.begin_txn()?;
        for key in 1..=10u64 {
            engine.put(txn, key, key)?;
        }
        engine.commit(txn)?;

        let txn = engine.begin_txn()?;
        engine.delete(txn, 3)?;
        engine.delete(txn, 7)?;
        engine.commit(txn)?;
    }

    let engine = StorageEngine::open(durable_config(&dir))?;
    let txn = engine.begin_txn()?;
    assert_eq!(engine.get(txn, 3)?, None);
    assert_eq!(engine.get(txn, 7)?, None);
    assert_eq!(engine.get(txn, 5)?, Some(5));
    engine.commit(txn)?;
    Ok(())
}

#[test]
fn test_checkpoint_bounds_replay() -> Result<()> {
    let dir = TempDir::new()?;

    {
        let engine = StorageEngine::open(durable_config(&dir))?;

        let txn = engine.begin_txn()?;
        for key in 1..=30u64 {
            engine.put(txn, key, key)?;
        }
        engine.commit(txn)?;
        engine.checkpoint()?;

        let txn = engine.begin_txn()?;
        for key in 31..=60u64 {
            engine.put(txn, key, key)?;
        }
        engine.commit(txn)?;
        // Crash after the checkpoint plus further committed work.
    }

    let engine = StorageEngine::open(durable_config(&dir))?;
    let txn = engine.begin_txn()?;
    for key in 1..=60u64 {
        assert_eq!(engine.get(txn, key)?, Some(key));
    }
    engine.commit(txn)?;
    Ok(())
}

#[test]
fn test_torn_log_tail_is_tolerated() -> Result<()> {
    let dir = TempDir::new()?;

    {
        let engine = StorageEngine::open(durable_config(&dir))?;
        let txn = engine.begin_txn()?;
        for key in 1..=20u64 {
            engine.put(txn, key, key * 3)?;
        }
        engine.commit(txn)?;
    }

    // Corrupt the log tail the way a torn write would: a frame header
    // followed by bytes that fail the checksum.
    let log_file = std::fs::read_dir(dir.path().join("logs"))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .find(|p| p.is_file())
        .expect("log file exists");
    append_raw_bytes(
        &log_file,
        &[0x40, 0x00, 0x00, 0x00, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03],
    )?;

    // Replay truncates at the bad record; everything before it is intact.
    let engine = StorageEngine::open(durable_config(&dir))?;
    let txn = engine.begin_txn()?;
    for key in 1..=20u64 {
        assert_eq!(engine.get(txn, key)?, Some(key * 3));
    }
    engine.commit(txn)?;
    Ok(())
}

#[test]
fn test_repeated_crashes_converge() -> Result<()> {
    let dir = TempDir::new()?;

    for round in 1..=3u64 {
        let engine = StorageEngine::open(durable_config(&dir))?;
        let txn = engine.begin_txn()?;
        engine.put(txn, round, round * 100)?;
        engine.commit(txn)?;

        // A loser in every round.
        let loser = engine.begin_txn()?;
        engine.put(loser, 1000 + round, 1)?;
        drop(engine);
    }

    let engine = StorageEngine::open(durable_config(&dir))?;
    let txn = engine.begin_txn()?;
    for round in 1..=3u64 {
        assert_eq!(engine.get(txn, round)?, Some(round * 100));
        assert_eq!(engine.get(txn, 1000 + round)?, None);
    }
    engine.commit(txn)?;
    engine.close()?;
    Ok(())
}
