use cascadb::{
    store::{Directory, RamDirectory},
    Database, LogMgr, Options, Slice,
};
use std::sync::Arc;
use test_log::test;

#[test]
fn crash_recovery_replays_log() -> cascadb::Result<()> {
    let ram = Arc::new(RamDirectory::new());
    let dir: Arc<dyn Directory> = ram.clone();

    // write straight to the redo log, then "crash": dropping the
    // manager would count as a clean shutdown and delete the logs
    {
        let lmgr = Arc::new(LogMgr::new(
            Arc::new(Options::default()),
            Some(dir.clone()),
        ));
        LogMgr::init(&lmgr)?;

        let big = Slice::from(vec![0u8; 512]);
        for _ in 0..10 {
            lmgr.enq_put(&big, &big, 0, false);
        }

        lmgr.enq_put(&Slice::from("key1"), &Slice::from("value1"), 0, false);
        lmgr.enq_put(&Slice::from("key2"), &Slice::from("value2"), 0, false);
        lmgr.enq_del(&Slice::from("key2"), 0, false);

        lmgr.flush();
        lmgr.fsync();

        std::mem::forget(lmgr);
    }

    assert!(ram.file_exists("cdb000001.redolog"));

    // opening the database replays the surviving log from LSN 0
    let db = Database::open_with("tree_test", dir.clone(), Some(dir.clone()), Options::default())?;

    assert_eq!(13, db.recovered_records());
    assert_eq!(Some(Slice::from("value1")), db.get("key1")?);
    assert_eq!(None, db.get("key2")?);

    // fully replayed logs are deleted
    assert!(!ram.file_exists("cdb000001.redolog"));

    Ok(())
}

#[test]
fn checkpoint_bounds_replay() -> cascadb::Result<()> {
    let ram = Arc::new(RamDirectory::new());
    let dir: Arc<dyn Directory> = ram.clone();

    let options = || Options {
        inner_node_msg_count: 4,
        inner_node_children_number: 2,
        leaf_node_record_count: 4,
        log_flush_period_ms: 20,
        log_fsync_period_ms: 20,
        ..Options::default()
    };

    {
        let db = Database::open_with("ckpt_test", dir.clone(), Some(dir.clone()), options())?;

        for i in 0..20u32 {
            db.put(format!("key{i:02}"), format!("value{i}"))?;
        }

        // checkpoint: everything so far is durable in the data file
        db.flush()?;

        // these two land only in the log
        db.put("late1", "l1")?;
        db.put("late2", "l2")?;

        // give the log crons a moment to write and fsync them
        std::thread::sleep(std::time::Duration::from_millis(500));

        // crash without a clean shutdown
        std::mem::forget(db);
    }

    {
        let db = Database::open_with("ckpt_test", dir.clone(), Some(dir.clone()), options())?;

        // only the records past the checkpoint LSN are replayed
        assert_eq!(2, db.recovered_records());

        for i in 0..20u32 {
            assert_eq!(
                Some(Slice::from(format!("value{i}"))),
                db.get(format!("key{i:02}"))?,
            );
        }
        assert_eq!(Some(Slice::from("l1")), db.get("late1")?);
        assert_eq!(Some(Slice::from("l2")), db.get("late2")?);
    }

    Ok(())
}

#[test]
fn recovery_is_idempotent_per_key() -> cascadb::Result<()> {
    let ram = Arc::new(RamDirectory::new());
    let dir: Arc<dyn Directory> = ram.clone();

    // a log with several versions of one key replays to the last one
    {
        let lmgr = Arc::new(LogMgr::new(
            Arc::new(Options::default()),
            Some(dir.clone()),
        ));
        LogMgr::init(&lmgr)?;

        lmgr.enq_put(&Slice::from("k"), &Slice::from("v1"), 0, false);
        lmgr.enq_put(&Slice::from("k"), &Slice::from("v2"), 0, false);
        lmgr.enq_del(&Slice::from("k"), 0, false);
        lmgr.enq_put(&Slice::from("k"), &Slice::from("v3"), 0, false);

        lmgr.flush();
        lmgr.fsync();
        std::mem::forget(lmgr);
    }

    let db = Database::open_with("idem_test", dir.clone(), Some(dir.clone()), Options::default())?;

    assert_eq!(4, db.recovered_records());
    assert_eq!(Some(Slice::from("v3")), db.get("k")?);

    Ok(())
}
