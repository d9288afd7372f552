use cascadb::{Database, Options};
use test_log::test;

fn small_options() -> Options {
    Options {
        inner_node_msg_count: 4,
        inner_node_children_number: 2,
        leaf_node_record_count: 4,
        ..Options::default()
    }
}

#[test]
fn db_reload_smoke_test() -> cascadb::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Database::open(&folder, small_options())?;
        db.put("a", "a")?;
        db.flush()?;

        assert_eq!(Some("a".as_bytes().into()), db.get("a")?);
    }

    {
        let db = Database::open(&folder, small_options())?;

        // a clean shutdown leaves nothing to replay
        assert_eq!(0, db.recovered_records());
        assert_eq!(Some("a".as_bytes().into()), db.get("a")?);
    }

    Ok(())
}

#[test]
fn db_reload_many_keys() -> cascadb::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Database::open(&folder, small_options())?;
        for i in 0..300u32 {
            db.put(format!("key{i:04}"), format!("value{i}"))?;
        }
        // drop flushes and checkpoints on the way out
    }

    {
        let db = Database::open(&folder, small_options())?;

        for i in 0..300u32 {
            assert_eq!(
                Some(format!("value{i}").into_bytes().into()),
                db.get(format!("key{i:04}"))?,
                "key{i:04} lost across reload",
            );
        }

        assert!(db.status().node_load_from_disk_num() > 0);
    }

    Ok(())
}

#[test]
fn db_reload_after_deletes() -> cascadb::Result<()> {
    let folder = tempfile::tempdir()?;

    {
        let db = Database::open(&folder, small_options())?;
        for i in 0..100u32 {
            db.put(format!("key{i:04}"), "v")?;
        }
        for i in 0..50u32 {
            db.del(format!("key{i:04}"))?;
        }
        db.flush()?;
    }

    {
        let db = Database::open(&folder, small_options())?;

        for i in 0..50u32 {
            assert_eq!(None, db.get(format!("key{i:04}"))?);
        }
        for i in 50..100u32 {
            assert_eq!(Some("v".as_bytes().into()), db.get(format!("key{i:04}"))?);
        }
    }

    Ok(())
}
