use cascadb::{Database, Options};
use test_log::test;

// tiny structural limits so a handful of keys already forces cascades,
// splits and a pile-up
fn small_options() -> Options {
    Options {
        inner_node_msg_count: 4,
        inner_node_children_number: 2,
        leaf_node_record_count: 4,
        ..Options::default()
    }
}

#[test]
fn db_fresh_open_point_reads() -> cascadb::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Database::open(&folder, small_options())?;

    db.put("a", "1")?;
    db.put("b", "1")?;
    db.put("c", "1")?;

    // still buffered at the root, no leaf exists yet
    assert_eq!(0, db.status().leaf_created_num());
    assert_eq!(Some("1".as_bytes().into()), db.get("a")?);
    assert_eq!(Some("1".as_bytes().into()), db.get("b")?);
    assert_eq!(Some("1".as_bytes().into()), db.get("c")?);
    assert_eq!(None, db.get("d")?);

    // the 4th write overflows the root buffer and materializes leaf #1
    db.put("d", "1")?;
    assert_eq!(1, db.status().leaf_created_num());
    assert_eq!(Some("1".as_bytes().into()), db.get("d")?);

    Ok(())
}

#[test]
fn db_leaf_split_and_pileup() -> cascadb::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Database::open(&folder, small_options())?;

    for key in ["a", "b", "c", "d", "e", "f", "g", "h"] {
        db.put(key, "1")?;
    }

    assert_eq!(1, db.status().leaf_split_num());
    assert_eq!(2, db.tree_depth());

    // another leaf split propagates into the root and piles it up
    db.put("a", "2")?;
    db.put("b", "2")?;
    db.put("bb", "1")?;
    db.put("e", "2")?;

    assert!(db.status().tree_pileup_num() >= 1);
    assert_eq!(3, db.tree_depth());

    assert_eq!(Some("2".as_bytes().into()), db.get("a")?);
    assert_eq!(Some("1".as_bytes().into()), db.get("bb")?);
    assert_eq!(Some("2".as_bytes().into()), db.get("e")?);
    assert_eq!(Some("1".as_bytes().into()), db.get("h")?);

    Ok(())
}

#[test]
fn db_latest_write_wins() -> cascadb::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Database::open(&folder, small_options())?;

    db.put("k", "v1")?;
    db.put("k", "v2")?;
    assert_eq!(Some("v2".as_bytes().into()), db.get("k")?);

    // push the value through a few cascades; the latest version must
    // survive merging into the leaves
    for i in 0..40 {
        db.put(format!("pad{i:02}"), "x")?;
    }
    assert_eq!(Some("v2".as_bytes().into()), db.get("k")?);

    db.del("k")?;
    assert_eq!(None, db.get("k")?);

    for i in 40..80 {
        db.put(format!("pad{i:02}"), "x")?;
    }
    assert_eq!(None, db.get("k")?);

    Ok(())
}

#[test]
fn db_delete_everything() -> cascadb::Result<()> {
    let folder = tempfile::tempdir()?;
    let db = Database::open(&folder, small_options())?;

    let keys: Vec<String> = (0..24).map(|i| format!("key{i:02}")).collect();
    for key in &keys {
        db.put(key.as_str(), "v")?;
    }

    // deletes only travel down when buffers overflow; pad each round
    // with distinct neighbor keys until the depleted root collapses
    let mut round = 0;
    while db.status().tree_collapse_num() == 0 && round < 50 {
        for key in &keys {
            db.del(key.as_str())?;
            db.del(format!("{key}x{round}"))?;
        }
        round += 1;
    }

    for key in &keys {
        assert_eq!(None, db.get(key.as_str())?, "{key} should be gone");
    }

    assert!(db.status().leaf_merge_num() > 0);
    assert!(db.status().tree_collapse_num() >= 1);
    assert_eq!(2, db.tree_depth());

    Ok(())
}

#[test]
fn db_many_keys_shuffled() -> cascadb::Result<()> {
    use rand::seq::SliceRandom;

    let folder = tempfile::tempdir()?;
    let db = Database::open(&folder, small_options())?;

    let mut keys: Vec<u32> = (0..500).collect();
    keys.shuffle(&mut rand::rng());

    for &i in &keys {
        db.put(format!("key{i:04}"), format!("value{i}"))?;
    }

    for i in 0..500u32 {
        assert_eq!(
            Some(format!("value{i}").into_bytes().into()),
            db.get(format!("key{i:04}"))?,
            "key{i:04} lost",
        );
    }

    // flush everything out and read it all back through the cache
    db.flush()?;

    for i in 0..500u32 {
        assert_eq!(
            Some(format!("value{i}").into_bytes().into()),
            db.get(format!("key{i:04}"))?,
        );
    }

    assert!(db.status().cache_writeback_num() > 0);
    assert!(db.status().async_write_num() > 0);

    Ok(())
}
