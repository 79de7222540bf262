//! End-to-end engine scenarios over file-backed environments.

use burrow_db::{
    CursorOp, DbFlags, Env, EnvFlags, Error, TxnRead, WriteFlags, PAGE_SIZE,
};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn minimal_put_get_over_a_small_file() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let env = Env::options()
        .map_size(16 * PAGE_SIZE)
        .open(dir.path())
        .unwrap();

    let mut txn = env.begin_write().unwrap();
    let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(dbi, b"test_key", b"test_value", WriteFlags::empty())
        .unwrap();
    txn.commit().unwrap();

    let mut rtxn = env.begin_read().unwrap();
    let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
    let value = rtxn.get(dbi, b"test_key").unwrap();
    assert_eq!(&*value, b"test_value");
    assert_eq!(value.len(), 10);
}

#[test]
fn reopen_yields_identical_state() {
    init_logging();
    let dir = TempDir::new().unwrap();
    {
        let env = Env::options()
            .map_size(64 * PAGE_SIZE)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        for i in 0..50u32 {
            txn.put(
                dbi,
                format!("key-{i:04}").as_bytes(),
                format!("value-{i}").as_bytes(),
                WriteFlags::empty(),
            )
            .unwrap();
        }
        txn.commit().unwrap();
        env.close();
    }

    let env = Env::options()
        .map_size(64 * PAGE_SIZE)
        .open(dir.path())
        .unwrap();
    let mut rtxn = env.begin_read().unwrap();
    let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
    for i in 0..50u32 {
        let v = rtxn.get(dbi, format!("key-{i:04}").as_bytes()).unwrap();
        assert_eq!(&*v, format!("value-{i}").as_bytes());
    }
    assert_eq!(rtxn.db_stat(dbi).unwrap().entries, 50);
    drop(rtxn);

    // A second clean reopen lands on the same snapshot.
    let stat = env.stat();
    env.close();
    let env = Env::options()
        .map_size(64 * PAGE_SIZE)
        .open(dir.path())
        .unwrap();
    assert_eq!(env.stat(), stat);
}

#[test]
fn durability_worker_certifies_syncs() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let env = Env::options()
        .map_size(32 * PAGE_SIZE)
        .open(dir.path())
        .unwrap();
    for _ in 0..2 {
        let (pre, ticket) = env.register_notification().unwrap();
        ticket.wait().unwrap();
        assert!(env.counter() > pre);
    }
    env.sync(true).unwrap();
}

#[test]
fn reader_isolation_across_commit() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let env = Env::options()
        .map_size(64 * PAGE_SIZE)
        .open(dir.path())
        .unwrap();

    let mut old = env.begin_read().unwrap();
    let old_dbi = old.open_db(None, DbFlags::empty()).unwrap();
    let t0 = old.id();

    let mut txn = env.begin_write().unwrap();
    let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
    txn.put(dbi, b"k", b"v1", WriteFlags::empty()).unwrap();
    txn.commit().unwrap();

    assert!(matches!(old.get(old_dbi, b"k"), Err(Error::NotFound)));

    let mut fresh = env.begin_read().unwrap();
    let dbi = fresh.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(&*fresh.get(dbi, b"k").unwrap(), b"v1");
    assert!(fresh.id() > t0);
}

#[test]
fn previous_snapshot_mode_sees_the_older_meta() {
    init_logging();
    let dir = TempDir::new().unwrap();
    {
        let env = Env::options()
            .map_size(64 * PAGE_SIZE)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"gen", b"one", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();

        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"gen", b"two", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.close();
    }

    let env = Env::options()
        .map_size(64 * PAGE_SIZE)
        .flags(EnvFlags::PREV_SNAPSHOT)
        .open(dir.path())
        .unwrap();
    let mut rtxn = env.begin_read().unwrap();
    let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(&*rtxn.get(dbi, b"gen").unwrap(), b"one");
}

#[test]
fn nosubdir_uses_the_path_as_data_file() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("standalone.bdb");
    {
        let env = Env::options()
            .map_size(32 * PAGE_SIZE)
            .flags(EnvFlags::NOSUBDIR)
            .open(&path)
            .unwrap();
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.close();
    }
    assert!(path.is_file());
    let mut lock = path.as_os_str().to_owned();
    lock.push("-lock");
    assert!(std::path::Path::new(&lock).is_file());

    let env = Env::options()
        .map_size(32 * PAGE_SIZE)
        .flags(EnvFlags::NOSUBDIR)
        .open(&path)
        .unwrap();
    let mut rtxn = env.begin_read().unwrap();
    let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(&*rtxn.get(dbi, b"k").unwrap(), b"v");
}

#[test]
fn read_only_open_rejects_writers() {
    init_logging();
    let dir = TempDir::new().unwrap();
    {
        let env = Env::options()
            .map_size(32 * PAGE_SIZE)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"k", b"v", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.close();
    }
    let env = Env::options()
        .map_size(32 * PAGE_SIZE)
        .flags(EnvFlags::RDONLY)
        .open(dir.path())
        .unwrap();
    assert!(env.begin_write().is_err());
    let mut rtxn = env.begin_read().unwrap();
    let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(&*rtxn.get(dbi, b"k").unwrap(), b"v");
}

#[test]
fn named_tables_survive_reopen() {
    init_logging();
    let dir = TempDir::new().unwrap();
    {
        let env = Env::options()
            .map_size(64 * PAGE_SIZE)
            .max_dbs(4)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_write().unwrap();
        let logs = txn.open_db(Some("logs"), DbFlags::CREATE).unwrap();
        let dups = txn
            .open_db(Some("tags"), DbFlags::CREATE | DbFlags::DUPSORT)
            .unwrap();
        txn.put(logs, b"2026-08-01", b"opened", WriteFlags::empty())
            .unwrap();
        txn.put(dups, b"post-1", b"rust", WriteFlags::empty()).unwrap();
        txn.put(dups, b"post-1", b"storage", WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.close();
    }

    let env = Env::options()
        .map_size(64 * PAGE_SIZE)
        .max_dbs(4)
        .open(dir.path())
        .unwrap();
    let mut rtxn = env.begin_read().unwrap();
    let logs = rtxn.open_db(Some("logs"), DbFlags::empty()).unwrap();
    let tags = rtxn.open_db(Some("tags"), DbFlags::empty()).unwrap();
    assert_eq!(&*rtxn.get(logs, b"2026-08-01").unwrap(), b"opened");
    assert_eq!(&*rtxn.get(tags, b"post-1").unwrap(), b"rust");
    let mut cursor = rtxn.cursor(tags).unwrap();
    cursor.get(CursorOp::Set, Some(b"post-1"), None).unwrap();
    assert_eq!(cursor.count().unwrap(), 2);

    // Reopening with conflicting flags is refused.
    assert!(matches!(
        rtxn.open_db(Some("logs"), DbFlags::DUPSORT),
        Err(Error::Incompatible)
    ));
}

#[test]
fn overflow_values_survive_reopen() {
    init_logging();
    let dir = TempDir::new().unwrap();
    let blob: Vec<u8> = (0..60_000u32).map(|i| (i % 241) as u8).collect();
    {
        let env = Env::options()
            .map_size(128 * PAGE_SIZE)
            .open(dir.path())
            .unwrap();
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        txn.put(dbi, b"blob", &blob, WriteFlags::empty()).unwrap();
        txn.commit().unwrap();
        env.close();
    }
    let env = Env::options()
        .map_size(128 * PAGE_SIZE)
        .open(dir.path())
        .unwrap();
    let mut rtxn = env.begin_read().unwrap();
    let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
    assert_eq!(&*rtxn.get(dbi, b"blob").unwrap(), &blob[..]);
}

#[test]
fn bulk_random_churn_stays_consistent() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    init_logging();
    let dir = TempDir::new().unwrap();
    let env = Env::options()
        .map_size(1024 * PAGE_SIZE)
        .open(dir.path())
        .unwrap();
    let mut rng = StdRng::seed_from_u64(0xb0220);
    let mut model = std::collections::BTreeMap::new();

    for _round in 0..8 {
        let mut txn = env.begin_write().unwrap();
        let dbi = txn.open_db(None, DbFlags::empty()).unwrap();
        for _ in 0..120 {
            let k = rng.gen_range(0..400u32);
            let key = format!("k{k:05}");
            if rng.gen_bool(0.3) && model.contains_key(&key) {
                txn.del(dbi, key.as_bytes(), None).unwrap();
                model.remove(&key);
            } else {
                let len = rng.gen_range(1..300usize);
                let val: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                txn.put(dbi, key.as_bytes(), &val, WriteFlags::empty())
                    .unwrap();
                model.insert(key, val);
            }
        }
        txn.commit().unwrap();

        let mut rtxn = env.begin_read().unwrap();
        let dbi = rtxn.open_db(None, DbFlags::empty()).unwrap();
        assert_eq!(rtxn.db_stat(dbi).unwrap().entries, model.len() as u64);
        let mut cursor = rtxn.cursor(dbi).unwrap();
        let mut op = CursorOp::First;
        let mut walked = 0usize;
        let mut expect = model.iter();
        loop {
            match cursor.get(op, None, None) {
                Ok((k, v)) => {
                    let (mk, mv) = expect.next().expect("cursor yielded an extra entry");
                    assert_eq!(&*k, mk.as_bytes());
                    assert_eq!(&*v, &mv[..]);
                    walked += 1;
                }
                Err(Error::NotFound) => break,
                Err(e) => panic!("{e}"),
            }
            op = CursorOp::Next;
        }
        assert_eq!(walked, model.len());
    }
}
