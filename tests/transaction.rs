mod common;

use common::{val, TableStorage, PAYLOAD_LEN};
use kura::{Engine, Epoch, Error, IsolationLevel, XctId};
use std::time::Duration;

/// Epoch advances only on demand, so commit epochs are deterministic.
fn manual_engine(dir: &std::path::Path) -> Engine {
    common::init_tracing();
    Engine::options()
        .epoch_advance_interval(Duration::from_secs(3600))
        .open(dir)
        .unwrap()
}

#[test]
fn empty_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let mut worker = engine.worker();

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    let commit_epoch = worker.precommit_xct().unwrap();
    assert!(commit_epoch.is_valid());
    assert!(!engine.current_global_epoch().before(commit_epoch));
    // Nothing was staged, nothing was published.
    assert_eq!(worker.log_offsets(), (0, 0));

    engine.uninitialize().unwrap();
}

#[test]
fn api_misuse() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let mut worker = engine.worker();

    assert!(matches!(worker.precommit_xct(), Err(Error::NoXct)));
    assert!(matches!(worker.abort_xct(), Err(Error::NoXct)));

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    assert!(matches!(
        worker.begin_xct(IsolationLevel::Serializable),
        Err(Error::XctAlreadyRunning)
    ));
    worker.abort_xct().unwrap();
    // Aborting again from idle reports that nothing is running.
    assert!(matches!(worker.abort_xct(), Err(Error::NoXct)));
}

#[test]
fn begin_abort_begin_leaves_no_log_tail() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    storage.put(&mut worker, 0, &val(b"doomed")).unwrap();
    let (committed, tail) = worker.log_offsets();
    assert!(committed < tail);
    worker.abort_xct().unwrap();
    let (committed, tail) = worker.log_offsets();
    assert_eq!(committed, tail);

    // The aborted write never happened.
    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    assert_eq!(storage.get(&mut worker, 0).unwrap(), [0; PAYLOAD_LEN]);
    worker.precommit_xct().unwrap();
}

#[test]
fn single_record_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    while engine.current_global_epoch() != Epoch(5) {
        engine.advance_current_global_epoch();
    }
    storage.seed(0, XctId::new(Epoch(5), 1), &val(b"initial"));

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    let observed = storage.get(&mut worker, 0).unwrap();
    assert_eq!(observed, val(b"initial"));
    assert_eq!(worker.xct().read_set()[0].observed_xct_id, XctId::new(Epoch(5), 1));
    storage.put(&mut worker, 0, &val(b"X")).unwrap();
    let commit_epoch = worker.precommit_xct().unwrap();

    assert_eq!(commit_epoch, Epoch(5));
    assert_eq!(storage.owner(0).xct_id(), XctId::new(Epoch(5), 2));
    assert_eq!(storage.payload(0), val(b"X"));
    assert!(!storage.owner(0).is_keylocked());
}

#[test]
fn read_only_commit_returns_observed_epoch() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    let epoch = engine.current_global_epoch();
    storage.seed(0, XctId::new(epoch, 1), &val(b"steady"));

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    assert_eq!(storage.get(&mut worker, 0).unwrap(), val(b"steady"));
    let commit_epoch = worker.precommit_xct().unwrap();
    assert_eq!(commit_epoch, epoch);
    // A read-only commit publishes nothing.
    assert_eq!(worker.log_offsets(), (0, 0));
    // The owner word is untouched.
    assert_eq!(storage.owner(0).xct_id(), XctId::new(epoch, 1));
}

#[test]
fn write_write_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut winner = engine.worker();
    let mut loser = engine.worker();
    winner.register_storage(storage.clone()).unwrap();

    let epoch = engine.current_global_epoch();
    storage.seed(0, XctId::new(epoch, 1), &val(b"base"));

    winner.begin_xct(IsolationLevel::Serializable).unwrap();
    loser.begin_xct(IsolationLevel::Serializable).unwrap();
    storage.get(&mut winner, 0).unwrap();
    storage.get(&mut loser, 0).unwrap();
    storage.put(&mut winner, 0, &val(b"w")).unwrap();
    storage.put(&mut loser, 0, &val(b"l")).unwrap();

    assert_eq!(winner.precommit_xct().unwrap(), epoch);
    let winner_id = storage.owner(0).xct_id();
    assert_eq!(winner_id, XctId::new(epoch, 2));

    // The loser read the record the winner overwrote.
    assert!(matches!(loser.precommit_xct(), Err(Error::RaceAbort)));
    assert_eq!(storage.payload(0), val(b"w"));

    // A blind write does not verify the record and succeeds, ordered
    // right after the winner.
    loser.begin_xct(IsolationLevel::Serializable).unwrap();
    storage.put(&mut loser, 0, &val(b"l2")).unwrap();
    assert_eq!(loser.precommit_xct().unwrap(), epoch);
    assert_eq!(
        storage.owner(0).xct_id(),
        XctId::new(epoch, winner_id.ordinal() + 1)
    );
    assert_eq!(storage.payload(0), val(b"l2"));
}

#[test]
fn duplicate_write_entries_on_one_record() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    let epoch = engine.current_global_epoch();
    storage.seed(0, XctId::new(epoch, 1), &val(b"base"));

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    storage.put(&mut worker, 0, &val(b"first")).unwrap();
    storage.put(&mut worker, 0, &val(b"second")).unwrap();
    assert_eq!(worker.precommit_xct().unwrap(), epoch);

    // Only the last write of the run decides the record.
    assert_eq!(storage.payload(0), val(b"second"));
    assert_eq!(storage.owner(0).xct_id(), XctId::new(epoch, 2));
    assert!(!storage.owner(0).is_keylocked());
}

#[test]
fn delete_preserves_deleted_state() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    let epoch = engine.current_global_epoch();
    storage.seed(0, XctId::new(epoch, 1), &val(b"doomed"));

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    storage.delete(&mut worker, 0).unwrap();
    assert_eq!(worker.precommit_xct().unwrap(), epoch);

    let owner_id = storage.owner(0).xct_id();
    assert!(owner_id.is_deleted());
    assert_eq!(owner_id.without_status(), XctId::new(epoch, 2));
    assert!(!storage.owner(0).is_keylocked());
}

#[test]
fn moved_record_is_tracked_and_retried() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    let epoch = engine.current_global_epoch();
    storage.seed(0, XctId::new(epoch, 1), &val(b"roaming"));

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    assert_eq!(storage.get(&mut worker, 0).unwrap(), val(b"roaming"));
    storage.put(&mut worker, 0, &val(b"X")).unwrap();

    // The record hops twice before precommit: the first hop is caught by
    // the pre-lock check, the second only after the lock is acquired,
    // forcing the lock phase to start over.
    storage.relocate(0, 1);
    storage.relocate(1, 2);

    assert_eq!(worker.precommit_xct().unwrap(), epoch);
    assert_eq!(storage.payload(2), val(b"X"));
    assert_eq!(storage.owner(2).xct_id(), XctId::new(epoch, 2));
    assert!(storage.owner(0).is_moved());
    assert!(storage.owner(1).is_moved());
    assert!(!storage.owner(2).is_moved());
}

#[test]
fn record_moved_too_far_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    let epoch = engine.current_global_epoch();
    storage.seed(0, XctId::new(epoch, 1), &val(b"gone"));
    storage.relocate_lost(0);

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    storage.put(&mut worker, 0, &val(b"X")).unwrap();
    assert!(matches!(worker.precommit_xct(), Err(Error::RaceAbort)));

    // The staged write was discarded and the worker is reusable.
    let (committed, tail) = worker.log_offsets();
    assert_eq!(committed, tail);
    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    worker.precommit_xct().unwrap();
}

#[test]
fn wait_for_commit_reaches_durability() {
    let dir = tempfile::tempdir().unwrap();
    common::init_tracing();
    let engine = Engine::options()
        .epoch_advance_interval(Duration::from_millis(5))
        .open(dir.path())
        .unwrap();
    let storage = TableStorage::new(1, "accounts", 16);
    let mut worker = engine.worker();
    worker.register_storage(storage.clone()).unwrap();

    worker.begin_xct(IsolationLevel::Serializable).unwrap();
    storage.put(&mut worker, 0, &val(b"durable")).unwrap();
    let commit_epoch = worker.precommit_xct().unwrap();

    let durable = engine
        .wait_for_commit(commit_epoch, Some(Duration::from_secs(10)))
        .unwrap();
    assert!(!durable.before(commit_epoch));
    assert!(!engine.durable_global_epoch().before(commit_epoch));
}

#[test]
fn wait_for_commit_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let engine = manual_engine(dir.path());

    let far_future = Epoch(engine.current_global_epoch().0 + 1000);
    assert!(matches!(
        engine.wait_for_commit(far_future, Some(Duration::from_millis(20))),
        Err(Error::Timeout)
    ));
}

#[test]
fn concurrent_increments_are_serializable() {
    const THREADS: usize = 4;
    const INCREMENTS: u64 = 200;

    let dir = tempfile::tempdir().unwrap();
    common::init_tracing();
    let engine = Engine::options()
        .epoch_advance_interval(Duration::from_millis(2))
        .open(dir.path())
        .unwrap();
    let storage = TableStorage::new(1, "counter", 4);
    engine.worker().register_storage(storage.clone()).unwrap();

    let epoch = engine.current_global_epoch();
    storage.seed(0, XctId::new(epoch, 1), &val(&0u64.to_le_bytes()));

    std::thread::scope(|scope| {
        for _ in 0..THREADS {
            let engine = &engine;
            let storage = storage.clone();
            scope.spawn(move || {
                let mut worker = engine.worker();
                for _ in 0..INCREMENTS {
                    loop {
                        worker.begin_xct(IsolationLevel::Serializable).unwrap();
                        let payload = storage.get(&mut worker, 0).unwrap();
                        let counter = u64::from_le_bytes(payload[..8].try_into().unwrap());
                        storage
                            .put(&mut worker, 0, &val(&(counter + 1).to_le_bytes()))
                            .unwrap();
                        match worker.precommit_xct() {
                            Ok(_) => break,
                            Err(Error::RaceAbort) => continue,
                            Err(e) => panic!("unexpected commit failure: {e}"),
                        }
                    }
                }
            });
        }
    });

    let payload = storage.payload(0);
    let counter = u64::from_le_bytes(payload[..8].try_into().unwrap());
    assert_eq!(counter, THREADS as u64 * INCREMENTS);

    // Every successful commit advanced the record's id.
    let final_id = storage.owner(0).xct_id();
    assert!(XctId::new(epoch, 1).before(final_id));
    engine.uninitialize().unwrap();
}
