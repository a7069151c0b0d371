//! End-to-end tests driving the store through its public transaction API,
//! including crash recovery scenarios that reconstruct journal state the way
//! an interrupted commit would have left it.

use revfs::{
    index::{entry, Indices},
    journal::Journal,
    path::QualifiedPath,
    pool::RevisionPool,
    program::{ChecksumAlgorithm, Phase, PhaseMask, ProgramBuilder},
    store::{JOURNAL_FILE, TABLE_FILE},
    table::RevisionTable,
    NodeId, ResourceId, ResourcePath, Revision, Store, StoreError, StoreOptions,
};
use tempfile::tempdir;

fn node(name: &str) -> NodeId {
    NodeId::new(name).unwrap()
}

fn path(input: &str) -> ResourcePath {
    ResourcePath::parse(input).unwrap()
}

#[test]
fn test_save_read_unlink_round_trip() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    let id = tx.save_new_resource(&path("/docs/readme"), b"hello").unwrap();
    // Read-your-writes before commit: the content is still in scratch.
    assert_eq!(tx.read(&path("/docs/readme")).unwrap(), b"hello");
    assert_eq!(tx.read_resource(id).unwrap(), b"hello");
    let first = tx.commit().unwrap();
    assert_eq!(first, Revision::new(1));

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.revision(), first);
    assert_eq!(ro.read(&path("/docs/readme")).unwrap(), b"hello");
    assert_eq!(ro.resolve(&path("/docs/readme")).unwrap(), Some(id));
    assert_eq!(ro.list(&path("/docs")).unwrap(), vec!["readme".to_owned()]);
    ro.close().unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.unlink(&path("/docs/readme")).unwrap();
    let second = tx.commit().unwrap();
    assert_eq!(second, Revision::new(2));

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.resolve(&path("/docs/readme")).unwrap(), None);
    assert!(matches!(ro.read(&path("/docs/readme")), Err(StoreError::PathNotFound(_))));
    // Unlinked, not removed: still reachable by id.
    assert_eq!(ro.read_resource(id).unwrap(), b"hello");
    ro.close().unwrap();
}

#[test]
fn test_snapshot_isolation() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/config"), b"v1").unwrap();
    tx.commit().unwrap();

    let reader = store.begin_ro(node("alpha")).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.unlink(&path("/config")).unwrap();
    tx.save_new_resource(&path("/config"), b"v2").unwrap();
    tx.commit().unwrap();

    // The reader keeps observing the revision it started at.
    assert_eq!(reader.read(&path("/config")).unwrap(), b"v1");
    reader.close().unwrap();

    let reader = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(reader.read(&path("/config")).unwrap(), b"v2");
    reader.close().unwrap();
}

#[test]
fn test_reader_outlives_resource_removal() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    let id = tx.save_new_resource(&path("/data"), b"payload").unwrap();
    tx.commit().unwrap();

    let reader = store.begin_ro(node("alpha")).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.remove_resource(id).unwrap();
    tx.commit().unwrap();

    // The commit swept, but the blob is retained for the live snapshot.
    assert_eq!(reader.read_resource(id).unwrap(), b"payload");
    assert_eq!(reader.read(&path("/data")).unwrap(), b"payload");
    reader.close().unwrap();

    let reader = store.begin_ro(node("alpha")).unwrap();
    assert!(matches!(reader.read_resource(id), Err(StoreError::ResourceNotFound(_))));
    assert_eq!(reader.resolve(&path("/data")).unwrap(), None);
    reader.close().unwrap();

    // With the last interested snapshot gone the blob is reclaimable.
    store.sweep().unwrap();
    assert!(!dir.path().join("store/blobs").join(id.to_string()).exists());
}

#[test]
fn test_conflicting_writers_fail_fast() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut first = store.begin_rw(node("alpha")).unwrap();
    let mut second = store.begin_rw(node("alpha")).unwrap();

    first.save_new_resource(&path("/shared"), b"one").unwrap();
    let conflict = second.save_new_resource(&path("/shared"), b"two").unwrap_err();
    assert!(conflict.is_retryable());

    first.commit().unwrap();
    second.close().unwrap();

    // Retrying after the winner committed hits the duplicate check instead.
    let mut retry = store.begin_rw(node("alpha")).unwrap();
    assert!(matches!(
        retry.save_new_resource(&path("/shared"), b"two"),
        Err(StoreError::DuplicatePath(_))
    ));
    retry.close().unwrap();

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.read(&path("/shared")).unwrap(), b"one");
    ro.close().unwrap();
}

#[test]
fn test_rollback_undoes_staging() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let store = Store::create(&root, StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/abandoned"), b"bytes").unwrap();
    tx.close().unwrap();

    // Scratch files are gone and nothing became visible.
    assert_eq!(std::fs::read_dir(root.join("tmp")).unwrap().count(), 0);
    assert_eq!(store.current_revision(), Revision::ZERO);

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.resolve(&path("/abandoned")).unwrap(), None);
    ro.close().unwrap();

    // The journal slot was released; the store keeps working.
    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/kept"), b"bytes").unwrap();
    assert_eq!(tx.commit().unwrap(), Revision::new(1));
}

#[test]
fn test_drop_rolls_back() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    {
        let mut tx = store.begin_rw(node("alpha")).unwrap();
        tx.save_new_resource(&path("/dropped"), b"bytes").unwrap();
    }

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.resolve(&path("/dropped")).unwrap(), None);
    ro.close().unwrap();
}

#[test]
fn test_multiple_links_to_one_resource() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    let id = tx.save_new_resource(&path("/primary"), b"content").unwrap();
    tx.link_existing_resource(&path("/alias"), id).unwrap();
    tx.commit().unwrap();

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.read(&path("/alias")).unwrap(), b"content");
    ro.close().unwrap();

    // Removing the resource unlinks every path at once.
    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.remove_resource(id).unwrap();
    tx.commit().unwrap();

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.resolve(&path("/primary")).unwrap(), None);
    assert_eq!(ro.resolve(&path("/alias")).unwrap(), None);
    ro.close().unwrap();
}

#[test]
fn test_node_namespaces_are_disjoint() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/settings"), b"alpha settings").unwrap();
    tx.save_new_resource(&path("beta:/settings"), b"beta settings").unwrap();
    tx.commit().unwrap();

    let ro = store.begin_ro(node("beta")).unwrap();
    assert_eq!(ro.read(&path("/settings")).unwrap(), b"beta settings");
    assert_eq!(ro.read(&path("alpha:/settings")).unwrap(), b"alpha settings");
    ro.close().unwrap();
}

#[test]
fn test_wildcard_rejected_by_mutations() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    assert!(matches!(
        tx.save_new_resource(&path("/docs/*"), b"x"),
        Err(StoreError::WildcardRejected(_))
    ));
    tx.close().unwrap();
}

#[test]
fn test_revisions_survive_reopen() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");

    {
        let store = Store::create(&root, StoreOptions::default()).unwrap();
        let mut tx = store.begin_rw(node("alpha")).unwrap();
        tx.save_new_resource(&path("/persisted"), b"bytes").unwrap();
        assert_eq!(tx.commit().unwrap(), Revision::new(1));
    }

    let store = Store::open(&root, StoreOptions::default()).unwrap();
    assert_eq!(store.current_revision(), Revision::new(1));
    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.read(&path("/persisted")).unwrap(), b"bytes");
    ro.close().unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/more"), b"bytes").unwrap();
    assert_eq!(tx.commit().unwrap(), Revision::new(2));
}

/// Reconstructs the on-disk state of a commit interrupted after its program
/// became durable: revision issued, scratch files staged, program journaled,
/// nothing applied or published. Opening the store must finish the commit.
#[test]
fn test_recovery_completes_durable_commit() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let options = StoreOptions::default();
    drop(Store::create(&root, options.clone()).unwrap());

    let id = ResourceId::generate();
    let target = QualifiedPath::parse("alpha:/docs/readme").unwrap();
    {
        let table = RevisionTable::open(&root.join(TABLE_FILE), options.table_slot_count()).unwrap();
        let pool = RevisionPool::open(table).unwrap();
        let issued = pool.issue().unwrap();
        assert_eq!(issued.revision(), Revision::new(1));

        let indices = Indices::new(&root);
        let blob = indices.resources.stage(&id.to_string(), b"recovered").unwrap();
        let entry_bytes = entry::encode(false, Some(id));
        let staged_entry = indices.resources.stage("pending-entry", &entry_bytes).unwrap();

        let mut builder = ProgramBuilder::new();
        builder
            .link_file_to_resource(Phase::Commit, blob.clone(), id)
            .link_file_to_path(Phase::Commit, staged_entry.clone(), target.clone())
            .link_resource_to_path(Phase::Commit, id, target.clone())
            .unlink_file(Phase::Cleanup, blob)
            .unlink_file(Phase::Cleanup, staged_entry);
        let mut program = builder.compile();
        program.commit(PhaseMask::ALL, ChecksumAlgorithm::Crc32, issued.revision());

        let recovery = Journal::open(&root.join(JOURNAL_FILE)).unwrap();
        assert!(recovery.programs().is_empty());
        let mut journal = recovery
            .into_journal(options.journal_slot_size(), options.journal_slot_count())
            .unwrap();
        let slot = journal.acquire().unwrap();
        journal.write(slot, &program).unwrap();
        // Crash: the slot is never released, the revision never published.
    }

    let store = Store::open(&root, options).unwrap();
    assert_eq!(store.current_revision(), Revision::new(1));

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.read(&path("/docs/readme")).unwrap(), b"recovered");
    assert_eq!(ro.resolve(&path("/docs/readme")).unwrap(), Some(id));
    ro.close().unwrap();

    // Cleanup ran: no scratch files survive recovery.
    assert_eq!(std::fs::read_dir(root.join("tmp")).unwrap().count(), 0);

    // The replayed slot is free again and numbering continues past the
    // recovered revision.
    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/next"), b"bytes").unwrap();
    assert_eq!(tx.commit().unwrap(), Revision::new(2));
}

/// A journal slot whose payload was corrupted after the fact must fail the
/// checksum and abort recovery instead of replaying garbage.
#[test]
fn test_recovery_rejects_corrupted_program() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let options = StoreOptions::default();
    drop(Store::create(&root, options.clone()).unwrap());

    let program_len;
    {
        let target = QualifiedPath::parse("alpha:/victim").unwrap();
        let mut builder = ProgramBuilder::new();
        builder.unlink_path(Phase::Commit, target);
        let mut program = builder.compile();
        program.commit(PhaseMask::ALL, ChecksumAlgorithm::Crc32, Revision::new(1));
        program_len = program.len();

        let recovery = Journal::open(&root.join(JOURNAL_FILE)).unwrap();
        let mut journal = recovery
            .into_journal(options.journal_slot_size(), options.journal_slot_count())
            .unwrap();
        let slot = journal.acquire().unwrap();
        journal.write(slot, &program).unwrap();
    }

    // Flip one payload byte of the journaled program (slot 0 follows the
    // 16-byte journal header).
    let journal_path = root.join(JOURNAL_FILE);
    let mut bytes = std::fs::read(&journal_path).unwrap();
    bytes[16 + program_len - 1] ^= 0xff;
    std::fs::write(&journal_path, &bytes).unwrap();

    let err = match Store::open(&root, options) {
        Err(err) => err,
        Ok(_) => panic!("a corrupted journal must not open"),
    };
    assert!(err.is_fatal());
}

#[test]
fn test_purge_empties_the_store() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    let id = tx.save_new_resource(&path("/doomed"), b"bytes").unwrap();
    tx.commit().unwrap();

    let mut ex = store.begin_exclusive(node("alpha")).unwrap();
    ex.purge().unwrap();
    assert_eq!(ex.resolve(&path("/doomed")).unwrap(), None);
    assert!(!ex.resource_exists(id).unwrap());

    // The exclusive transaction can rebuild in place.
    ex.save_new_resource(&path("/fresh"), b"new").unwrap();
    ex.commit().unwrap();

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.read(&path("/fresh")).unwrap(), b"new");
    assert_eq!(ro.resolve(&path("/doomed")).unwrap(), None);
    ro.close().unwrap();
}

#[test]
fn test_purge_alone_commits_a_new_revision() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/doomed"), b"bytes").unwrap();
    let before = tx.commit().unwrap();

    // The emptied store must be denoted by a fresh revision; `before` keeps
    // denoting the populated state.
    let mut ex = store.begin_exclusive(node("alpha")).unwrap();
    ex.purge().unwrap();
    let after = ex.commit().unwrap();
    assert!(after > before);
    assert_eq!(store.current_revision(), after);

    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.revision(), after);
    assert_eq!(ro.resolve(&path("/doomed")).unwrap(), None);
    ro.close().unwrap();
}

#[test]
fn test_concurrent_readers_during_commits() {
    let dir = tempdir().unwrap();
    let store = Store::create(&dir.path().join("store"), StoreOptions::default()).unwrap();

    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/key"), b"v0").unwrap();
    tx.commit().unwrap();

    let writer_done = std::sync::atomic::AtomicBool::new(false);
    std::thread::scope(|scope| {
        let writer_done = &writer_done;
        scope.spawn(|| {
            for _ in 0..50 {
                let mut tx = store.begin_rw(node("alpha")).unwrap();
                tx.unlink(&path("/key")).unwrap();
                tx.save_new_resource(&path("/key"), b"updated").unwrap();
                tx.commit().unwrap();
            }
            writer_done.store(true, std::sync::atomic::Ordering::Release);
        });

        let store = &store;
        for _ in 0..3 {
            scope.spawn(move || {
                while !writer_done.load(std::sync::atomic::Ordering::Acquire) {
                    let ro = store.begin_ro(node("alpha")).unwrap();
                    // Each snapshot stays readable for the whole transaction
                    // even while commits sweep superseded files.
                    let content = ro.read(&path("/key")).unwrap();
                    assert!(content == b"v0" || content == b"updated");
                    ro.close().unwrap();
                }
            });
        }
    });

    assert_eq!(store.current_revision(), Revision::new(51));
}

#[test]
fn test_adler32_store() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("store");
    let options = StoreOptions::default().with_checksum(ChecksumAlgorithm::Adler32);

    let store = Store::create(&root, options.clone()).unwrap();
    let mut tx = store.begin_rw(node("alpha")).unwrap();
    tx.save_new_resource(&path("/checked"), b"bytes").unwrap();
    tx.commit().unwrap();
    drop(store);

    let store = Store::open(&root, options).unwrap();
    let ro = store.begin_ro(node("alpha")).unwrap();
    assert_eq!(ro.read(&path("/checked")).unwrap(), b"bytes");
    ro.close().unwrap();
}
