use crate::*;
use block_lib::{CoreGuard, CoreLock, MemoryBackend, StoreError, StoreResult};
use std::sync::{Arc, Once};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;

const TEST_BLOCK_SIZE: u64 = 32;

static INIT_LOGGER: Once = Once::new();

fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

fn test_config(keep_history: bool) -> BlockStoreConfig {
    BlockStoreConfig {
        block_size: TEST_BLOCK_SIZE,
        skip_empty_blocks: true,
        keep_history,
        ..BlockStoreConfig::default()
    }
}

async fn open_engine(
    temp_dir: &TempDir,
    keep_history: bool,
) -> (BlockStoreEngine, Arc<MemoryBackend>) {
    init_logging();
    let backend = Arc::new(MemoryBackend::new());
    let engine = BlockStoreEngine::open_with_config(
        temp_dir.path().to_path_buf(),
        backend.clone(),
        test_config(keep_history),
    )
    .await
    .unwrap();
    (engine, backend)
}

async fn put_file(
    engine: &BlockStoreEngine,
    core: &mut CoreGuard<'_>,
    file_id: FileId,
    path: &str,
    data: &[u8],
    was_present: bool,
    mtime: u64,
) -> StoreResult<FileInfo> {
    let mut prefix = engine.create_staging(file_id).await?;
    prefix.append(data).await?;
    prefix.prepare(core, engine.chunker()).await?;
    engine.apply(core, &prefix, path, was_present, mtime, None).await
}

async fn read_file(engine: &BlockStoreEngine, file_id: &FileId) -> StoreResult<Vec<u8>> {
    let mut reader = engine.open_file(file_id).await?;
    let mut data = Vec::new();
    reader.read_to_end(&mut data).await?;
    Ok(data)
}

fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn test_round_trip_across_block_boundaries() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, _backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    for (branch, len) in [
        0u64,
        1,
        TEST_BLOCK_SIZE - 1,
        TEST_BLOCK_SIZE,
        TEST_BLOCK_SIZE + 1,
        5 * TEST_BLOCK_SIZE,
    ]
    .into_iter()
    .enumerate()
    {
        let file_id = FileId::new(1, 1, branch as u32);
        let data = patterned(len as usize);
        let info = put_file(
            &engine,
            &mut core,
            file_id,
            &format!("/files/f{}", branch),
            &data,
            false,
            100,
        )
        .await
        .unwrap();

        assert_eq!(info.length, len);
        assert_eq!(
            info.content_hash.block_count(),
            block_count_for(len, TEST_BLOCK_SIZE, true)
        );
        assert_eq!(read_file(&engine, &file_id).await.unwrap(), data);
    }
}

#[tokio::test]
async fn test_dedup_shares_blocks_across_ids() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let data = patterned(TEST_BLOCK_SIZE as usize * 2 + 5);
    let id_a = FileId::new(1, 1, 0);
    let id_b = FileId::new(1, 2, 0);

    let info_a = put_file(&engine, &mut core, id_a, "/a", &data, false, 1).await.unwrap();
    let info_b = put_file(&engine, &mut core, id_b, "/b", &data, false, 2).await.unwrap();
    assert_eq!(info_a.content_hash, info_b.content_hash);

    // one row per unique hash, refcount 2
    let stats = engine.stats().unwrap();
    assert_eq!(stats.total_blocks, 3);
    assert_eq!(backend.block_count(), 3);
    for hash in info_a.content_hash.iter() {
        let count = engine.db.get_block_count(&hash).unwrap().unwrap();
        assert_eq!(count.ref_count, 2);
    }

    // dropping one reference keeps the content reachable through the other
    engine.delete(&mut core, &id_a, "/a", 3, None).await.unwrap();
    assert_eq!(backend.block_count(), 3);
    assert_eq!(read_file(&engine, &id_b).await.unwrap(), data);

    // dropping the last reference reclaims the backend copies
    engine.delete(&mut core, &id_b, "/b", 4, None).await.unwrap();
    assert_eq!(backend.block_count(), 0);
    assert_eq!(engine.stats().unwrap().total_blocks, 0);
}

#[tokio::test]
async fn test_existence_conflicts_are_never_reconciled() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, _backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let file_id = FileId::new(1, 1, 0);

    // caller claims the file exists, storage says absent
    let err = put_file(&engine, &mut core, file_id, "/f", b"data", true, 1)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::NotFound(_)));

    engine.create(&mut core, &file_id, 1).await.unwrap();
    let err = engine.create(&mut core, &file_id, 2).await.err().unwrap();
    assert!(matches!(err, StoreError::AlreadyExists(_)));

    // caller claims absent, storage says live
    let err = put_file(&engine, &mut core, file_id, "/f", b"data", false, 3)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::AlreadyExists(_)));

    // correct hint succeeds and bumps the version
    let info = put_file(&engine, &mut core, file_id, "/f", b"data", true, 4)
        .await
        .unwrap();
    assert_eq!(info.version, 1);

    // tombstoned counts as not present for the hint check
    engine.delete(&mut core, &file_id, "/f", 5, None).await.unwrap();
    let err = put_file(&engine, &mut core, file_id, "/f", b"data", true, 6)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::NotFound(_)));
}

#[tokio::test]
async fn test_create_revives_tombstone_with_next_version() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, _backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let file_id = FileId::new(1, 1, 0);
    let info = engine.create(&mut core, &file_id, 1).await.unwrap();
    assert_eq!(info.version, 0);
    assert_eq!(info.length, 0);

    engine.delete(&mut core, &file_id, "/f", 2, None).await.unwrap();
    // deleting again tolerates the race
    engine.delete(&mut core, &file_id, "/f", 3, None).await.unwrap();

    let revived = engine.create(&mut core, &file_id, 4).await.unwrap();
    assert_eq!(revived.version, 2);
}

#[tokio::test]
async fn test_move_cross_id_repoints_without_copy() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let data = patterned(TEST_BLOCK_SIZE as usize + 9);
    let src = FileId::new(1, 1, 0);
    let dst = FileId::new(1, 2, 0);

    let src_info = put_file(&engine, &mut core, src, "/src", &data, false, 1)
        .await
        .unwrap();
    let blocks_before = backend.block_count();

    let dst_info = engine
        .move_file(&mut core, &src, "/src", &dst, "/dst", None)
        .await
        .unwrap();

    // pure metadata repoint: same manifest and length, no new backend data
    assert_eq!(dst_info.content_hash, src_info.content_hash);
    assert_eq!(dst_info.length, src_info.length);
    assert_eq!(backend.block_count(), blocks_before);
    assert_eq!(read_file(&engine, &dst).await.unwrap(), data);

    // source is tombstoned
    let err = engine.open_file(&src).await.err().unwrap();
    assert!(err.is_not_found());
    assert!(matches!(
        engine.db.get_file_state_by_name(&src.internal_name()).unwrap(),
        FileState::Deleted { .. }
    ));

    // moving from a tombstoned source fails not-found
    let err = engine
        .move_file(&mut core, &src, "/src", &FileId::new(1, 3, 0), "/x", None)
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());

    // moving onto a live destination fails already-exists
    let other = FileId::new(1, 4, 0);
    put_file(&engine, &mut core, other, "/other", b"occupied", false, 2)
        .await
        .unwrap();
    let err = engine
        .move_file(&mut core, &dst, "/dst", &other, "/other", None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::AlreadyExists(_)));
}

#[tokio::test]
async fn test_move_same_id_keeps_content_identity() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, _backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let data = patterned(TEST_BLOCK_SIZE as usize * 2);
    let file_id = FileId::new(1, 1, 0);
    let before = put_file(&engine, &mut core, file_id, "/old/name", &data, false, 7)
        .await
        .unwrap();

    let after = engine
        .move_file(&mut core, &file_id, "/old/name", &file_id, "/new/name", None)
        .await
        .unwrap();

    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.length, before.length);
    assert_eq!(after.version, before.version + 1);
    assert_eq!(read_file(&engine, &file_id).await.unwrap(), data);

    // refcounts balanced: exactly one reference per block remains
    for hash in after.content_hash.iter() {
        let count = engine.db.get_block_count(&hash).unwrap().unwrap();
        assert_eq!(count.ref_count, 1);
    }
}

#[tokio::test]
async fn test_history_toggle_archive_vs_deref() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, backend) = open_engine(&temp_dir, true).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let file_id = FileId::new(1, 1, 0);
    let old_data = patterned(TEST_BLOCK_SIZE as usize + 1);
    let new_data: Vec<u8> = old_data.iter().map(|b| b ^ 0xff).collect();

    put_file(&engine, &mut core, file_id, "/docs/report", &old_data, false, 1)
        .await
        .unwrap();
    put_file(&engine, &mut core, file_id, "/docs/report", &new_data, true, 2)
        .await
        .unwrap();

    // retention on: the prior version is browsable and readable
    let children = engine.list_children("/docs").unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "report");
    assert!(!children[0].is_dir);

    let revisions = engine.list_history("/docs/report").unwrap();
    assert_eq!(revisions.len(), 1);
    assert_eq!(revisions[0].version, 0);
    assert_eq!(revisions[0].length, old_data.len() as u64);

    let mut reader = engine
        .open_revision("/docs/report", &revisions[0].token)
        .await
        .unwrap();
    let mut archived = Vec::new();
    reader.read_to_end(&mut archived).await.unwrap();
    assert_eq!(archived, old_data);

    // and the current version still reads the new content
    assert_eq!(read_file(&engine, &file_id).await.unwrap(), new_data);

    // retention off for this transaction: overwrite derefs immediately
    let newer: Vec<u8> = new_data.iter().map(|b| b ^ 0x55).collect();
    let mut prefix = engine.create_staging(file_id).await.unwrap();
    prefix.append(&newer).await.unwrap();
    prefix.prepare(&mut core, engine.chunker()).await.unwrap();
    engine
        .apply(&mut core, &prefix, "/docs/report", true, 3, Some(false))
        .await
        .unwrap();

    // new_data's unique blocks are gone, old_data's survive in history
    let old_alive = old_data
        .chunks(TEST_BLOCK_SIZE as usize)
        .map(block_lib::BlockHasher::calc_from_bytes);
    for hash in old_alive {
        assert!(backend.contains(&hash), "archived block was collected");
    }
    assert_eq!(engine.list_history("/docs/report").unwrap().len(), 1);
    assert_eq!(read_file(&engine, &file_id).await.unwrap(), newer);
}

#[tokio::test]
async fn test_gc_never_touches_referenced_or_retained_blocks() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, backend) = open_engine(&temp_dir, true).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let shared = patterned(TEST_BLOCK_SIZE as usize * 2);
    let id_a = FileId::new(1, 1, 0);
    let id_b = FileId::new(1, 2, 0);

    put_file(&engine, &mut core, id_a, "/a", &shared, false, 1).await.unwrap();
    put_file(&engine, &mut core, id_b, "/b", &shared, false, 2).await.unwrap();

    // archive a's version, then hard-delete b's reference
    put_file(&engine, &mut core, id_a, "/a", b"replacement", true, 3)
        .await
        .unwrap();
    engine
        .delete(&mut core, &id_b, "/b", 4, Some(false))
        .await
        .unwrap();

    // the shared blocks are still retained by a's archived version
    for block in shared.chunks(TEST_BLOCK_SIZE as usize) {
        let hash = block_lib::BlockHasher::calc_from_bytes(block);
        assert!(backend.contains(&hash));
    }

    let revisions = engine.list_history("/a").unwrap();
    let mut reader = engine.open_revision("/a", &revisions[0].token).await.unwrap();
    let mut archived = Vec::new();
    reader.read_to_end(&mut archived).await.unwrap();
    assert_eq!(archived, shared);
}

#[tokio::test]
async fn test_delete_revision_reclaims_blocks() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, backend) = open_engine(&temp_dir, true).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let file_id = FileId::new(1, 1, 0);
    let old_data = patterned(TEST_BLOCK_SIZE as usize);
    put_file(&engine, &mut core, file_id, "/f", &old_data, false, 1)
        .await
        .unwrap();
    put_file(&engine, &mut core, file_id, "/f", b"tiny", true, 2)
        .await
        .unwrap();

    let revisions = engine.list_history("/f").unwrap();
    assert_eq!(revisions.len(), 1);
    let token = revisions[0].token.clone();

    engine.delete_revision(&mut core, "/f", &token).await.unwrap();
    assert!(engine.list_history("/f").unwrap().is_empty());

    let old_hash = block_lib::BlockHasher::calc_from_bytes(&old_data);
    assert!(!backend.contains(&old_hash));

    // the token no longer resolves
    let err = engine.open_revision("/f", &token).await.err().unwrap();
    assert!(matches!(err, StoreError::InvalidRevision(_)));
    let err = engine
        .delete_revision(&mut core, "/f", &token)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::InvalidRevision(_)));

    // garbage tokens fail the same way
    let err = engine
        .open_revision("/f", &RevisionToken::from("no-such-token"))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::InvalidRevision(_)));
}

#[tokio::test]
async fn test_delete_all_revisions_under_subtree() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, backend) = open_engine(&temp_dir, true).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let id_a = FileId::new(1, 1, 0);
    let id_b = FileId::new(1, 2, 0);
    let data_a = patterned(TEST_BLOCK_SIZE as usize);
    let data_b: Vec<u8> = data_a.iter().map(|b| b ^ 1).collect();

    put_file(&engine, &mut core, id_a, "/proj/src/a", &data_a, false, 1).await.unwrap();
    put_file(&engine, &mut core, id_a, "/proj/src/a", b"a2", true, 2).await.unwrap();
    put_file(&engine, &mut core, id_b, "/proj/doc/b", &data_b, false, 3).await.unwrap();
    put_file(&engine, &mut core, id_b, "/proj/doc/b", b"b2", true, 4).await.unwrap();

    let removed = engine
        .delete_all_revisions_under(&mut core, "/proj/src")
        .await
        .unwrap();
    assert_eq!(removed, 1);

    assert!(engine.list_children("/proj/src").is_err());
    assert_eq!(engine.list_history("/proj/doc/b").unwrap().len(), 1);
    assert!(!backend.contains(&block_lib::BlockHasher::calc_from_bytes(&data_a)));
    assert!(backend.contains(&block_lib::BlockHasher::calc_from_bytes(&data_b)));

    let removed = engine
        .delete_all_revisions_under(&mut core, "/proj")
        .await
        .unwrap();
    assert_eq!(removed, 1);
    assert!(!backend.contains(&block_lib::BlockHasher::calc_from_bytes(&data_b)));
}

#[tokio::test]
async fn test_delete_under_purges_objects_and_staging() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let obj1_b0 = FileId::new(1, 1, 0);
    let obj1_b1 = FileId::new(1, 1, 1);
    let obj2 = FileId::new(1, 2, 0);

    put_file(&engine, &mut core, obj1_b0, "/o1/b0", b"obj one branch zero", false, 1)
        .await
        .unwrap();
    put_file(&engine, &mut core, obj1_b1, "/o1/b1", b"obj one branch one!", false, 2)
        .await
        .unwrap();
    put_file(&engine, &mut core, obj2, "/o2", b"second object here..", false, 3)
        .await
        .unwrap();

    // leftover staging file under the purged object must disappear too
    let leftover = engine.create_staging(FileId::new(1, 1, 2)).await.unwrap();
    let leftover_path = leftover.path().to_path_buf();
    assert!(leftover_path.exists());

    let removed = engine
        .delete_under(&mut core, &FileId::object_prefix(1, 1), None)
        .await
        .unwrap();
    assert_eq!(removed, 2);

    assert!(engine.open_file(&obj1_b0).await.err().unwrap().is_not_found());
    assert!(engine.open_file(&obj1_b1).await.err().unwrap().is_not_found());
    assert_eq!(read_file(&engine, &obj2).await.unwrap(), b"second object here..");
    assert!(!leftover_path.exists());

    // purged rows are gone entirely, not tombstoned
    assert_eq!(
        engine.db.get_file_state_by_name(&obj1_b0.internal_name()).unwrap(),
        FileState::Absent
    );

    // purging the whole store clears the rest
    engine
        .delete_under(&mut core, &FileId::store_prefix(1), None)
        .await
        .unwrap();
    assert_eq!(backend.block_count(), 0);
    assert_eq!(engine.stats().unwrap().live_files, 0);
}

#[tokio::test]
async fn test_apply_requires_prepared_prefix_and_cleans_staging() {
    let temp_dir = TempDir::new().unwrap();
    let (engine, _backend) = open_engine(&temp_dir, false).await;
    let lock = CoreLock::new();
    let mut core = lock.enter().await.unwrap();

    let file_id = FileId::new(1, 1, 0);
    let mut prefix = engine.create_staging(file_id).await.unwrap();
    prefix.append(b"unprepared").await.unwrap();

    let err = engine
        .apply(&mut core, &prefix, "/f", false, 1, None)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::InvalidParam(_)));

    prefix.prepare(&mut core, engine.chunker()).await.unwrap();
    let staging_file = prefix.path().to_path_buf();
    assert!(staging_file.exists());

    // a conflicting apply rolls back and must NOT delete the staging file
    let err = engine
        .apply(&mut core, &prefix, "/f", true, 1, None)
        .await
        .err()
        .unwrap();
    assert!(err.is_not_found());
    assert!(staging_file.exists());

    engine
        .apply(&mut core, &prefix, "/f", false, 1, None)
        .await
        .unwrap();
    // commit-only cleanup fired
    assert!(!staging_file.exists());
}
