//! Disk-mode caches: restoring piece files left by a previous run, evicting
//! them by modification time, and reporting state.

use streamcache_core::storage::test_fixtures::{
    at_seconds, create_temp_save_path, info_hash, write_piece_file,
};
use streamcache_core::{
    CacheConfig, CacheRegistry, CacheState, PieceIndex, PieceIo, TorrentFile, TorrentLayout,
};

const KIB: u64 = 1024;

#[test]
fn test_restores_piece_files_from_previous_run() {
    let save_path = create_temp_save_path();
    let hash = info_hash(1);
    let dir = save_path.path().join(hash.to_hex());
    std::fs::create_dir_all(&dir).unwrap();

    write_piece_file(&dir, 0, KIB as usize, at_seconds(1_000));
    write_piece_file(&dir, 3, 100, at_seconds(2_000));
    write_piece_file(&dir, 42, KIB as usize, at_seconds(3_000));
    std::fs::write(dir.join("notes.txt"), b"not a piece").unwrap();

    let registry = CacheRegistry::new(CacheConfig::disk(save_path.path()));
    let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 8));
    assert_eq!(cache.directory(), Some(dir.as_path()));

    let state = cache.state();
    assert_eq!(state.pieces.keys().copied().collect::<Vec<_>>(), vec![0, 3]);
    assert!(state.pieces[&0].completed);
    assert!(!state.pieces[&3].completed);
    assert_eq!(state.pieces[&3].size, 100);
    assert_eq!(state.filled, KIB + 100);
    assert_eq!(state.completed_pieces(), 1);

    let first = cache.piece(PieceIndex::new(0)).unwrap();
    assert_eq!(first.accessed(), at_seconds(1_000));
    assert_eq!(
        cache.piece(PieceIndex::new(3)).unwrap().accessed(),
        at_seconds(2_000)
    );

    let mut buf = vec![0u8; KIB as usize];
    assert_eq!(first.read_at(&mut buf, 0).unwrap(), KIB as usize);
    assert!(buf.iter().all(|&byte| byte == 0xAB));
}

#[test]
fn test_piece_files_survive_close() {
    let save_path = create_temp_save_path();
    let hash = info_hash(2);

    {
        let registry = CacheRegistry::new(CacheConfig::disk(save_path.path()));
        let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 4));
        let piece = cache.piece(PieceIndex::new(2)).unwrap();
        piece.write_at(&[9u8; KIB as usize], 0).unwrap();
        assert!(registry.close_cache(&hash));
    }

    let registry = CacheRegistry::new(CacheConfig::disk(save_path.path()));
    let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 4));
    let state = cache.state();
    assert_eq!(state.pieces.len(), 1);
    assert!(state.pieces[&2].completed);
}

#[test]
fn test_restored_pieces_evicted_by_modification_time() {
    let save_path = create_temp_save_path();
    let hash = info_hash(3);
    let dir = save_path.path().join(hash.to_hex());
    std::fs::create_dir_all(&dir).unwrap();

    for (index, seconds) in [(3, 100), (0, 200), (5, 300), (1, 400), (4, 500), (2, 600)] {
        write_piece_file(&dir, index, KIB as usize, at_seconds(seconds));
    }

    let registry = CacheRegistry::new(CacheConfig::disk(save_path.path()).with_capacity(2 * KIB));
    let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 10));
    assert_eq!(cache.state().filled, 6 * KIB);

    let _reader = cache
        .new_reader(TorrentFile::new("extras.mkv", 6 * KIB, 4 * KIB))
        .unwrap();

    let kept: Vec<u32> = cache.state().pieces.keys().copied().collect();
    assert_eq!(kept, vec![2, 4]);
    for index in [0, 1, 3, 5] {
        assert!(!dir.join(index.to_string()).exists());
    }
    assert!(dir.join("2").exists());
}

#[test]
fn test_state_serializes_for_web_layer() {
    let save_path = create_temp_save_path();
    let hash = info_hash(4);
    let registry = CacheRegistry::new(CacheConfig::disk(save_path.path()));
    let layout = TorrentLayout::new(KIB, 4).with_total_length(3 * KIB + 10);
    let cache = registry.open_cache(hash, layout);

    let last = cache.piece(PieceIndex::new(3)).unwrap();
    assert_eq!(last.length(), 10);
    last.write_at(&[1u8; 10], 0).unwrap();
    last.mark_complete();
    let _reader = cache
        .new_reader(TorrentFile::new("clip.mp4", 0, 3 * KIB + 10))
        .unwrap();

    let value = serde_json::to_value(cache.state()).unwrap();
    assert_eq!(value["hash"], hash.to_hex());
    assert_eq!(value["pieces_count"], 4);
    assert_eq!(value["pieces"]["3"]["completed"], true);
    assert_eq!(value["pieces"]["3"]["length"], 10);
    assert_eq!(value["readers"][0]["reader"], 0);

    let parsed: CacheState = serde_json::from_value(value).unwrap();
    assert_eq!(parsed, cache.state());
}

#[test]
fn test_piece_evicted_mid_write_is_not_restored_complete() {
    let save_path = create_temp_save_path();
    let hash = info_hash(5);
    let config = CacheConfig {
        protected_zone: 0,
        ..CacheConfig::disk(save_path.path()).with_capacity(KIB + KIB / 2)
    };
    let half = (KIB / 2) as usize;

    {
        let registry = CacheRegistry::new(config.clone());
        let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 64));
        let _reader = cache
            .new_reader(TorrentFile::new("movie.mkv", 0, 64 * KIB))
            .unwrap();

        let downloading = cache.piece(PieceIndex::new(45)).unwrap();
        downloading.write_at(&vec![0x11; half], 0).unwrap();
        downloading.set_accessed(at_seconds(100));

        let older = cache.piece(PieceIndex::new(46)).unwrap();
        older.write_at(&[0x22; KIB as usize], 0).unwrap();
        older.set_accessed(at_seconds(200));

        // Pushes the cache over capacity, evicting the half-written piece
        let newest = cache.piece(PieceIndex::new(47)).unwrap();
        newest.write_at(&[0x33; KIB as usize], 0).unwrap();
        assert_eq!(downloading.size(), 0);

        downloading.write_at(&vec![0x11; half], half as u64).unwrap();
        let state = cache.state();
        assert_eq!(state.pieces[&45].size, KIB / 2);
        assert!(!state.pieces[&45].completed);

        let mut buf = [0u8; 4];
        assert_eq!(downloading.read_at(&mut buf, 0).unwrap(), 0);

        registry.close_cache(&hash);
    }

    let registry = CacheRegistry::new(config);
    let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 64));
    let state = cache.state();
    assert!(!state.pieces.contains_key(&45));
    assert!(state.pieces[&47].completed);
    assert!(!save_path.path().join(hash.to_hex()).join("45").exists());
}

#[test]
fn test_partial_piece_file_trimmed_on_close() {
    let save_path = create_temp_save_path();
    let hash = info_hash(6);

    {
        let registry = CacheRegistry::new(CacheConfig::disk(save_path.path()));
        let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 4));
        let piece = cache.piece(PieceIndex::new(1)).unwrap();
        piece.write_at(&[5u8; 100], 0).unwrap();
        piece.write_at(&[6u8; 24], KIB - 24).unwrap();
        registry.close_cache(&hash);
    }

    let registry = CacheRegistry::new(CacheConfig::disk(save_path.path()));
    let cache = registry.open_cache(hash, TorrentLayout::new(KIB, 4));
    let state = cache.state();
    assert_eq!(state.pieces[&1].size, 100);
    assert!(!state.pieces[&1].completed);
}
