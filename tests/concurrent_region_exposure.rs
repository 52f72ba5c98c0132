use blobstore::{AccessMode, BlobHandle, BlobStoreConfig, MemCache};
use test_log::test;

/// Two tasks exposing disjoint windows of the same large value, on
/// independent handles sharing one underlying reference, must both
/// complete and see exactly their own slice.
#[test]
fn disjoint_windows_read_concurrently() -> blobstore::Result<()> {
    let config = BlobStoreConfig::new(4096, 251);
    let cache = MemCache::open_temporary(&config)?;
    let txn = cache.begin();

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let mut handle = BlobHandle::empty(config.maxreflen);
    handle.append(&txn, &config, &payload)?;
    assert_eq!(handle.ref_levels(&config), 2);

    let dumped = handle.dump_ref().to_vec();

    std::thread::scope(|scope| {
        let t1 = scope.spawn(|| {
            let txn = cache.begin();
            let mut h = BlobHandle::from_ref(&dumped, config.maxreflen);
            let region = h.expose_region(&txn, &config, AccessMode::Read, 0, 50_000).unwrap();
            region.read_to_vec()
        });
        let t2 = scope.spawn(|| {
            let txn = cache.begin();
            let mut h = BlobHandle::from_ref(&dumped, config.maxreflen);
            let region = h.expose_region(&txn, &config, AccessMode::Read, 100_000, 50_000).unwrap();
            region.read_to_vec()
        });

        let first = t1.join().unwrap();
        let second = t2.join().unwrap();

        assert_eq!(first, payload[0..50_000]);
        assert_eq!(second, payload[100_000..150_000]);
    });

    Ok(())
}
