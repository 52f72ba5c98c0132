use blobstore::{BlobHandle, BlobStoreConfig, MemCache};
use test_log::test;

#[test]
fn level_growth_at_root_fanout_boundary() -> blobstore::Result<()> {
    let config = BlobStoreConfig::new(4096, 251);
    let cache = MemCache::open_temporary(&config)?;
    let txn = cache.begin();

    assert_eq!(config.leaf_size(), 4092);
    assert_eq!(blobstore::refword::root_fanout_max(config.maxreflen), 29);

    let mut handle = BlobHandle::empty(config.maxreflen);
    handle.append(&txn, &config, &vec![0u8; 29 * 4092])?;
    assert_eq!(handle.valuesize(), 118_668);
    assert_eq!(handle.ref_levels(&config), 1);

    handle.append(&txn, &config, &[1u8])?;
    assert_eq!(handle.valuesize(), 118_669);
    assert_eq!(handle.ref_levels(&config), 2);

    Ok(())
}
