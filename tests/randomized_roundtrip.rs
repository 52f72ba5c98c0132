use blobstore::{AccessMode, BlobHandle, BlobStoreConfig, MemCache};
use rand::Rng;
use test_log::test;

fn config() -> BlobStoreConfig {
    BlobStoreConfig::new(512, 64).max_concurrent_io_requests(4)
}

/// Appending and prepending a random sequence of chunks must always leave
/// the value readable back exactly as a plain `Vec<u8>` model would
/// produce, inline or tree-backed.
#[test]
fn random_append_prepend_matches_vec_model() -> blobstore::Result<()> {
    let config = config();
    let cache = MemCache::open_temporary(&config)?;
    let txn = cache.begin();

    let mut rng = rand::rng();
    let mut handle = BlobHandle::empty(config.maxreflen);
    let mut model: Vec<u8> = Vec::new();

    for _ in 0..60 {
        let chunk_len = rng.random_range(1..=300);
        let chunk: Vec<u8> = (0..chunk_len).map(|_| rng.random()).collect();

        if rng.random_bool(0.5) {
            handle.append(&txn, &config, &chunk)?;
            model.extend_from_slice(&chunk);
        } else {
            handle.prepend(&txn, &config, &chunk)?;
            let mut new_model = chunk.clone();
            new_model.extend_from_slice(&model);
            model = new_model;
        }

        assert_eq!(handle.valuesize(), model.len() as i64);
        let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, model.len() as i64)?;
        assert_eq!(region.read_to_vec(), model);
    }

    Ok(())
}

/// A random sequence of append/prepend growth followed by the same
/// sequence of unappend/unprepend shrinks (in reverse) restores the
/// original bytes exactly, whether or not the value ever left the inline
/// representation.
#[test]
fn append_prepend_then_inverse_unwind_restores_original_bytes() -> blobstore::Result<()> {
    let config = config();
    let cache = MemCache::open_temporary(&config)?;
    let txn = cache.begin();

    let mut rng = rand::rng();
    let original: Vec<u8> = (0..20u32).map(|i| (i * 7) as u8).collect();

    let mut handle = BlobHandle::empty(config.maxreflen);
    handle.append(&txn, &config, &original)?;

    let mut growths: Vec<(bool, usize)> = Vec::new();
    for _ in 0..8 {
        let len = rng.random_range(1..=400);
        let chunk: Vec<u8> = (0..len).map(|_| rng.random()).collect();
        if rng.random_bool(0.5) {
            handle.append(&txn, &config, &chunk)?;
            growths.push((true, len));
        } else {
            handle.prepend(&txn, &config, &chunk)?;
            growths.push((false, len));
        }
    }

    for (was_append, len) in growths.into_iter().rev() {
        if was_append {
            handle.unappend(&txn, &config, len as i64)?;
        } else {
            handle.unprepend(&txn, &config, len as i64)?;
        }
    }

    assert_eq!(handle.valuesize(), original.len() as i64);
    assert_eq!(handle.ref_levels(&config), 0);
    let region = handle.expose_region(&txn, &config, AccessMode::Read, 0, original.len() as i64)?;
    assert_eq!(region.read_to_vec(), original);

    Ok(())
}

/// `prepend(n)` then reading the first `n` bytes must match `append(n)`
/// then reading the last `n` bytes, for freshly-random `n`-byte chunks —
/// both leave the chunk's bytes exactly where the caller asked for them,
/// regardless of which side of the value they land on.
#[test]
fn prepend_append_symmetry_for_random_sizes() -> blobstore::Result<()> {
    let config = config();
    let cache = MemCache::open_temporary(&config)?;
    let txn = cache.begin();
    let mut rng = rand::rng();

    for _ in 0..10 {
        let n = rng.random_range(1..=2000);
        let chunk: Vec<u8> = (0..n).map(|_| rng.random()).collect();

        let mut prepend_handle = BlobHandle::empty(config.maxreflen);
        prepend_handle.prepend(&txn, &config, &chunk)?;
        let prepend_region = prepend_handle.expose_region(&txn, &config, AccessMode::Read, 0, n as i64)?;

        let mut append_handle = BlobHandle::empty(config.maxreflen);
        append_handle.append(&txn, &config, &chunk)?;
        let valuesize = append_handle.valuesize();
        let append_region =
            append_handle.expose_region(&txn, &config, AccessMode::Read, valuesize - n as i64, n as i64)?;

        assert_eq!(prepend_region.read_to_vec(), append_region.read_to_vec());
    }

    Ok(())
}
