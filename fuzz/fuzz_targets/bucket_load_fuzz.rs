#![no_main]
use libfuzzer_sys::fuzz_target;
use stepcache::bucket::CacheBucket;
use stepcache::key::{BucketFlags, BucketId};

fuzz_target!(|data: &[u8]| {
    // Bucket files come from disk; a damaged one must be rejected, never panic.
    let id = BucketId::new(1, 0, BucketFlags::CASE_SENSITIVE);
    if let Ok(bucket) = CacheBucket::from_bytes(id, data, true) {
        let _ = bucket.validate();
        let _ = bucket.rebuild_tables();
        let _ = bucket.to_bytes();
    }
    let _ = CacheBucket::from_bytes(BucketId::new(1, 0, BucketFlags::empty()), data, false);
});
