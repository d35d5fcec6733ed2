#![no_main]
use libfuzzer_sys::fuzz_target;
use rustc_hash::FxHashMap;
use stepcache::binary::BinaryReader;
use stepcache::entries::CacheEntries;

fuzz_target!(|data: &[u8]| {
    let _ = CacheEntries::read_network(&mut BinaryReader::new(data));

    let Ok(mut entries) = CacheEntries::read_disk(&mut BinaryReader::new(data)) else {
        return;
    };
    let valid = entries.validate().is_ok();
    for entry in &entries.entries {
        let _ = entries.flatten(entry);
    }
    let shift: FxHashMap<u32, u32> = (0..256).map(|v| (v, v + 3)).collect();
    let updated = entries.update_entries(&shift);
    if valid {
        assert!(updated.is_ok());
    }
});
