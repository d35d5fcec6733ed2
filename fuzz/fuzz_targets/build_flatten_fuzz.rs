#![no_main]
use libfuzzer_sys::fuzz_target;
use stepcache::entries::CacheEntries;

fuzz_target!(|data: &[u8]| {
    // Each byte run separated by 0xff is one input set.
    let mut entries = CacheEntries::new();
    let mut built = Vec::new();
    for chunk in data.split(|&b| b == 0xff).take(32) {
        let mut inputs: Vec<u32> = chunk.iter().map(|&b| u32::from(b)).collect();
        inputs.sort_unstable();
        inputs.dedup();
        let entry = entries.build_inputs(&inputs).unwrap();
        built.push((entry.id, inputs));
        entries.push_front(entry);
    }
    entries.validate().unwrap();
    for (id, inputs) in built {
        let entry = entries.entries.iter().find(|e| e.id == id).unwrap();
        assert_eq!(entries.flatten(entry).unwrap(), inputs);
    }
});
