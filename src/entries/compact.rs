// Building, flattening, remapping and validating compacted input sets.

use rustc_hash::FxHashMap;

use super::{decode, CacheEntries, CacheEntry, EntriesError, CHECK_ALL_INPUTS};
use crate::binary::varint::{self, Item};

// ---------------------------------------------------------------------------
// Range helpers
// ---------------------------------------------------------------------------

fn decode_items(field: &'static str, bytes: &[u8]) -> Result<Vec<Item>, EntriesError> {
    varint::decode_items(bytes).map_err(|source| EntriesError::Malformed { field, source })
}

/// Spans of `values` as `encode_all` lays them out.
fn items_of(values: &[u32]) -> Vec<Item> {
    let mut pos = 0u32;
    values
        .iter()
        .map(|&value| {
            let start = pos;
            pos += varint::encoded_len_u32(value) as u32;
            Item {
                value,
                start,
                end: pos,
            }
        })
        .collect()
}

fn read_ranges(bytes: &[u8]) -> Result<Vec<(u32, u32)>, EntriesError> {
    let flat = decode("input ranges", bytes)?;
    if flat.len() % 2 != 0 {
        return Err(EntriesError::Malformed {
            field: "input ranges",
            source: varint::VarIntError::Underflow,
        });
    }
    Ok(flat.chunks_exact(2).map(|p| (p[0], p[1])).collect())
}

fn push_range(out: &mut Vec<u8>, begin: u32, end: u32) {
    varint::write_u32(out, begin);
    varint::write_u32(out, end);
}

/// Index of the item starting at byte `pos`, or `items.len()` for the end
/// of the blob.
fn boundary_index(items: &[Item], blob_len: usize, pos: u32) -> Option<usize> {
    if pos as usize == blob_len {
        return Some(items.len());
    }
    items.binary_search_by_key(&pos, |i| i.start).ok()
}

/// Merge-scan sorted `inputs` against the sorted shared items.
///
/// Runs of shared items present in `inputs` become `[begin, end)` ranges;
/// inputs absent from the blob become extras.
fn match_inputs(shared: &[Item], blob_len: usize, inputs: &[u32]) -> (Vec<u8>, Vec<u8>) {
    let mut ranges = Vec::new();
    let mut extras = Vec::new();
    let mut j = 0;
    let mut open: Option<u32> = None;
    for item in shared {
        while j < inputs.len() && inputs[j] < item.value {
            varint::write_u32(&mut extras, inputs[j]);
            j += 1;
        }
        if j < inputs.len() && inputs[j] == item.value {
            open.get_or_insert(item.start);
            j += 1;
        } else if let Some(begin) = open.take() {
            push_range(&mut ranges, begin, item.start);
        }
    }
    if let Some(begin) = open {
        push_range(&mut ranges, begin, blob_len as u32);
    }
    for &v in &inputs[j..] {
        varint::write_u32(&mut extras, v);
    }
    (ranges, extras)
}

/// Ranges covering every item except the sorted `excluded` indices.
fn ranges_from_excluded(items: &[Item], excluded: &[usize], blob_len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut open: Option<u32> = None;
    let mut x = 0;
    for (i, item) in items.iter().enumerate() {
        if x < excluded.len() && excluded[x] == i {
            x += 1;
            if let Some(begin) = open.take() {
                push_range(&mut out, begin, item.start);
            }
        } else {
            open.get_or_insert(item.start);
        }
    }
    if let Some(begin) = open {
        push_range(&mut out, begin, blob_len as u32);
    }
    out
}

fn merge_sorted(a: &[u32], b: &[u32]) -> Vec<u32> {
    let mut out = Vec::with_capacity(a.len() + b.len());
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        if a[i] <= b[j] {
            out.push(a[i]);
            i += 1;
        } else {
            out.push(b[j]);
            j += 1;
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

fn remap_sorted(values: &[u32], remap: &impl Fn(u32) -> u32) -> Vec<u32> {
    let mut out: Vec<u32> = values.iter().map(|&v| remap(v)).collect();
    out.sort_unstable();
    out
}

fn has_duplicates(sorted: &[u32]) -> bool {
    sorted.windows(2).any(|w| w[0] == w[1])
}

/// New blobs for every entry, computed before anything is committed.
struct ExclusionUpdate {
    shared_inputs: Vec<u8>,
    entries: Vec<(Vec<u8>, Vec<u8>, Vec<u8>)>,
}

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

impl CacheEntries {
    /// Build an entry with a fresh id for the strictly ascending `inputs`.
    ///
    /// The first input set stored for a key becomes the shared blob and its
    /// entry the primary.
    pub fn build_inputs(&mut self, inputs: &[u32]) -> Result<CacheEntry, EntriesError> {
        if inputs.windows(2).any(|w| w[0] >= w[1]) {
            return Err(EntriesError::UnsortedInputs);
        }
        let mut entry = CacheEntry {
            id: self.id_counter,
            ..CacheEntry::default()
        };

        if self.shared_inputs.is_empty() {
            self.adopt_as_shared(&mut entry, inputs);
        } else {
            let shared = decode_items("shared inputs", &self.shared_inputs)?;
            let (ranges, extras) = match_inputs(&shared, self.shared_inputs.len(), inputs);
            entry.shared_input_ranges = ranges;
            entry.extra_inputs = extras;
        }

        self.id_counter = self.id_counter.wrapping_add(1);
        Ok(entry)
    }

    fn adopt_as_shared(&mut self, entry: &mut CacheEntry, inputs: &[u32]) {
        self.shared_inputs = varint::encode_all(inputs);
        self.primary_id = entry.id;
        entry.shared_input_ranges.clear();
        entry.extra_inputs.clear();
        if !self.shared_inputs.is_empty() {
            push_range(
                &mut entry.shared_input_ranges,
                0,
                self.shared_inputs.len() as u32,
            );
        }
    }

    /// Recover the exact ascending input offsets of `entry`.
    pub fn flatten(&self, entry: &CacheEntry) -> Result<Vec<u32>, EntriesError> {
        let extras = decode("extra inputs", &entry.extra_inputs)?;
        let len = self.shared_inputs.len();
        let mut shared = Vec::new();
        for (begin, end) in read_ranges(&entry.shared_input_ranges)? {
            if begin > end || end as usize > len {
                return Err(EntriesError::RangeOutOfBounds { begin, end, len });
            }
            shared.extend(decode(
                "shared inputs",
                &self.shared_inputs[begin as usize..end as usize],
            )?);
        }
        Ok(merge_sorted(&shared, &extras))
    }

    /// Rewrite every offset through `old_to_new` after a content-key table
    /// rebuild. Offsets missing from the map keep their value.
    pub fn update_entries(&mut self, old_to_new: &FxHashMap<u32, u32>) -> Result<(), EntriesError> {
        let remap = |v: u32| old_to_new.get(&v).copied().unwrap_or(v);

        let primary_known = self.entries.iter().any(|e| e.id == self.primary_id);
        if self.entries.len() > 1 && primary_known {
            match self.plan_exclusion_update(&remap)? {
                Some(update) => {
                    self.shared_inputs = update.shared_inputs;
                    for (entry, (ranges, extras, outputs)) in
                        self.entries.iter_mut().zip(update.entries)
                    {
                        entry.shared_input_ranges = ranges;
                        entry.extra_inputs = extras;
                        entry.outputs = outputs;
                    }
                    self.remap_inputs_that_are_outputs(old_to_new);
                    return Ok(());
                }
                None => log::debug!("offset remap collides inside shared inputs, rebuilding"),
            }
        }
        self.rebuild_from_primary(&remap)?;
        self.remap_inputs_that_are_outputs(old_to_new);
        Ok(())
    }

    /// Tracked offsets the remap does not know about are forgotten.
    fn remap_inputs_that_are_outputs(&mut self, old_to_new: &FxHashMap<u32, u32>) {
        if self.checks_all_inputs() {
            return;
        }
        self.inputs_that_are_outputs = self
            .inputs_that_are_outputs
            .iter()
            .filter_map(|v| old_to_new.get(v).copied())
            .filter(|&v| v != CHECK_ALL_INPUTS)
            .collect();
    }

    /// Remap the shared blob in place and derive each entry's new ranges
    /// from the shared items it did *not* cover. Returns `None` when the
    /// remap is not injective over the offsets involved.
    fn plan_exclusion_update(
        &self,
        remap: &impl Fn(u32) -> u32,
    ) -> Result<Option<ExclusionUpdate>, EntriesError> {
        let old = decode_items("shared inputs", &self.shared_inputs)?;
        let old_len = self.shared_inputs.len();

        let new_values: Vec<u32> = old.iter().map(|i| remap(i.value)).collect();
        let mut sorted_values = new_values.clone();
        sorted_values.sort_unstable();
        if has_duplicates(&sorted_values) {
            return Ok(None);
        }
        let shared_inputs = varint::encode_all(&sorted_values);
        let new_items = items_of(&sorted_values);

        let mut entries = Vec::with_capacity(self.entries.len());
        let mut covered = vec![false; old.len()];
        for entry in &self.entries {
            covered.iter_mut().for_each(|c| *c = false);
            for (begin, end) in read_ranges(&entry.shared_input_ranges)? {
                let (Some(b), Some(e)) = (
                    boundary_index(&old, old_len, begin),
                    boundary_index(&old, old_len, end),
                ) else {
                    return Err(EntriesError::RangeMisaligned { begin, end });
                };
                if b > e {
                    return Err(EntriesError::RangesUnordered { id: entry.id });
                }
                covered[b..e].iter_mut().for_each(|c| *c = true);
            }

            let mut excluded = Vec::new();
            for (i, _) in covered.iter().enumerate().filter(|(_, c)| !**c) {
                match sorted_values.binary_search(&new_values[i]) {
                    Ok(index) => excluded.push(index),
                    Err(_) => return Ok(None),
                }
            }
            excluded.sort_unstable();
            let ranges = ranges_from_excluded(&new_items, &excluded, shared_inputs.len());

            let extras = remap_sorted(&decode("extra inputs", &entry.extra_inputs)?, remap);
            if has_duplicates(&extras)
                || extras.iter().any(|v| sorted_values.binary_search(v).is_ok())
            {
                return Ok(None);
            }

            let mut outputs = remap_sorted(&entry.output_offsets()?, remap);
            outputs.dedup();

            entries.push((
                ranges,
                varint::encode_all(&extras),
                varint::encode_all(&outputs),
            ));
        }

        Ok(Some(ExclusionUpdate {
            shared_inputs,
            entries,
        }))
    }

    /// Rebuild the shared blob from the primary entry's remapped inputs and
    /// every other entry against it.
    fn rebuild_from_primary(&mut self, remap: &impl Fn(u32) -> u32) -> Result<(), EntriesError> {
        if self.entries.is_empty() {
            let mut values = remap_sorted(&decode("shared inputs", &self.shared_inputs)?, remap);
            values.dedup();
            self.shared_inputs = varint::encode_all(&values);
            return Ok(());
        }

        let mut flattened = Vec::with_capacity(self.entries.len());
        let mut outputs = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let mut inputs = remap_sorted(&self.flatten(entry)?, remap);
            inputs.dedup();
            flattened.push(inputs);
            let mut out = remap_sorted(&entry.output_offsets()?, remap);
            out.dedup();
            outputs.push(out);
        }

        // A primary without inputs would leave the blob empty while others
        // still have inputs; promote the first entry that has some.
        let designated = self.entries.iter().position(|e| e.id == self.primary_id);
        let primary = match designated {
            Some(i) if !flattened[i].is_empty() => i,
            _ => flattened
                .iter()
                .position(|f| !f.is_empty())
                .or(designated)
                .unwrap_or(0),
        };

        self.shared_inputs = varint::encode_all(&flattened[primary]);
        self.primary_id = self.entries[primary].id;
        let items = items_of(&flattened[primary]);
        let blob_len = self.shared_inputs.len();

        for (i, entry) in self.entries.iter_mut().enumerate() {
            let (ranges, extras) = if i == primary {
                let mut ranges = Vec::new();
                if blob_len > 0 {
                    push_range(&mut ranges, 0, blob_len as u32);
                }
                (ranges, Vec::new())
            } else {
                match_inputs(&items, blob_len, &flattened[i])
            };
            entry.shared_input_ranges = ranges;
            entry.extra_inputs = extras;
            entry.outputs = varint::encode_all(&outputs[i]);
        }
        Ok(())
    }

    /// Check the structural invariants of every entry.
    pub fn validate(&self) -> Result<(), EntriesError> {
        let shared = decode_items("shared inputs", &self.shared_inputs)?;
        if shared.windows(2).any(|w| w[0].value >= w[1].value) {
            return Err(EntriesError::SharedUnsorted);
        }
        let len = self.shared_inputs.len();

        for entry in &self.entries {
            let id = entry.id;
            let mut covered = Vec::new();
            let mut prev_end = 0;
            for (begin, end) in read_ranges(&entry.shared_input_ranges)? {
                if begin >= end || begin < prev_end {
                    return Err(EntriesError::RangesUnordered { id });
                }
                if end as usize > len {
                    return Err(EntriesError::RangeOutOfBounds { begin, end, len });
                }
                let (Some(b), Some(e)) = (
                    boundary_index(&shared, len, begin),
                    boundary_index(&shared, len, end),
                ) else {
                    return Err(EntriesError::RangeMisaligned { begin, end });
                };
                covered.extend(shared[b..e].iter().map(|i| i.value));
                prev_end = end;
            }

            let mut extras = decode("extra inputs", &entry.extra_inputs)?;
            for &offset in &extras {
                if covered.binary_search(&offset).is_ok() {
                    return Err(EntriesError::SharedExtraOverlap { id, offset });
                }
            }
            extras.sort_unstable();
            if let Some(w) = extras.windows(2).find(|w| w[0] == w[1]) {
                return Err(EntriesError::DuplicateInput { id, offset: w[0] });
            }
            entry.output_offsets()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(entries: &mut CacheEntries, inputs: &[u32]) -> u32 {
        let mut e = entries.build_inputs(inputs).unwrap();
        e.outputs = varint::encode_all(&[1000 + e.id]);
        let id = e.id;
        entries.push_front(e);
        id
    }

    fn entry(entries: &CacheEntries, id: u32) -> &CacheEntry {
        entries.entries.iter().find(|e| e.id == id).unwrap()
    }

    fn scenario() -> (CacheEntries, [u32; 3]) {
        let mut entries = CacheEntries::new();
        let a = store(&mut entries, &[1, 4, 6]);
        let b = store(&mut entries, &[0, 4, 6]);
        let c = store(&mut entries, &[2, 4, 6]);
        (entries, [a, b, c])
    }

    #[test]
    fn first_entry_becomes_shared() {
        let (entries, [a, b, c]) = scenario();
        assert_eq!(varint::decode_all(&entries.shared_inputs).unwrap(), vec![1, 4, 6]);
        assert_eq!(entries.primary_id, a);

        let first = entry(&entries, a);
        assert_eq!(varint::decode_all(&first.shared_input_ranges).unwrap(), vec![0, 3]);
        assert!(first.extra_inputs.is_empty());

        // {4, 6} sit at bytes 1..3 of the blob.
        for (id, extra) in [(b, 0), (c, 2)] {
            let e = entry(&entries, id);
            assert_eq!(varint::decode_all(&e.extra_inputs).unwrap(), vec![extra]);
            assert_eq!(varint::decode_all(&e.shared_input_ranges).unwrap(), vec![1, 3]);
        }
        entries.validate().unwrap();
    }

    #[test]
    fn remap_doubles_every_offset() {
        let (mut entries, [a, b, c]) = scenario();
        entries.inputs_that_are_outputs.extend([4, 99]);
        let map: FxHashMap<u32, u32> = (0..7).map(|i| (i, i * 2)).collect();
        entries.update_entries(&map).unwrap();
        assert_eq!(
            entries.inputs_that_are_outputs.iter().copied().collect::<Vec<_>>(),
            vec![8]
        );
        entries.validate().unwrap();
        assert_eq!(entries.flatten(entry(&entries, a)).unwrap(), vec![2, 8, 12]);
        assert_eq!(entries.flatten(entry(&entries, b)).unwrap(), vec![0, 8, 12]);
        assert_eq!(entries.flatten(entry(&entries, c)).unwrap(), vec![4, 8, 12]);
        // Offsets the map does not cover keep their value.
        assert_eq!(entry(&entries, c).output_offsets().unwrap(), vec![1002]);
    }

    #[test]
    fn flatten_inverts_build() {
        let mut entries = CacheEntries::new();
        let sets: &[&[u32]] = &[
            &[10, 20, 30, 40, 50],
            &[10, 20, 40, 50],
            &[5, 10, 20, 30, 40, 50, 60],
            &[],
            &[30],
            &[1, 2, 3],
        ];
        let ids: Vec<u32> = sets.iter().map(|s| store(&mut entries, s)).collect();
        for (id, set) in ids.iter().zip(sets) {
            assert_eq!(entries.flatten(entry(&entries, *id)).unwrap(), *set);
        }
        entries.validate().unwrap();
    }

    #[test]
    fn gap_in_shared_splits_ranges() {
        let mut entries = CacheEntries::new();
        store(&mut entries, &[1, 2, 3, 4, 5]);
        let e = entries.build_inputs(&[1, 2, 4, 5]).unwrap();
        assert_eq!(
            varint::decode_all(&e.shared_input_ranges).unwrap(),
            vec![0, 2, 3, 5]
        );
        assert!(e.extra_inputs.is_empty());
    }

    #[test]
    fn identical_inputs_match() {
        let (entries, _) = scenario();
        let mut probe = entries.clone();
        let candidate = probe.build_inputs(&[0, 4, 6]).unwrap();
        assert!(entries.find_matching(&candidate).is_some());
        let other = probe.build_inputs(&[0, 4]).unwrap();
        assert!(entries.find_matching(&other).is_none());
    }

    #[test]
    fn unsorted_inputs_rejected() {
        let mut entries = CacheEntries::new();
        assert_eq!(
            entries.build_inputs(&[3, 1]),
            Err(EntriesError::UnsortedInputs)
        );
        assert_eq!(
            entries.build_inputs(&[1, 1]),
            Err(EntriesError::UnsortedInputs)
        );
    }

    #[test]
    fn collision_falls_back_to_rebuild() {
        let (mut entries, [a, b, c]) = scenario();
        // 1 and 0 collapse onto the same offset.
        let map: FxHashMap<u32, u32> = [(1, 0)].into_iter().collect();
        entries.update_entries(&map).unwrap();
        entries.validate().unwrap();
        assert_eq!(entries.flatten(entry(&entries, a)).unwrap(), vec![0, 4, 6]);
        assert_eq!(entries.flatten(entry(&entries, b)).unwrap(), vec![0, 4, 6]);
        assert_eq!(entries.flatten(entry(&entries, c)).unwrap(), vec![2, 4, 6]);
    }

    #[test]
    fn missing_primary_uses_full_rebuild() {
        let (mut entries, [a, b, c]) = scenario();
        let index = entries.entries.iter().position(|e| e.id == a).unwrap();
        entries.remove(index);
        assert_eq!(entries.primary_id, super::super::NO_PRIMARY);

        let map: FxHashMap<u32, u32> = (0..7).map(|i| (i, 100 - i)).collect();
        entries.update_entries(&map).unwrap();
        entries.validate().unwrap();
        assert_ne!(entries.primary_id, super::super::NO_PRIMARY);
        assert_eq!(entries.flatten(entry(&entries, b)).unwrap(), vec![94, 96, 100]);
        assert_eq!(entries.flatten(entry(&entries, c)).unwrap(), vec![94, 96, 98]);
    }

    #[test]
    fn shared_value_excluded_then_remapped() {
        let mut entries = CacheEntries::new();
        let a = store(&mut entries, &[1, 2, 3, 4]);
        let b = store(&mut entries, &[1, 4, 9]);
        // Reverse the order of offsets to force a re-sort of the blob.
        let map: FxHashMap<u32, u32> = [(1, 40), (2, 30), (3, 20), (4, 10), (9, 5)]
            .into_iter()
            .collect();
        entries.update_entries(&map).unwrap();
        entries.validate().unwrap();
        assert_eq!(entries.flatten(entry(&entries, a)).unwrap(), vec![10, 20, 30, 40]);
        assert_eq!(entries.flatten(entry(&entries, b)).unwrap(), vec![5, 10, 40]);
    }

    #[test]
    fn empty_primary_hands_blob_to_next_entry() {
        let mut entries = CacheEntries::new();
        let empty = store(&mut entries, &[]);
        let full = store(&mut entries, &[3, 4]);
        assert_eq!(entries.primary_id, full);
        let index = entries.entries.iter().position(|e| e.id == full).unwrap();
        entries.remove(index);
        let again = store(&mut entries, &[7]);

        entries.update_entries(&FxHashMap::default()).unwrap();
        entries.validate().unwrap();
        assert_eq!(entries.primary_id, again);
        assert!(entries.flatten(entry(&entries, empty)).unwrap().is_empty());
        assert_eq!(entries.flatten(entry(&entries, again)).unwrap(), vec![7]);
    }

    #[test]
    fn validate_rejects_corruption() {
        let (entries, [_, b, _]) = scenario();

        let mut bad = entries.clone();
        let e = bad.entry_mut(b).unwrap();
        e.shared_input_ranges = varint::encode_all(&[1, 99]);
        assert!(matches!(
            bad.validate(),
            Err(EntriesError::RangeOutOfBounds { .. })
        ));

        let mut bad = entries.clone();
        bad.shared_inputs = varint::encode_all(&[1, 300, 6]);
        let e = bad.entry_mut(b).unwrap();
        e.shared_input_ranges = varint::encode_all(&[2, 4]);
        assert!(matches!(
            bad.validate(),
            Err(EntriesError::RangeMisaligned { .. }) | Err(EntriesError::SharedUnsorted)
        ));

        let mut bad = entries.clone();
        let e = bad.entry_mut(b).unwrap();
        e.extra_inputs = varint::encode_all(&[4]);
        assert_eq!(
            bad.validate(),
            Err(EntriesError::SharedExtraOverlap { id: b, offset: 4 })
        );

        let mut bad = entries.clone();
        let e = bad.entry_mut(b).unwrap();
        e.extra_inputs = varint::encode_all(&[0, 0]);
        assert_eq!(
            bad.validate(),
            Err(EntriesError::DuplicateInput { id: b, offset: 0 })
        );

        let mut bad = entries.clone();
        let e = bad.entry_mut(b).unwrap();
        e.shared_input_ranges = varint::encode_all(&[1, 3, 0, 1]);
        assert_eq!(bad.validate(), Err(EntriesError::RangesUnordered { id: b }));

        let mut bad = entries;
        let e = bad.entry_mut(b).unwrap();
        e.shared_input_ranges = vec![0x80];
        assert!(matches!(bad.validate(), Err(EntriesError::Malformed { .. })));
    }

    #[test]
    fn corrupt_ranges_never_panic_in_update() {
        let (mut entries, [_, b, _]) = scenario();
        entries.entry_mut(b).unwrap().shared_input_ranges = varint::encode_all(&[0, 99]);
        let map: FxHashMap<u32, u32> = [(4, 5)].into_iter().collect();
        assert_eq!(
            entries.update_entries(&map),
            Err(EntriesError::RangeMisaligned { begin: 0, end: 99 })
        );
    }
}
