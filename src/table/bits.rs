// Dense bit set over table offsets.

#[derive(Debug, Clone, Default)]
pub struct BitArray {
    words: Vec<u64>,
}

impl BitArray {
    /// A cleared array able to hold bits `0..bit_count`.
    pub fn new(bit_count: u32) -> Self {
        Self {
            words: vec![0; (bit_count as usize).div_ceil(64)],
        }
    }

    /// Set `bit`. Returns false (and does nothing) when it is out of range.
    #[inline]
    pub fn set(&mut self, bit: u32) -> bool {
        match self.words.get_mut(bit as usize / 64) {
            Some(word) => {
                *word |= 1u64 << (bit % 64);
                true
            }
            None => false,
        }
    }

    #[inline]
    pub fn is_set(&self, bit: u32) -> bool {
        self.words
            .get(bit as usize / 64)
            .is_some_and(|w| w & (1u64 << (bit % 64)) != 0)
    }

    pub fn count_set(&self) -> u32 {
        self.words.iter().map(|w| w.count_ones()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Set bits in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            let base = i as u32 * 64;
            let mut w = word;
            std::iter::from_fn(move || {
                if w == 0 {
                    return None;
                }
                let bit = w.trailing_zeros();
                w &= w - 1;
                Some(base + bit)
            })
        })
    }
}
